/// Runtime options for the engine. Every field has a default; the CLI maps
/// its flags onto this struct 1:1.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of documents drawn when sampling index statistics. Collection
    /// statistics use a tenth of this.
    pub sample_size: u64,
    /// Seconds over which one sampling session is spread.
    pub sample_speed: u64,
    /// Days before cached statistics go stale and the collection is resampled.
    pub cardinality_update_interval: i64,
    /// Fields with a sampled cardinality below this are dropped from
    /// optimized indexes.
    pub minimum_cardinality: u64,
    /// Reduction threshold for field elimination; 1 disables elimination.
    pub minimum_reduction: f64,
    /// Whether the extension pass runs after reduction.
    pub index_extension: bool,
    /// Fields whose longest stringified value exceeds this are demoted to
    /// separate hashed indexes.
    pub longest_indexable_value: usize,
    /// Forget profiles not seen for this many days. -1 disables forgetting.
    pub recent_queries_only_days: i64,
    /// Profiles observed fewer times than this are not recommended for.
    pub minimum_query_count: u64,
    /// Seconds between synchronization cycles, measured from the end of the
    /// previous cycle.
    pub index_synchronization_interval: u64,
    /// Profiling level to set on startup. -1 leaves the deployment untouched.
    pub profile_level: i32,
    /// Actually create and drop indexes. Off by default: render the plan only.
    pub do_changes: bool,
    /// Only report indexes that would be created or dropped.
    pub show_changes_only: bool,
    /// Collapse the report to one line per action.
    pub simple: bool,
    pub verbose: bool,
    pub debug: bool,
    /// Collection the engine state document is persisted to.
    pub state_collection: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sample_size: 100_000,
            sample_speed: 600,
            cardinality_update_interval: 30,
            minimum_cardinality: 3,
            minimum_reduction: 0.70,
            index_extension: true,
            longest_indexable_value: 500,
            recent_queries_only_days: -1,
            minimum_query_count: 1,
            index_synchronization_interval: 60,
            profile_level: 2,
            do_changes: false,
            show_changes_only: false,
            simple: false,
            verbose: false,
            debug: false,
            state_collection: "index_advisor".to_owned(),
        }
    }
}
