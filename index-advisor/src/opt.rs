use advisor_core::Options;
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "index-advisor",
    about = "Watches a MongoDB profiling stream and keeps a minimal covering set of compound indexes."
)]
pub struct AdvisorOpt {
    /// MongoDB connection string, including the database to watch.
    #[structopt(long, env = "INDEX_ADVISOR_URL")]
    pub url: String,

    /// Number of documents drawn when sampling index statistics; collection
    /// statistics use a tenth of this.
    #[structopt(long, default_value = "100000")]
    pub sample_size: u64,

    /// Seconds over which one sampling session is spread.
    #[structopt(long, default_value = "600")]
    pub sample_speed: u64,

    /// Days before cached statistics go stale and collections are resampled.
    #[structopt(long, default_value = "30")]
    pub cardinality_update_interval: i64,

    /// Fields with a sampled cardinality below this are dropped from
    /// optimized indexes.
    #[structopt(long, default_value = "3")]
    pub minimum_cardinality: u64,

    /// Reduction threshold for field elimination; 1 disables elimination.
    #[structopt(long, default_value = "0.70")]
    pub minimum_reduction: f64,

    /// Disable the index extension pass.
    #[structopt(long)]
    pub no_index_extension: bool,

    /// Fields whose longest stringified value exceeds this become separate
    /// hashed indexes.
    #[structopt(long, default_value = "500")]
    pub longest_indexable_value: usize,

    /// Forget query profiles not observed for this many days; -1 disables.
    #[structopt(long, default_value = "-1", allow_hyphen_values = true)]
    pub recent_queries_only_days: i64,

    /// Profiles observed fewer times than this are ignored.
    #[structopt(long, default_value = "1")]
    pub minimum_query_count: u64,

    /// Seconds between synchronization cycles, measured from the end of the
    /// previous cycle.
    #[structopt(long, default_value = "60")]
    pub index_synchronization_interval: u64,

    /// Profiling level to set on startup; -1 leaves the deployment as-is.
    #[structopt(long, default_value = "2", allow_hyphen_values = true)]
    pub profile_level: i32,

    /// Actually create and drop indexes instead of only reporting.
    #[structopt(long)]
    pub do_changes: bool,

    /// Only report indexes that would be created or dropped.
    #[structopt(long)]
    pub show_changes_only: bool,

    /// Collapse the report to one line per action.
    #[structopt(long)]
    pub simple: bool,

    /// Report per-index provenance and reduction numbers.
    #[structopt(long, short = "v")]
    pub verbose: bool,

    /// Enable debug logging.
    #[structopt(long, short = "d")]
    pub debug: bool,

    /// Collection the engine state document is persisted to.
    #[structopt(long, default_value = "index_advisor")]
    pub state_collection: String,
}

impl AdvisorOpt {
    pub fn options(&self) -> Options {
        Options {
            sample_size: self.sample_size,
            sample_speed: self.sample_speed,
            cardinality_update_interval: self.cardinality_update_interval,
            minimum_cardinality: self.minimum_cardinality,
            minimum_reduction: self.minimum_reduction,
            index_extension: !self.no_index_extension,
            longest_indexable_value: self.longest_indexable_value,
            recent_queries_only_days: self.recent_queries_only_days,
            minimum_query_count: self.minimum_query_count,
            index_synchronization_interval: self.index_synchronization_interval,
            profile_level: self.profile_level,
            do_changes: self.do_changes,
            show_changes_only: self.show_changes_only,
            simple: self.simple,
            verbose: self.verbose,
            debug: self.debug,
            state_collection: self.state_collection.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_engine_defaults() {
        let opt = AdvisorOpt::from_iter(["index-advisor", "--url", "mongodb://localhost/app"]);
        let options = opt.options();
        let defaults = Options::default();

        assert_eq!(defaults.sample_size, options.sample_size);
        assert_eq!(defaults.sample_speed, options.sample_speed);
        assert_eq!(defaults.minimum_cardinality, options.minimum_cardinality);
        assert_eq!(defaults.minimum_reduction, options.minimum_reduction);
        assert_eq!(defaults.index_extension, options.index_extension);
        assert_eq!(defaults.longest_indexable_value, options.longest_indexable_value);
        assert_eq!(defaults.recent_queries_only_days, options.recent_queries_only_days);
        assert_eq!(defaults.profile_level, options.profile_level);
        assert_eq!(defaults.state_collection, options.state_collection);
        assert!(!options.do_changes);
    }

    #[test]
    fn negative_overrides_parse() {
        let opt = AdvisorOpt::from_iter([
            "index-advisor",
            "--url",
            "mongodb://localhost/app",
            "--recent-queries-only-days",
            "-1",
            "--profile-level",
            "-1",
        ]);

        assert_eq!(-1, opt.recent_queries_only_days);
        assert_eq!(-1, opt.profile_level);
    }
}
