//! The index-recommendation engine.
//!
//! The engine watches the queries a live MongoDB deployment is servicing,
//! folds them into a deduplicated set of query profiles, samples the data to
//! learn per-field and per-index statistics, and derives a minimal covering
//! set of compound indexes. It can optionally reconcile the database's actual
//! indexes with the recommended set; it only ever touches indexes it created
//! itself (names carrying the `auto_` prefix).

mod config;
mod decomposer;
mod engine;
mod error;
mod index;
mod path;
mod profile;
mod profiling;
mod query_set;
mod reconciler;
mod sampler;
mod state;

pub use config::Options;
pub use decomposer::decompose;
pub use engine::Engine;
pub use error::{Error, Result};
pub use index::{CompoundIndex, Direction, IndexField, IndexSet, OWNERSHIP_PREFIX, PRIMARY_KEY_INDEX_NAME};
pub use profile::{OptimizedIndexes, QueryProfile, Source};
pub use profiling::ProfileEntry;
pub use query_set::{QuerySet, Recommendation, RecommendedIndex};
pub use reconciler::{reconcile, CollectionActions, ExistingIndex, Reconciliation};
pub use sampler::{CollectionStatistics, FieldMode, FieldStatistics, IndexStatistics, PrefixStatistics, Sampler};
