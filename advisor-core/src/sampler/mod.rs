//! Draws uniform random documents from collections and derives the cached
//! field and index statistics the optimizer runs on.

mod statistics;

pub use statistics::{CollectionStatistics, FieldMode, FieldStatistics, IndexStatistics, PrefixStatistics};

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bson::{doc, Bson, Document};
use chrono::Utc;
use mongodb::{options::FindOneOptions, Collection, Database};
use rand::Rng;
use tokio::time::sleep;

use crate::{
    config::Options,
    error::Result,
    index::CompoundIndex,
    sampler::statistics::{CollectionAccumulator, IndexAccumulator},
};

/// Owns the statistics caches. One instance per engine; resampling happens
/// lazily when a cache entry is older than the configured update interval.
pub struct Sampler {
    database: Database,
    sample_size: u64,
    sample_speed: u64,
    cardinality_update_interval: i64,
    longest_indexable_value: usize,
    collections: HashMap<String, CollectionStatistics>,
    indexes: HashMap<String, IndexStatistics>,
}

impl Sampler {
    pub fn new(database: Database, options: &Options) -> Self {
        Sampler {
            database,
            sample_size: options.sample_size,
            sample_speed: options.sample_speed,
            cardinality_update_interval: options.cardinality_update_interval,
            longest_indexable_value: options.longest_indexable_value,
            collections: HashMap::new(),
            indexes: HashMap::new(),
        }
    }

    /// Replaces the caches with previously persisted ones.
    pub fn restore(
        &mut self,
        collections: HashMap<String, CollectionStatistics>,
        indexes: HashMap<String, IndexStatistics>,
    ) {
        self.collections = collections;
        self.indexes = indexes;
    }

    pub fn collection_cache(&self) -> &HashMap<String, CollectionStatistics> {
        &self.collections
    }

    pub fn index_cache(&self) -> &HashMap<String, IndexStatistics> {
        &self.indexes
    }

    fn is_fresh(&self, last_sample_time: chrono::DateTime<Utc>) -> bool {
        Utc::now() - last_sample_time < chrono::Duration::days(self.cardinality_update_interval)
    }

    /// Field statistics for one collection, resampling when stale.
    pub async fn collection_statistics(&mut self, collection: &str) -> Result<&CollectionStatistics> {
        let fresh = self
            .collections
            .get(collection)
            .map(|stats| self.is_fresh(stats.last_sample_time))
            .unwrap_or(false);

        if !fresh {
            let sample_size = (self.sample_size / 10).max(1);
            tracing::info!(collection, sample_size, "sampling collection statistics");

            let mut cursor = SampleCursor::create(
                self.database.collection::<Document>(collection),
                sample_size,
                self.sample_speed,
            )
            .await?;

            let mut accumulator = CollectionAccumulator::new(self.longest_indexable_value);
            while let Some(document) = cursor.next().await? {
                accumulator.observe(&document);
            }

            self.collections
                .insert(collection.to_owned(), accumulator.finish(Utc::now()));
        }

        Ok(&self.collections[collection])
    }

    /// Prefix statistics for the given indexes, keyed by their canonical key.
    /// Stale entries are recomputed in one sampling pass per collection; a
    /// changed index has a new name and therefore always resamples.
    pub async fn index_statistics(&mut self, indexes: &[Arc<CompoundIndex>]) -> Result<HashMap<String, IndexStatistics>> {
        let mut by_collection: HashMap<&str, Vec<Arc<CompoundIndex>>> = HashMap::new();
        for index in indexes {
            by_collection.entry(index.collection()).or_default().push(index.clone());
        }

        for (collection, targets) in by_collection {
            let stale: Vec<Arc<CompoundIndex>> = targets
                .iter()
                .filter(|index| {
                    self.indexes
                        .get(&cache_key(collection, &index.name()))
                        .map(|stats| !self.is_fresh(stats.last_sample_time))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            if stale.is_empty() {
                continue;
            }

            tracing::info!(
                collection,
                indexes = stale.len(),
                sample_size = self.sample_size,
                "sampling index statistics"
            );

            let previous: HashMap<String, IndexStatistics> = stale
                .iter()
                .filter_map(|index| {
                    self.indexes
                        .get(&cache_key(collection, &index.name()))
                        .map(|stats| (index.name(), stats.clone()))
                })
                .collect();

            let mut cursor = SampleCursor::create(
                self.database.collection::<Document>(collection),
                self.sample_size,
                self.sample_speed,
            )
            .await?;

            let mut accumulator = IndexAccumulator::new(stale);
            while let Some(document) = cursor.next().await? {
                accumulator.observe(&document);
            }

            for (index, stats) in accumulator.finish(Utc::now(), &previous) {
                self.indexes.insert(cache_key(collection, &index.name()), stats);
            }
        }

        Ok(indexes
            .iter()
            .filter_map(|index| {
                self.indexes
                    .get(&cache_key(index.collection(), &index.name()))
                    .map(|stats| (index.canonical_key(), stats.clone()))
            })
            .collect())
    }

    /// Marks the longest of the given fields as hash-only. Called when the
    /// database refused an index because a value was too large; the next
    /// optimization pass then routes the field into a separate hashed index.
    pub fn demote_longest_to_hash(&mut self, collection: &str, paths: &[&str]) -> Option<String> {
        let stats = self.collections.get_mut(collection)?;

        let longest = paths
            .iter()
            .filter_map(|path| stats.fields.get(*path).map(|f| (*path, f.longest)))
            .max_by_key(|(_, longest)| *longest)
            .map(|(path, _)| path.to_owned())?;

        stats.demote_to_hash(&longest);
        Some(longest)
    }
}

fn cache_key(collection: &str, index_name: &str) -> String {
    format!("{collection}-{index_name}")
}

/// Visits `n` uniformly drawn slots of a collection in ascending primary-key
/// order, using skip deltas from the previous position so the server never
/// rescans. Fetches are paced so one session spreads over the configured
/// sampling window. Slots emptied between the count and the fetch are
/// silently skipped.
struct SampleCursor {
    collection: Collection<Document>,
    targets: Vec<u64>,
    next_target: usize,
    position: i64,
    last_id: Option<Bson>,
    pause: Duration,
    started: bool,
}

impl SampleCursor {
    async fn create(collection: Collection<Document>, requested: u64, sample_speed: u64) -> Result<Self> {
        let total = collection.count_documents(None, None).await?;
        let drawn = requested.min(total);
        let targets = draw_targets(drawn, total);

        let pause = if drawn == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(sample_speed as f64 / drawn as f64)
        };

        Ok(SampleCursor {
            collection,
            targets,
            next_target: 0,
            position: -1,
            last_id: None,
            pause,
            started: false,
        })
    }

    async fn next(&mut self) -> Result<Option<Document>> {
        loop {
            let Some(target) = self.targets.get(self.next_target).copied() else {
                return Ok(None);
            };
            self.next_target += 1;

            if self.started {
                sleep(self.pause).await;
            }
            self.started = true;

            let skip = (target as i64 - (self.position + 1)) as u64;
            self.position = target as i64;

            let filter = self.last_id.as_ref().map(|id| doc! { "_id": { "$gt": id.clone() } });
            let options = FindOneOptions::builder()
                .sort(Some(doc! { "_id": 1 }))
                .skip(Some(skip))
                .build();

            match self.collection.find_one(filter, Some(options)).await {
                Ok(Some(document)) => {
                    self.last_id = document.get("_id").cloned();
                    return Ok(Some(document));
                }
                // The slot was deleted between the count and the fetch.
                Ok(None) => continue,
                Err(err) if is_transient(&err) => {
                    tracing::warn!(error = %err, "sample fetch failed, skipping slot");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_transient(err: &mongodb::error::Error) -> bool {
    matches!(*err.kind, mongodb::error::ErrorKind::Command(_))
}

/// `n` distinct indices drawn uniformly from `[0, total)`, sorted ascending.
fn draw_targets(n: u64, total: u64) -> Vec<u64> {
    if n >= total {
        return (0..total).collect();
    }

    let mut rng = rand::thread_rng();
    let mut drawn = HashSet::with_capacity(n as usize);
    while (drawn.len() as u64) < n {
        drawn.insert(rng.gen_range(0..total));
    }

    let mut targets: Vec<u64> = drawn.into_iter().collect();
    targets.sort_unstable();
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_targets_without_replacement() {
        let targets = draw_targets(10, 100);
        assert_eq!(10, targets.len());
        assert!(targets.windows(2).all(|w| w[0] < w[1]));
        assert!(targets.iter().all(|t| *t < 100));
    }

    #[test]
    fn draw_targets_saturates_at_the_collection_size() {
        assert_eq!(vec![0, 1, 2], draw_targets(10, 3));
        assert!(draw_targets(10, 0).is_empty());
    }
}
