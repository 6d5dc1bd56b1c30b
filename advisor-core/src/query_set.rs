//! The deduplicated set of observed query profiles, and the iterative loop
//! that turns their candidate indexes into the final recommendation.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::Utc;
use indexmap::IndexMap;

use crate::{
    config::Options,
    error::Result,
    index::{CompoundIndex, Direction, IndexField, IndexSet},
    profile::QueryProfile,
    sampler::{CollectionStatistics, FieldMode, IndexStatistics, Sampler},
};

#[derive(Debug, Default)]
pub struct QuerySet {
    profiles: Vec<QueryProfile>,
}

/// A profile's current candidate indexes during the reduction loop. Identical
/// candidates across slots always point at the same `CompoundIndex`.
#[derive(Debug)]
struct Slot {
    profile_index: usize,
    candidates: Vec<Arc<CompoundIndex>>,
}

/// The outcome of one recommendation cycle.
#[derive(Debug, Default)]
pub struct Recommendation {
    pub indexes: Vec<RecommendedIndex>,
}

#[derive(Debug)]
pub struct RecommendedIndex {
    pub index: Arc<CompoundIndex>,
    /// Prefix statistics from the final sampling pass, for reporting.
    pub statistics: Option<IndexStatistics>,
    /// Total observations of the queries this index serves.
    pub usage_count: u64,
    /// How many distinct profiles this index serves.
    pub serves: usize,
}

impl Recommendation {
    pub fn index_set(&self) -> IndexSet {
        self.indexes.iter().map(|r| r.index.clone()).collect()
    }

    pub fn find(&self, index: &CompoundIndex) -> Option<&RecommendedIndex> {
        let key = index.canonical_key();
        self.indexes.iter().find(|r| r.index.canonical_key() == key)
    }
}

impl QuerySet {
    pub fn new() -> Self {
        QuerySet::default()
    }

    /// Restores a persisted set, re-merging anything that deduplicates under
    /// the current equivalence.
    pub fn from_profiles(profiles: Vec<QueryProfile>) -> Self {
        let mut set = QuerySet::new();
        for profile in profiles {
            set.add(profile);
        }
        set
    }

    pub fn profiles(&self) -> &[QueryProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Admits one decomposed profile, merging it into an equivalent existing
    /// profile when there is one.
    pub fn add(&mut self, profile: QueryProfile) {
        let key = profile.equivalence_key();
        match self.profiles.iter_mut().find(|p| p.equivalence_key() == key) {
            Some(existing) => existing.merge(profile),
            None => self.profiles.push(profile),
        }
    }

    /// Forgets profiles whose last observation is older than the configured
    /// window. Returns how many were removed.
    pub fn prune(&mut self, options: &Options) -> usize {
        if options.recent_queries_only_days < 0 {
            return 0;
        }

        let cutoff = Utc::now() - chrono::Duration::days(options.recent_queries_only_days);
        let before = self.profiles.len();
        self.profiles.retain(|p| p.last_query_time >= cutoff);
        before - self.profiles.len()
    }

    /// Runs one full recommendation cycle: optimize every qualifying profile,
    /// reduce to a prefix-free candidate set, eliminate low-value fields by
    /// sampling, optionally extend, and take a final statistics pass.
    pub async fn recommend(&mut self, sampler: &mut Sampler, options: &Options) -> Result<Recommendation> {
        self.prune(options);

        let mut slots: Vec<Slot> = Vec::new();

        for (profile_index, profile) in self.profiles.iter().enumerate() {
            if profile.usage_count < options.minimum_query_count {
                continue;
            }

            let statistics = sampler.collection_statistics(&profile.collection).await?;

            let candidates: Vec<Arc<CompoundIndex>> = if statistics.sampled_documents == 0 {
                // Nothing to ground an ordering on; fall back to the naive
                // shape.
                vec![Arc::new(profile.naive_index())]
            } else {
                let optimized = profile.optimized_indexes(statistics, options);

                for field in &optimized.unknown_fields {
                    tracing::warn!(
                        collection = profile.collection.as_str(),
                        field = field.as_str(),
                        "queried field was not present in the sampled data"
                    );
                }

                optimized
                    .compounds
                    .into_iter()
                    .chain(optimized.hashed)
                    .map(Arc::new)
                    .collect()
            };

            if !candidates.is_empty() {
                slots.push(Slot {
                    profile_index,
                    candidates,
                });
            }
        }

        reduce_indexes(&mut slots);

        if options.minimum_reduction < 1.0 {
            self.simplify(&mut slots, sampler, options).await?;
        }

        if options.index_extension {
            self.extend(&mut slots, sampler).await?;
            reduce_indexes(&mut slots);
        }

        // Refetch statistics for the final shapes so the report carries
        // accurate reduction numbers.
        let (relation, lookup) = build_relation(&slots);
        let finals: Vec<Arc<CompoundIndex>> = lookup.values().cloned().collect();
        let statistics = sampler.index_statistics(&finals).await?;

        let mut indexes = Vec::new();
        for (key, serving) in relation {
            let index = lookup[&key].clone();
            let usage_count = serving
                .iter()
                .map(|slot| self.profiles[slots[*slot].profile_index].usage_count)
                .sum();

            indexes.push(RecommendedIndex {
                statistics: statistics.get(key.as_str()).cloned(),
                usage_count,
                serves: serving.len(),
                index,
            });
        }

        Ok(Recommendation { indexes })
    }

    /// The outer field-elimination loop: resample, drop at most one
    /// low-reduction field per index, reduce again, until a pass removes
    /// nothing.
    async fn simplify(&self, slots: &mut Vec<Slot>, sampler: &mut Sampler, options: &Options) -> Result<()> {
        loop {
            let (relation, lookup) = build_relation(slots);

            let multi_field: Vec<Arc<CompoundIndex>> = lookup.values().filter(|i| i.len() > 1).cloned().collect();
            if multi_field.is_empty() {
                return Ok(());
            }

            let statistics = sampler.index_statistics(&multi_field).await?;

            let mut changed = false;
            for (key, serving) in &relation {
                let index = &lookup[key];
                if index.len() <= 1 {
                    continue;
                }
                let Some(index_statistics) = statistics.get(key.as_str()) else {
                    continue;
                };

                let serving_profiles: Vec<&QueryProfile> = serving
                    .iter()
                    .map(|slot| &self.profiles[slots[*slot].profile_index])
                    .collect();

                if let Some(victim) = eliminate_field(index, &serving_profiles, index_statistics, options.minimum_reduction) {
                    tracing::debug!(
                        index = %index,
                        field = victim.as_str(),
                        "eliminating field with insufficient reduction"
                    );

                    let reduced = Arc::new(index.without_field(&victim));
                    for slot in serving {
                        replace_candidate(&mut slots[*slot], key, reduced.clone());
                    }
                    changed = true;
                }
            }

            if !changed {
                return Ok(());
            }

            // Removing a field invalidates the statistics of the remaining
            // prefixes, so the next iteration resamples the new shapes.
            reduce_indexes(slots);
        }
    }

    /// Appends fields that are free with respect to index sharing: voted for
    /// by the served profiles, never hash-mode, never inside an array.
    async fn extend(&self, slots: &mut Vec<Slot>, sampler: &mut Sampler) -> Result<()> {
        let (relation, lookup) = build_relation(slots);

        for (initial_key, serving) in relation {
            let mut index = lookup[&initial_key].clone();
            let mut key = initial_key;

            // Hashed singles stay single-field.
            if index.fields().iter().any(|f| f.direction == Direction::Hashed) {
                continue;
            }

            let mut voters: Vec<usize> = serving.clone();

            loop {
                let statistics = sampler.collection_statistics(index.collection()).await?.clone();

                let voter_profiles: Vec<&QueryProfile> = voters
                    .iter()
                    .map(|slot| &self.profiles[slots[*slot].profile_index])
                    .collect();

                let Some(winner) = best_extension(&index, &voter_profiles, &statistics) else {
                    break;
                };

                let extended = Arc::new(index.with_appended(IndexField::new(winner.clone(), Direction::Ascending)));

                // The shared object grows for every profile it serves; only
                // the voters for the winning field keep steering further
                // extension rounds.
                for slot in &serving {
                    replace_candidate(&mut slots[*slot], &key, extended.clone());
                }

                voters.retain(|slot| {
                    let profile = &self.profiles[slots[*slot].profile_index];
                    profile.exact.contains(&winner) || profile.range.contains(&winner)
                });

                key = extended.canonical_key();
                index = extended;
            }
        }

        Ok(())
    }
}

fn replace_candidate(slot: &mut Slot, key: &str, replacement: Arc<CompoundIndex>) {
    for candidate in &mut slot.candidates {
        if candidate.canonical_key() == key {
            *candidate = replacement.clone();
        }
    }

    // A replacement can collide with an existing candidate.
    let mut seen = BTreeSet::new();
    slot.candidates.retain(|c| seen.insert(c.canonical_key()));
}

/// Absorbs every candidate into the candidates it is an index-prefix of, and
/// canonicalizes identical candidates to one shared object. Iterates until no
/// slot's candidate set changes in a full pass; at the fixed point no
/// candidate anywhere is a prefix of another.
fn reduce_indexes(slots: &mut Vec<Slot>) {
    loop {
        let mut pool: BTreeMap<String, Arc<CompoundIndex>> = BTreeMap::new();
        for slot in slots.iter() {
            for candidate in &slot.candidates {
                pool.entry(candidate.canonical_key()).or_insert_with(|| candidate.clone());
            }
        }

        let mut changed = false;

        for slot in slots.iter_mut() {
            let before: Vec<String> = slot.candidates.iter().map(|c| c.canonical_key()).collect();

            let mut next: Vec<Arc<CompoundIndex>> = Vec::new();
            let mut push = |index: Arc<CompoundIndex>| {
                if !next.iter().any(|c| c.canonical_key() == index.canonical_key()) {
                    next.push(index);
                }
            };

            for candidate in &slot.candidates {
                let extensions: Vec<&Arc<CompoundIndex>> = pool
                    .values()
                    .filter(|other| candidate.is_index_prefix_of(other))
                    .collect();

                if extensions.is_empty() {
                    push(pool[&candidate.canonical_key()].clone());
                } else {
                    for extension in extensions {
                        push(extension.clone());
                    }
                }
            }

            let after: Vec<String> = next.iter().map(|c| c.canonical_key()).collect();
            if before != after {
                changed = true;
            }

            slot.candidates = next;
        }

        if !changed {
            return;
        }
    }
}

/// The relation between final candidates and the slots they serve, plus a
/// lookup from canonical key to the shared index object. Rebuilt from scratch
/// after every reduction pass.
fn build_relation(slots: &[Slot]) -> (BTreeMap<String, Vec<usize>>, BTreeMap<String, Arc<CompoundIndex>>) {
    let mut relation: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut lookup: BTreeMap<String, Arc<CompoundIndex>> = BTreeMap::new();

    for (slot_index, slot) in slots.iter().enumerate() {
        for candidate in &slot.candidates {
            let key = candidate.canonical_key();
            relation.entry(key.clone()).or_default().push(slot_index);
            lookup.entry(key).or_insert_with(|| candidate.clone());
        }
    }

    (relation, lookup)
}

/// Picks the field to remove from an index this pass: the rightmost
/// non-sort field whose reduction exceeds the threshold. Sort keys of any
/// serving profile are immune.
fn eliminate_field(
    index: &CompoundIndex,
    serving: &[&QueryProfile],
    statistics: &IndexStatistics,
    minimum_reduction: f64,
) -> Option<String> {
    let sort_fields: BTreeSet<&str> = serving
        .iter()
        .flat_map(|p| p.sort.keys())
        .map(|s| s.as_str())
        .collect();

    index
        .fields()
        .iter()
        .filter(|f| !sort_fields.contains(f.path.as_str()))
        .filter(|f| {
            statistics
                .position(&f.path)
                .map(|p| p.reduction > minimum_reduction)
                .unwrap_or(false)
        })
        .last()
        .map(|f| f.path.clone())
}

/// Scores every extension candidate by the usage count of the voters that
/// reference it, and returns the winner. Hash-mode fields and fields living
/// inside arrays are never candidates.
fn best_extension(index: &CompoundIndex, voters: &[&QueryProfile], statistics: &CollectionStatistics) -> Option<String> {
    let mut scores: IndexMap<String, u64> = IndexMap::new();

    for profile in voters {
        for path in profile.exact.iter().chain(profile.range.iter()) {
            if index.contains_path(path) {
                continue;
            }

            if let Some(field) = statistics.field(path) {
                if field.mode == FieldMode::Hash || !field.array_prefixes.is_empty() {
                    continue;
                }
            }

            *scores.entry(path.clone()).or_insert(0) += profile.usage_count;
        }
    }

    // Ties break toward the first-seen candidate.
    let mut winner: Option<(&String, u64)> = None;
    for (path, score) in &scores {
        match winner {
            Some((_, best)) if *score <= best => {}
            _ => winner = Some((path, *score)),
        }
    }

    winner.map(|(path, _)| path.clone())
}
