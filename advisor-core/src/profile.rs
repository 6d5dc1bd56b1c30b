use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::{
    config::Options,
    index::{CompoundIndex, Direction, IndexField},
    sampler::{CollectionStatistics, FieldMode, FieldStatistics},
};

/// Provenance attached to a query through a `$comment` object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub source: String,
    pub version: String,
}

/// A canonical decomposition of one observed query: the fields matched
/// exactly, the ordered sort keys, and the fields constrained by ranges or
/// multi-value operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProfile {
    pub collection: String,
    pub exact: IndexSet<String>,
    pub sort: IndexMap<String, i32>,
    pub range: IndexSet<String>,
    pub usage_count: u64,
    pub last_query_time: DateTime<Utc>,
    pub sources: Vec<Source>,
}

/// The equivalence under which the query set deduplicates: same collection,
/// same exact set, same sort keys with the same direction on each key, same
/// range set. Exact and range are sets; only the sort is order-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    collection: String,
    exact: Vec<String>,
    sort: Vec<(String, i32)>,
    range: Vec<String>,
}

impl QueryProfile {
    pub fn new(
        collection: impl Into<String>,
        exact: IndexSet<String>,
        sort: IndexMap<String, i32>,
        range: IndexSet<String>,
        seen_at: DateTime<Utc>,
    ) -> Self {
        QueryProfile {
            collection: collection.into(),
            exact,
            sort,
            range,
            usage_count: 1,
            last_query_time: seen_at,
            sources: Vec::new(),
        }
    }

    pub fn equivalence_key(&self) -> ProfileKey {
        let mut exact: Vec<String> = self.exact.iter().cloned().collect();
        exact.sort();
        let mut range: Vec<String> = self.range.iter().cloned().collect();
        range.sort();

        ProfileKey {
            collection: self.collection.clone(),
            exact,
            sort: self.sort.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            range,
        }
    }

    /// Folds a re-observation of an equivalent query into this profile.
    pub fn merge(&mut self, other: QueryProfile) {
        self.usage_count += other.usage_count;
        self.last_query_time = self.last_query_time.max(other.last_query_time);
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
    }

    /// Every field path the profile touches, deduplicated.
    pub fn referenced_paths(&self) -> IndexSet<String> {
        let mut paths = IndexSet::new();
        paths.extend(self.exact.iter().cloned());
        paths.extend(self.sort.keys().cloned());
        paths.extend(self.range.iter().cloned());
        paths
    }

    /// The statistics-free fallback: exact fields in insertion order, then the
    /// sort keys with their given directions, then range fields.
    pub fn naive_index(&self) -> CompoundIndex {
        let mut fields: Vec<IndexField> = Vec::new();
        let mut push = |field: IndexField| {
            if !fields.iter().any(|f| f.path == field.path) {
                fields.push(field);
            }
        };

        for path in &self.exact {
            push(IndexField::new(path.clone(), Direction::Ascending));
        }
        for (path, direction) in &self.sort {
            push(IndexField::new(path.clone(), sort_direction(*direction)));
        }
        for path in &self.range {
            push(IndexField::new(path.clone(), Direction::Ascending));
        }

        CompoundIndex::new(self.collection.clone(), fields)
    }

    /// Derives the statistically-ordered index set for this profile. Requires
    /// collection statistics covering the referenced fields; fields the sample
    /// never saw are synthesized and reported in `unknown_fields`.
    pub fn optimized_indexes(&self, statistics: &CollectionStatistics, options: &Options) -> OptimizedIndexes {
        let mut unknown_fields = Vec::new();
        let mut field_stats: HashMap<String, FieldStatistics> = HashMap::new();

        for path in self.referenced_paths() {
            let stats = match statistics.field(&path) {
                Some(stats) => stats.clone(),
                None => {
                    unknown_fields.push(path.clone());
                    statistics.synthesize(&path, options.minimum_cardinality)
                }
            };
            field_stats.insert(path, stats);
        }

        let cardinality = |path: &str| field_stats[path].cardinality;

        // Exact fields by descending cardinality, range by ascending. Both
        // sorts are stable on ties.
        let mut exact: Vec<String> = self.exact.iter().cloned().collect();
        exact.sort_by(|a, b| cardinality(b).cmp(&cardinality(a)));
        let mut range: Vec<String> = self.range.iter().cloned().collect();
        range.sort_by(|a, b| cardinality(a).cmp(&cardinality(b)));
        let sort: Vec<(String, i32)> = self.sort.iter().map(|(k, v)| (k.clone(), *v)).collect();

        // Drop fields below the cardinality floor, but never produce an empty
        // index: if nothing is left, keep the original sets.
        let keeps = |path: &str| cardinality(path) >= options.minimum_cardinality;
        let kept_exact: Vec<String> = exact.iter().filter(|p| keeps(p.as_str())).cloned().collect();
        let kept_sort: Vec<(String, i32)> = sort.iter().filter(|(p, _)| keeps(p.as_str())).cloned().collect();
        let kept_range: Vec<String> = range.iter().filter(|p| keeps(p.as_str())).cloned().collect();

        let (exact, sort, range) = if kept_exact.is_empty() && kept_sort.is_empty() && kept_range.is_empty() {
            (exact, sort, range)
        } else {
            (kept_exact, kept_sort, kept_range)
        };

        // Oversized fields cannot live in a compound index; they come back as
        // separate single-field hashed indexes.
        let is_hashed = |path: &str| field_stats[path].mode == FieldMode::Hash;
        let mut hashed_paths: IndexSet<String> = IndexSet::new();
        hashed_paths.extend(exact.iter().filter(|p| is_hashed(p.as_str())).cloned());
        hashed_paths.extend(sort.iter().map(|(p, _)| p).filter(|p| is_hashed(p.as_str())).cloned());
        hashed_paths.extend(range.iter().filter(|p| is_hashed(p.as_str())).cloned());

        let exact: Vec<String> = exact.into_iter().filter(|p| !hashed_paths.contains(p)).collect();
        let sort: Vec<(String, i32)> = sort.into_iter().filter(|(p, _)| !hashed_paths.contains(p)).collect();
        let range: Vec<String> = range.into_iter().filter(|p| !hashed_paths.contains(p)).collect();

        let hashed = hashed_paths
            .iter()
            .map(|path| CompoundIndex::single(self.collection.clone(), path.clone(), Direction::Hashed))
            .collect();

        // Fields under distinct array prefixes cannot share one compound
        // index; the profile splits into one index per prefix.
        let array_prefixes: BTreeSet<String> = exact
            .iter()
            .chain(sort.iter().map(|(p, _)| p))
            .chain(range.iter())
            .flat_map(|p| field_stats[p].array_prefixes.iter().cloned())
            .collect();

        let admits = |path: &str, prefix: &str| {
            let prefixes = &field_stats[path].array_prefixes;
            prefixes.is_empty() || prefixes.contains(prefix)
        };

        let mut compounds = Vec::new();
        let mut seen_sequences = BTreeSet::new();

        let groups: Vec<Option<&str>> = if array_prefixes.len() >= 2 {
            array_prefixes.iter().map(|p| Some(p.as_str())).collect()
        } else {
            vec![None]
        };

        for group in groups {
            let mut fields: Vec<IndexField> = Vec::new();
            let mut push = |field: IndexField| {
                if !fields.iter().any(|f| f.path == field.path) {
                    fields.push(field);
                }
            };

            let in_group = |path: &str| match group {
                Some(prefix) => admits(path, prefix),
                None => true,
            };

            for path in exact.iter().filter(|p| in_group(p.as_str())) {
                push(IndexField::new(path.clone(), Direction::Ascending));
            }

            // Flip every sort direction by the sign of the group's first sort
            // key, so the leading sort key is always ascending. The database
            // can walk an index backward, and downstream reduction folds more
            // shapes together this way.
            let group_sort: Vec<&(String, i32)> = sort.iter().filter(|(p, _)| in_group(p.as_str())).collect();
            let sign = group_sort.first().map(|(_, d)| d.signum()).unwrap_or(1);
            for (path, direction) in &group_sort {
                push(IndexField::new(path.clone(), sort_direction(direction * sign)));
            }

            for path in range.iter().filter(|p| in_group(p.as_str())) {
                push(IndexField::new(path.clone(), Direction::Ascending));
            }

            if fields.is_empty() {
                continue;
            }

            let compound = CompoundIndex::new(self.collection.clone(), fields);
            if seen_sequences.insert(compound.sequence_key()) {
                compounds.push(compound);
            }
        }

        OptimizedIndexes {
            compounds,
            hashed,
            unknown_fields,
        }
    }
}

fn sort_direction(direction: i32) -> Direction {
    if direction < 0 {
        Direction::Descending
    } else {
        Direction::Ascending
    }
}

#[derive(Debug)]
pub struct OptimizedIndexes {
    pub compounds: Vec<CompoundIndex>,
    /// Single-field hashed indexes emitted alongside the compounds.
    pub hashed: Vec<CompoundIndex>,
    /// Referenced fields the sample never saw.
    pub unknown_fields: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn profile(exact: &[&str], sort: &[(&str, i32)], range: &[&str]) -> QueryProfile {
        QueryProfile::new(
            "users",
            exact.iter().map(|s| s.to_string()).collect(),
            sort.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            range.iter().map(|s| s.to_string()).collect(),
            Utc::now(),
        )
    }

    fn field(cardinality: u64) -> FieldStatistics {
        FieldStatistics {
            cardinality,
            longest: 8,
            mode: FieldMode::Normal,
            array_prefixes: BTreeSet::new(),
        }
    }

    fn collection_stats(fields: Vec<(&str, FieldStatistics)>) -> CollectionStatistics {
        let mut known_array_prefixes = BTreeSet::new();
        for (_, stats) in &fields {
            known_array_prefixes.extend(stats.array_prefixes.iter().cloned());
        }

        CollectionStatistics {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
            known_array_prefixes,
            sampled_documents: 1000,
            last_sample_time: Utc::now(),
        }
    }

    fn sequence(index: &CompoundIndex) -> Vec<(&str, Direction)> {
        index.fields().iter().map(|f| (f.path.as_str(), f.direction)).collect()
    }

    #[test]
    fn equivalent_profiles_share_a_key() {
        let a = profile(&["name", "status"], &[("birthday", -1)], &["email"]);
        let b = profile(&["status", "name"], &[("birthday", -1)], &["email"]);

        assert_eq!(a.equivalence_key(), b.equivalence_key());
    }

    #[test]
    fn sort_direction_is_part_of_the_key() {
        let a = profile(&["name"], &[("birthday", -1)], &[]);
        let b = profile(&["name"], &[("birthday", 1)], &[]);

        assert_ne!(a.equivalence_key(), b.equivalence_key());
    }

    #[test]
    fn merge_accumulates_usage_and_sources() {
        let mut a = profile(&["name"], &[], &[]);
        let mut b = profile(&["name"], &[], &[]);
        b.sources.push(Source {
            source: "checkout".to_owned(),
            version: "2.1".to_owned(),
        });

        a.merge(b);
        assert_eq!(2, a.usage_count);
        assert_eq!(1, a.sources.len());
    }

    #[test]
    fn naive_index_preserves_given_order() {
        let p = profile(&["name", "status"], &[("birthday", -1)], &["email"]);

        assert_eq!(
            vec![
                ("name", Direction::Ascending),
                ("status", Direction::Ascending),
                ("birthday", Direction::Descending),
                ("email", Direction::Ascending),
            ],
            sequence(&p.naive_index())
        );
    }

    #[test]
    fn exact_fields_order_by_descending_cardinality() {
        // a is dropped below the floor; b comes before c.
        let p = profile(&["a", "b", "c"], &[], &[]);
        let stats = collection_stats(vec![("a", field(2)), ("b", field(100)), ("c", field(10))]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(1, optimized.compounds.len());
        assert_eq!(
            vec![("b", Direction::Ascending), ("c", Direction::Ascending)],
            sequence(&optimized.compounds[0])
        );
    }

    #[test]
    fn range_fields_order_by_ascending_cardinality() {
        let p = profile(&["name"], &[], &["age", "score"]);
        let stats = collection_stats(vec![("name", field(50)), ("age", field(90)), ("score", field(10))]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(
            vec![
                ("name", Direction::Ascending),
                ("score", Direction::Ascending),
                ("age", Direction::Ascending),
            ],
            sequence(&optimized.compounds[0])
        );
    }

    #[test]
    fn dropping_every_field_reverts_to_the_original_sets() {
        let p = profile(&["a"], &[], &[]);
        let stats = collection_stats(vec![("a", field(2))]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(vec![("a", Direction::Ascending)], sequence(&optimized.compounds[0]));
    }

    #[test]
    fn sort_directions_canonicalize_to_a_leading_ascent() {
        let p = profile(&[], &[("birthday", -1), ("name", 1)], &[]);
        let stats = collection_stats(vec![("birthday", field(500)), ("name", field(50))]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(
            vec![("birthday", Direction::Ascending), ("name", Direction::Descending)],
            sequence(&optimized.compounds[0])
        );
    }

    #[test]
    fn oversized_fields_become_separate_hashed_indexes() {
        let p = profile(&["blob", "name"], &[], &[]);
        let oversized = FieldStatistics {
            cardinality: 1000,
            longest: 4096,
            mode: FieldMode::Hash,
            array_prefixes: BTreeSet::new(),
        };
        let stats = collection_stats(vec![("blob", oversized), ("name", field(50))]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(vec![("name", Direction::Ascending)], sequence(&optimized.compounds[0]));
        assert_eq!(1, optimized.hashed.len());
        assert_eq!(vec![("blob", Direction::Hashed)], sequence(&optimized.hashed[0]));
    }

    #[test]
    fn parallel_arrays_split_into_one_index_per_prefix() {
        let array_field = |prefix: &str, cardinality| FieldStatistics {
            cardinality,
            longest: 8,
            mode: FieldMode::Normal,
            array_prefixes: BTreeSet::from([prefix.to_owned()]),
        };
        let p = profile(&["names.first", "statuses.date", "password"], &[], &[]);
        let stats = collection_stats(vec![
            ("names.first", array_field("names", 100)),
            ("statuses.date", array_field("statuses", 50)),
            ("password", field(10)),
        ]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(2, optimized.compounds.len());

        let sequences: Vec<Vec<(&str, Direction)>> = optimized.compounds.iter().map(sequence).collect();
        assert!(sequences.contains(&vec![
            ("names.first", Direction::Ascending),
            ("password", Direction::Ascending)
        ]));
        assert!(sequences.contains(&vec![
            ("statuses.date", Direction::Ascending),
            ("password", Direction::Ascending)
        ]));
    }

    #[test]
    fn unknown_fields_are_synthesized_and_reported() {
        let p = profile(&["ghost"], &[], &[]);
        let stats = collection_stats(vec![]);

        let optimized = p.optimized_indexes(&stats, &Options::default());
        assert_eq!(vec!["ghost".to_owned()], optimized.unknown_fields);
        assert_eq!(vec![("ghost", Direction::Ascending)], sequence(&optimized.compounds[0]));
    }
}
