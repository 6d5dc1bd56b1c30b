//! Statistics derived from sampled documents. The accumulators in this module
//! are pure: they observe `Document`s one at a time and produce the cached
//! statistics records when the sampling session finishes. All database access
//! lives in the parent module.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    index::CompoundIndex,
    path::{self, EMPTY_ARRAY_SEGMENT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMode {
    Normal,
    /// The field's values are too large for a regular index entry; it can
    /// only be indexed through a separate single-field hashed index.
    Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStatistics {
    /// Distinct-value count seen in the sample.
    pub cardinality: u64,
    /// Longest stringified value seen in the sample.
    pub longest: usize,
    pub mode: FieldMode,
    /// Ancestor paths of this field that hold arrays.
    pub array_prefixes: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub fields: BTreeMap<String, FieldStatistics>,
    pub known_array_prefixes: BTreeSet<String>,
    pub sampled_documents: u64,
    pub last_sample_time: DateTime<Utc>,
}

impl CollectionStatistics {
    pub fn field(&self, path: &str) -> Option<&FieldStatistics> {
        self.fields.get(path)
    }

    /// Statistics for a field the sample never saw. The field probably does
    /// not exist in the data; it gets the minimum viable record so it is
    /// neither dropped nor preferred during ordering.
    pub fn synthesize(&self, path: &str, minimum_cardinality: u64) -> FieldStatistics {
        FieldStatistics {
            cardinality: minimum_cardinality,
            longest: 1,
            mode: FieldMode::Normal,
            array_prefixes: path::strict_prefixes(path)
                .filter(|p| self.known_array_prefixes.contains(*p))
                .map(|p| p.to_owned())
                .collect(),
        }
    }

    pub fn demote_to_hash(&mut self, path: &str) -> bool {
        match self.fields.get_mut(path) {
            Some(stats) => {
                stats.mode = FieldMode::Hash;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixStatistics {
    /// Average number of sampled index entries sharing a key tuple at this
    /// prefix length.
    pub current_average_distinct: f64,
    /// The previous sampling session's value, kept for reporting drift.
    pub last_average_distinct: f64,
    /// Ratio to the previous position; values near 1 mean the field adds
    /// little specificity.
    pub reduction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatistics {
    /// One entry per index position, in field order.
    pub positions: IndexMap<String, PrefixStatistics>,
    pub last_sample_time: DateTime<Utc>,
}

impl IndexStatistics {
    pub fn position(&self, path: &str) -> Option<&PrefixStatistics> {
        self.positions.get(path)
    }
}

/// Fingerprint of a single BSON value. The statistics only ever need to
/// compare values for identity, so an order-insensitive 64-bit digest bounds
/// the memory a sampling session can take.
pub(crate) fn fingerprint(value: &Bson) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (value.element_type() as u8).hash(&mut hasher);
    value.to_string().hash(&mut hasher);
    hasher.finish()
}

fn combine(tuple: u64, value: u64) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tuple.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

fn stringified_len(value: &Bson) -> usize {
    value.to_string().len()
}

/// All values a document holds at a dotted path. Arrays are transparent, so a
/// multikey field yields one value per element; a missing field indexes as a
/// single null entry.
pub(crate) fn field_values(document: &Document, field_path: &str) -> Vec<Bson> {
    fn descend(value: &Bson, segments: &[&str], out: &mut Vec<Bson>) {
        match value {
            Bson::Array(items) => {
                for item in items {
                    descend(item, segments, out);
                }
            }
            Bson::Document(doc) => match segments.split_first() {
                Some((head, tail)) => {
                    if let Some(inner) = doc.get(*head) {
                        descend(inner, tail, out);
                    }
                }
                None => out.push(value.clone()),
            },
            other => {
                if segments.is_empty() {
                    out.push(other.clone());
                }
            }
        }
    }

    let segments: Vec<&str> = field_path.split('.').collect();
    let mut out = Vec::new();

    if let Some(first) = document.get(segments[0]) {
        descend(first, &segments[1..], &mut out);
    }

    if out.is_empty() {
        out.push(Bson::Null);
    }

    out
}

#[derive(Debug, Default)]
struct FieldAccumulator {
    fingerprints: HashSet<u64>,
    longest: usize,
}

/// Derives [`CollectionStatistics`] from a stream of sampled documents.
#[derive(Debug)]
pub(crate) struct CollectionAccumulator {
    longest_indexable_value: usize,
    fields: BTreeMap<String, FieldAccumulator>,
    array_prefixes: BTreeSet<String>,
    documents: u64,
}

impl CollectionAccumulator {
    pub(crate) fn new(longest_indexable_value: usize) -> Self {
        CollectionAccumulator {
            longest_indexable_value,
            fields: BTreeMap::new(),
            array_prefixes: BTreeSet::new(),
            documents: 0,
        }
    }

    pub(crate) fn observe(&mut self, document: &Document) {
        self.documents += 1;
        for (key, value) in document {
            self.flatten(key.clone(), value);
        }
    }

    fn flatten(&mut self, prefix: String, value: &Bson) {
        match value {
            Bson::Document(doc) => {
                for (key, inner) in doc {
                    self.flatten(path::join(&prefix, key), inner);
                }
            }
            Bson::Array(items) if items.is_empty() => {
                self.array_prefixes.insert(prefix.clone());
                self.leaf(path::join(&prefix, EMPTY_ARRAY_SEGMENT), value);
            }
            Bson::Array(items) => {
                self.array_prefixes.insert(prefix.clone());
                // Element positions collapse onto the array's own path.
                for item in items {
                    self.flatten(prefix.clone(), item);
                }
            }
            other => self.leaf(prefix, other),
        }
    }

    fn leaf(&mut self, field_path: String, value: &Bson) {
        let field = self.fields.entry(field_path).or_default();
        field.fingerprints.insert(fingerprint(value));
        field.longest = field.longest.max(stringified_len(value));
    }

    pub(crate) fn finish(self, now: DateTime<Utc>) -> CollectionStatistics {
        let known_array_prefixes = self.array_prefixes;
        let longest_indexable_value = self.longest_indexable_value;

        let fields = self
            .fields
            .into_iter()
            .map(|(field_path, acc)| {
                let stats = FieldStatistics {
                    cardinality: acc.fingerprints.len() as u64,
                    longest: acc.longest,
                    mode: if acc.longest > longest_indexable_value {
                        FieldMode::Hash
                    } else {
                        FieldMode::Normal
                    },
                    array_prefixes: path::strict_prefixes(&field_path)
                        .filter(|p| known_array_prefixes.contains(*p))
                        .map(|p| p.to_owned())
                        .collect(),
                };
                (field_path, stats)
            })
            .collect();

        CollectionStatistics {
            fields,
            known_array_prefixes,
            sampled_documents: self.documents,
            last_sample_time: now,
        }
    }
}

struct IndexTarget {
    index: Arc<CompoundIndex>,
    /// One frequency map per prefix length, keyed by key-tuple fingerprint.
    prefixes: Vec<HashMap<u64, u64>>,
}

/// Derives per-prefix [`IndexStatistics`] for a set of candidate indexes from
/// one shared stream of sampled documents.
pub(crate) struct IndexAccumulator {
    targets: Vec<IndexTarget>,
    documents: u64,
}

impl IndexAccumulator {
    pub(crate) fn new(indexes: Vec<Arc<CompoundIndex>>) -> Self {
        IndexAccumulator {
            targets: indexes
                .into_iter()
                .map(|index| {
                    let prefixes = vec![HashMap::new(); index.len()];
                    IndexTarget { index, prefixes }
                })
                .collect(),
            documents: 0,
        }
    }

    pub(crate) fn observe(&mut self, document: &Document) {
        self.documents += 1;

        for target in &mut self.targets {
            let distinct_per_field: Vec<Vec<u64>> = target
                .index
                .paths()
                .map(|p| {
                    let mut seen = HashSet::new();
                    field_values(document, p)
                        .iter()
                        .map(fingerprint)
                        .filter(|fp| seen.insert(*fp))
                        .collect()
                })
                .collect();

            // A multikey field makes the document produce one index entry per
            // element, so each prefix length tallies the cartesian product of
            // the distinct values seen so far.
            let mut tuples: Vec<u64> = vec![0];
            for (position, values) in distinct_per_field.iter().enumerate() {
                tuples = tuples
                    .iter()
                    .flat_map(|tuple| values.iter().map(|value| combine(*tuple, *value)))
                    .collect();

                let frequencies = &mut target.prefixes[position];
                for tuple in &tuples {
                    *frequencies.entry(*tuple).or_insert(0) += 1;
                }
            }
        }
    }

    pub(crate) fn finish(
        self,
        now: DateTime<Utc>,
        previous: &HashMap<String, IndexStatistics>,
    ) -> Vec<(Arc<CompoundIndex>, IndexStatistics)> {
        let documents = self.documents;

        self.targets
            .into_iter()
            .map(|target| {
                let prior = previous.get(&target.index.name());
                let mut positions = IndexMap::with_capacity(target.index.len());
                let mut previous_level = documents as f64;

                for (position, field_path) in target.index.paths().enumerate() {
                    let frequencies = &target.prefixes[position];
                    let current = if frequencies.is_empty() {
                        0.0
                    } else {
                        frequencies.values().sum::<u64>() as f64 / frequencies.len() as f64
                    };

                    let reduction = if previous_level > 0.0 { current / previous_level } else { 1.0 };

                    let last = prior
                        .and_then(|stats| stats.position(field_path))
                        .map(|p| p.current_average_distinct)
                        .unwrap_or(current);

                    positions.insert(
                        field_path.to_owned(),
                        PrefixStatistics {
                            current_average_distinct: current,
                            last_average_distinct: last,
                            reduction,
                        },
                    );

                    previous_level = current;
                }

                (
                    target.index,
                    IndexStatistics {
                        positions,
                        last_sample_time: now,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Direction, IndexField};
    use bson::doc;

    fn finish(acc: CollectionAccumulator) -> CollectionStatistics {
        acc.finish(Utc::now())
    }

    #[test]
    fn cardinality_counts_distinct_values() {
        let mut acc = CollectionAccumulator::new(500);
        acc.observe(&doc! { "status": "registered" });
        acc.observe(&doc! { "status": "registered" });
        acc.observe(&doc! { "status": "pending" });

        let stats = finish(acc);
        assert_eq!(2, stats.field("status").unwrap().cardinality);
        assert_eq!(3, stats.sampled_documents);
    }

    #[test]
    fn long_values_switch_the_field_to_hash_mode() {
        let mut acc = CollectionAccumulator::new(16);
        acc.observe(&doc! { "blob": "x".repeat(64), "name": "brad" });

        let stats = finish(acc);
        assert_eq!(FieldMode::Hash, stats.field("blob").unwrap().mode);
        assert_eq!(FieldMode::Normal, stats.field("name").unwrap().mode);
    }

    #[test]
    fn array_positions_collapse_and_mark_prefixes() {
        let mut acc = CollectionAccumulator::new(500);
        acc.observe(&doc! {
            "names": [ { "first": "brad" }, { "first": "anna" } ],
            "password": "secret",
        });

        let stats = finish(acc);
        let first = stats.field("names.first").unwrap();
        assert_eq!(2, first.cardinality);
        assert_eq!(BTreeSet::from(["names".to_owned()]), first.array_prefixes);
        assert!(stats.known_array_prefixes.contains("names"));
        assert!(stats.field("password").unwrap().array_prefixes.is_empty());
    }

    #[test]
    fn empty_arrays_leave_a_marker_entry() {
        let mut acc = CollectionAccumulator::new(500);
        acc.observe(&doc! { "tags": [] });

        let stats = finish(acc);
        assert!(stats.field("tags.[]").is_some());
        assert!(stats.known_array_prefixes.contains("tags"));
    }

    #[test]
    fn synthesized_fields_get_minimum_cardinality() {
        let mut acc = CollectionAccumulator::new(500);
        acc.observe(&doc! { "names": [ { "first": "brad" } ] });

        let stats = finish(acc);
        let synthesized = stats.synthesize("names.last", 3);
        assert_eq!(3, synthesized.cardinality);
        assert_eq!(FieldMode::Normal, synthesized.mode);
        assert_eq!(BTreeSet::from(["names".to_owned()]), synthesized.array_prefixes);
    }

    #[test]
    fn field_values_are_multikey_aware() {
        let document = doc! {
            "names": [ { "first": "brad" }, { "first": "anna" }, { "first": "brad" } ],
            "age": 33,
        };

        assert_eq!(
            vec![
                Bson::String("brad".to_owned()),
                Bson::String("anna".to_owned()),
                Bson::String("brad".to_owned())
            ],
            field_values(&document, "names.first")
        );
        assert_eq!(vec![Bson::Int32(33)], field_values(&document, "age"));
        assert_eq!(vec![Bson::Null], field_values(&document, "missing"));
    }

    fn compound(paths: &[&str]) -> Arc<CompoundIndex> {
        Arc::new(CompoundIndex::new(
            "users",
            paths.iter().map(|p| IndexField::new(*p, Direction::Ascending)).collect(),
        ))
    }

    #[test]
    fn average_distinct_and_reduction() {
        let index = compound(&["name", "birthday"]);
        let mut acc = IndexAccumulator::new(vec![index.clone()]);

        // Four documents, two distinct names, each name two distinct birthdays.
        acc.observe(&doc! { "name": "brad", "birthday": "1990-01-01" });
        acc.observe(&doc! { "name": "brad", "birthday": "1990-01-02" });
        acc.observe(&doc! { "name": "anna", "birthday": "1990-01-01" });
        acc.observe(&doc! { "name": "anna", "birthday": "1990-01-02" });

        let stats = &acc.finish(Utc::now(), &HashMap::new())[0].1;

        let name = stats.position("name").unwrap();
        assert_eq!(2.0, name.current_average_distinct);
        assert_eq!(0.5, name.reduction);

        let birthday = stats.position("birthday").unwrap();
        assert_eq!(1.0, birthday.current_average_distinct);
        assert_eq!(0.5, birthday.reduction);
    }

    #[test]
    fn useless_field_has_reduction_near_one() {
        let index = compound(&["name", "flag"]);
        let mut acc = IndexAccumulator::new(vec![index]);

        acc.observe(&doc! { "name": "brad", "flag": true });
        acc.observe(&doc! { "name": "brad", "flag": true });
        acc.observe(&doc! { "name": "anna", "flag": true });
        acc.observe(&doc! { "name": "anna", "flag": true });

        let stats = &acc.finish(Utc::now(), &HashMap::new())[0].1;
        assert_eq!(1.0, stats.position("flag").unwrap().reduction);
    }

    #[test]
    fn multikey_fields_expand_the_cartesian_product() {
        let index = compound(&["tags", "owner"]);
        let mut acc = IndexAccumulator::new(vec![index]);

        acc.observe(&doc! { "tags": ["a", "b"], "owner": "brad" });

        let stats = &acc.finish(Utc::now(), &HashMap::new())[0].1;
        // Two distinct tag entries, each paired with the single owner.
        assert_eq!(1.0, stats.position("tags").unwrap().current_average_distinct);
        assert_eq!(1.0, stats.position("owner").unwrap().current_average_distinct);
    }

    #[test]
    fn previous_averages_are_carried_over() {
        let index = compound(&["name"]);

        let mut first = IndexAccumulator::new(vec![index.clone()]);
        first.observe(&doc! { "name": "brad" });
        first.observe(&doc! { "name": "brad" });
        let previous: HashMap<String, IndexStatistics> = first
            .finish(Utc::now(), &HashMap::new())
            .into_iter()
            .map(|(index, stats)| (index.name(), stats))
            .collect();

        let mut second = IndexAccumulator::new(vec![index.clone()]);
        second.observe(&doc! { "name": "brad" });
        let stats = &second.finish(Utc::now(), &previous)[0].1;

        let position = stats.position("name").unwrap();
        assert_eq!(1.0, position.current_average_distinct);
        assert_eq!(2.0, position.last_average_distinct);
    }
}
