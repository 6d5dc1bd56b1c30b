//! Diffs the recommended index set against what the database actually has,
//! honoring the ownership rule: only indexes whose name carries the `auto_`
//! prefix may ever be dropped.

use std::{collections::BTreeMap, fmt::Write as _, sync::Arc};

use bson::Document;
use itertools::Itertools;

use crate::{
    config::Options,
    index::{CompoundIndex, IndexSet, OWNERSHIP_PREFIX, PRIMARY_KEY_INDEX_NAME},
    query_set::Recommendation,
};

/// An index as listed by the database. `parsed` is `None` for key types the
/// engine does not model (text, geo, wildcard); such indexes never match a
/// recommendation and are always user-owned.
#[derive(Debug, Clone)]
pub struct ExistingIndex {
    pub name: String,
    pub keys: Document,
    pub parsed: Option<CompoundIndex>,
}

impl ExistingIndex {
    pub fn new(collection: &str, name: String, keys: Document) -> Self {
        let parsed = CompoundIndex::from_key_document(collection, &keys);
        ExistingIndex { name, keys, parsed }
    }

    pub fn is_engine_owned(&self) -> bool {
        self.name.starts_with(OWNERSHIP_PREFIX)
    }
}

#[derive(Debug)]
pub struct CollectionActions {
    pub collection: String,
    pub create: Vec<Arc<CompoundIndex>>,
    pub keep: Vec<ExistingIndex>,
    pub drop: Vec<ExistingIndex>,
}

impl CollectionActions {
    fn has_changes(&self) -> bool {
        !self.create.is_empty() || !self.drop.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    pub collections: Vec<CollectionActions>,
}

impl Reconciliation {
    pub fn has_changes(&self) -> bool {
        self.collections.iter().any(|c| c.has_changes())
    }

    /// Renders the plan in a human-readable form. `[+]` create, `[-]` drop,
    /// `[=]` keep.
    pub fn render(&self, recommendation: &Recommendation, options: &Options) -> String {
        if !self.has_changes() && options.show_changes_only {
            return "No index changes recommended.\n".to_owned();
        }

        let mut out = String::new();

        for actions in &self.collections {
            for index in &actions.create {
                if options.simple {
                    let _ = writeln!(out, "create {} {}", actions.collection, index);
                    continue;
                }

                let _ = write!(out, "[+] Index `{}` on `{}` ({index})", index.name(), actions.collection);

                if options.verbose {
                    if let Some(recommended) = recommendation.find(index) {
                        let _ = write!(
                            out,
                            " serving {} query shape(s), {} observation(s)",
                            recommended.serves, recommended.usage_count
                        );

                        if let Some(statistics) = &recommended.statistics {
                            let reductions = statistics
                                .positions
                                .values()
                                .map(|p| format!("{:.0}%", p.reduction * 100.0))
                                .join(" / ");
                            let _ = write!(out, ", reduction {reductions}");
                        }
                    }
                }

                out.push('\n');
            }

            for existing in &actions.drop {
                if options.simple {
                    let _ = writeln!(out, "drop {} {}", actions.collection, existing.name);
                } else {
                    let _ = writeln!(out, "[-] Index `{}` on `{}`", existing.name, actions.collection);
                }
            }

            if !options.show_changes_only && !options.simple {
                for existing in &actions.keep {
                    let _ = writeln!(out, "[=] Index `{}` on `{}`", existing.name, actions.collection);
                }
            }
        }

        if out.is_empty() {
            out.push_str("No index changes recommended.\n");
        }

        out
    }
}

/// Splits recommended vs. existing into per-collection create/keep/drop.
/// The primary-key index is never part of any action; existing indexes whose
/// names lack the ownership prefix are kept even when superfluous.
pub fn reconcile(recommended: &IndexSet, existing: &BTreeMap<String, Vec<ExistingIndex>>) -> Reconciliation {
    let recommended_by_collection = recommended.by_collection();

    let mut collections: BTreeMap<&str, CollectionActions> = BTreeMap::new();

    let collection_names: std::collections::BTreeSet<&str> = recommended_by_collection
        .keys()
        .copied()
        .chain(existing.keys().map(|s| s.as_str()))
        .collect();

    for collection in collection_names {
        let wanted: Vec<&Arc<CompoundIndex>> = recommended_by_collection
            .get(collection)
            .map(|v| v.to_vec())
            .unwrap_or_default();

        let present = existing.get(collection).map(|v| v.as_slice()).unwrap_or_default();

        let mut actions = CollectionActions {
            collection: collection.to_owned(),
            create: Vec::new(),
            keep: Vec::new(),
            drop: Vec::new(),
        };

        let mut matched: Vec<bool> = vec![false; wanted.len()];

        for index in present {
            if index.name == PRIMARY_KEY_INDEX_NAME {
                continue;
            }

            let matching = index.parsed.as_ref().and_then(|parsed| {
                wanted
                    .iter()
                    .position(|w| w.sequence_key() == parsed.sequence_key())
            });

            match matching {
                Some(position) => {
                    matched[position] = true;
                    actions.keep.push(index.clone());
                }
                None if index.is_engine_owned() => actions.drop.push(index.clone()),
                None => actions.keep.push(index.clone()),
            }
        }

        for (position, index) in wanted.iter().enumerate() {
            if !matched[position] {
                actions.create.push((*index).clone());
            }
        }

        collections.insert(collection, actions);
    }

    Reconciliation {
        collections: collections.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Direction, IndexField};
    use bson::doc;

    fn recommended(collection: &str, paths: &[&str]) -> Arc<CompoundIndex> {
        Arc::new(CompoundIndex::new(
            collection,
            paths.iter().map(|p| IndexField::new(*p, Direction::Ascending)).collect(),
        ))
    }

    #[test]
    fn ownership_rule() {
        let wanted = recommended("users", &["email"]);
        let set: IndexSet = [wanted.clone()].into_iter().collect();

        let existing = BTreeMap::from([(
            "users".to_owned(),
            vec![
                ExistingIndex::new("users", "_id_".to_owned(), doc! { "_id": 1 }),
                ExistingIndex::new("users", "user_email_unique".to_owned(), doc! { "name": 1 }),
                ExistingIndex::new("users", "auto_abc".to_owned(), doc! { "status": 1 }),
                ExistingIndex::new("users", wanted.name(), wanted.key_document()),
            ],
        )]);

        let plan = reconcile(&set, &existing);
        assert_eq!(1, plan.collections.len());

        let actions = &plan.collections[0];
        assert!(actions.create.is_empty());
        assert_eq!(vec!["auto_abc"], actions.drop.iter().map(|e| e.name.as_str()).collect::<Vec<_>>());

        let mut kept: Vec<String> = actions.keep.iter().map(|e| e.name.clone()).collect();
        kept.sort();
        let mut expected = vec![wanted.name(), "user_email_unique".to_owned()];
        expected.sort();
        assert_eq!(expected, kept);
    }

    #[test]
    fn missing_recommendations_are_created() {
        let wanted = recommended("users", &["email", "name"]);
        let set: IndexSet = [wanted.clone()].into_iter().collect();

        let plan = reconcile(&set, &BTreeMap::new());

        assert_eq!(1, plan.collections.len());
        assert_eq!(1, plan.collections[0].create.len());
        assert!(plan.has_changes());
    }

    #[test]
    fn primary_key_index_is_untouched() {
        let existing = BTreeMap::from([(
            "users".to_owned(),
            vec![ExistingIndex::new("users", "_id_".to_owned(), doc! { "_id": 1 })],
        )]);

        let plan = reconcile(&IndexSet::default(), &existing);
        let actions = &plan.collections[0];

        assert!(actions.create.is_empty());
        assert!(actions.drop.is_empty());
        assert!(actions.keep.is_empty());
    }

    #[test]
    fn unmodeled_index_types_are_kept() {
        let existing = BTreeMap::from([(
            "users".to_owned(),
            vec![ExistingIndex::new("users", "bio_text".to_owned(), doc! { "bio": "text" })],
        )]);

        let plan = reconcile(&IndexSet::default(), &existing);
        assert_eq!(1, plan.collections[0].keep.len());
    }

    #[test]
    fn direction_differences_do_not_match() {
        let wanted = Arc::new(CompoundIndex::new(
            "users",
            vec![IndexField::new("birthday", Direction::Descending)],
        ));
        let set: IndexSet = [wanted].into_iter().collect();

        let existing = BTreeMap::from([(
            "users".to_owned(),
            vec![ExistingIndex::new("users", "auto_old".to_owned(), doc! { "birthday": 1 })],
        )]);

        let plan = reconcile(&set, &existing);
        let actions = &plan.collections[0];

        assert_eq!(1, actions.create.len());
        assert_eq!(1, actions.drop.len());
    }

    #[test]
    fn render_marks_every_action() {
        let wanted = recommended("users", &["email"]);
        let set: IndexSet = [wanted.clone()].into_iter().collect();

        let existing = BTreeMap::from([(
            "users".to_owned(),
            vec![
                ExistingIndex::new("users", "auto_stale".to_owned(), doc! { "status": 1 }),
                ExistingIndex::new("users", "user_email_unique".to_owned(), doc! { "name": 1 }),
            ],
        )]);

        let plan = reconcile(&set, &existing);
        let rendered = plan.render(&Recommendation::default(), &Options::default());

        assert!(rendered.contains("[+] Index"));
        assert!(rendered.contains("[-] Index `auto_stale`"));
        assert!(rendered.contains("[=] Index `user_email_unique`"));

        let changes_only = plan.render(
            &Recommendation::default(),
            &Options {
                show_changes_only: true,
                ..Options::default()
            },
        );
        assert!(!changes_only.contains("[=]"));
    }
}
