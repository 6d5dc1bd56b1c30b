//! Turns an observed query predicate plus sort into query profiles. A `$or`
//! expands every disjunct into its own profile; all other operators fold into
//! the current profiles.

use std::collections::HashSet;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};

use crate::{
    path,
    profile::{QueryProfile, Source},
};

const RANGE_OPERATORS: &[&str] = &[
    "$lt", "$lte", "$gt", "$gte", "$in", "$nin", "$ne", "$neq", "$exists", "$mod", "$all", "$regex", "$size",
];

const IGNORED_OPERATORS: &[&str] = &["$options", "$hint", "$explain", "$text"];

const PRIMARY_KEY: &str = "_id";

#[derive(Debug, Clone, Default)]
struct Subprofile {
    exact: IndexSet<String>,
    range: IndexSet<String>,
}

impl Subprofile {
    // The first classification of a path wins; a path never sits in both sets.
    fn add_exact(&mut self, field_path: String) {
        if !self.range.contains(&field_path) {
            self.exact.insert(field_path);
        }
    }

    fn add_range(&mut self, field_path: String) {
        if !self.exact.contains(&field_path) {
            self.range.insert(field_path);
        }
    }
}

/// Decomposes one observed query into profiles. Profiles with no field
/// coverage, or covering only the primary key, are discarded.
pub fn decompose(
    collection: &str,
    predicate: &Document,
    sort: Option<&Document>,
    seen_at: DateTime<Utc>,
) -> Vec<QueryProfile> {
    let mut sources = Vec::new();
    let subprofiles = walk_document(predicate, "", vec![Subprofile::default()], &mut sources);

    let sort: IndexMap<String, i32> = sort.map(parse_sort).unwrap_or_default();

    let mut profiles = Vec::new();
    let mut seen = HashSet::new();

    for subprofile in subprofiles {
        let mut profile = QueryProfile::new(
            collection,
            subprofile.exact,
            sort.clone(),
            subprofile.range,
            seen_at,
        );
        profile.sources = sources.clone();

        let referenced = profile.referenced_paths();
        if referenced.is_empty() {
            continue;
        }
        if referenced.len() == 1 && referenced.contains(PRIMARY_KEY) {
            continue;
        }

        if seen.insert(profile.equivalence_key()) {
            profiles.push(profile);
        }
    }

    profiles
}

fn parse_sort(sort: &Document) -> IndexMap<String, i32> {
    let mut keys = IndexMap::new();
    for (key, value) in sort {
        let direction = match value {
            Bson::Int32(d) => *d,
            Bson::Int64(d) => *d as i32,
            Bson::Double(d) => *d as i32,
            _ => continue,
        };
        keys.insert(key.clone(), if direction < 0 { -1 } else { 1 });
    }
    keys
}

fn walk_document(
    document: &Document,
    prefix: &str,
    mut current: Vec<Subprofile>,
    sources: &mut Vec<Source>,
) -> Vec<Subprofile> {
    for (key, value) in document {
        if key.starts_with('$') {
            current = walk_operator(key, value, prefix, current, sources);
        } else {
            let field_path = path::join(prefix, key);
            current = walk_leaf(&field_path, value, current, sources);
        }
    }

    current
}

fn walk_operator(
    operator: &str,
    value: &Bson,
    prefix: &str,
    mut current: Vec<Subprofile>,
    sources: &mut Vec<Source>,
) -> Vec<Subprofile> {
    match operator {
        "$and" => {
            if let Bson::Array(operands) = value {
                for operand in operands {
                    if let Bson::Document(operand) = operand {
                        current = walk_document(operand, prefix, current, sources);
                    }
                }
            }
            current
        }
        "$or" => {
            // Every disjunct becomes an independent profile. Each disjunct is
            // analyzed on top of the previous one's result, so earlier
            // disjuncts' classifications carry into later profiles; nested
            // disjunctions multiply.
            if let Bson::Array(operands) = value {
                let mut expanded = Vec::new();
                let mut running = current;

                for operand in operands {
                    if let Bson::Document(operand) = operand {
                        running = walk_document(operand, prefix, running, sources);
                        expanded.extend(running.iter().cloned());
                    }
                }

                expanded
            } else {
                current
            }
        }
        "$not" => match value {
            Bson::Document(subtree) => walk_document(subtree, prefix, current, sources),
            _ => current,
        },
        "$comment" => {
            if let Bson::Document(meta) = value {
                let source = Source {
                    source: meta.get_str("source").unwrap_or_default().to_owned(),
                    version: meta.get_str("version").unwrap_or_default().to_owned(),
                };
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
            current
        }
        op if IGNORED_OPERATORS.contains(&op) => current,
        op => {
            tracing::warn!(operator = op, "skipping unrecognized query operator");
            current
        }
    }
}

fn walk_leaf(
    field_path: &str,
    value: &Bson,
    mut current: Vec<Subprofile>,
    sources: &mut Vec<Source>,
) -> Vec<Subprofile> {
    let operator_document = match value {
        Bson::Document(doc) => doc
            .keys()
            .next()
            .map(|k| k.starts_with('$'))
            .unwrap_or(false)
            .then_some(doc),
        _ => None,
    };

    let Some(operators) = operator_document else {
        // A primitive, date, object id, embedded document or array literal is
        // an exact match; a bare regex constrains a range.
        match value {
            Bson::RegularExpression(_) => {
                for subprofile in &mut current {
                    subprofile.add_range(field_path.to_owned());
                }
            }
            _ => {
                for subprofile in &mut current {
                    subprofile.add_exact(field_path.to_owned());
                }
            }
        }
        return current;
    };

    let mut exact = false;
    let mut range = false;

    for (operator, operand) in operators {
        match operator.as_str() {
            "$eq" => exact = true,
            op if RANGE_OPERATORS.contains(&op) => range = true,
            "$elemMatch" => {
                if let Bson::Document(subtree) = operand {
                    let is_operator_subtree = subtree.keys().next().map(|k| k.starts_with('$')).unwrap_or(false);
                    current = if is_operator_subtree {
                        // {tags: {$elemMatch: {$gt: 5}}} constrains the array
                        // field itself.
                        walk_leaf(field_path, operand, current, sources)
                    } else {
                        walk_document(subtree, field_path, current, sources)
                    };
                }
            }
            "$not" => {
                current = walk_leaf(field_path, operand, current, sources);
            }
            op if IGNORED_OPERATORS.contains(&op) => {}
            op => {
                tracing::warn!(operator = op, path = field_path, "skipping unrecognized query operator");
            }
        }
    }

    if exact {
        for subprofile in &mut current {
            subprofile.add_exact(field_path.to_owned());
        }
    } else if range {
        for subprofile in &mut current {
            subprofile.add_range(field_path.to_owned());
        }
    }

    current
}
