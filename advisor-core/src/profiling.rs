//! Consumes the database's profiling stream. Each record is parsed into a
//! [`ProfileEntry`]; records the engine does not care about (writes without a
//! filter, system namespaces, other databases) are skipped.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    options::{CursorType, FindOptions},
    Database,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{Error, Result};

const PROFILE_COLLECTION: &str = "system.profile";

/// One observed query, as the engine consumes it.
#[derive(Debug)]
pub struct ProfileEntry {
    pub collection: String,
    pub predicate: Document,
    pub sort: Option<Document>,
    pub timestamp: DateTime<Utc>,
    /// Key patterns of `IXSCAN` nodes in the recorded execution stats, for
    /// debug logging of which index served the query.
    pub used_key_patterns: Vec<String>,
}

impl ProfileEntry {
    pub fn parse(record: &Document, database: &str, state_collection: &str) -> Option<ProfileEntry> {
        let ns = record.get_str("ns").ok()?;
        let (db, collection) = ns.split_once('.')?;

        if db != database || collection.starts_with("system.") || collection == state_collection {
            return None;
        }

        let timestamp = record
            .get_datetime("ts")
            .map(|ts| ts.to_chrono())
            .unwrap_or_else(|_| Utc::now());

        let (predicate, sort) = extract_query(record)?;

        Some(ProfileEntry {
            collection: collection.to_owned(),
            predicate,
            sort,
            timestamp,
            used_key_patterns: collect_key_patterns(record),
        })
    }
}

/// Pulls the predicate and sort out of a record. Legacy records carry the
/// predicate in `query`, possibly wrapped under a `$query`/`query` alias with
/// the sort beside it; command-style records use `command.filter`/`command.q`
/// and `command.sort`.
fn extract_query(record: &Document) -> Option<(Document, Option<Document>)> {
    if let Ok(query) = record.get_document("query") {
        for alias in ["$query", "query"] {
            if let Ok(inner) = query.get_document(alias) {
                let sort = query
                    .get_document("$orderby")
                    .or_else(|_| query.get_document("orderby"))
                    .ok()
                    .or_else(|| record.get_document("orderby").ok())
                    .cloned();
                return Some((inner.clone(), sort));
            }
        }

        let sort = record.get_document("orderby").ok().cloned();
        return Some((query.clone(), sort));
    }

    if let Ok(command) = record.get_document("command") {
        let predicate = command
            .get_document("filter")
            .or_else(|_| command.get_document("q"))
            .ok()?;
        let sort = command
            .get_document("sort")
            .or_else(|_| command.get_document("orderby"))
            .ok()
            .cloned();
        return Some((predicate.clone(), sort));
    }

    None
}

fn collect_key_patterns(record: &Document) -> Vec<String> {
    fn walk(node: &Document, out: &mut Vec<String>) {
        let node_type = node.get_str("type").or_else(|_| node.get_str("stage")).ok();
        if node_type == Some("IXSCAN") {
            if let Some(pattern) = node.get("keyPattern") {
                out.push(match pattern {
                    Bson::String(text) => text.clone(),
                    other => other.to_string(),
                });
            }
        }

        for value in node.values() {
            match value {
                Bson::Document(child) => walk(child, out),
                Bson::Array(items) => {
                    for item in items {
                        if let Bson::Document(child) = item {
                            walk(child, out);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let mut patterns = Vec::new();
    if let Ok(stats) = record.get_document("execStats") {
        walk(stats, &mut patterns);
    }
    patterns
}

/// Sets the profiling level through the `profile` command. A negative level
/// leaves the deployment untouched.
pub(crate) async fn set_profile_level(database: &Database, level: i32) -> Result<()> {
    if level < 0 {
        return Ok(());
    }

    let reply = database
        .run_command(doc! { "profile": level }, None)
        .await
        .map_err(|err| Error::ProfileConfiguration {
            level,
            message: err.to_string(),
        })?;

    tracing::info!(level, was = reply.get_i32("was").unwrap_or(-1), "profiling level set");
    Ok(())
}

/// Tails the profile stream from `start_at` onward and forwards every parsed
/// entry. Returns an error when the stream ends (profiling turned off
/// mid-run) or the connection drops; the engine treats both as fatal.
pub(crate) async fn tail(
    database: Database,
    state_collection: String,
    start_at: DateTime<Utc>,
    sender: UnboundedSender<ProfileEntry>,
) -> Result<()> {
    let collection = database.collection::<Document>(PROFILE_COLLECTION);

    let options = FindOptions::builder()
        .cursor_type(Some(CursorType::TailableAwait))
        .no_cursor_timeout(Some(true))
        .build();
    let filter = doc! { "ts": { "$gt": bson::DateTime::from_chrono(start_at) } };

    let mut cursor = collection.find(Some(filter), Some(options)).await?;
    let database_name = database.name().to_owned();

    while let Some(record) = cursor.try_next().await? {
        if let Some(entry) = ProfileEntry::parse(&record, &database_name, &state_collection) {
            if sender.send(entry).is_err() {
                // The engine is gone; nothing left to feed.
                return Ok(());
            }
        }
    }

    Err(Error::ProfilingStreamEnded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_query_records() {
        let record = doc! {
            "ns": "app.users",
            "ts": bson::DateTime::now(),
            "query": { "name": "brad" },
            "orderby": { "birthday": -1 },
        };

        let entry = ProfileEntry::parse(&record, "app", "index_advisor").unwrap();
        assert_eq!("users", entry.collection);
        assert_eq!(doc! { "name": "brad" }, entry.predicate);
        assert_eq!(Some(doc! { "birthday": -1 }), entry.sort);
    }

    #[test]
    fn unwraps_the_dollar_query_alias() {
        let record = doc! {
            "ns": "app.users",
            "query": {
                "$query": { "name": "brad" },
                "$orderby": { "birthday": -1 },
            },
        };

        let entry = ProfileEntry::parse(&record, "app", "index_advisor").unwrap();
        assert_eq!(doc! { "name": "brad" }, entry.predicate);
        assert_eq!(Some(doc! { "birthday": -1 }), entry.sort);
    }

    #[test]
    fn parses_command_style_records() {
        let record = doc! {
            "ns": "app.users",
            "command": {
                "find": "users",
                "filter": { "status": "registered" },
                "sort": { "birthday": -1 },
            },
        };

        let entry = ProfileEntry::parse(&record, "app", "index_advisor").unwrap();
        assert_eq!(doc! { "status": "registered" }, entry.predicate);
        assert_eq!(Some(doc! { "birthday": -1 }), entry.sort);
    }

    #[test]
    fn skips_foreign_and_system_namespaces() {
        let query = doc! { "query": { "a": 1 } };

        let mut other_db = query.clone();
        other_db.insert("ns", "other.users");
        assert!(ProfileEntry::parse(&other_db, "app", "index_advisor").is_none());

        let mut system = query.clone();
        system.insert("ns", "app.system.profile");
        assert!(ProfileEntry::parse(&system, "app", "index_advisor").is_none());

        let mut state = query;
        state.insert("ns", "app.index_advisor");
        assert!(ProfileEntry::parse(&state, "app", "index_advisor").is_none());
    }

    #[test]
    fn records_without_a_predicate_are_skipped() {
        let record = doc! { "ns": "app.users", "op": "insert" };
        assert!(ProfileEntry::parse(&record, "app", "index_advisor").is_none());
    }

    #[test]
    fn collects_ixscan_key_patterns() {
        let record = doc! {
            "ns": "app.users",
            "query": { "name": "brad" },
            "execStats": {
                "type": "FETCH",
                "children": [
                    { "type": "IXSCAN", "keyPattern": "{ name: 1 }", "children": [] },
                ],
            },
        };

        let entry = ProfileEntry::parse(&record, "app", "index_advisor").unwrap();
        assert_eq!(vec!["{ name: 1 }".to_owned()], entry.used_key_patterns);
    }
}
