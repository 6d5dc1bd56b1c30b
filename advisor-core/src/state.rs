//! Persists the engine state as one document, upserted wholesale. The engine
//! assumes it is the only writer. Map keys are field paths and may contain
//! `.`, which some server versions reject in document keys, so every key is
//! encoded on the way out and decoded on the way in.

use std::collections::HashMap;

use bson::{doc, Bson, Document};
use mongodb::{options::ReplaceOptions, Database};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    path,
    profile::QueryProfile,
    sampler::{CollectionStatistics, IndexStatistics},
};

const STATE_DOCUMENT_ID: &str = "index-advisor-state";

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PersistedState {
    pub query_set: Vec<QueryProfile>,
    pub sampler: PersistedSampler,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PersistedSampler {
    pub collection_statistics: HashMap<String, CollectionStatistics>,
    pub index_statistics: HashMap<String, IndexStatistics>,
}

pub(crate) async fn save(database: &Database, collection: &str, state: &PersistedState) -> Result<()> {
    let serialized = bson::to_document(state).map_err(|err| Error::StatePersistence(err.to_string()))?;
    let mut document = encode_keys(serialized);
    document.insert("_id", STATE_DOCUMENT_ID);

    database
        .collection::<Document>(collection)
        .replace_one(
            doc! { "_id": STATE_DOCUMENT_ID },
            document,
            Some(ReplaceOptions::builder().upsert(Some(true)).build()),
        )
        .await
        .map_err(|err| Error::StatePersistence(err.to_string()))?;

    Ok(())
}

pub(crate) async fn load(database: &Database, collection: &str) -> Result<Option<PersistedState>> {
    let document = database
        .collection::<Document>(collection)
        .find_one(Some(doc! { "_id": STATE_DOCUMENT_ID }), None)
        .await?;

    let Some(document) = document else {
        return Ok(None);
    };

    let mut document = decode_keys(document);
    document.remove("_id");

    let state = bson::from_document(document).map_err(|err| Error::StateCorrupt(err.to_string()))?;
    Ok(Some(state))
}

fn encode_keys(document: Document) -> Document {
    map_keys(document, &path::encode_key)
}

fn decode_keys(document: Document) -> Document {
    map_keys(document, &path::decode_key)
}

fn map_keys(document: Document, transform: &dyn Fn(&str) -> String) -> Document {
    document
        .into_iter()
        .map(|(key, value)| (transform(&key), map_value_keys(value, transform)))
        .collect()
}

fn map_value_keys(value: Bson, transform: &dyn Fn(&str) -> String) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(map_keys(doc, transform)),
        Bson::Array(items) => Bson::Array(items.into_iter().map(|v| map_value_keys(v, transform)).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};

    use crate::sampler::{FieldMode, FieldStatistics};

    fn walk_keys(document: &Document, check: &dyn Fn(&str)) {
        for (key, value) in document {
            check(key);
            match value {
                Bson::Document(doc) => walk_keys(doc, check),
                Bson::Array(items) => {
                    for item in items {
                        if let Bson::Document(doc) = item {
                            walk_keys(doc, check);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn sample_state() -> PersistedState {
        let mut profile = QueryProfile::new(
            "users",
            ["name".to_owned()].into_iter().collect(),
            [("names.first".to_owned(), -1)].into_iter().collect(),
            ["email".to_owned()].into_iter().collect(),
            Utc::now(),
        );
        profile.usage_count = 7;

        let statistics = CollectionStatistics {
            fields: BTreeMap::from([(
                "names.first".to_owned(),
                FieldStatistics {
                    cardinality: 42,
                    longest: 12,
                    mode: FieldMode::Normal,
                    array_prefixes: BTreeSet::from(["names".to_owned()]),
                },
            )]),
            known_array_prefixes: BTreeSet::from(["names".to_owned()]),
            sampled_documents: 100,
            last_sample_time: Utc::now(),
        };

        PersistedState {
            query_set: vec![profile],
            sampler: PersistedSampler {
                collection_statistics: HashMap::from([("users".to_owned(), statistics)]),
                index_statistics: HashMap::new(),
            },
        }
    }

    #[test]
    fn no_dots_survive_encoding() {
        let state = sample_state();
        let encoded = encode_keys(bson::to_document(&state).unwrap());

        walk_keys(&encoded, &|key| {
            assert!(!key.contains('.'), "key `{key}` still contains a dot");
        });
    }

    #[test]
    fn state_round_trips() {
        let state = sample_state();

        let encoded = encode_keys(bson::to_document(&state).unwrap());
        let decoded: PersistedState = bson::from_document(decode_keys(encoded)).unwrap();

        assert_eq!(1, decoded.query_set.len());
        let profile = &decoded.query_set[0];
        assert_eq!(7, profile.usage_count);
        assert_eq!(Some(&-1), profile.sort.get("names.first"));

        let statistics = &decoded.sampler.collection_statistics["users"];
        assert_eq!(42, statistics.fields["names.first"].cardinality);
        assert!(statistics.known_array_prefixes.contains("names"));
    }

    #[test]
    fn timestamps_serialize_as_iso_8601_strings() {
        let state = sample_state();
        let document = bson::to_document(&state).unwrap();

        let profile = document.get_array("query_set").unwrap()[0].as_document().unwrap();
        assert!(profile.get_str("last_query_time").is_ok());
    }
}
