//! The long-running engine: drains observed queries into the query set and
//! runs a synchronization cycle on a fixed interval. One logical worker owns
//! all mutable state; the profile tailer is the only concurrent task and
//! communicates through a queue.

use std::collections::BTreeMap;

use bson::Document;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::Database;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Duration, Instant},
};

use crate::{
    config::Options,
    decomposer,
    error::{Error, Result},
    profiling::{self, ProfileEntry},
    query_set::QuerySet,
    reconciler::{self, ExistingIndex, Reconciliation},
    sampler::Sampler,
    state::{self, PersistedSampler, PersistedState},
};

pub struct Engine {
    database: Database,
    options: Options,
    query_set: QuerySet,
    sampler: Sampler,
}

impl Engine {
    pub fn new(database: Database, options: Options) -> Self {
        let sampler = Sampler::new(database.clone(), &options);
        Engine {
            database,
            options,
            query_set: QuerySet::new(),
            sampler,
        }
    }

    /// Runs until a fatal error. Recoverable conditions are logged and
    /// absorbed inside their steps; anything that escapes here terminates the
    /// process.
    pub async fn run(mut self) -> Result<()> {
        profiling::set_profile_level(&self.database, self.options.profile_level).await?;
        self.load_state().await?;

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let tailer = tokio::spawn(profiling::tail(
            self.database.clone(),
            self.options.state_collection.clone(),
            Utc::now(),
            sender,
        ));

        let interval = Duration::from_secs(self.options.index_synchronization_interval);
        let mut next_cycle = Instant::now() + interval;

        loop {
            tokio::select! {
                entry = receiver.recv() => {
                    match entry {
                        Some(entry) => self.observe(entry),
                        None => {
                            return match tailer.await {
                                Ok(Ok(())) => Err(Error::ProfilingStreamEnded),
                                Ok(Err(err)) => Err(err),
                                Err(join_error) => {
                                    tracing::error!(error = %join_error, "profile tailer panicked");
                                    Err(Error::ProfilingStreamEnded)
                                }
                            };
                        }
                    }
                }
                _ = sleep_until(next_cycle) => {
                    self.synchronize().await?;
                    // The interval is measured from the end of the cycle.
                    next_cycle = Instant::now() + interval;
                }
            }
        }
    }

    fn observe(&mut self, entry: ProfileEntry) {
        if !entry.used_key_patterns.is_empty() {
            tracing::debug!(
                collection = entry.collection.as_str(),
                indexes = ?entry.used_key_patterns,
                "observed query already used an index"
            );
        }

        let profiles = decomposer::decompose(
            &entry.collection,
            &entry.predicate,
            entry.sort.as_ref(),
            entry.timestamp,
        );

        for profile in profiles {
            self.query_set.add(profile);
        }
    }

    async fn load_state(&mut self) -> Result<()> {
        if let Some(persisted) = state::load(&self.database, &self.options.state_collection).await? {
            tracing::info!(
                profiles = persisted.query_set.len(),
                collections = persisted.sampler.collection_statistics.len(),
                "restored engine state"
            );
            self.query_set = QuerySet::from_profiles(persisted.query_set);
            self.sampler.restore(
                persisted.sampler.collection_statistics,
                persisted.sampler.index_statistics,
            );
        }
        Ok(())
    }

    async fn persist_state(&self) -> Result<()> {
        let snapshot = PersistedState {
            query_set: self.query_set.profiles().to_vec(),
            sampler: PersistedSampler {
                collection_statistics: self.sampler.collection_cache().clone(),
                index_statistics: self.sampler.index_cache().clone(),
            },
        };

        state::save(&self.database, &self.options.state_collection, &snapshot).await
    }

    /// One synchronization cycle over a consistent snapshot of the query set:
    /// persist, recommend, diff, report, and apply when changes are enabled.
    async fn synchronize(&mut self) -> Result<()> {
        self.persist_state().await?;

        let recommendation = self.query_set.recommend(&mut self.sampler, &self.options).await?;
        let existing = self.existing_indexes().await?;
        let plan = reconciler::reconcile(&recommendation.index_set(), &existing);

        tracing::info!("\n{}", plan.render(&recommendation, &self.options));

        if self.options.do_changes {
            self.apply(&plan).await?;
        }

        // Sampling during recommendation refreshed the caches.
        self.persist_state().await?;
        Ok(())
    }

    async fn existing_indexes(&self) -> Result<BTreeMap<String, Vec<ExistingIndex>>> {
        let mut existing = BTreeMap::new();

        for collection_name in self.database.list_collection_names(None).await? {
            if collection_name.starts_with("system.") || collection_name == self.options.state_collection {
                continue;
            }

            let collection = self.database.collection::<Document>(&collection_name);
            let mut indexes = Vec::new();

            let mut cursor = collection.list_indexes(None).await?;
            while let Some(model) = cursor.try_next().await? {
                let name = model
                    .options
                    .as_ref()
                    .and_then(|options| options.name.clone())
                    .unwrap_or_default();
                indexes.push(ExistingIndex::new(&collection_name, name, model.keys.clone()));
            }

            existing.insert(collection_name, indexes);
        }

        Ok(existing)
    }

    async fn apply(&mut self, plan: &Reconciliation) -> Result<()> {
        for actions in &plan.collections {
            let collection = self.database.collection::<Document>(&actions.collection);

            for existing in &actions.drop {
                tracing::info!(
                    collection = actions.collection.as_str(),
                    index = existing.name.as_str(),
                    "dropping index"
                );

                if let Err(err) = collection.drop_index(&existing.name, None).await {
                    tracing::error!(
                        error = %err,
                        index = existing.name.as_str(),
                        "failed to drop index, continuing"
                    );
                }
            }

            for index in &actions.create {
                tracing::info!(
                    collection = actions.collection.as_str(),
                    index = %index,
                    name = index.name().as_str(),
                    "creating index"
                );

                let mut index_options = mongodb::options::IndexOptions::default();
                index_options.name = Some(index.name());
                let mut model = mongodb::IndexModel::default();
                model.keys = index.key_document();
                model.options = Some(index_options);

                if let Err(err) = collection.create_index(model, None).await {
                    if is_too_large_to_index(&err) {
                        // Feed the failure back into the statistics so the
                        // next optimization pass routes the field into a
                        // hashed index instead.
                        let paths: Vec<&str> = index.paths().collect();
                        match self.sampler.demote_longest_to_hash(&actions.collection, &paths) {
                            Some(field) => tracing::warn!(
                                field = field.as_str(),
                                "index entry too large, field demoted to hash mode"
                            ),
                            None => tracing::warn!(index = %index, "index entry too large"),
                        }
                    } else {
                        tracing::error!(error = %err, index = %index, "failed to create index, continuing");
                    }
                }
            }
        }

        Ok(())
    }
}

/// MongoDB refuses to index entries above its size limit with code 17280.
fn is_too_large_to_index(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        mongodb::error::ErrorKind::Command(command_error) => {
            command_error.code == 17280 || command_error.message.contains("too large to index")
        }
        _ => false,
    }
}
