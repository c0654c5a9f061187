//! Append-only event store with per-aggregate optimistic concurrency.
//!
//! Durability is delegated to a pluggable [`CommitLog`]; this module
//! layers the per-aggregate version chain on top: a dense version index,
//! a command-id index for idempotence, and the three-way append
//! classification (success, duplicate command, version conflict) the
//! committing pipeline drives its recovery off.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::event::EventStream;

/// A stream with its position in the global commit log.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub sequence: u64,
    pub stream: EventStream,
}

/// Durable append-only storage of committed event streams.
///
/// Implementations only need to persist and look up whole streams; all
/// concurrency and idempotence checks live in [`EventStore`].
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Persist a stream and return its global sequence number.
    async fn append(&self, stream: EventStream) -> anyhow::Result<u64>;

    /// Load the stream at a global sequence, if it exists.
    async fn get(&self, sequence: u64) -> anyhow::Result<Option<EventStream>>;

    /// Page through the log in sequence order.
    async fn query(&self, start: u64, size: usize) -> anyhow::Result<Vec<CommitRecord>>;
}

/// Volatile commit log backed by a vector; the global sequence is the
/// vector index.
#[derive(Default)]
pub struct InMemoryCommitLog {
    streams: RwLock<Vec<EventStream>>,
}

impl InMemoryCommitLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitLog for InMemoryCommitLog {
    async fn append(&self, stream: EventStream) -> anyhow::Result<u64> {
        let mut streams = self.streams.write().await;
        streams.push(stream);
        Ok((streams.len() - 1) as u64)
    }

    async fn get(&self, sequence: u64) -> anyhow::Result<Option<EventStream>> {
        Ok(self.streams.read().await.get(sequence as usize).cloned())
    }

    async fn query(&self, start: u64, size: usize) -> anyhow::Result<Vec<CommitRecord>> {
        let streams = self.streams.read().await;
        Ok(streams
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(size)
            .map(|(i, stream)| CommitRecord {
                sequence: i as u64,
                stream: stream.clone(),
            })
            .collect())
    }
}

/// Classification of a single stream append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The stream was persisted at its target version.
    Success,
    /// A stream with the same command id is already committed for this
    /// aggregate; nothing was written.
    DuplicateCommand,
    /// The target version is not the aggregate's current version plus
    /// one; nothing was written.
    Conflict,
}

/// Per-command outcome of a batch append, keyed for the committing
/// pipeline's classification pass.
#[derive(Debug, Default)]
pub struct BatchAppendResult {
    /// Command ids whose streams were persisted.
    pub succeeded: Vec<String>,
    /// Aggregate id -> command ids rejected as duplicates.
    pub duplicate_command: HashMap<String, Vec<String>>,
    /// Command ids rejected with a version conflict.
    pub conflicted: Vec<String>,
}

/// Version and command-id indexes for one aggregate, mapping to global
/// log sequences.
#[derive(Default)]
struct VersionChain {
    current_version: u64,
    by_version: HashMap<u64, u64>,
    by_command: HashMap<String, u64>,
}

/// The event store: a [`CommitLog`] plus per-aggregate version chains.
pub struct EventStore {
    log: Arc<dyn CommitLog>,
    /// One lock per aggregate serializes appends for that aggregate
    /// while leaving unrelated aggregates fully concurrent.
    chains: RwLock<HashMap<String, Arc<Mutex<VersionChain>>>>,
}

impl EventStore {
    pub fn new(log: Arc<dyn CommitLog>) -> Self {
        Self {
            log,
            chains: RwLock::new(HashMap::new()),
        }
    }

    async fn chain_for(&self, aggregate_id: &str) -> Arc<Mutex<VersionChain>> {
        if let Some(chain) = self.chains.read().await.get(aggregate_id) {
            return Arc::clone(chain);
        }
        let mut chains = self.chains.write().await;
        Arc::clone(
            chains
                .entry(aggregate_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VersionChain::default()))),
        )
    }

    /// Append one stream, enforcing idempotence and the dense version
    /// invariant.
    ///
    /// Checks run and the log write happens under the aggregate's chain
    /// lock, so two concurrent appends for the same aggregate serialize
    /// and the loser is classified as a conflict rather than corrupting
    /// the chain.
    ///
    /// # Errors
    ///
    /// Only infrastructure faults from the underlying log; rejected
    /// appends are reported through [`AppendResult`].
    pub async fn append(&self, stream: EventStream) -> anyhow::Result<AppendResult> {
        let chain = self.chain_for(&stream.aggregate_id).await;
        let mut chain = chain.lock().await;

        if chain.by_command.contains_key(&stream.command_id) {
            tracing::debug!(
                aggregate_id = %stream.aggregate_id,
                command_id = %stream.command_id,
                "append rejected: duplicate command id"
            );
            return Ok(AppendResult::DuplicateCommand);
        }
        if stream.version != chain.current_version + 1 {
            tracing::debug!(
                aggregate_id = %stream.aggregate_id,
                expected = chain.current_version + 1,
                got = stream.version,
                "append rejected: version conflict"
            );
            return Ok(AppendResult::Conflict);
        }

        let version = stream.version;
        let command_id = stream.command_id.clone();
        let sequence = self.log.append(stream).await?;
        chain.current_version = version;
        chain.by_version.insert(version, sequence);
        chain.by_command.insert(command_id, sequence);
        Ok(AppendResult::Success)
    }

    /// Append a batch of streams, classifying each one individually.
    pub async fn batch_append(
        &self,
        streams: Vec<EventStream>,
    ) -> anyhow::Result<BatchAppendResult> {
        let mut result = BatchAppendResult::default();
        for stream in streams {
            let aggregate_id = stream.aggregate_id.clone();
            let command_id = stream.command_id.clone();
            match self.append(stream).await? {
                AppendResult::Success => result.succeeded.push(command_id),
                AppendResult::DuplicateCommand => result
                    .duplicate_command
                    .entry(aggregate_id)
                    .or_default()
                    .push(command_id),
                AppendResult::Conflict => result.conflicted.push(command_id),
            }
        }
        Ok(result)
    }

    /// The committed stream produced by a command, if that command ever
    /// committed against this aggregate.
    ///
    /// # Errors
    ///
    /// [`StoreError::MissingStream`] if the index points at a log
    /// sequence the log no longer has, indicating a corrupted chain.
    pub async fn find_by_command(
        &self,
        aggregate_id: &str,
        command_id: &str,
    ) -> Result<Option<EventStream>, StoreError> {
        let chain = self.chain_for(aggregate_id).await;
        let sequence = {
            let chain = chain.lock().await;
            match chain.by_command.get(command_id) {
                Some(&sequence) => sequence,
                None => return Ok(None),
            }
        };
        let stream = self
            .log
            .get(sequence)
            .await?
            .ok_or_else(|| StoreError::MissingStream {
                aggregate_id: aggregate_id.to_string(),
                version: sequence,
            })?;
        Ok(Some(stream))
    }

    /// The committed stream at an exact version of an aggregate.
    pub async fn find_by_version(
        &self,
        aggregate_id: &str,
        version: u64,
    ) -> Result<Option<EventStream>, StoreError> {
        let chain = self.chain_for(aggregate_id).await;
        let sequence = {
            let chain = chain.lock().await;
            match chain.by_version.get(&version) {
                Some(&sequence) => sequence,
                None => return Ok(None),
            }
        };
        let stream = self
            .log
            .get(sequence)
            .await?
            .ok_or_else(|| StoreError::MissingStream {
                aggregate_id: aggregate_id.to_string(),
                version,
            })?;
        Ok(Some(stream))
    }

    /// All committed streams of an aggregate with versions in
    /// `[min_version, max_version]`, ordered by version.
    pub async fn query_aggregate_events(
        &self,
        aggregate_id: &str,
        min_version: u64,
        max_version: u64,
    ) -> Result<Vec<EventStream>, StoreError> {
        let chain = self.chain_for(aggregate_id).await;
        let sequences: Vec<(u64, u64)> = {
            let chain = chain.lock().await;
            let mut sequences: Vec<(u64, u64)> = chain
                .by_version
                .iter()
                .filter(|(&version, _)| version >= min_version && version <= max_version)
                .map(|(&version, &sequence)| (version, sequence))
                .collect();
            sequences.sort_by_key(|&(version, _)| version);
            sequences
        };

        let mut streams = Vec::with_capacity(sequences.len());
        for (version, sequence) in sequences {
            let stream = self
                .log
                .get(sequence)
                .await?
                .ok_or_else(|| StoreError::MissingStream {
                    aggregate_id: aggregate_id.to_string(),
                    version,
                })?;
            streams.push(stream);
        }
        Ok(streams)
    }

    /// The aggregate's current (highest committed) version; 0 if it has
    /// no events.
    pub async fn current_version(&self, aggregate_id: &str) -> u64 {
        let chain = self.chain_for(aggregate_id).await;
        let chain = chain.lock().await;
        chain.current_version
    }

    /// Rebuild every version chain by paging through the commit log.
    /// Called once at startup before any command is accepted.
    pub async fn replay_from_log(&self) -> anyhow::Result<()> {
        const PAGE: usize = 256;
        let mut start = 0u64;
        let mut total = 0usize;
        loop {
            let records = self.log.query(start, PAGE).await?;
            if records.is_empty() {
                break;
            }
            start += records.len() as u64;
            total += records.len();
            for record in records {
                let chain = self.chain_for(&record.stream.aggregate_id).await;
                let mut chain = chain.lock().await;
                chain.current_version = chain.current_version.max(record.stream.version);
                chain
                    .by_version
                    .insert(record.stream.version, record.sequence);
                chain
                    .by_command
                    .insert(record.stream.command_id.clone(), record.sequence);
            }
        }
        if total > 0 {
            tracing::info!(streams = total, "rebuilt version chains from commit log");
        }
        Ok(())
    }
}
