//! Ordered event publishing with a durable per-aggregate high-water mark.
//!
//! Committed event streams arrive here possibly out of order (committing
//! mailboxes run in parallel, retries reorder deliveries). Each aggregate
//! gets a publish mailbox that holds streams in a version-keyed buffer
//! and dispatches them to subscribers strictly in version order, gapless
//! from the last published version. A periodic sweep resolves mailboxes
//! stalled on a gap by re-querying the durable published version.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::{with_retry, PublishingConfig, RetryPolicy};
use crate::event::EventStream;

/// Entry point the committing pipeline hands finished streams to.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Accept a committed stream for ordered delivery. Must be durable
    /// against redelivery: versions at or below the published high-water
    /// mark are discarded.
    async fn publish(&self, stream: EventStream) -> anyhow::Result<()>;
}

/// Durable storage of the per-aggregate published-version high-water
/// mark, keyed by processor name so independent pipelines can share a
/// backend.
#[async_trait]
pub trait PublishedVersionStore: Send + Sync {
    /// Highest version published for the aggregate; 0 if none.
    async fn published_version(&self, processor: &str, aggregate_id: &str)
        -> anyhow::Result<u64>;

    /// Record that `version` has been published.
    async fn update_published_version(
        &self,
        processor: &str,
        aggregate_id: &str,
        version: u64,
    ) -> anyhow::Result<()>;
}

/// A consumer of ordered committed event streams.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn handle(&self, stream: &EventStream) -> anyhow::Result<()>;
}

/// Volatile published-version store for tests and single-process use.
#[derive(Default)]
pub struct InMemoryPublishedVersionStore {
    versions: RwLock<HashMap<(String, String), u64>>,
}

impl InMemoryPublishedVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishedVersionStore for InMemoryPublishedVersionStore {
    async fn published_version(
        &self,
        processor: &str,
        aggregate_id: &str,
    ) -> anyhow::Result<u64> {
        Ok(self
            .versions
            .read()
            .await
            .get(&(processor.to_string(), aggregate_id.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn update_published_version(
        &self,
        processor: &str,
        aggregate_id: &str,
        version: u64,
    ) -> anyhow::Result<()> {
        self.versions
            .write()
            .await
            .insert((processor.to_string(), aggregate_id.to_string()), version);
        Ok(())
    }
}

/// Reorder buffer and dispatch cursor for one aggregate.
struct PublishState {
    /// The version the mailbox will dispatch next.
    next_expected: u64,
    /// Streams waiting for their version's turn, keyed by version.
    waiting: BTreeMap<u64, EventStream>,
    /// Set when the head of `waiting` is not `next_expected` (a gap) or
    /// a subscriber dispatch hard-failed; cleared on progress.
    stalled_since: Option<Instant>,
}

struct PublishMailbox {
    aggregate_id: String,
    running: AtomicBool,
    state: StdMutex<PublishState>,
    last_active: StdMutex<Instant>,
}

impl PublishMailbox {
    fn new(aggregate_id: String, next_expected: u64) -> Self {
        Self {
            aggregate_id,
            running: AtomicBool::new(false),
            state: StdMutex::new(PublishState {
                next_expected,
                waiting: BTreeMap::new(),
                stalled_since: None,
            }),
            last_active: StdMutex::new(Instant::now()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PublishState> {
        self.state.lock().expect("publish state lock poisoned")
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .expect("publish last_active lock poisoned") = Instant::now();
    }

    fn is_idle(&self, idle_timeout: std::time::Duration) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return false;
        }
        if !self.lock_state().waiting.is_empty() {
            return false;
        }
        let last_active = *self
            .last_active
            .lock()
            .expect("publish last_active lock poisoned");
        last_active.elapsed() >= idle_timeout
    }
}

struct PipelineInner {
    processor_name: String,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    versions: Arc<dyn PublishedVersionStore>,
    mailboxes: RwLock<HashMap<String, Arc<PublishMailbox>>>,
    config: PublishingConfig,
    retry: RetryPolicy,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// The ordered publishing pipeline. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct EventPublishingPipeline {
    inner: Arc<PipelineInner>,
}

impl EventPublishingPipeline {
    pub fn new(
        processor_name: impl Into<String>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
        versions: Arc<dyn PublishedVersionStore>,
        config: PublishingConfig,
        retry: RetryPolicy,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(PipelineInner {
                processor_name: processor_name.into(),
                subscribers,
                versions,
                mailboxes: RwLock::new(HashMap::new()),
                config,
                retry,
                sweeper: StdMutex::new(None),
                shutdown,
            }),
        }
    }

    /// Spawn the periodic sweep that resolves stalled mailboxes and
    /// removes idle empty ones.
    pub fn start(&self) {
        let pipeline = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pipeline.sweep().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self
            .inner
            .sweeper
            .lock()
            .expect("publish sweeper lock poisoned") = Some(handle);
    }

    /// Stop the sweep task. In-flight dispatches finish on their own.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .expect("publish sweeper lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Buffer a committed stream and drive its aggregate's mailbox.
    pub async fn enqueue(&self, stream: EventStream) -> anyhow::Result<()> {
        let mailbox = self.mailbox_for(&stream.aggregate_id).await?;
        {
            let mut state = mailbox.lock_state();
            if stream.version < state.next_expected {
                tracing::debug!(
                    aggregate_id = %stream.aggregate_id,
                    version = stream.version,
                    next_expected = state.next_expected,
                    "discarding already-published stream"
                );
                return Ok(());
            }
            state.waiting.insert(stream.version, stream);
            if state.stalled_since.is_none() {
                state.stalled_since = Some(Instant::now());
            }
        }
        mailbox.touch();
        self.drive(mailbox).await;
        Ok(())
    }

    async fn mailbox_for(&self, aggregate_id: &str) -> anyhow::Result<Arc<PublishMailbox>> {
        if let Some(mailbox) = self.inner.mailboxes.read().await.get(aggregate_id) {
            return Ok(Arc::clone(mailbox));
        }
        // Seed the cursor from the durable high-water mark before the
        // mailbox becomes visible.
        let published = self
            .inner
            .versions
            .published_version(&self.inner.processor_name, aggregate_id)
            .await?;
        let mut mailboxes = self.inner.mailboxes.write().await;
        Ok(Arc::clone(mailboxes.entry(aggregate_id.to_string()).or_insert_with(
            || Arc::new(PublishMailbox::new(aggregate_id.to_string(), published + 1)),
        )))
    }

    /// Dispatch every contiguous stream starting at `next_expected`.
    /// Only one driver runs per mailbox; concurrent callers bounce off
    /// the claim and the holder re-checks before exiting.
    async fn drive(&self, mailbox: Arc<PublishMailbox>) {
        loop {
            if mailbox
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            loop {
                let stream = {
                    let mut state = mailbox.lock_state();
                    let expected = state.next_expected;
                    match state.waiting.remove(&expected) {
                        Some(stream) => stream,
                        None => {
                            if state.waiting.is_empty() {
                                state.stalled_since = None;
                            }
                            break;
                        }
                    }
                };

                let version = stream.version;
                if let Err(e) = self.dispatch(&stream).await {
                    tracing::error!(
                        aggregate_id = %mailbox.aggregate_id,
                        version,
                        error = %e,
                        "subscriber dispatch failed after retries, stalling mailbox"
                    );
                    let mut state = mailbox.lock_state();
                    state.waiting.insert(version, stream);
                    state.stalled_since = Some(Instant::now());
                    break;
                }

                // Advance the durable mark; a failure here only delays
                // redelivery suppression, so it is logged and skipped.
                let durable = with_retry(&self.inner.retry, "update published version", || {
                    self.inner.versions.update_published_version(
                        &self.inner.processor_name,
                        &mailbox.aggregate_id,
                        version,
                    )
                })
                .await;
                if let Err(e) = durable {
                    tracing::error!(
                        aggregate_id = %mailbox.aggregate_id,
                        version,
                        error = %e,
                        "failed to persist published version"
                    );
                }

                let mut state = mailbox.lock_state();
                state.next_expected = version + 1;
                state.stalled_since = if state.waiting.is_empty() {
                    None
                } else {
                    Some(Instant::now())
                };
                mailbox.touch();
            }

            mailbox.running.store(false, Ordering::SeqCst);

            // A stream for the expected version may have arrived between
            // the last check and the claim release.
            let head_ready = {
                let state = mailbox.lock_state();
                state.waiting.contains_key(&state.next_expected)
            };
            if !head_ready {
                return;
            }
        }
    }

    async fn dispatch(&self, stream: &EventStream) -> anyhow::Result<()> {
        for subscriber in &self.inner.subscribers {
            with_retry(&self.inner.retry, "publish event stream", || {
                subscriber.handle(stream)
            })
            .await?;
        }
        tracing::debug!(
            aggregate_id = %stream.aggregate_id,
            version = stream.version,
            events = stream.events.len(),
            "published event stream"
        );
        Ok(())
    }

    /// Resolve stalled mailboxes against the durable published version
    /// and drop idle empty ones.
    async fn sweep(&self) {
        let mailboxes: Vec<Arc<PublishMailbox>> = {
            let map = self.inner.mailboxes.read().await;
            map.values().cloned().collect()
        };

        let mut idle = Vec::new();
        for mailbox in mailboxes {
            let stalled = {
                let state = mailbox.lock_state();
                match state.stalled_since {
                    Some(since) => since.elapsed() >= self.inner.config.problem_timeout,
                    None => false,
                }
            };
            if stalled {
                self.resync(&mailbox).await;
            }
            if mailbox.is_idle(self.inner.config.idle_timeout) {
                idle.push(mailbox.aggregate_id.clone());
            }
        }

        if !idle.is_empty() {
            let mut map = self.inner.mailboxes.write().await;
            for aggregate_id in idle {
                // Re-check under the write lock: a stream may have landed
                // since the scan.
                let still_idle = map
                    .get(&aggregate_id)
                    .is_some_and(|m| m.is_idle(self.inner.config.idle_timeout));
                if still_idle {
                    map.remove(&aggregate_id);
                }
            }
        }
    }

    /// Re-align a stalled mailbox with the durable published version:
    /// versions at or below it were published by someone else (or a lost
    /// update), so waiting entries up to it are dropped and the cursor
    /// jumps forward.
    async fn resync(&self, mailbox: &Arc<PublishMailbox>) {
        let durable = match self
            .inner
            .versions
            .published_version(&self.inner.processor_name, &mailbox.aggregate_id)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %mailbox.aggregate_id,
                    error = %e,
                    "failed to re-query published version for stalled mailbox"
                );
                return;
            }
        };

        {
            let mut state = mailbox.lock_state();
            if durable + 1 > state.next_expected {
                tracing::warn!(
                    aggregate_id = %mailbox.aggregate_id,
                    from = state.next_expected,
                    to = durable + 1,
                    "advancing stalled publish cursor to durable version"
                );
                state.next_expected = durable + 1;
            }
            let next_expected = state.next_expected;
            let still_waiting = state.waiting.split_off(&next_expected);
            state.waiting = still_waiting;
            state.stalled_since = if state.waiting.is_empty() {
                None
            } else {
                Some(Instant::now())
            };
        }
        self.drive(Arc::clone(mailbox)).await;
    }
}

#[async_trait]
impl MessagePublisher for EventPublishingPipeline {
    async fn publish(&self, stream: EventStream) -> anyhow::Result<()> {
        self.enqueue(stream).await
    }
}
