//! Ordered per-key mailbox: the sequencing primitive behind command
//! processing and event committing.
//!
//! A mailbox serializes processing of messages that share a routing key
//! (here, an aggregate id) while unrelated mailboxes run fully in
//! parallel. Exactly one task executes a mailbox's processing loop at any
//! instant, enforced by an atomic enter/exit claim; completion callbacks
//! may arrive concurrently from other tasks and are funneled through a
//! single critical section. Results are finalized strictly in enqueue
//! order even when the underlying asynchronous work finishes out of
//! order -- the out-of-order buffer holds early completions until their
//! turn.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

/// Processing and finalization callbacks for one mailbox.
///
/// `process` receives batches of consumed messages in sequence order;
/// `finalize` is invoked exactly when a message's result becomes
/// externally visible, strictly in enqueue order.
#[async_trait]
pub trait MailboxHandler<M, R>: Send + Sync + 'static {
    /// Process a batch of messages drained from the mailbox.
    ///
    /// The batch is contiguous and in sequence order. Returning an error
    /// aborts the current run cycle: the batch is rewound and retried
    /// after the configured backoff. Handlers should therefore convert
    /// per-message failures into completed results themselves and reserve
    /// `Err` for wholesale infrastructure faults.
    async fn process(&self, messages: Vec<Arc<MailboxMessage<M, R>>>) -> anyhow::Result<()>;

    /// A message's result has been finalized in enqueue order.
    ///
    /// Errors are logged at error severity by the mailbox and never
    /// rolled back.
    async fn finalize(&self, message: Arc<MailboxMessage<M, R>>, result: R)
        -> anyhow::Result<()>;
}

/// Tuning knobs for one mailbox.
#[derive(Debug, Clone)]
pub struct MailboxOptions {
    /// Maximum messages drained into a single `process` call.
    pub batch_size: usize,
    /// When `true`, the next batch is not consumed until every previously
    /// consumed message has been finalized via
    /// [`complete_message`](Mailbox::complete_message). Command mailboxes
    /// use this to guarantee one in-flight command per aggregate.
    pub await_completion: bool,
    /// Backoff before retrying a run cycle whose handler returned an
    /// error.
    pub failure_backoff: Duration,
}

impl Default for MailboxOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            await_completion: false,
            failure_backoff: Duration::from_millis(100),
        }
    }
}

/// A message enqueued into a [`Mailbox`].
///
/// The sequence is assigned at enqueue time, dense and gap-free from 0,
/// and immutable afterwards. The message keeps a weak back-reference to
/// its owning mailbox so downstream stages can complete it without
/// carrying the mailbox handle separately.
pub struct MailboxMessage<M, R> {
    sequence: u64,
    payload: M,
    owner: Weak<MailboxInner<M, R>>,
}

impl<M, R> MailboxMessage<M, R>
where
    M: Send + Sync + 'static,
    R: Send + 'static,
{
    /// The mailbox-assigned sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The enqueued payload.
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// The owning mailbox, if it is still alive.
    pub fn mailbox(&self) -> Option<Mailbox<M, R>> {
        self.owner.upgrade().map(|inner| Mailbox { inner })
    }

    /// Complete this message through its owning mailbox.
    ///
    /// Convenience over [`Mailbox::complete_message`]. A completion for a
    /// mailbox that has already been dropped is logged and discarded.
    pub async fn complete(self: Arc<Self>, result: R) {
        match self.mailbox() {
            Some(mailbox) => mailbox.complete_message(&self, result).await,
            None => {
                tracing::warn!(
                    sequence = self.sequence,
                    "completion for a dropped mailbox discarded"
                );
            }
        }
    }
}

impl<M: std::fmt::Debug, R> std::fmt::Debug for MailboxMessage<M, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxMessage")
            .field("sequence", &self.sequence)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Mutable mailbox state, guarded by a plain mutex.
///
/// Invariant: `consumed_sequence < consuming_sequence <= next_sequence`
/// (with `consumed_sequence == -1` meaning "nothing finalized yet").
/// The guard is never held across an await point.
struct MailboxState<M, R> {
    /// Next sequence to assign at enqueue.
    next_sequence: u64,
    /// Next sequence to hand to the handler.
    consuming_sequence: u64,
    /// Highest sequence whose result has been finalized; -1 if none.
    consumed_sequence: i64,
    /// In-flight messages keyed by sequence. A message is removed when
    /// it is finalized, not when it is consumed.
    messages: HashMap<u64, Arc<MailboxMessage<M, R>>>,
    /// Results that completed out of order, awaiting their turn.
    pending: BTreeMap<u64, R>,
}

struct MailboxInner<M, R> {
    routing_key: String,
    options: MailboxOptions,
    handler: Arc<dyn MailboxHandler<M, R>>,
    /// Enter/exit claim: exactly one run cycle at a time.
    running: AtomicBool,
    paused: AtomicBool,
    state: StdMutex<MailboxState<M, R>>,
    /// Signaled whenever a run cycle exits; `pause` waits on this.
    run_exited: Notify,
    /// Funnel for concurrent completion callbacks, held across the
    /// finalize awaits so finalization order equals sequence order.
    completion_gate: tokio::sync::Mutex<()>,
    last_active: StdMutex<Instant>,
}

/// An ordered, single-consumer message-processing unit keyed by a routing
/// identifier.
///
/// Cheaply cloneable; all clones share the same state.
pub struct Mailbox<M, R> {
    inner: Arc<MailboxInner<M, R>>,
}

impl<M, R> Clone for Mailbox<M, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, R> Mailbox<M, R>
where
    M: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a mailbox with the given routing key, options, and handler.
    pub fn new(
        routing_key: impl Into<String>,
        options: MailboxOptions,
        handler: Arc<dyn MailboxHandler<M, R>>,
    ) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                routing_key: routing_key.into(),
                options,
                handler,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                state: StdMutex::new(MailboxState {
                    next_sequence: 0,
                    consuming_sequence: 0,
                    consumed_sequence: -1,
                    messages: HashMap::new(),
                    pending: BTreeMap::new(),
                }),
                run_exited: Notify::new(),
                completion_gate: tokio::sync::Mutex::new(()),
                last_active: StdMutex::new(Instant::now()),
            }),
        }
    }

    /// The routing key this mailbox serializes on.
    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    /// Assign the next sequence, store the message, and trigger a run
    /// attempt. Returns the stored message for later completion.
    pub fn enqueue(&self, payload: M) -> Arc<MailboxMessage<M, R>> {
        let message = {
            let mut st = self.lock_state();
            let sequence = st.next_sequence;
            let message = Arc::new(MailboxMessage {
                sequence,
                payload,
                owner: Arc::downgrade(&self.inner),
            });
            st.messages.insert(sequence, Arc::clone(&message));
            st.next_sequence += 1;
            message
        };
        self.touch();
        self.try_run();
        message
    }

    /// Claim the running state and process available messages on a
    /// spawned task. A no-op if the mailbox is paused or a run cycle is
    /// already active.
    pub fn try_run(&self) {
        if self.inner.paused.load(Ordering::SeqCst) {
            return;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Mailbox { inner }.run_cycle().await;
        });
    }

    /// The processing loop body, run under the claimed running flag.
    async fn run_cycle(self) {
        let mut retrigger_after_backoff = false;
        loop {
            let batch = self.drain_batch();
            if batch.is_empty() {
                break;
            }
            self.touch();
            let first_sequence = batch[0].sequence;
            if let Err(e) = self.inner.handler.process(batch).await {
                tracing::error!(
                    routing_key = %self.inner.routing_key,
                    sequence = first_sequence,
                    error = %e,
                    "mailbox processing cycle failed, will retry after backoff"
                );
                // Rewind so the retried run re-consumes the failed batch.
                {
                    let mut st = self.lock_state();
                    st.consuming_sequence = first_sequence;
                }
                retrigger_after_backoff = true;
                break;
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.run_exited.notify_waiters();

        if retrigger_after_backoff {
            let mailbox = self.clone();
            let backoff = self.inner.options.failure_backoff;
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                mailbox.try_run();
            });
        } else if self.has_ready() {
            // A message was enqueued between the last empty drain and the
            // claim release; pick it up.
            self.try_run();
        }
    }

    /// Drain up to `batch_size` contiguous messages starting at the
    /// consuming sequence, advancing it. Empty when gated on completion.
    fn drain_batch(&self) -> Vec<Arc<MailboxMessage<M, R>>> {
        let mut st = self.lock_state();
        if self.inner.options.await_completion
            && (st.consumed_sequence + 1) as u64 != st.consuming_sequence
        {
            return Vec::new();
        }
        let mut batch = Vec::new();
        while batch.len() < self.inner.options.batch_size.max(1) {
            let sequence = st.consuming_sequence;
            match st.messages.get(&sequence) {
                Some(message) => {
                    batch.push(Arc::clone(message));
                    st.consuming_sequence += 1;
                }
                None => break,
            }
        }
        batch
    }

    /// Whether an unpaused run could make progress right now.
    fn has_ready(&self) -> bool {
        if self.inner.paused.load(Ordering::SeqCst) {
            return false;
        }
        let st = self.lock_state();
        if st.consuming_sequence >= st.next_sequence {
            return false;
        }
        !(self.inner.options.await_completion
            && (st.consumed_sequence + 1) as u64 != st.consuming_sequence)
    }

    /// Record that a message's asynchronous processing has actually
    /// finished.
    ///
    /// If the message is the next expected one, it is finalized
    /// immediately and any buffered later completions are drained in
    /// order. Early completions are buffered; completions for
    /// already-finalized slots finalize idempotently. Concurrent callers
    /// are funneled through a single critical section so externally
    /// observed finalization order always equals enqueue order.
    pub async fn complete_message(&self, message: &Arc<MailboxMessage<M, R>>, result: R) {
        let _gate = self.inner.completion_gate.lock().await;
        let mut finalizable: Vec<(Arc<MailboxMessage<M, R>>, R)> = Vec::new();
        {
            let mut st = self.lock_state();
            let expected = (st.consumed_sequence + 1) as u64;
            if message.sequence == expected {
                st.messages.remove(&message.sequence);
                st.consumed_sequence = message.sequence as i64;
                finalizable.push((Arc::clone(message), result));
                // Drain buffered completions that are now contiguous.
                loop {
                    let next = (st.consumed_sequence + 1) as u64;
                    let Some(pending_result) = st.pending.remove(&next) else {
                        break;
                    };
                    match st.messages.remove(&next) {
                        Some(msg) => {
                            st.consumed_sequence = next as i64;
                            finalizable.push((msg, pending_result));
                        }
                        None => {
                            tracing::error!(
                                routing_key = %self.inner.routing_key,
                                sequence = next,
                                "buffered completion has no in-flight message"
                            );
                            st.consumed_sequence = next as i64;
                        }
                    }
                }
            } else if message.sequence > expected {
                st.pending.insert(message.sequence, result);
            } else {
                // Already-finalized slot: finalize idempotently.
                finalizable.push((Arc::clone(message), result));
            }
        }

        for (msg, res) in finalizable {
            let sequence = msg.sequence;
            if let Err(e) = self.inner.handler.finalize(msg, res).await {
                tracing::error!(
                    routing_key = %self.inner.routing_key,
                    sequence,
                    error = %e,
                    "message finalization failed"
                );
            }
        }
        self.touch();
        self.try_run();
    }

    /// Pause the mailbox, blocking until any in-progress run has exited.
    ///
    /// After `pause` returns, no processing happens until
    /// [`resume`](Mailbox::resume). Required before
    /// [`reset_consuming_sequence`](Mailbox::reset_consuming_sequence)
    /// during conflict recovery.
    pub async fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        while self.inner.running.load(Ordering::SeqCst) {
            let exited = self.inner.run_exited.notified();
            // Re-check after registering so a run exiting in between
            // cannot strand us waiting on a notification already sent.
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            exited.await;
        }
    }

    /// Lift the pause. The caller decides when to trigger the next run
    /// via [`try_run`](Mailbox::try_run).
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Rewind the consuming sequence and clear the out-of-order
    /// completion buffer.
    ///
    /// Used after an aggregate is reloaded from storage following a
    /// conflict, so the colliding command is re-consumed against fresh
    /// state. Only meaningful while paused; `sequence` must be greater
    /// than the consumed sequence.
    pub fn reset_consuming_sequence(&self, sequence: u64) {
        let mut st = self.lock_state();
        tracing::debug!(
            routing_key = %self.inner.routing_key,
            from = st.consuming_sequence,
            to = sequence,
            "resetting consuming sequence"
        );
        st.consuming_sequence = sequence;
        st.pending.clear();
    }

    /// Reset all counters and buffers to the empty-mailbox state.
    pub fn clear(&self) {
        let mut st = self.lock_state();
        st.next_sequence = 0;
        st.consuming_sequence = 0;
        st.consumed_sequence = -1;
        st.messages.clear();
        st.pending.clear();
    }

    /// Number of enqueued messages not yet handed to the handler.
    pub fn total_unhandled(&self) -> u64 {
        let st = self.lock_state();
        st.next_sequence - st.consuming_sequence
    }

    /// Number of results buffered out of order.
    pub fn pending_completions(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Whether a run cycle currently holds the claim.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether the mailbox is eligible for idle removal: not running,
    /// nothing unhandled, nothing buffered, and untouched for at least
    /// `idle_timeout`.
    pub fn is_inactive(&self, idle_timeout: Duration) -> bool {
        if self.is_running() {
            return false;
        }
        {
            let st = self.lock_state();
            if st.consuming_sequence < st.next_sequence || !st.pending.is_empty() {
                return false;
            }
            if !st.messages.is_empty() {
                // Consumed but not yet finalized.
                return false;
            }
        }
        let last_active = *self
            .inner
            .last_active
            .lock()
            .expect("mailbox last_active lock poisoned");
        last_active.elapsed() >= idle_timeout
    }

    fn touch(&self) {
        *self
            .inner
            .last_active
            .lock()
            .expect("mailbox last_active lock poisoned") = Instant::now();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MailboxState<M, R>> {
        self.inner
            .state
            .lock()
            .expect("mailbox state lock poisoned")
    }
}
