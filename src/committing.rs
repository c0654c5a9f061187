//! Batched event committing with conflict recovery.
//!
//! Uncommitted event streams produced by command execution are routed by
//! aggregate-id hash into a small pool of committing mailboxes, so one
//! aggregate always commits through the same mailbox while the pool
//! batches appends across aggregates. Each append is classified three
//! ways (success, duplicate command, version conflict) and the worker
//! reacts per stream: publish and complete, reconcile the duplicate, or
//! pause the command mailbox, reload the aggregate, and replay the
//! colliding command against fresh state.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::cache::{AggregateCache, AggregateSnapshot};
use crate::command::CommandResult;
use crate::config::{with_retry, CommittingConfig, RetryPolicy};
use crate::event::EventStream;
use crate::mailbox::{Mailbox, MailboxHandler, MailboxMessage, MailboxOptions};
use crate::processor::ProcessingCommand;
use crate::publishing::MessagePublisher;
use crate::registry::HandlerRegistry;
use crate::store::EventStore;

/// One uncommitted stream travelling through the committing pool,
/// carrying the post-commit snapshot and the originating command
/// message so the worker can complete it.
pub struct EventCommittingContext {
    pub stream: EventStream,
    pub snapshot: AggregateSnapshot,
    pub message: Arc<MailboxMessage<ProcessingCommand, CommandResult>>,
}

type CommittingMailbox = Mailbox<EventCommittingContext, ()>;

/// Routes uncommitted streams to a fixed pool of committing mailboxes.
pub struct EventCommittingService {
    mailboxes: Vec<CommittingMailbox>,
}

impl EventCommittingService {
    pub fn new(
        store: Arc<EventStore>,
        cache: Arc<AggregateCache>,
        registry: Arc<HandlerRegistry>,
        publisher: Arc<dyn MessagePublisher>,
        config: &CommittingConfig,
        retry: RetryPolicy,
    ) -> Self {
        let count = config.mailbox_count.max(1);
        let options = MailboxOptions {
            batch_size: config.batch_size.max(1),
            await_completion: false,
            ..MailboxOptions::default()
        };
        let mailboxes = (0..count)
            .map(|index| {
                let worker = Arc::new(CommittingWorker {
                    store: Arc::clone(&store),
                    cache: Arc::clone(&cache),
                    registry: Arc::clone(&registry),
                    publisher: Arc::clone(&publisher),
                    retry: retry.clone(),
                    stale: StdMutex::new(HashMap::new()),
                });
                Mailbox::new(format!("committing-{index}"), options.clone(), worker)
            })
            .collect();
        Self { mailboxes }
    }

    /// Enqueue a stream into its aggregate's committing mailbox.
    pub fn enqueue(&self, context: EventCommittingContext) {
        let mut hasher = DefaultHasher::new();
        context.stream.aggregate_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.mailboxes.len();
        self.mailboxes[index].enqueue(context);
    }
}

/// Handler behind one committing mailbox.
struct CommittingWorker {
    store: Arc<EventStore>,
    cache: Arc<AggregateCache>,
    registry: Arc<HandlerRegistry>,
    publisher: Arc<dyn MessagePublisher>,
    retry: RetryPolicy,
    /// Aggregate id -> refreshed version recorded during conflict
    /// recovery. Queued streams at or below that version were built
    /// against stale state and are dropped; the rewound command mailbox
    /// re-produces them against fresh state.
    stale: StdMutex<HashMap<String, u64>>,
}

impl CommittingWorker {
    /// Returns true when the context targets a version already covered
    /// by a recovery refresh. Seeing a newer version retires the entry.
    fn is_stale(&self, context: &EventCommittingContext) -> bool {
        let mut stale = self.stale.lock().expect("stale map lock poisoned");
        match stale.get(&context.stream.aggregate_id) {
            Some(&version) if context.stream.version <= version => true,
            Some(_) => {
                stale.remove(&context.stream.aggregate_id);
                false
            }
            None => false,
        }
    }

    async fn publish_stream(&self, stream: &EventStream) -> anyhow::Result<()> {
        with_retry(&self.retry, "hand stream to publisher", || {
            self.publisher.publish(stream.clone())
        })
        .await
    }

    async fn complete_command(
        &self,
        context: &EventCommittingContext,
        result: CommandResult,
    ) {
        Arc::clone(&context.message).complete(result).await;
    }

    /// Success path: cache the post-commit snapshot, publish, complete.
    async fn handle_success(&self, context: &EventCommittingContext) {
        self.cache.set(context.snapshot.clone()).await;
        let command = &context.message.payload().command;
        if let Err(e) = self.publish_stream(&context.stream).await {
            tracing::error!(
                aggregate_id = %context.stream.aggregate_id,
                command_id = %command.command_id,
                version = context.stream.version,
                error = %e,
                "stream committed but publishing failed after retries"
            );
            self.complete_command(
                context,
                CommandResult::failed(
                    &command.command_id,
                    &command.aggregate_id,
                    "events committed but publishing failed",
                ),
            )
            .await;
            return;
        }
        self.complete_command(
            context,
            CommandResult::success(&command.command_id, &command.aggregate_id),
        )
        .await;
    }

    /// Duplicate-command path: the command already committed once, so
    /// find its stream and republish it (publishing is idempotent), then
    /// report success. A version-1 duplicate with a different command id
    /// means two distinct creation attempts for the same aggregate id.
    async fn handle_duplicate(&self, context: &EventCommittingContext) {
        let command = &context.message.payload().command;
        let aggregate_id = &context.stream.aggregate_id;
        let committed = match self
            .store
            .find_by_command(aggregate_id, &command.command_id)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                self.complete_command(
                    context,
                    CommandResult::failed(
                        &command.command_id,
                        &command.aggregate_id,
                        format!("failed to look up committed stream: {e}"),
                    ),
                )
                .await;
                return;
            }
        };

        match committed {
            Some(stream) => {
                if let Err(e) = self.publish_stream(&stream).await {
                    tracing::warn!(
                        aggregate_id = %aggregate_id,
                        command_id = %command.command_id,
                        error = %e,
                        "republish of duplicate command's stream failed"
                    );
                }
                self.complete_command(
                    context,
                    CommandResult::success(&command.command_id, &command.aggregate_id),
                )
                .await;
            }
            None if context.stream.version == 1 => {
                // Another command already created this aggregate.
                let taken = self.store.find_by_version(aggregate_id, 1).await;
                let message = match taken {
                    Ok(Some(_)) => {
                        format!("aggregate '{aggregate_id}' was already created by another command")
                    }
                    _ => {
                        tracing::error!(
                            aggregate_id = %aggregate_id,
                            command_id = %command.command_id,
                            "duplicate creation reported but no version-1 stream exists"
                        );
                        format!("inconsistent creation state for aggregate '{aggregate_id}'")
                    }
                };
                self.complete_command(
                    context,
                    CommandResult::failed(&command.command_id, &command.aggregate_id, message),
                )
                .await;
            }
            None => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    command_id = %command.command_id,
                    version = context.stream.version,
                    "duplicate command reported but its stream cannot be found"
                );
                self.complete_command(
                    context,
                    CommandResult::failed(
                        &command.command_id,
                        &command.aggregate_id,
                        "duplicate command detected but its committed events are missing",
                    ),
                )
                .await;
            }
        }
    }

    /// Conflict path: a concurrent writer advanced the aggregate past the
    /// version this stream targeted. Pause the command mailbox, reload
    /// the aggregate from the store, mark queued streams built on stale
    /// state, rewind the mailbox to the colliding command, and resume so
    /// it re-executes against the refreshed snapshot.
    async fn handle_conflict(&self, context: &EventCommittingContext) {
        let command = &context.message.payload().command;
        let aggregate_id = context.stream.aggregate_id.clone();
        tracing::info!(
            aggregate_id = %aggregate_id,
            command_id = %command.command_id,
            version = context.stream.version,
            "version conflict, reloading aggregate and replaying command"
        );

        let Some(command_mailbox) = context.message.mailbox() else {
            tracing::error!(
                aggregate_id = %aggregate_id,
                command_id = %command.command_id,
                "conflicted command's mailbox is gone, cannot recover"
            );
            self.complete_command(
                context,
                CommandResult::failed(
                    &command.command_id,
                    &command.aggregate_id,
                    "version conflict and the command mailbox no longer exists",
                ),
            )
            .await;
            return;
        };

        command_mailbox.pause().await;

        let refreshed = match self.registry.resolve(&context.stream.aggregate_type) {
            Ok(runtime) => {
                self.cache
                    .refresh_from_store(&runtime, &self.store, &aggregate_id)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match refreshed {
            Ok(snapshot) => {
                self.stale
                    .lock()
                    .expect("stale map lock poisoned")
                    .insert(aggregate_id, snapshot.version);
                command_mailbox.reset_consuming_sequence(context.message.sequence());
            }
            Err(e) => {
                tracing::error!(
                    aggregate_id = %aggregate_id,
                    command_id = %command.command_id,
                    error = %e,
                    "failed to reload aggregate during conflict recovery"
                );
                self.complete_command(
                    context,
                    CommandResult::failed(
                        &command.command_id,
                        &command.aggregate_id,
                        format!("conflict recovery failed: {e}"),
                    ),
                )
                .await;
            }
        }

        command_mailbox.resume();
        command_mailbox.try_run();
    }
}

#[async_trait]
impl MailboxHandler<EventCommittingContext, ()> for CommittingWorker {
    async fn process(
        &self,
        messages: Vec<Arc<MailboxMessage<EventCommittingContext, ()>>>,
    ) -> anyhow::Result<()> {
        // Skip streams invalidated by an earlier conflict recovery. The
        // rewound command mailbox re-executes their commands, so only the
        // committing-side bookkeeping is completed here.
        let mut live = Vec::with_capacity(messages.len());
        for message in messages {
            if self.is_stale(message.payload()) {
                tracing::debug!(
                    aggregate_id = %message.payload().stream.aggregate_id,
                    version = message.payload().stream.version,
                    "dropping stream built against stale aggregate state"
                );
                message.complete(()).await;
            } else {
                live.push(message);
            }
        }
        if live.is_empty() {
            return Ok(());
        }

        let streams: Vec<EventStream> =
            live.iter().map(|m| m.payload().stream.clone()).collect();
        let appended = with_retry(&self.retry, "batch append event streams", || {
            self.store.batch_append(streams.clone())
        })
        .await;

        let result = match appended {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "event store unavailable after retries");
                for message in &live {
                    let ctx = message.payload();
                    let command = &ctx.message.payload().command;
                    self.complete_command(
                        ctx,
                        CommandResult::failed(
                            &command.command_id,
                            &command.aggregate_id,
                            "event store unavailable",
                        ),
                    )
                    .await;
                    Arc::clone(message).complete(()).await;
                }
                return Ok(());
            }
        };

        let succeeded: HashSet<&str> = result.succeeded.iter().map(String::as_str).collect();
        let conflicted: HashSet<&str> = result.conflicted.iter().map(String::as_str).collect();
        let duplicates: HashSet<&str> = result
            .duplicate_command
            .values()
            .flatten()
            .map(String::as_str)
            .collect();

        for message in &live {
            let ctx = message.payload();
            let command_id = ctx.stream.command_id.as_str();
            if succeeded.contains(command_id) {
                self.handle_success(ctx).await;
            } else if duplicates.contains(command_id) {
                self.handle_duplicate(ctx).await;
            } else if conflicted.contains(command_id) {
                self.handle_conflict(ctx).await;
            } else {
                // Every stream must fall into exactly one class.
                tracing::error!(
                    aggregate_id = %ctx.stream.aggregate_id,
                    command_id = %command_id,
                    "batch append returned no classification for stream"
                );
                let command = &ctx.message.payload().command;
                self.complete_command(
                    ctx,
                    CommandResult::failed(
                        &command.command_id,
                        &command.aggregate_id,
                        "event store returned no result for this stream",
                    ),
                )
                .await;
            }
            Arc::clone(message).complete(()).await;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        _message: Arc<MailboxMessage<EventCommittingContext, ()>>,
        _result: (),
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
