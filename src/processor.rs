//! Per-aggregate command mailboxes and the command execution handler.
//!
//! Every aggregate id gets a dedicated mailbox processing one command at
//! a time; the next command is not consumed until the previous one's
//! result is finalized, so command execution per aggregate is strictly
//! serial while distinct aggregates run concurrently. Execution itself
//! never blocks on the event store: it reads the cached snapshot, runs
//! the handler, and hands the uncommitted stream to the committing pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use crate::cache::{AggregateCache, AggregateSnapshot};
use crate::command::{Command, CommandResult};
use crate::committing::{EventCommittingContext, EventCommittingService};
use crate::config::MailboxSweepConfig;
use crate::error::CommandError;
use crate::event::EventStream;
use crate::mailbox::{Mailbox, MailboxHandler, MailboxMessage, MailboxOptions};
use crate::registry::{Decision, HandlerRegistry};
use crate::store::EventStore;

/// A command travelling through its aggregate's mailbox, carrying the
/// one-shot reply channel back to the caller.
pub struct ProcessingCommand {
    pub command: Command,
    reply: StdMutex<Option<oneshot::Sender<CommandResult>>>,
}

impl ProcessingCommand {
    /// Wrap a command and hand back the receiver the caller awaits.
    pub fn new(command: Command) -> (Self, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: StdMutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver the result to the caller. Subsequent deliveries (an
    /// idempotent re-finalization) are dropped; a caller that has gone
    /// away is ignored.
    pub fn send_reply(&self, result: CommandResult) {
        let sender = self
            .reply
            .lock()
            .expect("reply channel lock poisoned")
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

pub type CommandMailbox = Mailbox<ProcessingCommand, CommandResult>;

/// Mailbox handler that executes commands against cached aggregate
/// state.
pub struct CommandExecutor {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) cache: Arc<AggregateCache>,
    pub(crate) store: Arc<EventStore>,
    committing: Arc<EventCommittingService>,
}

impl CommandExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        cache: Arc<AggregateCache>,
        store: Arc<EventStore>,
        committing: Arc<EventCommittingService>,
    ) -> Self {
        Self {
            registry,
            cache,
            store,
            committing,
        }
    }

    async fn execute_one(&self, message: Arc<MailboxMessage<ProcessingCommand, CommandResult>>) {
        let command = &message.payload().command;
        let command_id = command.command_id.clone();
        let aggregate_id = command.aggregate_id.clone();
        tracing::debug!(
            aggregate_id = %aggregate_id,
            command_id = %command_id,
            aggregate_type = %command.aggregate_type,
            "executing command"
        );

        let runtime = match self.registry.resolve(&command.aggregate_type) {
            Ok(runtime) => runtime,
            Err(e) => {
                message
                    .complete(CommandResult::failed(&command_id, &aggregate_id, e.to_string()))
                    .await;
                return;
            }
        };

        let snapshot = match self.cache.get(&aggregate_id).await {
            Some(snapshot) => snapshot,
            None => {
                match self
                    .cache
                    .refresh_from_store(&runtime, &self.store, &aggregate_id)
                    .await
                {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        tracing::error!(
                            aggregate_id = %aggregate_id,
                            command_id = %command_id,
                            error = %e,
                            "failed to load aggregate state"
                        );
                        message
                            .complete(CommandResult::failed(
                                &command_id,
                                &aggregate_id,
                                format!("failed to load aggregate state: {e}"),
                            ))
                            .await;
                        return;
                    }
                }
            }
        };

        match runtime.execute(command, &snapshot).await {
            Err(e) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    error = %e,
                    "command rejected"
                );
                message
                    .complete(CommandResult::failed(&command_id, &aggregate_id, e.to_string()))
                    .await;
            }
            Ok(Decision::Unchanged) => {
                message
                    .complete(CommandResult::nothing_changed(&command_id, &aggregate_id))
                    .await;
            }
            Ok(Decision::Events { records, state }) => {
                let version = snapshot.version + 1;
                let stream = EventStream::new(
                    aggregate_id.clone(),
                    command.aggregate_type.clone(),
                    command_id.clone(),
                    version,
                    records,
                );
                let next_snapshot = AggregateSnapshot {
                    aggregate_id: aggregate_id.clone(),
                    aggregate_type: command.aggregate_type.clone(),
                    version,
                    state,
                };
                self.committing.enqueue(EventCommittingContext {
                    stream,
                    snapshot: next_snapshot,
                    message: Arc::clone(&message),
                });
            }
        }
    }
}

#[async_trait]
impl MailboxHandler<ProcessingCommand, CommandResult> for CommandExecutor {
    async fn process(
        &self,
        messages: Vec<Arc<MailboxMessage<ProcessingCommand, CommandResult>>>,
    ) -> anyhow::Result<()> {
        for message in messages {
            self.execute_one(message).await;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        message: Arc<MailboxMessage<ProcessingCommand, CommandResult>>,
        result: CommandResult,
    ) -> anyhow::Result<()> {
        message.payload().send_reply(result);
        Ok(())
    }
}

/// Routes commands to per-aggregate mailboxes and sweeps idle ones.
pub struct CommandProcessor {
    mailboxes: Arc<RwLock<HashMap<String, CommandMailbox>>>,
    executor: Arc<CommandExecutor>,
    sweep: MailboxSweepConfig,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl CommandProcessor {
    pub fn new(executor: Arc<CommandExecutor>, sweep: MailboxSweepConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            executor,
            sweep,
            sweeper: StdMutex::new(None),
            shutdown,
        }
    }

    /// Spawn the idle-mailbox sweep.
    pub fn start(&self) {
        let mailboxes = Arc::clone(&self.mailboxes);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.sweep.sweep_interval;
        let idle_timeout = self.sweep.idle_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut map = mailboxes.write().await;
                        let before = map.len();
                        map.retain(|_, mailbox| !mailbox.is_inactive(idle_timeout));
                        let removed = before - map.len();
                        if removed > 0 {
                            tracing::debug!(removed, "swept idle command mailboxes");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self
            .sweeper
            .lock()
            .expect("command sweeper lock poisoned") = Some(handle);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self
            .sweeper
            .lock()
            .expect("command sweeper lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Route a command into its aggregate's mailbox.
    ///
    /// # Errors
    ///
    /// [`CommandError::MissingAggregateId`] when the aggregate id is
    /// empty; every other failure is reported through the command's
    /// [`CommandResult`].
    pub async fn process(&self, processing: ProcessingCommand) -> Result<(), CommandError> {
        if processing.command.aggregate_id.is_empty() {
            return Err(CommandError::MissingAggregateId);
        }
        let mailbox = self.mailbox_for(&processing.command).await;
        mailbox.enqueue(processing);
        Ok(())
    }

    async fn mailbox_for(&self, command: &Command) -> CommandMailbox {
        if let Some(mailbox) = self.mailboxes.read().await.get(&command.aggregate_id) {
            return mailbox.clone();
        }

        // First command for this aggregate since startup (or since the
        // sweep removed its mailbox): warm the snapshot cache so the
        // executor does not race a cold read.
        if self.executor.cache.get(&command.aggregate_id).await.is_none() {
            if let Ok(runtime) = self.executor.registry.resolve(&command.aggregate_type) {
                if let Err(e) = self
                    .executor
                    .cache
                    .refresh_from_store(&runtime, &self.executor.store, &command.aggregate_id)
                    .await
                {
                    // The executor retries the load itself and fails the
                    // command if the store stays unavailable.
                    tracing::warn!(
                        aggregate_id = %command.aggregate_id,
                        error = %e,
                        "failed to warm aggregate snapshot"
                    );
                }
            }
        }

        let mut map = self.mailboxes.write().await;
        map.entry(command.aggregate_id.clone())
            .or_insert_with(|| {
                Mailbox::new(
                    command.aggregate_id.clone(),
                    MailboxOptions {
                        batch_size: 1,
                        await_completion: true,
                        ..MailboxOptions::default()
                    },
                    Arc::clone(&self.executor)
                        as Arc<dyn MailboxHandler<ProcessingCommand, CommandResult>>,
                )
            })
            .clone()
    }
}
