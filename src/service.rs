//! Builder and facade wiring the whole pipeline together.
//!
//! [`CommandServiceBuilder`] assembles the store, cache, registry,
//! committing pool, and publishing pipeline from registered aggregates
//! and subscribers; [`CommandService`] is the resulting entry point for
//! executing commands and reading back aggregate state.

use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::cache::AggregateCache;
use crate::command::{Command, CommandResult};
use crate::committing::EventCommittingService;
use crate::config::SequentConfig;
use crate::error::{CommandError, StoreError};
use crate::event::fold_streams;
use crate::processor::{CommandExecutor, CommandProcessor, ProcessingCommand};
use crate::publishing::{
    EventPublishingPipeline, EventSubscriber, InMemoryPublishedVersionStore, MessagePublisher,
    PublishedVersionStore,
};
use crate::registry::HandlerRegistry;
use crate::store::{CommitLog, EventStore, InMemoryCommitLog};

/// Assembles a [`CommandService`]: register aggregates and subscribers,
/// optionally swap in durable backends, then `build().await`.
///
/// With no backends configured the service runs fully in memory, which
/// is the intended setup for tests and embedded use.
pub struct CommandServiceBuilder {
    registry: HandlerRegistry,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    commit_log: Option<Arc<dyn CommitLog>>,
    version_store: Option<Arc<dyn PublishedVersionStore>>,
    config: SequentConfig,
    processor_name: String,
}

impl Default for CommandServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandServiceBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            subscribers: Vec::new(),
            commit_log: None,
            version_store: None,
            config: SequentConfig::default(),
            processor_name: "sequent".to_string(),
        }
    }

    /// Register an aggregate type and its command handler.
    pub fn aggregate<A: Aggregate>(mut self) -> Self {
        self.registry.register::<A>();
        self
    }

    /// Add a subscriber that receives committed event streams in
    /// per-aggregate version order.
    pub fn subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Use a custom commit log instead of the in-memory default.
    pub fn commit_log(mut self, log: Arc<dyn CommitLog>) -> Self {
        self.commit_log = Some(log);
        self
    }

    /// Use a custom published-version store instead of the in-memory
    /// default.
    pub fn published_version_store(mut self, store: Arc<dyn PublishedVersionStore>) -> Self {
        self.version_store = Some(store);
        self
    }

    pub fn config(mut self, config: SequentConfig) -> Self {
        self.config = config;
        self
    }

    /// Name under which published versions are tracked. Defaults to
    /// "sequent"; give each pipeline sharing a version store its own
    /// name.
    pub fn processor_name(mut self, name: impl Into<String>) -> Self {
        self.processor_name = name.into();
        self
    }

    /// Wire everything up, rebuild version chains from the commit log,
    /// and start the background sweeps.
    ///
    /// # Errors
    ///
    /// Fails when the commit log cannot be read during chain replay.
    pub async fn build(self) -> Result<CommandService, StoreError> {
        let log = self
            .commit_log
            .unwrap_or_else(|| Arc::new(InMemoryCommitLog::new()));
        let versions = self
            .version_store
            .unwrap_or_else(|| Arc::new(InMemoryPublishedVersionStore::new()));

        let store = Arc::new(EventStore::new(log));
        store.replay_from_log().await.map_err(StoreError::from)?;

        let pipeline = EventPublishingPipeline::new(
            self.processor_name,
            self.subscribers,
            versions,
            self.config.publishing.clone(),
            self.config.retry.clone(),
        );
        pipeline.start();

        let registry = Arc::new(self.registry);
        let cache = Arc::new(AggregateCache::new());
        let committing = Arc::new(EventCommittingService::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::new(pipeline.clone()) as Arc<dyn MessagePublisher>,
            &self.config.committing,
            self.config.retry.clone(),
        ));
        let executor = Arc::new(CommandExecutor::new(
            registry,
            cache,
            Arc::clone(&store),
            committing,
        ));
        let processor = CommandProcessor::new(executor, self.config.command_sweep.clone());
        processor.start();

        Ok(CommandService {
            processor,
            store,
            pipeline,
            config: self.config,
        })
    }
}

/// The running pipeline: accepts commands, exposes the event store, and
/// owns the background tasks.
pub struct CommandService {
    processor: CommandProcessor,
    store: Arc<EventStore>,
    pipeline: EventPublishingPipeline,
    config: SequentConfig,
}

impl CommandService {
    /// Execute a command and wait for its terminal result.
    ///
    /// Domain rejections, conflicts that exhaust recovery, and
    /// infrastructure failures all come back as a [`CommandResult`];
    /// the error type covers only commands that could not be routed at
    /// all. If no result arrives within the configured execute timeout a
    /// `Timeout` result is returned while the command keeps processing
    /// in the background.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, CommandError> {
        let command_id = command.command_id.clone();
        let aggregate_id = command.aggregate_id.clone();
        let (processing, reply) = ProcessingCommand::new(command);
        self.processor.process(processing).await?;

        match tokio::time::timeout(self.config.execute_timeout.0, reply).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(CommandResult::failed(
                command_id,
                aggregate_id,
                "command processing dropped without a result",
            )),
            Err(_) => {
                tracing::warn!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    "timed out waiting for command result"
                );
                Ok(CommandResult::timeout(command_id, aggregate_id))
            }
        }
    }

    /// Enqueue a command without waiting for its result.
    pub async fn send(&self, command: Command) -> Result<(), CommandError> {
        let (processing, _reply) = ProcessingCommand::new(command);
        self.processor.process(processing).await
    }

    /// Fold an aggregate's committed events into its current state.
    /// Returns `None` for an aggregate with no history.
    pub async fn aggregate_state<A: Aggregate>(
        &self,
        aggregate_id: &str,
    ) -> anyhow::Result<Option<A>> {
        let streams = self
            .store
            .query_aggregate_events(aggregate_id, 1, u64::MAX)
            .await?;
        if streams.is_empty() {
            return Ok(None);
        }
        let (state, _version) = fold_streams::<A>(&streams);
        Ok(Some(state))
    }

    /// The underlying event store.
    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Stop the background sweep tasks. In-flight commands complete on
    /// their own.
    pub fn shutdown(&self) {
        self.processor.shutdown();
        self.pipeline.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{
        AccountCommand, BankAccount, Counter, CounterCommand,
    };
    use crate::command::CommandStatus;
    use crate::event::EventStream;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct CollectingSubscriber {
        seen: StdMutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl EventSubscriber for CollectingSubscriber {
        async fn handle(&self, stream: &EventStream) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((stream.aggregate_id.clone(), stream.version));
            Ok(())
        }
    }

    async fn service() -> CommandService {
        CommandServiceBuilder::new()
            .aggregate::<BankAccount>()
            .aggregate::<Counter>()
            .build()
            .await
            .expect("service should build")
    }

    #[tokio::test]
    async fn execute_commits_and_reports_success() {
        let service = service().await;
        let open = Command::new::<BankAccount>("acc-1", &AccountCommand::Open).unwrap();
        let result = service.execute(open).await.unwrap();
        assert_eq!(result.status, CommandStatus::Success);

        let deposit =
            Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(25)).unwrap();
        let result = service.execute(deposit).await.unwrap();
        assert_eq!(result.status, CommandStatus::Success);

        let account = service
            .aggregate_state::<BankAccount>("acc-1")
            .await
            .unwrap()
            .expect("account should exist");
        assert!(account.open);
        assert_eq!(account.balance, 25);
        assert_eq!(service.event_store().current_version("acc-1").await, 2);
        service.shutdown();
    }

    #[tokio::test]
    async fn accepted_command_with_no_events_is_nothing_changed() {
        let service = service().await;
        let touch = Command::new::<Counter>("ctr-1", &CounterCommand::Touch).unwrap();
        let result = service.execute(touch).await.unwrap();
        assert_eq!(result.status, CommandStatus::NothingChanged);
        assert!(service
            .aggregate_state::<Counter>("ctr-1")
            .await
            .unwrap()
            .is_none());
        service.shutdown();
    }

    #[tokio::test]
    async fn domain_rejection_is_a_failed_result() {
        let service = service().await;
        let deposit =
            Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(10)).unwrap();
        let result = service.execute(deposit).await.unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(result
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("not open"));
        service.shutdown();
    }

    #[tokio::test]
    async fn unregistered_aggregate_type_fails_the_command() {
        let service = CommandServiceBuilder::new().build().await.unwrap();
        let open = Command::new::<BankAccount>("acc-1", &AccountCommand::Open).unwrap();
        let result = service.execute(open).await.unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(result
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("no command handler"));
        service.shutdown();
    }

    #[tokio::test]
    async fn empty_aggregate_id_is_rejected_up_front() {
        let service = service().await;
        let command = Command::new::<BankAccount>("", &AccountCommand::Open).unwrap();
        let err = service.execute(command).await.expect_err("must not route");
        assert!(matches!(err, CommandError::MissingAggregateId));
        service.shutdown();
    }

    #[tokio::test]
    async fn retried_command_id_replays_idempotently() {
        let service = service().await;
        let open = Command::new::<BankAccount>("acc-1", &AccountCommand::Open).unwrap();
        service.execute(open).await.unwrap();

        let deposit = Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(25))
            .unwrap()
            .with_command_id("deposit-once");
        let first = service.execute(deposit.clone()).await.unwrap();
        assert_eq!(first.status, CommandStatus::Success);

        // Same command id delivered again: reported as success, applied
        // exactly once.
        let second = service.execute(deposit).await.unwrap();
        assert_eq!(second.status, CommandStatus::Success);

        let account = service
            .aggregate_state::<BankAccount>("acc-1")
            .await
            .unwrap()
            .expect("account should exist");
        assert_eq!(account.balance, 25);
        assert_eq!(service.event_store().current_version("acc-1").await, 2);
        service.shutdown();
    }

    #[tokio::test]
    async fn subscribers_see_streams_in_version_order() {
        let subscriber = Arc::new(CollectingSubscriber {
            seen: StdMutex::new(Vec::new()),
        });
        let service = CommandServiceBuilder::new()
            .aggregate::<BankAccount>()
            .subscriber(subscriber.clone())
            .build()
            .await
            .unwrap();

        let open = Command::new::<BankAccount>("acc-1", &AccountCommand::Open).unwrap();
        service.execute(open).await.unwrap();
        for amount in [5, 10, 15] {
            let deposit =
                Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(amount)).unwrap();
            service.execute(deposit).await.unwrap();
        }

        // Publishing is asynchronous relative to the command result.
        for _ in 0..100 {
            if subscriber.seen.lock().unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let versions: Vec<u64> = subscriber
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|&(_, v)| v)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
        service.shutdown();
    }

    #[tokio::test]
    async fn state_restored_after_restart_from_same_log() {
        let log = Arc::new(InMemoryCommitLog::new());
        {
            let service = CommandServiceBuilder::new()
                .aggregate::<BankAccount>()
                .commit_log(Arc::clone(&log) as Arc<dyn CommitLog>)
                .build()
                .await
                .unwrap();
            let open = Command::new::<BankAccount>("acc-1", &AccountCommand::Open).unwrap();
            service.execute(open).await.unwrap();
            let deposit =
                Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(40)).unwrap();
            service.execute(deposit).await.unwrap();
            service.shutdown();
        }

        let restarted = CommandServiceBuilder::new()
            .aggregate::<BankAccount>()
            .commit_log(log as Arc<dyn CommitLog>)
            .build()
            .await
            .unwrap();
        let account = restarted
            .aggregate_state::<BankAccount>("acc-1")
            .await
            .unwrap()
            .expect("history should survive a restart");
        assert_eq!(account.balance, 40);

        // The rebuilt version chain keeps enforcing density.
        let withdraw =
            Command::new::<BankAccount>("acc-1", &AccountCommand::Withdraw(15)).unwrap();
        let result = restarted.execute(withdraw).await.unwrap();
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(restarted.event_store().current_version("acc-1").await, 3);
        restarted.shutdown();
    }
}
