//! End-to-end pipeline tests: serialized per-aggregate execution,
//! conflict recovery against an out-of-band writer, idempotent replay,
//! and ordered publishing across a gap.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use sequent::{
    Aggregate, AppendResult, Command, CommandService, CommandServiceBuilder, CommandStatus,
    EventRecord, EventStream, EventSubscriber, InMemoryPublishedVersionStore, PublishedVersionStore,
    PublishingConfig, SequentConfig,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BankAccount {
    open: bool,
    balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum AccountCommand {
    Open,
    Deposit(i64),
    Withdraw(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Opened,
    Deposited { amount: i64 },
    Withdrew { amount: i64 },
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("account is not open")]
    NotOpen,
    #[error("account is already open")]
    AlreadyOpen,
    #[error("insufficient funds")]
    InsufficientFunds,
}

impl Aggregate for BankAccount {
    const AGGREGATE_TYPE: &'static str = "account";

    type Command = AccountCommand;
    type DomainEvent = AccountEvent;
    type Error = AccountError;

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error> {
        match cmd {
            AccountCommand::Open => {
                if self.open {
                    return Err(AccountError::AlreadyOpen);
                }
                Ok(vec![AccountEvent::Opened])
            }
            AccountCommand::Deposit(amount) => {
                if !self.open {
                    return Err(AccountError::NotOpen);
                }
                Ok(vec![AccountEvent::Deposited { amount }])
            }
            AccountCommand::Withdraw(amount) => {
                if !self.open {
                    return Err(AccountError::NotOpen);
                }
                if amount > self.balance {
                    return Err(AccountError::InsufficientFunds);
                }
                Ok(vec![AccountEvent::Withdrew { amount }])
            }
        }
    }

    fn apply(mut self, event: &Self::DomainEvent) -> Self {
        match event {
            AccountEvent::Opened => self.open = true,
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrew { amount } => self.balance -= amount,
        }
        self
    }
}

/// Builds the stream a concurrent writer (another node) would commit.
fn foreign_deposit(aggregate_id: &str, version: u64, amount: i64) -> EventStream {
    EventStream::new(
        aggregate_id,
        "account",
        format!("external-{version}"),
        version,
        vec![EventRecord {
            event_id: Uuid::new_v4(),
            event_type: "Deposited".to_string(),
            payload: json!({ "amount": amount }),
        }],
    )
}

struct OrderedSubscriber {
    seen: Mutex<Vec<(String, u64)>>,
}

impl OrderedSubscriber {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn versions_for(&self, aggregate_id: &str) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == aggregate_id)
            .map(|&(_, v)| v)
            .collect()
    }
}

#[async_trait]
impl EventSubscriber for OrderedSubscriber {
    async fn handle(&self, stream: &EventStream) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((stream.aggregate_id.clone(), stream.version));
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn build_service() -> CommandService {
    init_tracing();
    CommandServiceBuilder::new()
        .aggregate::<BankAccount>()
        .build()
        .await
        .expect("service should build")
}

async fn open_account(service: &CommandService, aggregate_id: &str) {
    let open = Command::new::<BankAccount>(aggregate_id, &AccountCommand::Open)
        .expect("command should serialize");
    let result = service.execute(open).await.expect("open should route");
    assert_eq!(result.status, CommandStatus::Success);
}

#[tokio::test]
async fn conflict_with_out_of_band_writer_recovers_and_replays() {
    let service = build_service().await;
    open_account(&service, "acc-1").await;

    // A concurrent writer commits version 2 behind the running service's
    // back; the cached snapshot is now stale at version 1.
    let appended = service
        .event_store()
        .append(foreign_deposit("acc-1", 2, 100))
        .await
        .expect("out-of-band append should succeed");
    assert_eq!(appended, AppendResult::Success);

    // The next command executes against the stale snapshot, targets
    // version 2, conflicts at commit, and must be replayed against the
    // reloaded state.
    let deposit = Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(10))
        .expect("command should serialize");
    let result = service.execute(deposit).await.expect("deposit should route");
    assert_eq!(result.status, CommandStatus::Success);

    let account = service
        .aggregate_state::<BankAccount>("acc-1")
        .await
        .expect("state query should succeed")
        .expect("account should exist");
    assert_eq!(
        account.balance, 110,
        "both the foreign deposit and the replayed one must apply exactly once"
    );
    assert_eq!(service.event_store().current_version("acc-1").await, 3);

    // The replayed stream must sit at version 3 and carry the original
    // command's events.
    let replayed = service
        .event_store()
        .find_by_version("acc-1", 3)
        .await
        .expect("lookup should succeed")
        .expect("version 3 should be committed");
    assert_eq!(replayed.events.len(), 1);
    assert_eq!(replayed.events[0].event_type, "Deposited");
    service.shutdown();
}

#[tokio::test]
async fn conflicted_command_is_rechecked_against_fresh_state() {
    let service = build_service().await;
    open_account(&service, "acc-1").await;
    let deposit = Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(30))
        .expect("command should serialize");
    assert_eq!(
        service.execute(deposit).await.unwrap().status,
        CommandStatus::Success
    );

    // The out-of-band writer drains the account (version 3, -30), then a
    // withdrawal races it. Against the stale balance of 30 the withdrawal
    // looks fine; after the conflict reload it must be re-decided against
    // the drained balance and rejected.
    let appended = service
        .event_store()
        .append(foreign_deposit("acc-1", 3, -30))
        .await
        .expect("out-of-band append should succeed");
    assert_eq!(appended, AppendResult::Success);

    let withdraw = Command::new::<BankAccount>("acc-1", &AccountCommand::Withdraw(20))
        .expect("command should serialize");
    let result = service
        .execute(withdraw)
        .await
        .expect("withdraw should route");
    assert_eq!(result.status, CommandStatus::Failed);
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("insufficient funds"));

    let account = service
        .aggregate_state::<BankAccount>("acc-1")
        .await
        .unwrap()
        .expect("account should exist");
    assert_eq!(account.balance, 0);
    assert_eq!(service.event_store().current_version("acc-1").await, 3);
    service.shutdown();
}

#[tokio::test]
async fn concurrent_commands_on_one_aggregate_apply_exactly_once() {
    let service = Arc::new(build_service().await);
    open_account(&service, "acc-1").await;

    // Twenty concurrent deposits: the command mailbox serializes them, so
    // none may conflict and each applies exactly once.
    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let deposit = Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(1))
                .expect("command should serialize");
            service.execute(deposit).await.expect("deposit should route")
        }));
    }
    for handle in handles {
        let result = handle.await.expect("task should not panic");
        assert_eq!(result.status, CommandStatus::Success);
    }

    let account = service
        .aggregate_state::<BankAccount>("acc-1")
        .await
        .unwrap()
        .expect("account should exist");
    assert_eq!(account.balance, 20);
    assert_eq!(service.event_store().current_version("acc-1").await, 21);
    service.shutdown();
}

#[tokio::test]
async fn independent_aggregates_run_concurrently() {
    let service = Arc::new(build_service().await);

    let mut handles = Vec::new();
    for i in 0..10 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let id = format!("acc-{i}");
            let open = Command::new::<BankAccount>(&id, &AccountCommand::Open)
                .expect("command should serialize");
            let result = service.execute(open).await.expect("open should route");
            assert_eq!(result.status, CommandStatus::Success);
            let deposit = Command::new::<BankAccount>(&id, &AccountCommand::Deposit(5))
                .expect("command should serialize");
            let result = service.execute(deposit).await.expect("deposit should route");
            assert_eq!(result.status, CommandStatus::Success);
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    for i in 0..10 {
        let account = service
            .aggregate_state::<BankAccount>(&format!("acc-{i}"))
            .await
            .unwrap()
            .expect("account should exist");
        assert_eq!(account.balance, 5);
    }
    service.shutdown();
}

#[tokio::test]
async fn publishing_skips_a_gap_once_the_durable_version_covers_it() {
    init_tracing();
    let subscriber = OrderedSubscriber::new();
    let versions = Arc::new(InMemoryPublishedVersionStore::new());
    let mut config = SequentConfig::default();
    config.publishing = PublishingConfig {
        problem_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(20),
        idle_timeout: Duration::from_secs(300),
    };
    let service = CommandServiceBuilder::new()
        .aggregate::<BankAccount>()
        .subscriber(subscriber.clone())
        .published_version_store(versions.clone() as Arc<dyn PublishedVersionStore>)
        .processor_name("node-a")
        .config(config)
        .build()
        .await
        .expect("service should build");

    open_account(&service, "acc-1").await;

    // Another node commits and publishes version 2: it lands in the
    // shared log and the shared published-version store, but this node's
    // pipeline never sees the stream itself.
    service
        .event_store()
        .append(foreign_deposit("acc-1", 2, 100))
        .await
        .expect("out-of-band append should succeed");
    versions
        .update_published_version("node-a", "acc-1", 2)
        .await
        .expect("version update should succeed");

    // This node's next commit is version 3; its publish mailbox sees a
    // gap at version 2 until the sweep consults the durable mark.
    let deposit = Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(10))
        .expect("command should serialize");
    assert_eq!(
        service.execute(deposit).await.unwrap().status,
        CommandStatus::Success
    );

    for _ in 0..100 {
        if subscriber.versions_for("acc-1") == vec![1, 3] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        subscriber.versions_for("acc-1"),
        vec![1, 3],
        "version 3 must be published once the durable mark covers the gap"
    );
    service.shutdown();
}
