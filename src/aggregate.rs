//! The typed domain seam: the [`Aggregate`] trait.

use serde::{Serialize, de::DeserializeOwned};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the
/// [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   returns zero or more events. The runtime guarantees that `handle` is
///   never invoked concurrently for the same aggregate instance, and that
///   the state it sees reflects every previously committed command.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to a domain event,
///   returning the next state. Unknown event variants should be ignored
///   for forward compatibility.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "account"). Commands are routed
    /// to handlers by this name.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Serialize + DeserializeOwned + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use adjacently tagged serialization
    /// (`#[serde(tag = "type", content = "data")]`), the crate-wide
    /// convention for domain events.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    ///
    /// Unknown event variants should be ignored (return `self` unchanged)
    /// to maintain forward compatibility.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}


#[cfg(test)]
mod tests {
    use super::Aggregate;
    use super::test_fixtures::{
        AccountCommand, AccountError, AccountEvent, BankAccount, Counter, CounterCommand,
        CounterError, CounterEvent,
    };

    #[test]
    fn handle_increment() {
        let counter = Counter::default();
        let events = counter.handle(CounterCommand::Increment).unwrap();
        assert_eq!(events, vec![CounterEvent::Incremented]);
    }

    #[test]
    fn handle_decrement_at_zero() {
        let counter = Counter::default();
        let err = counter.handle(CounterCommand::Decrement).unwrap_err();
        assert!(
            matches!(err, CounterError::AlreadyZero),
            "expected AlreadyZero, got: {err}"
        );
    }

    #[test]
    fn handle_touch_is_a_no_op() {
        let counter = Counter { value: 3 };
        let events = counter.handle(CounterCommand::Touch).unwrap();
        assert!(events.is_empty(), "Touch should produce no events");
    }

    #[test]
    fn apply_folds_event_history() {
        let final_state = [
            CounterEvent::Incremented,
            CounterEvent::Added { amount: 10 },
            CounterEvent::Decremented,
        ]
        .iter()
        .fold(Counter::default(), |state, event| state.apply(event));
        assert_eq!(final_state.value, 10);
    }

    #[test]
    fn account_deposit_requires_open() {
        let account = BankAccount::default();
        let err = account.handle(AccountCommand::Deposit(10)).unwrap_err();
        assert!(matches!(err, AccountError::NotOpen), "got: {err}");
    }

    #[test]
    fn account_open_then_deposit() {
        let account = BankAccount::default().apply(&AccountEvent::Opened);
        let events = account.handle(AccountCommand::Deposit(25)).unwrap();
        assert_eq!(events, vec![AccountEvent::Deposited { amount: 25 }]);
        let account = events
            .iter()
            .fold(account, |state, event| state.apply(event));
        assert_eq!(account.balance, 25);
    }

    #[test]
    fn account_overdraw_rejected() {
        let account = BankAccount {
            open: true,
            balance: 5,
        };
        let err = account.handle(AccountCommand::Withdraw(10)).unwrap_err();
        assert!(
            matches!(
                err,
                AccountError::InsufficientFunds {
                    balance: 5,
                    requested: 10
                }
            ),
            "got: {err}"
        );
    }
}
