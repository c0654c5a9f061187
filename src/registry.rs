//! Command-handler registry and the type-erased aggregate runtime.
//!
//! Statically typed [`Aggregate`] implementations are wrapped in
//! [`TypedAggregate`], which erases the concrete types behind the
//! [`AggregateRuntime`] trait so the processing pipeline can route
//! commands by aggregate type name alone. The registry enforces exactly
//! one runtime per aggregate type at resolution time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::cache::AggregateSnapshot;
use crate::command::Command;
use crate::error::RegistryError;
use crate::event::{encode_domain_events, fold_streams, EventRecord, EventStream};

/// Outcome of executing a command against an aggregate's current state.
#[derive(Debug)]
pub enum Decision {
    /// The command was handled and produced no events.
    Unchanged,
    /// The command produced events; `records` is non-empty and `state` is
    /// the serialized post-command aggregate state.
    Events {
        records: Vec<EventRecord>,
        state: Value,
    },
}

/// Type-erased execution surface over one aggregate type.
#[async_trait]
pub trait AggregateRuntime: Send + Sync {
    /// The aggregate type name this runtime serves.
    fn aggregate_type(&self) -> &'static str;

    /// Deserialize the command and current state, run the aggregate's
    /// command handler, and fold any produced events into the next state.
    ///
    /// # Errors
    ///
    /// Fails when the payload or snapshot cannot be deserialized, or when
    /// the aggregate rejects the command.
    async fn execute(
        &self,
        command: &Command,
        snapshot: &AggregateSnapshot,
    ) -> anyhow::Result<Decision>;

    /// Rebuild a snapshot by folding the aggregate's committed event
    /// streams from scratch.
    fn replay(
        &self,
        aggregate_id: &str,
        streams: &[EventStream],
    ) -> anyhow::Result<AggregateSnapshot>;
}

/// Wraps a concrete [`Aggregate`] type as an [`AggregateRuntime`].
pub struct TypedAggregate<A> {
    _marker: std::marker::PhantomData<fn() -> A>,
}

impl<A> TypedAggregate<A> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<A> Default for TypedAggregate<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> TypedAggregate<A> {
    fn state_from(&self, snapshot: &AggregateSnapshot) -> anyhow::Result<A> {
        if snapshot.version == 0 || snapshot.state.is_null() {
            return Ok(A::default());
        }
        serde_json::from_value(snapshot.state.clone()).with_context(|| {
            format!(
                "deserializing cached state for aggregate '{}'",
                snapshot.aggregate_id
            )
        })
    }
}

#[async_trait]
impl<A: Aggregate> AggregateRuntime for TypedAggregate<A> {
    fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    async fn execute(
        &self,
        command: &Command,
        snapshot: &AggregateSnapshot,
    ) -> anyhow::Result<Decision> {
        let cmd: A::Command = serde_json::from_value(command.payload.clone())
            .with_context(|| format!("deserializing command '{}'", command.command_id))?;
        let state = self.state_from(snapshot)?;

        let events = state
            .handle(cmd)
            .map_err(|e| anyhow!("command rejected: {e}"))?;
        if events.is_empty() {
            return Ok(Decision::Unchanged);
        }

        let next_state = events
            .iter()
            .fold(self.state_from(snapshot)?, |acc, event| acc.apply(event));
        let records = encode_domain_events::<A>(&events)
            .context("serializing produced domain events")?;
        let state_value =
            serde_json::to_value(&next_state).context("serializing post-command state")?;
        Ok(Decision::Events {
            records,
            state: state_value,
        })
    }

    fn replay(
        &self,
        aggregate_id: &str,
        streams: &[EventStream],
    ) -> anyhow::Result<AggregateSnapshot> {
        let (state, version) = fold_streams::<A>(streams);
        let state_value = if version == 0 {
            Value::Null
        } else {
            serde_json::to_value(&state).context("serializing replayed state")?
        };
        Ok(AggregateSnapshot {
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            version,
            state: state_value,
        })
    }
}

/// Maps aggregate type names to their registered runtimes.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn AggregateRuntime>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runtime for `A::AGGREGATE_TYPE`. Registering the same
    /// type twice is recorded and rejected at resolution, matching the
    /// fail-at-dispatch semantics of ambiguous handler sets.
    pub fn register<A: Aggregate>(&mut self) {
        self.handlers
            .entry(A::AGGREGATE_TYPE.to_string())
            .or_default()
            .push(Arc::new(TypedAggregate::<A>::new()));
    }

    /// Resolve the single runtime for an aggregate type.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NoHandler`] when the type was never registered,
    /// [`RegistryError::DuplicateHandler`] when more than one runtime
    /// claims the type.
    pub fn resolve(&self, aggregate_type: &str) -> Result<Arc<dyn AggregateRuntime>, RegistryError> {
        let runtimes = self
            .handlers
            .get(aggregate_type)
            .ok_or_else(|| RegistryError::NoHandler {
                aggregate_type: aggregate_type.to_string(),
            })?;
        match runtimes.as_slice() {
            [single] => Ok(Arc::clone(single)),
            [] => Err(RegistryError::NoHandler {
                aggregate_type: aggregate_type.to_string(),
            }),
            many => Err(RegistryError::DuplicateHandler {
                aggregate_type: aggregate_type.to_string(),
                count: many.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{AccountCommand, BankAccount};
    use crate::event::EventStream;

    fn registry_with_account() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register::<BankAccount>();
        registry
    }

    #[test]
    fn resolve_unknown_type_is_no_handler() {
        let registry = registry_with_account();
        let err = registry
            .resolve("order")
            .err()
            .expect("unknown type should not resolve");
        assert!(matches!(err, RegistryError::NoHandler { .. }));
    }

    #[test]
    fn duplicate_registration_fails_at_resolution() {
        let mut registry = registry_with_account();
        registry.register::<BankAccount>();
        let err = registry
            .resolve("account")
            .err()
            .expect("duplicate registration should not resolve");
        assert!(matches!(err, RegistryError::DuplicateHandler { count: 2, .. }));
    }

    #[tokio::test]
    async fn execute_against_empty_snapshot_uses_default_state() {
        let registry = registry_with_account();
        let runtime = registry.resolve("account").expect("runtime registered");
        let command = Command::new::<BankAccount>("acc-1", &AccountCommand::Open)
            .expect("command should serialize");
        let snapshot = AggregateSnapshot::empty("acc-1", "account");

        match runtime
            .execute(&command, &snapshot)
            .await
            .expect("open should succeed")
        {
            Decision::Events { records, state } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].event_type, "Opened");
                assert_eq!(state["open"], true);
            }
            Decision::Unchanged => panic!("open must produce an event"),
        }
    }

    #[tokio::test]
    async fn execute_surfaces_domain_rejections() {
        let registry = registry_with_account();
        let runtime = registry.resolve("account").expect("runtime registered");
        let command = Command::new::<BankAccount>("acc-1", &AccountCommand::Deposit(10))
            .expect("command should serialize");
        let snapshot = AggregateSnapshot::empty("acc-1", "account");

        let err = runtime
            .execute(&command, &snapshot)
            .await
            .expect_err("deposit into unopened account must be rejected");
        assert!(err.to_string().contains("command rejected"));
    }

    #[test]
    fn replay_of_no_streams_is_the_empty_snapshot() {
        let registry = registry_with_account();
        let runtime = registry.resolve("account").expect("runtime registered");
        let snapshot = runtime
            .replay("acc-1", &[])
            .expect("empty replay should succeed");
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.state.is_null());
    }

    #[tokio::test]
    async fn replay_folds_committed_streams() {
        let registry = registry_with_account();
        let runtime = registry.resolve("account").expect("runtime registered");
        let snapshot = AggregateSnapshot::empty("acc-1", "account");

        // Commit an Open, replay it, then execute a deposit against the
        // replayed state.
        let open = Command::new::<BankAccount>("acc-1", &AccountCommand::Open)
            .expect("command should serialize");
        let Decision::Events { records, .. } = runtime
            .execute(&open, &snapshot)
            .await
            .expect("open should succeed")
        else {
            panic!("open must produce events");
        };
        let stream = EventStream::new("acc-1", "account", open.command_id.clone(), 1, records);

        let replayed = runtime
            .replay("acc-1", &[stream])
            .expect("replay should succeed");
        assert_eq!(replayed.version, 1);
        assert_eq!(replayed.state["open"], true);
    }
}
