//! In-memory cache of the latest materialized aggregate state.
//!
//! The pipeline consults the cache before executing a command and writes
//! back the post-commit state after every successful append, so steady
//! state command execution never touches the event store. On a miss or
//! after a concurrency conflict the snapshot is rebuilt from the full
//! event history.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::registry::AggregateRuntime;
use crate::store::EventStore;

/// Serialized aggregate state at a specific version.
///
/// `version` 0 with a null `state` denotes an aggregate that has no
/// committed events yet.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub state: Value,
}

impl AggregateSnapshot {
    /// The pre-creation snapshot for an aggregate with no history.
    pub fn empty(aggregate_id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version: 0,
            state: Value::Null,
        }
    }
}

/// Shared snapshot cache keyed by aggregate id.
#[derive(Default)]
pub struct AggregateCache {
    entries: RwLock<HashMap<String, AggregateSnapshot>>,
}

impl AggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest cached snapshot for the aggregate, if any.
    pub async fn get(&self, aggregate_id: &str) -> Option<AggregateSnapshot> {
        self.entries.read().await.get(aggregate_id).cloned()
    }

    /// Store a snapshot, replacing any previous entry. Last writer wins;
    /// per-aggregate commit ordering guarantees the writers arrive in
    /// version order.
    pub async fn set(&self, snapshot: AggregateSnapshot) {
        self.entries
            .write()
            .await
            .insert(snapshot.aggregate_id.clone(), snapshot);
    }

    /// Drop the cached snapshot for the aggregate.
    pub async fn remove(&self, aggregate_id: &str) {
        self.entries.write().await.remove(aggregate_id);
    }

    /// Rebuild the snapshot from the aggregate's full event history and
    /// cache the result.
    ///
    /// Used on cache miss and during conflict recovery, where the cached
    /// state is known to be behind the store.
    pub async fn refresh_from_store(
        &self,
        runtime: &Arc<dyn AggregateRuntime>,
        store: &EventStore,
        aggregate_id: &str,
    ) -> anyhow::Result<AggregateSnapshot> {
        let streams = store
            .query_aggregate_events(aggregate_id, 1, u64::MAX)
            .await?;
        let snapshot = runtime.replay(aggregate_id, &streams)?;
        tracing::debug!(
            aggregate_id = %aggregate_id,
            version = snapshot.version,
            "refreshed aggregate snapshot from event store"
        );
        self.set(snapshot.clone()).await;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_latest_set_snapshot() {
        let cache = AggregateCache::new();
        assert!(cache.get("acc-1").await.is_none());

        cache
            .set(AggregateSnapshot {
                aggregate_id: "acc-1".to_string(),
                aggregate_type: "bank_account".to_string(),
                version: 1,
                state: serde_json::json!({"balance": 10}),
            })
            .await;
        cache
            .set(AggregateSnapshot {
                aggregate_id: "acc-1".to_string(),
                aggregate_type: "bank_account".to_string(),
                version: 2,
                state: serde_json::json!({"balance": 30}),
            })
            .await;

        let snapshot = cache.get("acc-1").await.expect("snapshot should be cached");
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.state["balance"], 30);
    }

    #[tokio::test]
    async fn remove_forgets_the_aggregate() {
        let cache = AggregateCache::new();
        cache
            .set(AggregateSnapshot::empty("acc-1", "bank_account"))
            .await;
        cache.remove("acc-1").await;
        assert!(cache.get("acc-1").await.is_none());
    }

    #[test]
    fn empty_snapshot_has_version_zero_and_null_state() {
        let snapshot = AggregateSnapshot::empty("acc-1", "bank_account");
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.state.is_null());
    }
}
