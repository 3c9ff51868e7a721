//! In-process store, used by tests and `store = "memory"` runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use netloom_core::{ChangeSet, TenantId, TopologyGraph};
use tokio::sync::RwLock;

use crate::store::{GraphStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    graphs: RwLock<HashMap<TenantId, TopologyGraph>>,
    changes: RwLock<HashMap<TenantId, Vec<ChangeSet>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tenant's graph.
    pub async fn insert(&self, graph: TopologyGraph) {
        self.graphs.write().await.insert(graph.tenant_id, graph);
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Change sets committed for a tenant, oldest first.
    pub async fn change_sets(&self, tenant_id: &TenantId) -> Vec<ChangeSet> {
        self.changes
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn load(&self, tenant_id: &TenantId) -> Result<TopologyGraph, StoreError> {
        self.check_online()?;
        Ok(self
            .graphs
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| TopologyGraph::new(*tenant_id)))
    }

    async fn commit(
        &self,
        tenant_id: &TenantId,
        graph: &TopologyGraph,
        changes: &ChangeSet,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        // Take both locks before writing either so readers never see half a commit.
        let mut graphs = self.graphs.write().await;
        let mut history = self.changes.write().await;
        graphs.insert(*tenant_id, graph.clone());
        history.entry(*tenant_id).or_default().push(changes.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::Utc;
    use netloom_core::{JobMetadata, JobOrigin};
    use uuid::Uuid;

    fn change_set(tenant_id: TenantId) -> ChangeSet {
        ChangeSet::empty(JobMetadata {
            job_id: Uuid::new_v4(),
            tenant_id,
            origin: JobOrigin::AdHoc,
            config_id: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            protocols: BTreeSet::new(),
            total_observations: 0,
            partial: false,
        })
    }

    #[tokio::test]
    async fn missing_tenant_loads_empty() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let graph = store.load(&tenant).await.unwrap();
        assert_eq!(graph.tenant_id, tenant);
        assert!(graph.devices.is_empty());
    }

    #[tokio::test]
    async fn commit_then_load() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let mut graph = TopologyGraph::new(tenant);
        graph.last_job = Some(Uuid::new_v4());

        store.commit(&tenant, &graph, &change_set(tenant)).await.unwrap();

        assert_eq!(store.load(&tenant).await.unwrap(), graph);
        assert_eq!(store.change_sets(&tenant).await.len(), 1);
    }

    #[tokio::test]
    async fn offline_store_fails_without_writing() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        store.set_offline(true);

        assert!(matches!(store.load(&tenant).await, Err(StoreError::Unavailable(_))));
        let result = store
            .commit(&tenant, &TopologyGraph::new(tenant), &change_set(tenant))
            .await;
        assert!(result.is_err());

        store.set_offline(false);
        assert!(store.change_sets(&tenant).await.is_empty());
    }
}
