//! The data-access seam between the engine and whatever holds the graph.

use async_trait::async_trait;
use netloom_core::{ChangeSet, TenantId, TopologyGraph};

/// Errors from graph store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Stored graph for tenant {tenant_id} is corrupt: {reason}")]
    Corrupt { tenant_id: TenantId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Load/save access to a tenant's topology graph.
///
/// `commit` must be all-or-nothing: either both the graph and the change set
/// are persisted, or neither is visible to the next `load`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Load the tenant's graph. A tenant with no stored graph loads as empty.
    async fn load(&self, tenant_id: &TenantId) -> Result<TopologyGraph, StoreError>;

    /// Persist the merged graph and the change set that produced it.
    async fn commit(
        &self,
        tenant_id: &TenantId,
        graph: &TopologyGraph,
        changes: &ChangeSet,
    ) -> Result<(), StoreError>;
}
