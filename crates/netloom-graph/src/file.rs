//! JSON file store.
//!
//! ```text
//! {root}/
//!   {tenant_id}/
//!     graph.json
//!     changes/
//!       2026/
//!         10/
//!           16/
//!             {job_id}.json
//! ```
//!
//! The change set is written first; the graph becomes visible through an
//! atomic rename of `graph.json.tmp`, which is the commit point.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use netloom_core::{ChangeSet, TenantId, TopologyGraph};
use tokio::fs;

use crate::store::{GraphStore, StoreError};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenant_dir(&self, tenant_id: &TenantId) -> PathBuf {
        self.root.join(tenant_id.0.to_string())
    }

    fn graph_path(&self, tenant_id: &TenantId) -> PathBuf {
        self.tenant_dir(tenant_id).join("graph.json")
    }

    fn change_path(&self, tenant_id: &TenantId, changes: &ChangeSet) -> PathBuf {
        let date = changes.meta.finished_at.format("%Y/%m/%d");
        self.tenant_dir(tenant_id)
            .join("changes")
            .join(format!("{date}/{}.json", changes.meta.job_id))
    }

    /// All change sets committed for a tenant, oldest first.
    pub async fn change_sets(&self, tenant_id: &TenantId) -> Result<Vec<ChangeSet>, StoreError> {
        let mut found = Vec::new();
        let mut pending = vec![self.tenant_dir(tenant_id).join("changes")];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let bytes = fs::read(&path).await?;
                    found.push(serde_json::from_slice::<ChangeSet>(&bytes)?);
                }
            }
        }

        found.sort_by(|a, b| a.meta.finished_at.cmp(&b.meta.finished_at));
        Ok(found)
    }
}

#[async_trait]
impl GraphStore for FileStore {
    async fn load(&self, tenant_id: &TenantId) -> Result<TopologyGraph, StoreError> {
        let path = self.graph_path(tenant_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(tenant_id = %tenant_id, "No stored graph, starting empty");
                return Ok(TopologyGraph::new(*tenant_id));
            }
            Err(e) => return Err(StoreError::Unavailable(format!("{}: {e}", path.display()))),
        };

        let graph: TopologyGraph =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                tenant_id: *tenant_id,
                reason: e.to_string(),
            })?;
        if graph.tenant_id != *tenant_id {
            return Err(StoreError::Corrupt {
                tenant_id: *tenant_id,
                reason: format!("graph file belongs to tenant {}", graph.tenant_id),
            });
        }
        Ok(graph)
    }

    async fn commit(
        &self,
        tenant_id: &TenantId,
        graph: &TopologyGraph,
        changes: &ChangeSet,
    ) -> Result<(), StoreError> {
        let change_path = self.change_path(tenant_id, changes);
        if let Some(parent) = change_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&change_path, serde_json::to_vec_pretty(changes)?).await?;

        let graph_path = self.graph_path(tenant_id);
        let tmp_path = graph_path.with_extension("json.tmp");
        let written = async {
            fs::write(&tmp_path, serde_json::to_vec_pretty(graph)?).await?;
            fs::rename(&tmp_path, &graph_path).await?;
            Ok::<(), StoreError>(())
        }
        .await;

        if let Err(e) = written {
            // The graph never became visible; drop the orphaned change set too.
            let _ = fs::remove_file(&change_path).await;
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tracing::debug!(
            tenant_id = %tenant_id,
            job_id = %changes.meta.job_id,
            devices = graph.devices.len(),
            "Graph committed"
        );
        Ok(())
    }
}
