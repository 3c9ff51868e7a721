//! Read side of the Neo4j store.
//!
//! Devices and links are stored with their full JSON document in a `doc`
//! property; the other node properties exist for ad-hoc Cypher browsing.

use std::collections::BTreeMap;

use neo4rs::query;
use netloom_core::{ChangeSet, Device, Link, TenantId, TopologyGraph};
use uuid::Uuid;

use crate::client::GraphClient;
use crate::store::StoreError;

impl GraphClient {
    /// Rebuild a tenant's topology graph from its stored documents.
    pub async fn load_topology(&self, tenant_id: &TenantId) -> Result<TopologyGraph, StoreError> {
        let tid = tenant_id.0.to_string();

        let device_rows = self
            .query_rows(
                query("MATCH (d:Device {tenant_id: $tenant_id}) RETURN d.doc AS doc")
                    .param("tenant_id", tid.clone()),
            )
            .await?;
        let mut devices = BTreeMap::new();
        for row in device_rows {
            let device: Device = decode_doc(tenant_id, &row)?;
            devices.insert(device.id, device);
        }

        let link_rows = self
            .query_rows(
                query("MATCH (l:Link {tenant_id: $tenant_id}) RETURN l.doc AS doc")
                    .param("tenant_id", tid.clone()),
            )
            .await?;
        let mut links = BTreeMap::new();
        for row in link_rows {
            let link: Link = decode_doc(tenant_id, &row)?;
            links.insert(link.key, link);
        }

        let last_job = match self
            .query_one(
                query("MATCH (t:Topology {tenant_id: $tenant_id}) RETURN t.last_job AS last_job")
                    .param("tenant_id", tid),
            )
            .await?
        {
            Some(row) => row
                .get::<String>("last_job")
                .ok()
                .and_then(|s| Uuid::parse_str(&s).ok()),
            None => None,
        };

        tracing::debug!(
            tenant_id = %tenant_id,
            devices = devices.len(),
            links = links.len(),
            "Loaded topology from Neo4j"
        );

        Ok(TopologyGraph {
            tenant_id: *tenant_id,
            devices,
            links,
            last_job,
        })
    }

    /// Change sets committed for a tenant, newest first.
    pub async fn recent_change_sets(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<ChangeSet>, StoreError> {
        let rows = self
            .query_rows(
                query(
                    "MATCH (c:ChangeSet {tenant_id: $tenant_id})
                     RETURN c.doc AS doc
                     ORDER BY c.finished_at DESC
                     LIMIT $limit",
                )
                .param("tenant_id", tenant_id.0.to_string())
                .param("limit", limit as i64),
            )
            .await?;

        rows.iter().map(|row| decode_doc(tenant_id, row)).collect()
    }

    /// Count nodes with a given label for a tenant.
    pub async fn count_nodes(&self, tenant_id: &TenantId, label: &str) -> Result<i64, StoreError> {
        let cypher = format!("MATCH (n:{label} {{tenant_id: $tenant_id}}) RETURN count(n) AS cnt");
        let q = query(&cypher).param("tenant_id", tenant_id.0.to_string());

        match self.query_one(q).await? {
            Some(row) => Ok(row.get::<i64>("cnt").unwrap_or(0)),
            None => Ok(0),
        }
    }
}

fn decode_doc<T: serde::de::DeserializeOwned>(
    tenant_id: &TenantId,
    row: &neo4rs::Row,
) -> Result<T, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        tenant_id: *tenant_id,
        reason,
    };
    let doc: String = row
        .get("doc")
        .map_err(|e| corrupt(format!("missing doc property: {e}")))?;
    serde_json::from_str(&doc).map_err(|e| corrupt(e.to_string()))
}
