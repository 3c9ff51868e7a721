//! Write side of the Neo4j store.
//!
//! A commit replaces the tenant's devices, interfaces and links and appends
//! the change set, all inside one transaction. Nothing is visible to the next
//! load unless the transaction commits.

use neo4rs::{query, Query};
use netloom_core::{ChangeSet, Device, Link, TenantId, TopologyGraph};

use crate::client::GraphClient;
use crate::store::StoreError;

impl GraphClient {
    pub async fn commit_topology(
        &self,
        tenant_id: &TenantId,
        graph: &TopologyGraph,
        changes: &ChangeSet,
    ) -> Result<(), StoreError> {
        let tid = tenant_id.0.to_string();
        let mut queries = vec![clear_topology(&tid)];

        for device in graph.devices.values() {
            queries.push(create_device(&tid, device)?);
        }
        for link in graph.links.values() {
            queries.push(create_link(&tid, link)?);
        }

        queries.push(
            query(
                "CREATE (:ChangeSet {tenant_id: $tenant_id, job_id: $job_id,
                                     finished_at: $finished_at, doc: $doc})",
            )
            .param("tenant_id", tid.clone())
            .param("job_id", changes.meta.job_id.to_string())
            .param("finished_at", changes.meta.finished_at.to_rfc3339())
            .param("doc", serde_json::to_string(changes)?),
        );
        queries.push(
            query("MERGE (t:Topology {tenant_id: $tenant_id}) SET t.last_job = $last_job")
                .param("tenant_id", tid)
                .param("last_job", opt_string(&graph.last_job.map(|j| j.to_string()))),
        );

        let statements = queries.len();
        let mut txn = self.start_txn().await?;
        txn.run_queries(queries).await?;
        txn.commit().await?;

        tracing::debug!(
            tenant_id = %tenant_id,
            job_id = %changes.meta.job_id,
            statements,
            "Topology committed to Neo4j"
        );
        Ok(())
    }
}

fn clear_topology(tid: &str) -> Query {
    query(
        "MATCH (n {tenant_id: $tenant_id})
         WHERE n:Device OR n:Interface OR n:Link
         DETACH DELETE n",
    )
    .param("tenant_id", tid.to_string())
}

fn create_device(tid: &str, device: &Device) -> Result<Query, StoreError> {
    let ips: Vec<String> = device.interfaces.keys().map(|ip| ip.to_string()).collect();
    Ok(query(
        "CREATE (d:Device {tenant_id: $tenant_id, id: $id, key: $key, mac: $mac,
                           vendor: $vendor, hostname: $hostname, status: $status,
                           last_seen: $last_seen, doc: $doc})
         WITH d
         UNWIND $ips AS ip
         CREATE (d)-[:HAS_INTERFACE]->(:Interface {tenant_id: $tenant_id, device_id: $id, ip: ip})",
    )
    .param("tenant_id", tid.to_string())
    .param("id", device.id.to_string())
    .param("key", device.key.to_string())
    .param("mac", opt_string(&device.mac.map(|m| m.to_string())))
    .param("vendor", opt_string(&device.vendor))
    .param("hostname", opt_string(&device.hostname))
    .param("status", device.status.to_string())
    .param("last_seen", device.last_seen.to_rfc3339())
    .param("ips", ips)
    .param("doc", serde_json::to_string(device)?))
}

/// Links are stored as nodes so that endpoints outside the interface set
/// survive a round trip; a `LINKED_TO` edge is added when both ends exist.
fn create_link(tid: &str, link: &Link) -> Result<Query, StoreError> {
    Ok(query(
        "CREATE (l:Link {tenant_id: $tenant_id, a_device: $a_device, a_ip: $a_ip,
                         b_device: $b_device, b_ip: $b_ip, doc: $doc})
         WITH l
         OPTIONAL MATCH (a:Interface {tenant_id: $tenant_id, device_id: $a_device, ip: $a_ip})
         OPTIONAL MATCH (b:Interface {tenant_id: $tenant_id, device_id: $b_device, ip: $b_ip})
         FOREACH (_ IN CASE WHEN a IS NULL OR b IS NULL THEN [] ELSE [1] END |
           CREATE (a)-[:LINKED_TO {confidence: $confidence}]->(b))",
    )
    .param("tenant_id", tid.to_string())
    .param("a_device", link.key.a.device_id.to_string())
    .param("a_ip", link.key.a.ip.to_string())
    .param("b_device", link.key.b.device_id.to_string())
    .param("b_ip", link.key.b.ip.to_string())
    .param("confidence", link.confidence)
    .param("doc", serde_json::to_string(link)?))
}

fn opt_string(opt: &Option<String>) -> String {
    opt.clone().unwrap_or_default()
}
