//! BLAKE3 content hashing for tamper evidence.
//!
//! Computes a deterministic hash of all record fields (excluding the
//! content_hash itself) so that any modification is detectable.

use serde::Serialize;

use crate::JobRecord;

/// Hashable representation of a JobRecord (excludes content_hash).
#[derive(Serialize)]
struct HashableRecord<'a> {
    id: &'a crate::RecordId,
    tenant_id: &'a netloom_core::TenantId,
    job_id: &'a uuid::Uuid,
    config_id: &'a Option<String>,
    origin: &'a netloom_core::JobOrigin,
    targets: &'a str,
    status: &'a Option<netloom_core::JobStatus>,
    protocols: &'a [crate::ProtocolDecision],
    steps: &'a [crate::Step],
    warnings: &'a [String],
    changes: &'a Option<netloom_core::ChangeSet>,
    started_at: &'a chrono::DateTime<chrono::Utc>,
    completed_at: &'a Option<chrono::DateTime<chrono::Utc>>,
}

/// Compute the BLAKE3 hash of a record's content.
///
/// Serializes all fields except `content_hash` to JSON, then hashes the
/// bytes with BLAKE3. Returns the hex-encoded hash.
pub fn compute_record_hash(record: &JobRecord) -> Result<String, serde_json::Error> {
    let hashable = HashableRecord {
        id: &record.id,
        tenant_id: &record.tenant_id,
        job_id: &record.job_id,
        config_id: &record.config_id,
        origin: &record.origin,
        targets: &record.targets,
        status: &record.status,
        protocols: &record.protocols,
        steps: &record.steps,
        warnings: &record.warnings,
        changes: &record.changes,
        started_at: &record.started_at,
        completed_at: &record.completed_at,
    };

    let json = serde_json::to_vec(&hashable)?;
    Ok(blake3::hash(&json).to_hex().to_string())
}
