//! netloom-journal: tamper-evident record of every scan job.
//!
//! A job record captures what a job was asked to do, which protocols ran
//! or were skipped and why, each pipeline step, the warnings raised, and the
//! resulting change set. Records are content-hashed with BLAKE3 and stored
//! as JSON files partitioned by date.

pub mod hash;
pub mod session;
pub mod store;

use chrono::{DateTime, Utc};
use netloom_core::{ChangeSet, JobOrigin, JobStatus, Protocol, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use session::JournalSession;
pub use store::{FileJournal, JournalError, JournalQuery, JournalStore};

// ── Core Types ───────────────────────────────────────────────────

/// Unique identifier for a journal record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a protocol took part in the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolDecision {
    pub protocol: Protocol,
    /// `ran`, `skipped`, `timed_out`, or `failed`.
    pub outcome: String,
    pub observations: usize,
    pub reason: Option<String>,
}

/// One pipeline step (scan, merge, diff, commit).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub step: String,
    pub description: String,
    /// Structured parameters/details.
    pub details: serde_json::Value,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// The complete audit trail of a single scan job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: RecordId,
    pub tenant_id: TenantId,
    pub job_id: Uuid,
    pub config_id: Option<String>,
    pub origin: JobOrigin,
    /// Rendered target set, e.g. `192.168.1.0/24,10.0.0.5`.
    pub targets: String,
    /// Set on finalization.
    pub status: Option<JobStatus>,
    pub protocols: Vec<ProtocolDecision>,
    pub steps: Vec<Step>,
    pub warnings: Vec<String>,
    pub changes: Option<ChangeSet>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// BLAKE3 content hash (hex), set on finalization.
    pub content_hash: Option<String>,
}

impl JobRecord {
    /// Compute the BLAKE3 hash of the record's content.
    /// The hash covers all fields except `content_hash` itself.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        hash::compute_record_hash(self)
    }

    /// Verify that the stored content_hash matches a freshly computed hash.
    pub fn verify_integrity(&self) -> bool {
        match (&self.content_hash, self.compute_hash()) {
            (Some(stored), Ok(computed)) => stored == &computed,
            _ => false,
        }
    }
}
