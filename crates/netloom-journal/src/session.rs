//! Builder-style recorder for job records.
//!
//! A session is filled in from a finished job's report, then sealed:
//!
//! ```no_run
//! # use netloom_journal::JournalSession;
//! # use netloom_core::{JobOrigin, JobStatus, Protocol, TenantId};
//! # use uuid::Uuid;
//! let mut session = JournalSession::new(TenantId::new(), Uuid::new_v4(), JobOrigin::AdHoc, "192.168.1.0/24");
//! session.record_protocol(Protocol::Arp, "ran", 12, None);
//! session.record_protocol(Protocol::Mdns, "skipped", 0, Some("PrivilegeDenied"));
//! session.add_step("merge", "Merged snapshot", serde_json::json!({"devices": 12}), true);
//! let record = session.finalize(JobStatus::Partial).unwrap();
//! assert!(record.content_hash.is_some());
//! ```

use chrono::Utc;
use netloom_core::{ChangeSet, JobOrigin, JobStatus, Protocol, TenantId};
use uuid::Uuid;

use crate::store::JournalError;
use crate::{JobRecord, ProtocolDecision, RecordId, Step};

/// Records a job incrementally and seals it on finalization.
pub struct JournalSession {
    record: JobRecord,
}

impl JournalSession {
    pub fn new(tenant_id: TenantId, job_id: Uuid, origin: JobOrigin, targets: &str) -> Self {
        Self {
            record: JobRecord {
                id: RecordId::new(),
                tenant_id,
                job_id,
                config_id: None,
                origin,
                targets: targets.to_string(),
                status: None,
                protocols: Vec::new(),
                steps: Vec::new(),
                warnings: Vec::new(),
                changes: None,
                started_at: Utc::now(),
                completed_at: None,
                content_hash: None,
            },
        }
    }

    pub fn set_config_id(&mut self, config_id: Option<String>) {
        self.record.config_id = config_id;
    }

    pub fn record_protocol(
        &mut self,
        protocol: Protocol,
        outcome: &str,
        observations: usize,
        reason: Option<&str>,
    ) {
        self.record.protocols.push(ProtocolDecision {
            protocol,
            outcome: outcome.to_string(),
            observations,
            reason: reason.map(String::from),
        });
    }

    pub fn add_step(
        &mut self,
        step: &str,
        description: &str,
        details: serde_json::Value,
        success: bool,
    ) {
        self.record.steps.push(Step {
            step: step.to_string(),
            description: description.to_string(),
            details,
            success,
            timestamp: Utc::now(),
        });
    }

    pub fn add_warning(&mut self, warning: &str) {
        self.record.warnings.push(warning.to_string());
    }

    pub fn set_changes(&mut self, changes: ChangeSet) {
        self.record.changes = Some(changes);
    }

    pub fn id(&self) -> RecordId {
        self.record.id
    }

    /// Seal the record: set status and completion time, then hash.
    pub fn finalize(mut self, status: JobStatus) -> Result<JobRecord, JournalError> {
        self.record.status = Some(status);
        self.record.completed_at = Some(Utc::now());
        let hash = self.record.compute_hash()?;
        self.record.content_hash = Some(hash);
        Ok(self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_record_verifies() {
        let mut session =
            JournalSession::new(TenantId::new(), Uuid::new_v4(), JobOrigin::Scheduled, "10.0.0.0/24");
        session.record_protocol(Protocol::Icmp, "ran", 3, None);
        session.add_warning("ProtocolTimeout: ICMP");
        let record = session.finalize(JobStatus::Partial).unwrap();

        assert_eq!(record.status, Some(JobStatus::Partial));
        assert!(record.completed_at.is_some());
        assert!(record.verify_integrity());
    }

    #[test]
    fn tampering_breaks_integrity() {
        let session =
            JournalSession::new(TenantId::new(), Uuid::new_v4(), JobOrigin::AdHoc, "10.0.0.1");
        let mut record = session.finalize(JobStatus::Success).unwrap();
        record.warnings.push("injected".into());
        assert!(!record.verify_integrity());
    }
}
