//! Completion events sent back to the job source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changes::ChangeSummary;
use crate::job::{JobReport, JobStatus};
use crate::types::TenantId;

/// Acknowledgement of a finished job: `{job_id, status, warnings}` plus
/// enough context for the trigger source to decide on a retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobAck {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub config_id: Option<String>,
    pub status: JobStatus,
    pub warnings: Vec<String>,
    pub summary: Option<ChangeSummary>,
    pub finished_at: DateTime<Utc>,
}

impl JobAck {
    pub fn from_report(report: &JobReport, tenant_id: TenantId, config_id: Option<String>) -> Self {
        Self {
            job_id: report.job_id,
            tenant_id,
            config_id,
            status: report.status,
            warnings: report.warnings.clone(),
            summary: report.change_set.as_ref().map(|cs| cs.summary()),
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_from_failed_report() {
        let report = JobReport::failed(Uuid::new_v4(), "StoreUnavailable: connection refused");
        let ack = JobAck::from_report(&report, TenantId::new(), Some("lan".into()));

        assert_eq!(ack.status, JobStatus::Failed);
        assert_eq!(ack.warnings.len(), 1);
        assert!(ack.summary.is_none());

        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
    }
}
