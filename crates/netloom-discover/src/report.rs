//! Downstream reporting of finished jobs.
//!
//! The runner hands every committed change set to a [`ChangeReporter`]. A
//! reporter failure is logged and surfaced as a warning; it never fails
//! the job.

use std::sync::Arc;

use async_trait::async_trait;
use netloom_core::{ChangeSet, JobOrigin, JobStatus, TenantId};
use netloom_journal::{JournalError, JournalSession, JournalStore};
use serde::Serialize;
use uuid::Uuid;

use crate::merge::{Migration, Transition};
use crate::orchestrator::ProtocolReport;
use crate::resolve::IpConflict;

/// Job context that travels with a change set.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub config_id: Option<String>,
    pub origin: JobOrigin,
    /// Rendered target set.
    pub targets: String,
    pub status: JobStatus,
    pub warnings: Vec<String>,
    pub protocols: Vec<ProtocolReport>,
    pub total_observations: usize,
    pub conflicts: Vec<IpConflict>,
    pub migrations: Vec<Migration>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Report failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait ChangeReporter: Send + Sync {
    async fn report(&self, changes: &ChangeSet, meta: &ReportMeta) -> Result<(), ReportError>;
}

/// Structured log summary of each job.
#[derive(Debug, Default)]
pub struct LogReporter;

#[async_trait]
impl ChangeReporter for LogReporter {
    async fn report(&self, changes: &ChangeSet, meta: &ReportMeta) -> Result<(), ReportError> {
        let summary = changes.summary();
        tracing::info!(
            job_id = %meta.job_id,
            tenant_id = %meta.tenant_id,
            config_id = meta.config_id.as_deref().unwrap_or(""),
            status = %meta.status,
            targets = %meta.targets,
            observations = meta.total_observations,
            devices_added = summary.devices_added,
            devices_removed = summary.devices_removed,
            devices_modified = summary.devices_modified,
            interfaces_added = summary.interfaces_added,
            interfaces_removed = summary.interfaces_removed,
            links_added = summary.links_added,
            links_removed = summary.links_removed,
            migrations = meta.migrations.len(),
            warnings = meta.warnings.len(),
            "Topology changes"
        );
        for warning in &meta.warnings {
            tracing::warn!(job_id = %meta.job_id, warning = %warning, "Job warning");
        }
        Ok(())
    }
}

/// Writes a sealed job record to the journal.
pub struct JournalReporter {
    journal: Arc<dyn JournalStore>,
}

impl JournalReporter {
    pub fn new(journal: Arc<dyn JournalStore>) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl ChangeReporter for JournalReporter {
    async fn report(&self, changes: &ChangeSet, meta: &ReportMeta) -> Result<(), ReportError> {
        let mut session = JournalSession::new(meta.tenant_id, meta.job_id, meta.origin, &meta.targets);
        session.set_config_id(meta.config_id.clone());

        for report in &meta.protocols {
            session.record_protocol(
                report.protocol,
                report.outcome.label(),
                report.observations,
                report.outcome.reason(),
            );
        }
        session.add_step(
            "scan",
            "Ran protocol scanners",
            serde_json::json!({
                "observations": meta.total_observations,
                "protocols": meta.protocols,
            }),
            meta.protocols.iter().any(|p| p.outcome.ran()),
        );
        session.add_step(
            "merge",
            "Merged snapshot into topology graph",
            serde_json::json!({
                "conflicts": meta.conflicts,
                "migrations": meta.migrations,
                "transitions": meta.transitions,
            }),
            true,
        );
        session.add_step(
            "diff",
            "Computed change set",
            serde_json::to_value(changes.summary()).map_err(JournalError::from)?,
            true,
        );
        for warning in &meta.warnings {
            session.add_warning(warning);
        }
        session.set_changes(changes.clone());

        let record = session.finalize(meta.status)?;
        let journal = Arc::clone(&self.journal);
        let record_id = record.id;
        tokio::task::spawn_blocking(move || journal.save(&record))
            .await
            .map_err(|e| ReportError::Failed(format!("journal writer task failed: {e}")))??;

        tracing::debug!(job_id = %meta.job_id, record_id = %record_id, "Job recorded in journal");
        Ok(())
    }
}

/// Sends every report to each inner reporter; the first error wins.
#[derive(Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn ChangeReporter>>,
}

impl FanoutReporter {
    pub fn new(reporters: Vec<Arc<dyn ChangeReporter>>) -> Self {
        Self { reporters }
    }
}

#[async_trait]
impl ChangeReporter for FanoutReporter {
    async fn report(&self, changes: &ChangeSet, meta: &ReportMeta) -> Result<(), ReportError> {
        let mut first_error = None;
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(changes, meta).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use chrono::Utc;
    use netloom_core::{JobMetadata, Protocol};
    use netloom_journal::{FileJournal, JournalQuery};

    use crate::orchestrator::ProtocolOutcome;
    use crate::scanner::ScanStats;

    fn sample() -> (ChangeSet, ReportMeta) {
        let tenant_id = TenantId::new();
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let changes = ChangeSet::empty(JobMetadata {
            job_id,
            tenant_id,
            origin: JobOrigin::Scheduled,
            config_id: Some("lan".into()),
            started_at: now,
            finished_at: now,
            protocols: BTreeSet::from([Protocol::Arp, Protocol::Mdns]),
            total_observations: 4,
            partial: true,
        });
        let meta = ReportMeta {
            job_id,
            tenant_id,
            config_id: Some("lan".into()),
            origin: JobOrigin::Scheduled,
            targets: "192.168.1.0/24".into(),
            status: JobStatus::Partial,
            warnings: vec!["PrivilegeDenied: mDNS".into()],
            protocols: vec![
                ProtocolReport {
                    protocol: Protocol::Arp,
                    outcome: ProtocolOutcome::Completed,
                    observations: 4,
                    stats: ScanStats::default(),
                },
                ProtocolReport {
                    protocol: Protocol::Mdns,
                    outcome: ProtocolOutcome::PrivilegeDenied("socket".into()),
                    observations: 0,
                    stats: ScanStats::default(),
                },
            ],
            total_observations: 4,
            conflicts: vec![],
            migrations: vec![],
            transitions: vec![],
        };
        (changes, meta)
    }

    struct Broken;

    #[async_trait]
    impl ChangeReporter for Broken {
        async fn report(&self, _: &ChangeSet, _: &ReportMeta) -> Result<(), ReportError> {
            Err(ReportError::Failed("downstream offline".into()))
        }
    }

    #[tokio::test]
    async fn journal_reporter_writes_sealed_record() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(FileJournal::new(dir.path()).unwrap());
        let reporter = JournalReporter::new(journal.clone());
        let (changes, meta) = sample();

        reporter.report(&changes, &meta).await.unwrap();

        let records = journal
            .list(&JournalQuery {
                job_id: Some(meta.job_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.verify_integrity());
        assert_eq!(record.status, Some(JobStatus::Partial));
        assert_eq!(record.protocols.len(), 2);
        assert_eq!(record.protocols[1].outcome, "skipped");
        assert_eq!(record.warnings, vec!["PrivilegeDenied: mDNS".to_string()]);
        assert_eq!(record.steps.len(), 3);
    }

    #[tokio::test]
    async fn fanout_reports_everywhere_and_returns_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(FileJournal::new(dir.path()).unwrap());
        let fanout = FanoutReporter::new(vec![
            Arc::new(Broken),
            Arc::new(LogReporter),
            Arc::new(JournalReporter::new(journal.clone())),
        ]);
        let (changes, meta) = sample();

        let err = fanout.report(&changes, &meta).await.unwrap_err();
        assert!(err.to_string().contains("downstream offline"));
        // The journal still got its record.
        assert_eq!(journal.list(&JournalQuery::default()).unwrap().len(), 1);
    }
}
