//! The job runner: one scan job from validation to acknowledgement.
//!
//! validate → lock tenant → load graph → scan → assemble → merge → diff →
//! commit → report. Store and validation failures fail the job; protocol
//! trouble only degrades it to `Partial`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use netloom_core::{JobAck, JobMetadata, JobReport, JobStatus, ScanJob, TenantId};
use netloom_graph::{GraphStore, StoreError};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{DiscoverConfig, Limits, MergePolicy};
use crate::diff;
use crate::error::DiscoverError;
use crate::merge::{self, MergeScope};
use crate::orchestrator::{Orchestrator, ProtocolOutcome, ProtocolReport};
use crate::queue::JobSource;
use crate::report::{ChangeReporter, ReportMeta};
use crate::resolve;
use crate::scanner::{ScanError, ScannerRegistry};

pub struct JobRunner {
    store: Arc<dyn GraphStore>,
    reporter: Arc<dyn ChangeReporter>,
    orchestrator: Orchestrator,
    policy: MergePolicy,
    limits: Limits,
    store_timeout: Duration,
    locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn GraphStore>,
        reporter: Arc<dyn ChangeReporter>,
        orchestrator: Orchestrator,
        policy: MergePolicy,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            reporter,
            orchestrator,
            policy,
            limits,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Bound each store load and commit. Expiry fails the job.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// A runner wired from configuration.
    pub fn from_config(
        config: &DiscoverConfig,
        registry: Arc<ScannerRegistry>,
        store: Arc<dyn GraphStore>,
        reporter: Arc<dyn ChangeReporter>,
    ) -> Self {
        let orchestrator = Orchestrator::new(registry, config.retry.clone(), config.probe_timeout());
        Self::new(
            store,
            reporter,
            orchestrator,
            config.policy.clone(),
            config.limits.clone(),
        )
        .with_store_timeout(config.store.timeout())
    }

    pub async fn run(&self, job: &ScanJob) -> JobReport {
        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            targets = %job.targets,
            protocols = ?job.protocols,
            origin = ?job.origin,
            "Job started"
        );

        if let Err(e) = job.validate(u128::from(self.limits.max_hosts_per_job)) {
            return self.fail(job, DiscoverError::from(e));
        }

        let lock = self.tenant_lock(&job.tenant_id);
        let _guard = lock.lock().await;

        let prior = match self.bounded(self.store.load(&job.tenant_id)).await {
            Ok(graph) => graph,
            Err(e) => return self.fail(job, DiscoverError::StoreUnavailable(e)),
        };

        let scan = self.orchestrator.run(job, start + job.deadline).await;
        let mut observations = scan.observations;
        for observation in &mut observations {
            observation.confidence = self.policy.confidence.weight(observation.protocol);
        }

        let mut warnings = protocol_warnings(&scan.reports);
        if scan.deadline_exceeded {
            warnings.push(DiscoverError::JobDeadlineExceeded.to_string());
        }
        let any_ran = scan.reports.iter().any(|r| r.outcome.ran());
        let complete = !scan.deadline_exceeded
            && scan.reports.iter().all(|r| r.outcome == ProtocolOutcome::Completed);
        let status = if warnings.is_empty() {
            JobStatus::Success
        } else {
            JobStatus::Partial
        };

        let snapshot = resolve::assemble(&observations);
        let scope = MergeScope {
            targets: &job.targets,
            complete,
            gateway: job.gateway,
        };
        let mut merged = if any_ran {
            merge::merge(&prior, &snapshot, &scope, &self.policy, Utc::now())
        } else {
            // Nothing probed the network; keep the graph as it was.
            merge::MergeOutcome {
                graph: prior.clone(),
                migrations: Vec::new(),
                seen: Default::default(),
                transitions: Vec::new(),
            }
        };
        merged.graph.last_job = Some(job.id);

        let meta = JobMetadata {
            job_id: job.id,
            tenant_id: job.tenant_id,
            origin: job.origin,
            config_id: job.config_id.clone(),
            started_at,
            finished_at: Utc::now(),
            protocols: job.protocols.clone(),
            total_observations: observations.len(),
            partial: status == JobStatus::Partial,
        };
        let change_set = diff::compute(&prior, &merged.graph, meta);

        if let Err(e) = self
            .bounded(self.store.commit(&job.tenant_id, &merged.graph, &change_set))
            .await
        {
            return self.fail(job, DiscoverError::StoreUnavailable(e));
        }

        let report_meta = ReportMeta {
            job_id: job.id,
            tenant_id: job.tenant_id,
            config_id: job.config_id.clone(),
            origin: job.origin,
            targets: job.targets.to_string(),
            status,
            warnings: warnings.clone(),
            protocols: scan.reports,
            total_observations: observations.len(),
            conflicts: snapshot.conflicts,
            migrations: merged.migrations,
            transitions: merged.transitions,
        };
        if let Err(e) = self.reporter.report(&change_set, &report_meta).await {
            tracing::warn!(job_id = %job.id, error = %e, "Reporting failed");
            warnings.push(format!("ReportFailed: {e}"));
        }

        let summary = change_set.summary();
        tracing::info!(
            job_id = %job.id,
            status = %status,
            observations = observations.len(),
            devices_added = summary.devices_added,
            devices_modified = summary.devices_modified,
            devices_removed = summary.devices_removed,
            warnings = warnings.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Job finished"
        );

        JobReport {
            job_id: job.id,
            status,
            warnings,
            change_set: Some(change_set),
        }
    }

    /// Run jobs from `source` one at a time until it runs dry.
    pub async fn serve(&self, source: &dyn JobSource) {
        while let Some(job) = source.next_job().await {
            let report = self.run(&job).await;
            let ack = JobAck::from_report(&report, job.tenant_id, job.config_id.clone());
            source.acknowledge(ack).await;
        }
        tracing::info!("Job source closed, runner stopping");
    }

    /// A store call that gives up after `store_timeout`.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "no response within {}s",
                self.store_timeout.as_secs_f64()
            ))),
        }
    }

    fn fail(&self, job: &ScanJob, error: DiscoverError) -> JobReport {
        tracing::warn!(job_id = %job.id, error = %error, "Job failed");
        JobReport::failed(job.id, error.to_string())
    }

    fn tenant_lock(&self, tenant_id: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(*tenant_id).or_default())
    }
}

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// One warning per protocol that did not complete cleanly.
fn protocol_warnings(reports: &[ProtocolReport]) -> Vec<String> {
    reports
        .iter()
        .filter_map(|r| match &r.outcome {
            ProtocolOutcome::Completed => None,
            ProtocolOutcome::TimedOut => Some(ScanError::ProtocolTimeout(r.protocol).to_string()),
            ProtocolOutcome::PrivilegeDenied(_) => Some(format!("PrivilegeDenied: {}", r.protocol)),
            ProtocolOutcome::Unavailable(reason) => {
                Some(format!("ProtocolUnavailable: {} ({reason})", r.protocol))
            }
            ProtocolOutcome::Failed(reason) => {
                Some(format!("ProtocolFailed: {} ({reason})", r.protocol))
            }
        })
        .collect()
}
