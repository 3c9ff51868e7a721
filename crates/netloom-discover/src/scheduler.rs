//! Scan scheduling.
//!
//! Spawns one tokio task per enabled scan configuration. Each task turns its
//! configuration into a job every `interval_secs` and puts it on the queue.

use std::time::Duration;

use netloom_core::{JobOrigin, TenantId};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoverConfig, ScanConfig};
use crate::error::{DiscoverError, Result};
use crate::queue::JobSubmitter;

/// Submits scheduled jobs for every enabled scan configuration.
pub struct ScanScheduler {
    config: DiscoverConfig,
    tenant_id: TenantId,
    submitter: JobSubmitter,
}

impl ScanScheduler {
    pub fn new(config: DiscoverConfig, tenant_id: TenantId, submitter: JobSubmitter) -> Self {
        Self {
            config,
            tenant_id,
            submitter,
        }
    }

    /// Run until `cancel` fires or every loop has stopped.
    ///
    /// Configurations that cannot produce a job are rejected up front.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut loops = JoinSet::new();

        for scan in &self.config.scans {
            if !scan.enabled {
                tracing::info!(config_id = %scan.id, "Scan config disabled, skipping");
                continue;
            }
            if scan.interval_secs == 0 {
                return Err(DiscoverError::ConfigInvalid(format!(
                    "scan config {}: interval_secs must be positive",
                    scan.id
                )));
            }
            scan.to_job(self.tenant_id, JobOrigin::Scheduled)?;

            loops.spawn(run_config_loop(
                scan.clone(),
                self.tenant_id,
                self.submitter.clone(),
                cancel.child_token(),
            ));
        }

        tracing::info!(config_count = loops.len(), "Scheduler started");

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Scan config task panicked");
            }
        }
        Ok(())
    }
}

/// Per-configuration submit loop. The first job goes out immediately.
async fn run_config_loop(
    scan: ScanConfig,
    tenant_id: TenantId,
    submitter: JobSubmitter,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(scan.interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let job = match scan.to_job(tenant_id, JobOrigin::Scheduled) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(config_id = %scan.id, error = %e, "Scheduled job invalid");
                continue;
            }
        };
        tracing::info!(
            config_id = %scan.id,
            name = %scan.display_name(),
            job_id = %job.id,
            "Scheduled scan triggered"
        );

        let submitted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = submitter.submit(job) => r,
        };
        if let Err(e) = submitted {
            tracing::warn!(config_id = %scan.id, error = %e, "Job queue closed, stopping schedule");
            break;
        }
    }
    tracing::debug!(config_id = %scan.id, "Schedule stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{self, JobSource};

    fn config(toml: &str) -> DiscoverConfig {
        DiscoverConfig::from_toml(toml).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_configs_submit_on_their_interval() {
        let cfg = config(
            r#"
            [discover]
            [[discover.scans]]
            id = "lan"
            targets = ["192.168.1.0/24"]
            interval_secs = 60

            [[discover.scans]]
            id = "lab"
            targets = ["10.9.0.0/24"]
            enabled = false
            "#,
        );
        let tenant_id = TenantId::new();
        let (submitter, jobs) = queue::channel(16);
        let scheduler = ScanScheduler::new(cfg, tenant_id, submitter);
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        // Immediate tick, then one per minute.
        let first = jobs.next_job().await.unwrap();
        assert_eq!(first.config_id.as_deref(), Some("lan"));
        assert_eq!(first.origin, JobOrigin::Scheduled);
        assert_eq!(first.tenant_id, tenant_id);

        tokio::time::advance(Duration::from_secs(60)).await;
        let second = jobs.next_job().await.unwrap();
        assert_eq!(second.config_id.as_deref(), Some("lan"));
        assert_ne!(second.id, first.id);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_targets_are_rejected_before_starting() {
        let cfg = config(
            r#"
            [discover]
            [[discover.scans]]
            id = "broken"
            targets = ["not-an-address"]
            "#,
        );
        let (submitter, _jobs) = queue::channel(1);
        let scheduler = ScanScheduler::new(cfg, TenantId::new(), submitter);

        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DiscoverError::ConfigInvalid(_)));
    }
}
