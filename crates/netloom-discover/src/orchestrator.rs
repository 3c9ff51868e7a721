//! Scan orchestration: run every selected protocol of a job concurrently
//! under one shared rate limiter and collect what they find.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use netloom_core::{Protocol, RawObservation, ScanJob};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::ratelimit::RateLimiter;
use crate::scanner::{ScanContext, ScanError, ScanStats, Scanner, ScannerRegistry};

/// How long a scanner gets past its deadline before it is cancelled, and
/// again after cancellation before it is aborted.
const DEFAULT_GRACE: Duration = Duration::from_millis(500);

const CHANNEL_CAPACITY: usize = 1024;

/// How one protocol's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ProtocolOutcome {
    Completed,
    /// Stopped at its deadline; whatever it sent before is kept.
    TimedOut,
    PrivilegeDenied(String),
    /// Not runnable here (no scanner, no suitable interface).
    Unavailable(String),
    Failed(String),
}

impl ProtocolOutcome {
    /// Short label for the job journal.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "ran",
            Self::TimedOut => "timed_out",
            Self::PrivilegeDenied(_) | Self::Unavailable(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Completed | Self::TimedOut => None,
            Self::PrivilegeDenied(r) | Self::Unavailable(r) | Self::Failed(r) => Some(r),
        }
    }

    /// The protocol actually probed the network.
    pub fn ran(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolReport {
    pub protocol: Protocol,
    pub outcome: ProtocolOutcome,
    pub observations: usize,
    pub stats: ScanStats,
}

/// Everything one job's scan phase produced.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// De-duplicated, in (protocol, ip, mac, observed_at) order.
    pub observations: Vec<RawObservation>,
    /// One per selected protocol, in protocol order.
    pub reports: Vec<ProtocolReport>,
    pub deadline_exceeded: bool,
}

pub struct Orchestrator {
    registry: Arc<ScannerRegistry>,
    retry: RetryPolicy,
    probe_timeout: Duration,
    grace: Duration,
}

struct Running {
    protocol: Protocol,
    handle: JoinHandle<Result<ScanStats, ScanError>>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl Orchestrator {
    pub fn new(registry: Arc<ScannerRegistry>, retry: RetryPolicy, probe_timeout: Duration) -> Self {
        Self {
            registry,
            retry,
            probe_timeout,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Scan `job.targets` with every selected protocol, stopping by `deadline`.
    pub async fn run(&self, job: &ScanJob, deadline: Instant) -> ScanOutcome {
        let limiter = Arc::new(RateLimiter::new(job.rate_limit_pps, job.burst));
        let job_cancel = CancellationToken::new();
        let mut outcomes: BTreeMap<Protocol, (ProtocolOutcome, ScanStats)> = BTreeMap::new();

        let ready = self.preflight(job, deadline, &mut outcomes).await;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let collector = tokio::spawn(collect(rx, stop.clone()));

        let mut running = Vec::with_capacity(ready.len());
        for scanner in ready {
            let protocol = scanner.protocol();
            let cancel = job_cancel.child_token();
            let protocol_deadline = (Instant::now() + job.protocol_timeout).min(deadline);
            let ctx = ScanContext {
                targets: job.targets.clone(),
                limiter: Arc::clone(&limiter),
                deadline: protocol_deadline,
                cancel: cancel.clone(),
                retry: self.retry.clone(),
                probe_timeout: self.probe_timeout,
                concurrency: job.concurrency,
                sink: tx.clone(),
            };
            tracing::info!(job_id = %job.id, protocol = %protocol, "Scanner started");
            running.push(Running {
                protocol,
                handle: tokio::spawn(async move { scanner.scan(ctx).await }),
                cancel,
                deadline: protocol_deadline,
            });
        }
        drop(tx);

        for run in running {
            let protocol = run.protocol;
            let finished = self.finish(run).await;
            outcomes.insert(protocol, finished);
        }
        job_cancel.cancel();

        stop.cancel();
        let collected = match collector.await {
            Ok(observations) => observations,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Observation collector failed");
                Vec::new()
            }
        };
        let observations = normalize(collected);

        let reports = outcomes
            .into_iter()
            .map(|(protocol, (outcome, stats))| ProtocolReport {
                protocol,
                observations: observations.iter().filter(|o| o.protocol == protocol).count(),
                outcome,
                stats,
            })
            .collect();

        ScanOutcome {
            observations,
            reports,
            deadline_exceeded: Instant::now() >= deadline,
        }
    }

    /// Check every selected protocol concurrently. Returns the runnable
    /// scanners; the rest get their outcome recorded.
    async fn preflight(
        &self,
        job: &ScanJob,
        deadline: Instant,
        outcomes: &mut BTreeMap<Protocol, (ProtocolOutcome, ScanStats)>,
    ) -> Vec<Arc<dyn Scanner>> {
        let mut checks = JoinSet::new();
        for &protocol in &job.protocols {
            let Some(scanner) = self.registry.get(protocol) else {
                tracing::warn!(job_id = %job.id, protocol = %protocol, "No scanner registered");
                outcomes.insert(
                    protocol,
                    (
                        ProtocolOutcome::Unavailable("no scanner registered".into()),
                        ScanStats::default(),
                    ),
                );
                continue;
            };
            let targets = job.targets.clone();
            checks.spawn(async move {
                let result = tokio::time::timeout_at(deadline, scanner.preflight(&targets)).await;
                (protocol, scanner, result)
            });
        }

        let mut ready = Vec::new();
        while let Some(joined) = checks.join_next().await {
            let Ok((protocol, scanner, result)) = joined else {
                continue;
            };
            let outcome = match result {
                Ok(Ok(())) => {
                    ready.push(scanner);
                    continue;
                }
                Ok(Err(ScanError::PrivilegeDenied { reason, .. })) => {
                    ProtocolOutcome::PrivilegeDenied(reason)
                }
                Ok(Err(ScanError::NoInterface { reason, .. })) => ProtocolOutcome::Unavailable(reason),
                Ok(Err(e)) => ProtocolOutcome::Failed(e.to_string()),
                Err(_) => ProtocolOutcome::TimedOut,
            };
            tracing::warn!(
                job_id = %job.id,
                protocol = %protocol,
                outcome = outcome.label(),
                reason = outcome.reason().unwrap_or(""),
                "Protocol skipped"
            );
            outcomes.insert(protocol, (outcome, ScanStats::default()));
        }

        for &protocol in &job.protocols {
            if !outcomes.contains_key(&protocol) && !ready.iter().any(|s| s.protocol() == protocol) {
                outcomes.insert(
                    protocol,
                    (
                        ProtocolOutcome::Failed("preflight task failed".into()),
                        ScanStats::default(),
                    ),
                );
            }
        }

        // JoinSet completes in arbitrary order.
        ready.sort_by_key(|s| s.protocol());
        ready
    }

    /// Wait for one scanner, enforcing its deadline.
    async fn finish(&self, mut run: Running) -> (ProtocolOutcome, ScanStats) {
        let joined = match tokio::time::timeout_at(run.deadline + self.grace, &mut run.handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(protocol = %run.protocol, "Scanner overran its deadline, cancelling");
                run.cancel.cancel();
                if tokio::time::timeout(self.grace, &mut run.handle).await.is_err() {
                    run.handle.abort();
                }
                return (ProtocolOutcome::TimedOut, ScanStats::default());
            }
        };

        let (outcome, stats) = match joined {
            Ok(Ok(stats)) if stats.truncated => (ProtocolOutcome::TimedOut, stats),
            Ok(Ok(stats)) => (ProtocolOutcome::Completed, stats),
            Ok(Err(ScanError::ProtocolTimeout(_) | ScanError::RateLimitTimeout)) => {
                (ProtocolOutcome::TimedOut, ScanStats::default())
            }
            Ok(Err(ScanError::PrivilegeDenied { reason, .. })) => {
                (ProtocolOutcome::PrivilegeDenied(reason), ScanStats::default())
            }
            Ok(Err(ScanError::NoInterface { reason, .. })) => {
                (ProtocolOutcome::Unavailable(reason), ScanStats::default())
            }
            Ok(Err(e)) => (ProtocolOutcome::Failed(e.to_string()), ScanStats::default()),
            Err(e) => (ProtocolOutcome::Failed(format!("scanner task failed: {e}")), ScanStats::default()),
        };

        match &outcome {
            ProtocolOutcome::Completed => tracing::info!(
                protocol = %run.protocol,
                probes = stats.probes_sent,
                responses = stats.responses,
                "Scanner finished"
            ),
            other => tracing::warn!(
                protocol = %run.protocol,
                outcome = other.label(),
                reason = other.reason().unwrap_or(""),
                "Scanner degraded"
            ),
        }
        (outcome, stats)
    }
}

/// Drain the channel until every sender is gone or `stop` fires, then take
/// whatever is still buffered.
async fn collect(mut rx: mpsc::Receiver<RawObservation>, stop: CancellationToken) -> Vec<RawObservation> {
    let mut observations = Vec::new();
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(observation) => observations.push(observation),
                None => return observations,
            },
            _ = stop.cancelled() => break,
        }
    }
    rx.close();
    while let Some(observation) = rx.recv().await {
        observations.push(observation);
    }
    observations
}

/// Sort and drop exact duplicates, keeping the earliest of each.
pub fn normalize(mut observations: Vec<RawObservation>) -> Vec<RawObservation> {
    observations.sort_by(|a, b| {
        (a.protocol, a.ip, a.mac, a.observed_at, &a.metadata)
            .cmp(&(b.protocol, b.ip, b.mac, b.observed_at, &b.metadata))
    });
    let mut seen = HashSet::new();
    observations.retain(|o| seen.insert(o.dedup_key()));
    observations
}
