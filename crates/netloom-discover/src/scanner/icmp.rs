//! ICMP echo sweep.
//!
//! Fans out over every target host under a semaphore. Each host gets
//! `1 + max_retries` echo attempts with exponential backoff between them; a
//! host that never answers is counted as unreachable, not as an error.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netloom_core::{Protocol, RawObservation, ServiceMetadata, TargetSet};
use surge_ping::{Client, Config, IcmpPacket, PingIdentifier, PingSequence, ICMP};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{address_families, ScanContext, ScanError, ScanStats, Scanner};
use crate::config::RetryPolicy;
use crate::ratelimit::RateLimiter;

const PAYLOAD: [u8; 56] = [0u8; 56];

#[derive(Debug, Default)]
pub struct IcmpScanner;

impl IcmpScanner {
    pub fn new() -> Self {
        Self
    }
}

/// What happened to one host.
enum HostOutcome {
    Replied,
    Unreachable,
    /// Stopped by the deadline, cancellation, or the limiter.
    Stopped,
}

/// Per-job pieces each host task needs.
#[derive(Clone)]
struct Probe {
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
    sink: tokio::sync::mpsc::Sender<RawObservation>,
    sent: Arc<AtomicU64>,
}

#[async_trait]
impl Scanner for IcmpScanner {
    fn protocol(&self) -> Protocol {
        Protocol::Icmp
    }

    async fn preflight(&self, targets: &TargetSet) -> Result<(), ScanError> {
        let (v4, v6) = address_families(targets);
        if v4 {
            client(ICMP::V4)?;
        }
        if v6 {
            client(ICMP::V6)?;
        }
        Ok(())
    }

    async fn scan(&self, ctx: ScanContext) -> Result<ScanStats, ScanError> {
        let (v4, v6) = address_families(&ctx.targets);
        let client_v4 = if v4 { Some(Arc::new(client(ICMP::V4)?)) } else { None };
        let client_v6 = if v6 { Some(Arc::new(client(ICMP::V6)?)) } else { None };

        let hosts = ctx.targets.hosts();
        tracing::info!(hosts = hosts.len(), "ICMP sweep started");

        let probe = Probe {
            limiter: Arc::clone(&ctx.limiter),
            retry: ctx.retry.clone(),
            timeout: ctx.probe_timeout,
            deadline: ctx.deadline,
            cancel: ctx.cancel.clone(),
            sink: ctx.sink.clone(),
            sent: Arc::new(AtomicU64::new(0)),
        };
        let semaphore = Arc::new(Semaphore::new(ctx.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut stats = ScanStats::default();

        for ip in hosts {
            if ctx.is_done() {
                stats.truncated = true;
                break;
            }
            let client = match ip {
                IpAddr::V4(_) => client_v4.clone(),
                IpAddr::V6(_) => client_v6.clone(),
            };
            let Some(client) = client else { continue };

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(ctx.deadline) => {
                    stats.truncated = true;
                    break;
                }
            };

            let probe = probe.clone();
            tasks.spawn(async move {
                let outcome = probe_host(&client, ip, &probe).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(HostOutcome::Replied) => stats.responses += 1,
                Ok(HostOutcome::Unreachable) => stats.unreachable += 1,
                Ok(HostOutcome::Stopped) => stats.truncated = true,
                Err(e) => tracing::warn!(error = %e, "ICMP probe task failed"),
            }
        }
        stats.probes_sent = probe.sent.load(Ordering::Relaxed);

        tracing::info!(
            responses = stats.responses,
            unreachable = stats.unreachable,
            "ICMP sweep finished"
        );
        Ok(stats)
    }
}

async fn probe_host(client: &Client, ip: IpAddr, probe: &Probe) -> HostOutcome {
    let mut pinger = client.pinger(ip, PingIdentifier(random_id())).await;
    pinger.timeout(probe.timeout);

    for attempt in 0..probe.retry.attempts() {
        if attempt > 0 {
            let wake = (Instant::now() + probe.retry.delay(attempt)).min(probe.deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = probe.cancel.cancelled() => return HostOutcome::Stopped,
            }
        }
        if probe.cancel.is_cancelled() || Instant::now() >= probe.deadline {
            return HostOutcome::Stopped;
        }

        let Ok(permit) = probe.limiter.acquire(1, probe.deadline).await else {
            return HostOutcome::Stopped;
        };
        permit.spend();
        probe.sent.fetch_add(1, Ordering::Relaxed);

        let reply = tokio::select! {
            reply = pinger.ping(PingSequence(attempt as u16), &PAYLOAD) => reply,
            _ = probe.cancel.cancelled() => return HostOutcome::Stopped,
            _ = tokio::time::sleep_until(probe.deadline) => return HostOutcome::Stopped,
        };

        match reply {
            Ok((packet, rtt)) => {
                let ttl = match packet {
                    IcmpPacket::V4(p) => p.get_ttl(),
                    IcmpPacket::V6(_) => None,
                };
                let observation = RawObservation::new(Protocol::Icmp, ip, None).with_metadata(
                    ServiceMetadata {
                        ttl,
                        latency_ms: Some(rtt.as_millis() as u64),
                        ..Default::default()
                    },
                );
                tracing::debug!(ip = %ip, attempt, ttl = ?ttl, "ICMP echo reply");
                // A closed sink means the job is over; the reply still counts.
                let _ = probe.sink.send(observation).await;
                return HostOutcome::Replied;
            }
            Err(e) => {
                tracing::debug!(ip = %ip, attempt, error = %e, "ICMP attempt failed");
            }
        }
    }

    tracing::debug!(ip = %ip, "{}", ScanError::TargetUnreachable(ip));
    HostOutcome::Unreachable
}

fn client(kind: ICMP) -> Result<Client, ScanError> {
    let config = match kind {
        ICMP::V4 => Config::default(),
        ICMP::V6 => Config::builder().kind(ICMP::V6).build(),
    };
    Client::new(&config).map_err(|e| ScanError::from_io(Protocol::Icmp, e))
}

fn random_id() -> u16 {
    let bytes = Uuid::new_v4().into_bytes();
    u16::from_be_bytes([bytes[0], bytes[1]])
}
