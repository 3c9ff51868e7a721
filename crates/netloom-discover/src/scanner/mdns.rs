//! mDNS / DNS-SD browse.
//!
//! Each configured service type is browsed once (one limiter permit per
//! query); resolved services are collected for the listen window.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use netloom_core::{Protocol, RawObservation, ServiceMetadata, TargetSet};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::{ScanContext, ScanError, ScanStats, Scanner};
use crate::config::MdnsConfig;

#[derive(Debug, Clone)]
pub struct MdnsScanner {
    config: MdnsConfig,
}

impl MdnsScanner {
    pub fn new(config: MdnsConfig) -> Self {
        Self { config }
    }
}

fn daemon() -> Result<ServiceDaemon, ScanError> {
    ServiceDaemon::new().map_err(|e| daemon_error(&e.to_string()))
}

/// mdns-sd flattens socket errors into a message, so the OS text is all
/// there is to tell a privilege problem from anything else.
fn daemon_error(reason: &str) -> ScanError {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        ScanError::PrivilegeDenied {
            protocol: Protocol::Mdns,
            reason: reason.to_string(),
        }
    } else {
        ScanError::Io(io::Error::other(format!("mDNS daemon: {reason}")))
    }
}

#[async_trait]
impl Scanner for MdnsScanner {
    fn protocol(&self) -> Protocol {
        Protocol::Mdns
    }

    async fn preflight(&self, _targets: &TargetSet) -> Result<(), ScanError> {
        let daemon = daemon()?;
        let _ = daemon.shutdown();
        Ok(())
    }

    async fn scan(&self, ctx: ScanContext) -> Result<ScanStats, ScanError> {
        let daemon = daemon()?;
        let mut stats = ScanStats::default();
        let mut browsing = Vec::new();

        for service_type in &self.config.service_types {
            let permit = match ctx.limiter.acquire(1, ctx.deadline).await {
                Ok(permit) => permit,
                Err(_) => {
                    stats.truncated = true;
                    break;
                }
            };
            match daemon.browse(service_type) {
                Ok(receiver) => {
                    permit.spend();
                    stats.probes_sent += 1;
                    browsing.push((service_type.clone(), receiver));
                }
                Err(e) => {
                    tracing::warn!(service_type = %service_type, error = %e, "mDNS browse failed");
                }
            }
        }

        let window = Duration::from_millis(self.config.listen_window_ms);
        let window_end = (Instant::now() + window).min(ctx.deadline);
        if window_end == ctx.deadline {
            stats.truncated = true;
        }

        let mut listeners = JoinSet::new();
        for (service_type, receiver) in browsing {
            let targets = ctx.targets.clone();
            let sink = ctx.sink.clone();
            let cancel = ctx.cancel.clone();
            listeners.spawn(async move {
                let mut counts = (0, 0);
                loop {
                    let event = tokio::select! {
                        event = tokio::time::timeout_at(window_end, receiver.recv_async()) => event,
                        _ = cancel.cancelled() => break,
                    };
                    // Window closed, or the daemon shut down.
                    let Ok(Ok(event)) = event else { break };
                    if !forward(event, &targets, &sink, &mut counts).await {
                        break;
                    }
                }
                counts
            });
            tracing::debug!(service_type = %service_type, "mDNS browse started");
        }

        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok((responses, discarded)) => {
                    stats.responses += responses;
                    stats.discarded += discarded;
                }
                Err(e) => tracing::warn!(error = %e, "mDNS listener failed"),
            }
        }

        for service_type in &self.config.service_types {
            let _ = daemon.stop_browse(service_type);
        }
        let _ = daemon.shutdown();

        tracing::info!(responses = stats.responses, "mDNS browse finished");
        Ok(stats)
    }
}

/// Send the in-target addresses of a resolved service on to the sink,
/// counting (sent, discarded). Returns false once the sink has closed.
async fn forward(
    event: ServiceEvent,
    targets: &TargetSet,
    sink: &tokio::sync::mpsc::Sender<RawObservation>,
    counts: &mut (u64, u64),
) -> bool {
    let ServiceEvent::ServiceResolved(info) = event else {
        return true;
    };

    for observation in observations(&info) {
        if !targets.contains(&observation.ip) {
            tracing::debug!(ip = %observation.ip, "mDNS response outside targets discarded");
            counts.1 += 1;
            continue;
        }
        if sink.send(observation).await.is_err() {
            return false;
        }
        counts.0 += 1;
    }
    true
}

fn observations(info: &ServiceInfo) -> Vec<RawObservation> {
    let hostname = info.get_hostname().trim_end_matches('.');
    let hostname = (!hostname.is_empty()).then(|| hostname.to_string());
    let service_type = info.get_type().trim_end_matches('.').to_string();

    let mut addresses: Vec<_> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    addresses
        .into_iter()
        .map(|ip| {
            RawObservation::new(Protocol::Mdns, ip, None).with_metadata(ServiceMetadata {
                hostname: hostname.clone(),
                service_type: Some(service_type.clone()),
                ..Default::default()
            })
        })
        .collect()
}
