//! SSDP (UPnP) discovery.
//!
//! Multicasts `M-SEARCH ssdp:all` and collects unicast `200 OK` responses
//! for the listen window. IPv4 only.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use netloom_core::{Protocol, RawObservation, ServiceMetadata, TargetSet};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::{address_families, ScanContext, ScanError, ScanStats, Scanner};
use crate::config::SsdpConfig;

const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 1900;

const M_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 2\r\n\
ST: ssdp:all\r\n\
\r\n";

#[derive(Debug, Clone)]
pub struct SsdpScanner {
    config: SsdpConfig,
}

impl SsdpScanner {
    pub fn new(config: SsdpConfig) -> Self {
        Self { config }
    }
}

/// The headers we keep from a search response.
#[derive(Debug, Default, PartialEq, Eq)]
struct SsdpResponse {
    st: Option<String>,
    location: Option<String>,
    server: Option<String>,
    usn: Option<String>,
}

async fn bind() -> Result<UdpSocket, ScanError> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| ScanError::from_io(Protocol::Ssdp, e))
}

#[async_trait]
impl Scanner for SsdpScanner {
    fn protocol(&self) -> Protocol {
        Protocol::Ssdp
    }

    async fn preflight(&self, targets: &TargetSet) -> Result<(), ScanError> {
        if !address_families(targets).0 {
            return Err(ScanError::NoInterface {
                protocol: Protocol::Ssdp,
                reason: "SSDP discovery covers IPv4 targets only".into(),
            });
        }
        bind().await.map(drop)
    }

    async fn scan(&self, ctx: ScanContext) -> Result<ScanStats, ScanError> {
        let socket = bind().await?;
        let group = SocketAddr::from((SSDP_GROUP, SSDP_PORT));
        let mut stats = ScanStats::default();

        for round in 0..self.config.search_repeats.max(1) {
            if round > 0 && !ctx.pause(ctx.retry.delay(1)).await {
                break;
            }
            let Ok(permit) = ctx.limiter.acquire(1, ctx.deadline).await else {
                stats.truncated = true;
                break;
            };
            socket
                .send_to(M_SEARCH.as_bytes(), group)
                .await
                .map_err(|e| ScanError::from_io(Protocol::Ssdp, e))?;
            permit.spend();
            stats.probes_sent += 1;
        }

        let window = Duration::from_millis(self.config.listen_window_ms);
        let window_end = (Instant::now() + window).min(ctx.deadline);
        if window_end == ctx.deadline {
            stats.truncated = true;
        }

        let mut buf = vec![0u8; 2048];
        let mut errors = RecvErrors::default();
        loop {
            let received = tokio::select! {
                r = tokio::time::timeout_at(window_end, socket.recv_from(&mut buf)) => r,
                _ = ctx.cancel.cancelled() => break,
            };
            let (len, from) = match received {
                Ok(Ok(r)) => {
                    errors.clear();
                    r
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "SSDP receive failed");
                    let Some(pause) = errors.record() else {
                        tracing::warn!(error = %e, "SSDP socket keeps failing, ending listen window");
                        stats.truncated = true;
                        break;
                    };
                    tokio::time::sleep_until((Instant::now() + pause).min(window_end)).await;
                    continue;
                }
                Err(_) => break,
            };

            let Some(response) = std::str::from_utf8(&buf[..len]).ok().and_then(parse_response)
            else {
                continue;
            };
            let ip = from.ip();
            if !ctx.targets.contains(&ip) {
                tracing::debug!(ip = %ip, "SSDP response outside targets discarded");
                stats.discarded += 1;
                continue;
            }

            let peer = response
                .location
                .as_deref()
                .and_then(location_host)
                .filter(|host| *host != ip);
            tracing::debug!(ip = %ip, usn = ?response.usn, "SSDP response");

            let observation =
                RawObservation::new(Protocol::Ssdp, ip, None).with_metadata(ServiceMetadata {
                    service_type: response.st,
                    location: response.location,
                    server: response.server,
                    advertised_peer: peer,
                    ..Default::default()
                });
            if !ctx.emit(observation).await {
                break;
            }
            stats.responses += 1;
        }

        tracing::info!(responses = stats.responses, "SSDP search finished");
        Ok(stats)
    }
}

/// Parse a search response. Anything that is not `HTTP/1.1 200` is ignored.
/// Consecutive receive failures on the listen socket.
#[derive(Debug, Default)]
struct RecvErrors {
    consecutive: u32,
}

impl RecvErrors {
    const LIMIT: u32 = 5;
    const PAUSE: Duration = Duration::from_millis(50);

    /// Pause before the next receive, or `None` once the socket looks dead.
    fn record(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        (self.consecutive < Self::LIMIT).then_some(Self::PAUSE)
    }

    fn clear(&mut self) {
        self.consecutive = 0;
    }
}

fn parse_response(text: &str) -> Option<SsdpResponse> {
    let mut lines = text.lines();
    let status = lines.next()?.trim();
    if !status.to_ascii_uppercase().starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut response = SsdpResponse::default();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match name.trim().to_ascii_lowercase().as_str() {
            "st" => &mut response.st,
            "location" => &mut response.location,
            "server" => &mut response.server,
            "usn" => &mut response.usn,
            _ => continue,
        };
        *slot = Some(value.to_string());
    }
    Some(response)
}

/// Host part of a LOCATION URL, when it is a literal address.
fn location_host(url: &str) -> Option<IpAddr> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split_once(']')?.0.parse().ok();
    }
    let host = authority.split_once(':').map_or(authority, |(host, _)| host);
    host.parse().ok()
}
