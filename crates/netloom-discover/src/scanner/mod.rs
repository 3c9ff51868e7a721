//! Protocol scanners.
//!
//! Every discovery protocol implements [`Scanner`]. A scanner probes the
//! job's targets and pushes [`RawObservation`]s into the context's sink as it
//! finds them, so anything already sent survives cancellation.

pub mod arp;
pub mod icmp;
pub mod mdns;
pub mod ssdp;

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netloom_core::{AddressTarget, Protocol, RawObservation, TargetSet};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoverConfig, RetryPolicy};
use crate::ratelimit::RateLimiter;

pub use arp::ArpScanner;
pub use icmp::IcmpScanner;
pub use mdns::MdnsScanner;
pub use ssdp::SsdpScanner;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(
        "PrivilegeDenied: {protocol} needs raw or multicast socket access ({reason}); \
         run with CAP_NET_RAW or as root"
    )]
    PrivilegeDenied { protocol: Protocol, reason: String },

    #[error("No usable interface for {protocol}: {reason}")]
    NoInterface { protocol: Protocol, reason: String },

    #[error("TargetUnreachable: {0}")]
    TargetUnreachable(IpAddr),

    #[error("ProtocolTimeout: {0}")]
    ProtocolTimeout(Protocol),

    #[error("Rate limiter wait would exceed the deadline")]
    RateLimitTimeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ScanError {
    /// Map an I/O error, treating permission failures as a privilege problem.
    pub fn from_io(protocol: Protocol, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied {
            Self::PrivilegeDenied {
                protocol,
                reason: err.to_string(),
            }
        } else {
            Self::Io(err)
        }
    }
}

/// Counters a scanner reports when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub probes_sent: u64,
    pub responses: u64,
    /// Targets that never answered after the last retry.
    pub unreachable: u64,
    /// Responses from outside the target set.
    pub discarded: u64,
    /// The scan stopped at its deadline before finishing its work.
    pub truncated: bool,
}

/// Everything a scanner needs for one run.
pub struct ScanContext {
    pub targets: TargetSet,
    pub limiter: Arc<RateLimiter>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    /// Per-host probe timeout.
    pub probe_timeout: Duration,
    /// Fan-out inside the scanner.
    pub concurrency: usize,
    pub sink: mpsc::Sender<RawObservation>,
}

impl ScanContext {
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Send an observation. Returns false once the collector has gone away.
    pub async fn emit(&self, observation: RawObservation) -> bool {
        self.sink.send(observation).await.is_ok()
    }

    /// Sleep for `delay`, cut short by the deadline or cancellation.
    /// Returns false if the scan should stop.
    pub async fn pause(&self, delay: Duration) -> bool {
        let wake = (Instant::now() + delay).min(self.deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => !self.is_done(),
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// One discovery protocol.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Check, before any probe is sent, that this protocol can run at all.
    async fn preflight(&self, targets: &TargetSet) -> Result<(), ScanError>;

    async fn scan(&self, ctx: ScanContext) -> Result<ScanStats, ScanError>;
}

/// Which address families (v4, v6) the targets cover.
pub(crate) fn address_families(targets: &TargetSet) -> (bool, bool) {
    targets.targets().iter().fold((false, false), |(v4, v6), t| {
        let is_v4 = match t {
            AddressTarget::Host(ip) => ip.is_ipv4(),
            AddressTarget::Cidr(net) => matches!(net, ipnet::IpNet::V4(_)),
        };
        (v4 || is_v4, v6 || !is_v4)
    })
}

/// Scanners by protocol.
#[derive(Default, Clone)]
pub struct ScannerRegistry {
    scanners: BTreeMap<Protocol, Arc<dyn Scanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four live network scanners.
    pub fn system(config: &DiscoverConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ArpScanner::new()));
        registry.register(Arc::new(IcmpScanner::new()));
        registry.register(Arc::new(MdnsScanner::new(config.mdns.clone())));
        registry.register(Arc::new(SsdpScanner::new(config.ssdp.clone())));
        registry
    }

    /// Register a scanner, replacing any previous one for its protocol.
    pub fn register(&mut self, scanner: Arc<dyn Scanner>) {
        self.scanners.insert(scanner.protocol(), scanner);
    }

    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn Scanner>> {
        self.scanners.get(&protocol).cloned()
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.scanners.keys().copied()
    }
}
