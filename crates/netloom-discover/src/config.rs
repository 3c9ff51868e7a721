//! Configuration for the netloom-discover engine.
//!
//! Loaded from the `[discover]` section of `netloom.toml`, overridden by
//! `NETLOOM_DISCOVER__*` environment variables.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use netloom_core::{JobOrigin, NetloomError, Protocol, ScanJob, TargetSet, TenantId};
use netloom_graph::GraphConfig;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{DiscoverError, Result};

/// Top-level discover configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// Tenant whose graph this instance maintains.
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub store: StoreConfig,

    /// Directory for job journal records.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,

    #[serde(default)]
    pub policy: MergePolicy,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub limits: Limits,

    #[serde(default)]
    pub mdns: MdnsConfig,

    #[serde(default)]
    pub ssdp: SsdpConfig,

    /// Per-host probe timeout (ICMP echo, ARP round).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Pending jobs the queue holds before submitters wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Stored scan configurations.
    #[serde(default)]
    pub scans: Vec<ScanConfig>,
}

/// Which graph store backs the engine.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
    Neo4j,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Root directory for the file store.
    #[serde(default = "default_store_path")]
    pub path: String,

    #[serde(default)]
    pub neo4j: GraphConfig,

    /// Upper bound on a single load or commit.
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Identity-resolution and ageing knobs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MergePolicy {
    /// Consecutive missed in-scope jobs before a device turns stale.
    #[serde(default = "default_stale_after")]
    pub stale_after: u32,

    /// Consecutive missed in-scope jobs before a stale device is removed.
    #[serde(default = "default_remove_after")]
    pub remove_after: u32,

    /// Minimum time since last sighting before removal.
    #[serde(default)]
    pub removal_grace_secs: u64,

    /// How long an IP-only match against a prior interface stays valid.
    #[serde(default = "default_ip_retention_secs")]
    pub ip_retention_secs: u64,

    #[serde(default)]
    pub confidence: ConfidenceWeights,

    #[serde(default = "default_advertised_link_confidence")]
    pub advertised_link_confidence: f64,
}

/// Trust placed in each protocol's observations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConfidenceWeights {
    #[serde(default = "default_arp_weight")]
    pub arp: f64,
    #[serde(default = "default_icmp_weight")]
    pub icmp: f64,
    #[serde(default = "default_mdns_weight")]
    pub mdns: f64,
    #[serde(default = "default_ssdp_weight")]
    pub ssdp: f64,
}

impl ConfidenceWeights {
    pub fn weight(&self, protocol: Protocol) -> f64 {
        match protocol {
            Protocol::Arp => self.arp,
            Protocol::Icmp => self.icmp,
            Protocol::Mdns => self.mdns,
            Protocol::Ssdp => self.ssdp,
        }
    }
}

impl MergePolicy {
    pub fn removal_grace(&self) -> chrono::Duration {
        saturating_secs(self.removal_grace_secs)
    }

    pub fn ip_retention(&self) -> chrono::Duration {
        saturating_secs(self.ip_retention_secs)
    }
}

/// Anything past the representable range means "forever".
fn saturating_secs(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Per-host retry with exponential backoff, inside a single protocol scan.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based). Attempt 0 is the first
    /// try and never waits.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Total attempts per host.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_hosts_per_job")]
    pub max_hosts_per_job: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    #[serde(default = "default_mdns_service_types")]
    pub service_types: Vec<String>,
    #[serde(default = "default_listen_window_ms")]
    pub listen_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsdpConfig {
    #[serde(default = "default_listen_window_ms")]
    pub listen_window_ms: u64,
    #[serde(default = "default_search_repeats")]
    pub search_repeats: u32,
}

/// A stored scan configuration: what to scan and how often.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    pub id: String,

    pub name: Option<String>,

    /// CIDR ranges or bare addresses.
    pub targets: Vec<String>,

    #[serde(default = "default_protocols")]
    pub protocols: Vec<Protocol>,

    #[serde(default = "default_rate_limit_pps")]
    pub rate_limit_pps: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_protocol_timeout_secs")]
    pub protocol_timeout_secs: u64,

    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Scheduling interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Gateway used for link inference; defaults to each subnet's first host.
    pub gateway: Option<IpAddr>,
}

impl ScanConfig {
    /// Build a job from this configuration.
    pub fn to_job(
        &self,
        tenant_id: TenantId,
        origin: JobOrigin,
    ) -> std::result::Result<ScanJob, NetloomError> {
        let targets = TargetSet::parse(&self.targets)?;
        let protocols: BTreeSet<Protocol> = self.protocols.iter().copied().collect();

        let mut job = ScanJob::new(tenant_id, targets, protocols);
        job.config_id = Some(self.id.clone());
        job.rate_limit_pps = self.rate_limit_pps;
        job.burst = self.burst;
        job.concurrency = self.concurrency;
        job.protocol_timeout = Duration::from_secs(self.protocol_timeout_secs);
        job.deadline = Duration::from_secs(self.deadline_secs);
        job.origin = origin;
        job.gateway = self.gateway;
        Ok(job)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl DiscoverConfig {
    /// Load from `{file_prefix}.toml` (optional) and the environment.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("NETLOOM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(cfg)
    }

    /// Parse a TOML document containing a `[discover]` table.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        Self::from_config(cfg)
    }

    fn from_config(cfg: config::Config) -> Result<Self> {
        match cfg.get::<DiscoverConfig>("discover") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => Ok(DiscoverConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn tenant(&self) -> Result<TenantId> {
        if self.tenant_id.is_empty() {
            return Err(DiscoverError::ConfigInvalid(
                "tenant ID required: set --tenant-id or discover.tenant_id".into(),
            ));
        }
        Uuid::parse_str(&self.tenant_id)
            .map(TenantId)
            .map_err(|e| DiscoverError::ConfigInvalid(format!("tenant_id: {e}")))
    }

    pub fn scan(&self, id: &str) -> Option<&ScanConfig> {
        self.scans.iter().find(|s| s.id == id)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_journal_dir() -> String {
    "./journal".to_string()
}

fn default_store_path() -> String {
    "./netloom-data".to_string()
}

fn default_store_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_stale_after() -> u32 {
    3
}

fn default_remove_after() -> u32 {
    6
}

fn default_ip_retention_secs() -> u64 {
    24 * 3600
}

fn default_advertised_link_confidence() -> f64 {
    0.4
}

fn default_arp_weight() -> f64 {
    Protocol::Arp.default_confidence()
}

fn default_icmp_weight() -> f64 {
    Protocol::Icmp.default_confidence()
}

fn default_mdns_weight() -> f64 {
    Protocol::Mdns.default_confidence()
}

fn default_ssdp_weight() -> f64 {
    Protocol::Ssdp.default_confidence()
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_hosts_per_job() -> u64 {
    65_536
}

fn default_mdns_service_types() -> Vec<String> {
    [
        "_services._dns-sd._udp.local.",
        "_workstation._tcp.local.",
        "_http._tcp.local.",
        "_ipp._tcp.local.",
        "_airplay._tcp.local.",
        "_googlecast._tcp.local.",
        "_ssh._tcp.local.",
        "_smb._tcp.local.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_listen_window_ms() -> u64 {
    3_000
}

fn default_search_repeats() -> u32 {
    2
}

fn default_protocols() -> Vec<Protocol> {
    vec![Protocol::Arp, Protocol::Icmp]
}

fn default_rate_limit_pps() -> u32 {
    100
}

fn default_burst() -> u32 {
    20
}

fn default_concurrency() -> usize {
    64
}

fn default_protocol_timeout_secs() -> u64 {
    30
}

fn default_deadline_secs() -> u64 {
    60
}

fn default_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            store: StoreConfig::default(),
            journal_dir: default_journal_dir(),
            policy: MergePolicy::default(),
            retry: RetryPolicy::default(),
            limits: Limits::default(),
            mdns: MdnsConfig::default(),
            ssdp: SsdpConfig::default(),
            probe_timeout_ms: default_probe_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            scans: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            neo4j: GraphConfig::default(),
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            remove_after: default_remove_after(),
            removal_grace_secs: 0,
            ip_retention_secs: default_ip_retention_secs(),
            confidence: ConfidenceWeights::default(),
            advertised_link_confidence: default_advertised_link_confidence(),
        }
    }
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            arp: default_arp_weight(),
            icmp: default_icmp_weight(),
            mdns: default_mdns_weight(),
            ssdp: default_ssdp_weight(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_hosts_per_job: default_max_hosts_per_job(),
        }
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            service_types: default_mdns_service_types(),
            listen_window_ms: default_listen_window_ms(),
        }
    }
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            listen_window_ms: default_listen_window_ms(),
            search_repeats: default_search_repeats(),
        }
    }
}
