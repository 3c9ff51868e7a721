//! Core domain types for the netloom topology graph.
//!
//! Raw observations come out of the protocol scanners; devices, interfaces,
//! and links are what the resolver turns them into and what the store persists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NetloomError;

/// Namespace UUID for deterministic device IDs.
const NETLOOM_NS: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x5a, 0x72, 0x0e, 0x4b, 0x4d, 0x8a, 0x9b, 0x61, 0x2c, 0xd0, 0x7e, 0x15, 0xa4, 0x93,
]);

// ── Tenant ────────────────────────────────────────────────────────

/// Every graph belongs to a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── MAC address ───────────────────────────────────────────────────

/// A 48-bit hardware address.
///
/// Parses `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff` in either case and
/// always renders lowercase with colons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The vendor prefix (first three octets).
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast_global(&self) -> bool {
        !self.is_multicast() && !self.is_locally_administered()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = NetloomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(NetloomError::InvalidMac(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(NetloomError::InvalidMac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| NetloomError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = NetloomError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

// ── Protocols ─────────────────────────────────────────────────────

/// A discovery protocol.
///
/// Variant order matches the lowercase protocol names, so the derived `Ord`
/// sorts by name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Arp,
    Icmp,
    Mdns,
    Ssdp,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Arp, Protocol::Icmp, Protocol::Mdns, Protocol::Ssdp];

    /// Lowercase name used in config files and for ordering.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arp => "arp",
            Self::Icmp => "icmp",
            Self::Mdns => "mdns",
            Self::Ssdp => "ssdp",
        }
    }

    /// Default trust in an observation from this protocol (0.0 – 1.0).
    pub fn default_confidence(&self) -> f64 {
        match self {
            Self::Arp => 0.95,
            Self::Icmp => 0.6,
            Self::Mdns => 0.5,
            Self::Ssdp => 0.5,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Arp => "ARP",
            Self::Icmp => "ICMP",
            Self::Mdns => "mDNS",
            Self::Ssdp => "SSDP",
        };
        f.write_str(label)
    }
}

impl FromStr for Protocol {
    type Err = NetloomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "arp" => Ok(Self::Arp),
            "icmp" | "ping" => Ok(Self::Icmp),
            "mdns" => Ok(Self::Mdns),
            "ssdp" | "upnp" => Ok(Self::Ssdp),
            _ => Err(NetloomError::UnknownProtocol(s.to_string())),
        }
    }
}

// ── Address targets ───────────────────────────────────────────────

/// A scan target: a CIDR range or a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressTarget {
    Cidr(IpNet),
    Host(IpAddr),
}

impl AddressTarget {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Cidr(net) => net.contains(ip),
            Self::Host(host) => host == ip,
        }
    }

    /// Number of probe-able addresses in this target.
    pub fn host_count(&self) -> u128 {
        match self {
            Self::Host(_) => 1,
            Self::Cidr(IpNet::V4(net)) => {
                let size = 1u128 << (32 - net.prefix_len());
                if net.prefix_len() < 31 {
                    size - 2
                } else {
                    size
                }
            }
            Self::Cidr(IpNet::V6(net)) => {
                let bits = 128 - u32::from(net.prefix_len());
                if bits >= 128 {
                    u128::MAX
                } else {
                    1u128 << bits
                }
            }
        }
    }
}

impl fmt::Display for AddressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr(net) => write!(f, "{net}"),
            Self::Host(ip) => write!(f, "{ip}"),
        }
    }
}

impl FromStr for AddressTarget {
    type Err = NetloomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            let net: IpNet = s
                .parse()
                .map_err(|_| NetloomError::InvalidTarget(s.to_string()))?;
            Ok(Self::Cidr(net.trunc()))
        } else {
            let ip: IpAddr = s
                .parse()
                .map_err(|_| NetloomError::InvalidTarget(s.to_string()))?;
            Ok(Self::Host(ip))
        }
    }
}

impl TryFrom<String> for AddressTarget {
    type Error = NetloomError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressTarget> for String {
    fn from(target: AddressTarget) -> Self {
        target.to_string()
    }
}

/// An ordered, de-duplicated set of scan targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<AddressTarget>", into = "Vec<AddressTarget>")]
pub struct TargetSet {
    targets: Vec<AddressTarget>,
}

impl TargetSet {
    pub fn new(targets: impl IntoIterator<Item = AddressTarget>) -> Self {
        let set: BTreeSet<AddressTarget> = targets.into_iter().collect();
        Self {
            targets: set.into_iter().collect(),
        }
    }

    /// Parse a list of target strings (CIDR or bare address).
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, NetloomError> {
        let targets = items
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<AddressTarget>, _>>()?;
        Ok(Self::new(targets))
    }

    pub fn targets(&self) -> &[AddressTarget] {
        &self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.targets.iter().any(|t| t.contains(ip))
    }

    /// Upper bound on the number of hosts (overlapping targets count twice).
    pub fn host_count(&self) -> u128 {
        self.targets
            .iter()
            .fold(0u128, |acc, t| acc.saturating_add(t.host_count()))
    }

    /// Expand into a sorted, de-duplicated host list.
    ///
    /// IPv4 prefixes shorter than /31 exclude the network and broadcast
    /// addresses. Callers bound the size with `host_count` first.
    pub fn hosts(&self) -> Vec<IpAddr> {
        let mut hosts = BTreeSet::new();
        for target in &self.targets {
            match target {
                AddressTarget::Host(ip) => {
                    hosts.insert(*ip);
                }
                AddressTarget::Cidr(net) => hosts.extend(net.hosts()),
            }
        }
        hosts.into_iter().collect()
    }

    /// The CIDR targets of this set.
    pub fn networks(&self) -> Vec<IpNet> {
        self.targets
            .iter()
            .filter_map(|t| match t {
                AddressTarget::Cidr(net) => Some(*net),
                AddressTarget::Host(_) => None,
            })
            .collect()
    }
}

impl From<Vec<AddressTarget>> for TargetSet {
    fn from(targets: Vec<AddressTarget>) -> Self {
        Self::new(targets)
    }
}

impl From<TargetSet> for Vec<AddressTarget> {
    fn from(set: TargetSet) -> Self {
        set.targets
    }
}

impl fmt::Display for TargetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.targets.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

// ── Raw observations ──────────────────────────────────────────────

/// Service-level details a protocol reported alongside an address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub hostname: Option<String>,
    /// Advertised service type (mDNS service, SSDP `ST`).
    pub service_type: Option<String>,
    /// SSDP description URL.
    pub location: Option<String>,
    /// SSDP `SERVER` header.
    pub server: Option<String>,
    /// IP TTL of an ICMP echo reply.
    pub ttl: Option<u8>,
    pub latency_ms: Option<u64>,
    /// Another address the responder pointed at (e.g. an SSDP LOCATION host).
    pub advertised_peer: Option<IpAddr>,
}

/// A single protocol response. Lives for one job only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub mac: Option<MacAddress>,
    #[serde(default)]
    pub metadata: ServiceMetadata,
    pub observed_at: DateTime<Utc>,
    pub confidence: f64,
}

impl RawObservation {
    /// An observation with the protocol's default confidence and no metadata.
    pub fn new(protocol: Protocol, ip: IpAddr, mac: Option<MacAddress>) -> Self {
        Self {
            protocol,
            ip,
            mac,
            metadata: ServiceMetadata::default(),
            observed_at: Utc::now(),
            confidence: protocol.default_confidence(),
        }
    }

    pub fn with_metadata(mut self, metadata: ServiceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Identity used to spot exact duplicates: everything except the
    /// timestamp, latency, and confidence.
    pub fn dedup_key(&self) -> (Protocol, IpAddr, Option<MacAddress>, ServiceMetadata) {
        let mut metadata = self.metadata.clone();
        metadata.latency_ms = None;
        (self.protocol, self.ip, self.mac, metadata)
    }
}

// ── Devices ───────────────────────────────────────────────────────

/// Unique identifier for a device in the topology graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Deterministic ID for a device key within a tenant.
    pub fn derive(tenant_id: &TenantId, key: &DeviceKey) -> Self {
        Self(Uuid::new_v5(
            &NETLOOM_NS,
            format!("{}:device:{}", tenant_id.0, key).as_bytes(),
        ))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a device's identity is anchored on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceKey {
    /// Hardware address. Authoritative.
    Mac(MacAddress),
    /// Built from the IP plus any service fingerprint. Lower confidence.
    Synthetic(String),
}

impl DeviceKey {
    /// Synthesize a key for a device known only by IP.
    pub fn synthetic(ip: IpAddr, fingerprint: Option<&str>) -> Self {
        match fingerprint.filter(|f| !f.is_empty()) {
            Some(fp) => Self::Synthetic(format!("ip:{ip}|{}", fp.to_lowercase())),
            None => Self::Synthetic(format!("ip:{ip}")),
        }
    }

    pub fn is_mac(&self) -> bool {
        matches!(self, Self::Mac(_))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mac(mac) => write!(f, "mac:{mac}"),
            Self::Synthetic(s) => write!(f, "synthetic:{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Active,
    Stale,
    Removed,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Removed => "removed",
        })
    }
}

/// A network device. Never hard-deleted; ages to `Removed` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub key: DeviceKey,
    pub mac: Option<MacAddress>,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
    pub status: DeviceStatus,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Consecutive in-scope jobs that did not observe this device.
    #[serde(default)]
    pub missed_scans: u32,
    /// Keyed by IP, so a device never holds the same IP twice.
    #[serde(default)]
    pub interfaces: BTreeMap<IpAddr, Interface>,
}

impl Device {
    pub fn new(tenant_id: &TenantId, key: DeviceKey, now: DateTime<Utc>) -> Self {
        let mac = match &key {
            DeviceKey::Mac(mac) => Some(*mac),
            DeviceKey::Synthetic(_) => None,
        };
        Self {
            id: DeviceId::derive(tenant_id, &key),
            key,
            mac,
            vendor: None,
            hostname: None,
            status: DeviceStatus::Active,
            confidence: 0.0,
            first_seen: now,
            last_seen: now,
            missed_scans: 0,
            interfaces: BTreeMap::new(),
        }
    }
}

/// A network address held by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub ip: IpAddr,
    /// Hostname advertised for this address, if any.
    pub name: Option<String>,
    pub protocols: BTreeSet<Protocol>,
    #[serde(default)]
    pub services: BTreeSet<String>,
    pub confidence: f64,
    pub last_seen: DateTime<Utc>,
}

impl Interface {
    pub fn new(ip: IpAddr, now: DateTime<Utc>) -> Self {
        Self {
            ip,
            name: None,
            protocols: BTreeSet::new(),
            services: BTreeSet::new(),
            confidence: 0.0,
            last_seen: now,
        }
    }
}

/// An interface together with its owning device, as stored and diffed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub interface: Interface,
}

impl InterfaceRecord {
    pub fn key(&self) -> InterfaceRef {
        InterfaceRef {
            device_id: self.device_id,
            ip: self.interface.ip,
        }
    }
}

// ── Links ─────────────────────────────────────────────────────────

/// Identity of an interface: owning device plus address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceRef {
    pub device_id: DeviceId,
    pub ip: IpAddr,
}

impl fmt::Display for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ip, self.device_id)
    }
}

/// Undirected endpoint pair, stored smaller-first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub a: InterfaceRef,
    pub b: InterfaceRef,
}

impl LinkKey {
    pub fn new(x: InterfaceRef, y: InterfaceRef) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn touches(&self, ip: &IpAddr) -> bool {
        self.a.ip == *ip || self.b.ip == *ip
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

/// The evidence a link was inferred from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Both ends in the same scanned subnet, one of them the gateway.
    SubnetGateway,
    /// A protocol response pointed from one address at the other.
    Advertised,
}

/// An inferred, advisory edge between two interfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub key: LinkKey,
    pub kind: LinkKind,
    pub confidence: f64,
    pub protocols: BTreeSet<Protocol>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ── Graph ─────────────────────────────────────────────────────────

/// The persisted topology of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, Device>,
    #[serde(default, with = "link_map")]
    pub links: BTreeMap<LinkKey, Link>,
    /// The job that last committed this graph.
    #[serde(default)]
    pub last_job: Option<Uuid>,
}

impl TopologyGraph {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            devices: BTreeMap::new(),
            links: BTreeMap::new(),
            last_job: None,
        }
    }

    pub fn device_by_mac(&self, mac: &MacAddress) -> Option<&Device> {
        self.devices.values().find(|d| d.mac.as_ref() == Some(mac))
    }

    /// The device currently holding `ip`, if any.
    pub fn owner_of_ip(&self, ip: &IpAddr) -> Option<DeviceId> {
        self.devices
            .values()
            .find(|d| d.interfaces.contains_key(ip))
            .map(|d| d.id)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (DeviceId, &Interface)> {
        self.devices
            .values()
            .flat_map(|d| d.interfaces.values().map(move |i| (d.id, i)))
    }

    pub fn interface_records(&self) -> Vec<InterfaceRecord> {
        self.interfaces()
            .map(|(device_id, interface)| InterfaceRecord {
                device_id,
                interface: interface.clone(),
            })
            .collect()
    }

    pub fn interface_count(&self) -> usize {
        self.devices.values().map(|d| d.interfaces.len()).sum()
    }
}

/// JSON object keys must be strings, so links are stored as a list.
mod link_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Link, LinkKey};

    pub fn serialize<S: Serializer>(
        links: &BTreeMap<LinkKey, Link>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&Link> = links.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<LinkKey, Link>, D::Error> {
        let list = Vec::<Link>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|l| (l.key, l)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddress = "AA-BB-CC-00-11-22".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:00:11:22");
        assert_eq!(mac.oui(), [0xaa, 0xbb, 0xcc]);
        assert!("aa:bb:cc".parse::<MacAddress>().is_err());
        assert!("zz:bb:cc:00:11:22".parse::<MacAddress>().is_err());
    }

    #[test]
    fn mac_flags() {
        let global: MacAddress = "00:11:22:33:44:55".parse().unwrap();
        let local: MacAddress = "02:11:22:33:44:55".parse().unwrap();
        assert!(global.is_unicast_global());
        assert!(local.is_locally_administered());
        assert!(!local.is_unicast_global());
    }

    #[test]
    fn protocol_names_sort_and_display() {
        let mut protos = vec![Protocol::Ssdp, Protocol::Arp, Protocol::Mdns, Protocol::Icmp];
        protos.sort();
        let names: Vec<&str> = protos.iter().map(|p| p.name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(Protocol::Mdns.to_string(), "mDNS");
        assert_eq!("UPnP".parse::<Protocol>().unwrap(), Protocol::Ssdp);
        assert_eq!(serde_json::to_string(&Protocol::Icmp).unwrap(), "\"icmp\"");
    }

    #[test]
    fn target_set_expansion() {
        let set = TargetSet::parse(&["192.168.1.0/30", "192.168.1.1", "10.0.0.9"]).unwrap();
        assert_eq!(
            set.hosts(),
            vec![ip("10.0.0.9"), ip("192.168.1.1"), ip("192.168.1.2")]
        );
        assert!(set.contains(&ip("192.168.1.3")));
        assert!(!set.contains(&ip("192.168.2.1")));
        assert_eq!(set.networks().len(), 1);
    }

    #[test]
    fn cidr_target_truncates_host_bits() {
        let target: AddressTarget = "192.168.1.77/24".parse().unwrap();
        assert_eq!(target.to_string(), "192.168.1.0/24");
        assert_eq!(target.host_count(), 254);
    }

    #[test]
    fn device_ids_are_deterministic() {
        let tenant = TenantId(Uuid::nil());
        let key = DeviceKey::Mac("aa:bb:cc:dd:ee:ff".parse().unwrap());
        assert_eq!(DeviceId::derive(&tenant, &key), DeviceId::derive(&tenant, &key));

        let other = DeviceKey::synthetic(ip("10.0.0.5"), Some("Printer.local"));
        assert_eq!(other, DeviceKey::Synthetic("ip:10.0.0.5|printer.local".into()));
        assert_ne!(DeviceId::derive(&tenant, &key), DeviceId::derive(&tenant, &other));
    }

    #[test]
    fn link_key_is_undirected() {
        let tenant = TenantId(Uuid::nil());
        let d1 = DeviceId::derive(&tenant, &DeviceKey::synthetic(ip("10.0.0.1"), None));
        let d2 = DeviceId::derive(&tenant, &DeviceKey::synthetic(ip("10.0.0.2"), None));
        let x = InterfaceRef { device_id: d1, ip: ip("10.0.0.1") };
        let y = InterfaceRef { device_id: d2, ip: ip("10.0.0.2") };
        assert_eq!(LinkKey::new(x, y), LinkKey::new(y, x));
    }

    #[test]
    fn graph_serialization_roundtrip() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let mut graph = TopologyGraph::new(tenant);

        let mut gw = Device::new(&tenant, DeviceKey::Mac("00:11:22:33:44:55".parse().unwrap()), now);
        gw.interfaces.insert(ip("10.0.0.1"), Interface::new(ip("10.0.0.1"), now));
        let mut host = Device::new(&tenant, DeviceKey::synthetic(ip("10.0.0.7"), None), now);
        host.interfaces.insert(ip("10.0.0.7"), Interface::new(ip("10.0.0.7"), now));

        let key = LinkKey::new(
            InterfaceRef { device_id: gw.id, ip: ip("10.0.0.1") },
            InterfaceRef { device_id: host.id, ip: ip("10.0.0.7") },
        );
        graph.links.insert(
            key,
            Link {
                key,
                kind: LinkKind::SubnetGateway,
                confidence: 0.5,
                protocols: BTreeSet::from([Protocol::Arp]),
                first_seen: now,
                last_seen: now,
            },
        );
        graph.devices.insert(gw.id, gw);
        graph.devices.insert(host.id, host);

        let json = serde_json::to_string(&graph).unwrap();
        let back: TopologyGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
        assert_eq!(back.owner_of_ip(&ip("10.0.0.7")), graph.owner_of_ip(&ip("10.0.0.7")));
        assert_eq!(back.interface_count(), 2);
    }
}
