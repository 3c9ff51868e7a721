//! Snapshot assembly: group one job's observations into candidate devices.
//!
//! Pure. MAC-bearing observations anchor devices; MAC-less ones attach to
//! whichever MAC device holds their IP, or stand alone keyed by IP.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use mac_oui::Oui;
use netloom_core::{MacAddress, Protocol, RawObservation};
use serde::Serialize;

/// One address as seen in this job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInterface {
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub protocols: BTreeSet<Protocol>,
    pub services: BTreeSet<String>,
    /// Best confidence among the contributing observations.
    pub confidence: f64,
    /// Latest contributing observation.
    pub observed_at: DateTime<Utc>,
    /// Addresses this one pointed at, with the protocols that said so.
    pub advertised_peers: BTreeMap<IpAddr, BTreeSet<Protocol>>,
}

impl SnapshotInterface {
    fn from_observation(obs: &RawObservation) -> Self {
        let mut interface = Self {
            ip: obs.ip,
            hostname: None,
            protocols: BTreeSet::new(),
            services: BTreeSet::new(),
            confidence: obs.confidence,
            observed_at: obs.observed_at,
            advertised_peers: BTreeMap::new(),
        };
        interface.absorb(obs);
        interface
    }

    /// Fold another observation of the same address in.
    pub fn absorb(&mut self, obs: &RawObservation) {
        self.protocols.insert(obs.protocol);
        if let Some(service) = &obs.metadata.service_type {
            self.services.insert(service.clone());
        }
        if self.hostname.is_none() {
            self.hostname = obs.metadata.hostname.clone();
        }
        if let Some(peer) = obs.metadata.advertised_peer.filter(|p| *p != obs.ip) {
            self.advertised_peers.entry(peer).or_default().insert(obs.protocol);
        }
        self.confidence = self.confidence.max(obs.confidence);
        self.observed_at = self.observed_at.max(obs.observed_at);
    }
}

/// A candidate device: one MAC, or one IP when no MAC was seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotDevice {
    pub mac: Option<MacAddress>,
    pub interfaces: BTreeMap<IpAddr, SnapshotInterface>,
}

impl SnapshotDevice {
    fn with_mac(mac: MacAddress) -> Self {
        Self {
            mac: Some(mac),
            interfaces: BTreeMap::new(),
        }
    }

    /// First hostname any interface reported.
    pub fn hostname(&self) -> Option<&str> {
        self.interfaces.values().find_map(|i| i.hostname.as_deref())
    }

    pub fn confidence(&self) -> f64 {
        self.interfaces
            .values()
            .map(|i| i.confidence)
            .fold(0.0, f64::max)
    }

    pub fn protocols(&self) -> BTreeSet<Protocol> {
        self.interfaces
            .values()
            .flat_map(|i| i.protocols.iter().copied())
            .collect()
    }

    fn observe(&mut self, obs: &RawObservation) {
        self.interfaces
            .entry(obs.ip)
            .and_modify(|i| i.absorb(obs))
            .or_insert_with(|| SnapshotInterface::from_observation(obs));
    }
}

/// Two MACs claimed one IP; the loser's claim was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpConflict {
    pub ip: IpAddr,
    pub winner: MacAddress,
    pub loser: MacAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSnapshot {
    /// MAC devices by MAC, then MAC-less devices by IP.
    pub devices: Vec<SnapshotDevice>,
    pub conflicts: Vec<IpConflict>,
    pub observation_count: usize,
}

impl ScanSnapshot {
    pub fn interfaces(&self) -> impl Iterator<Item = &SnapshotInterface> {
        self.devices.iter().flat_map(|d| d.interfaces.values())
    }
}

/// Build the snapshot for one job.
pub fn assemble(observations: &[RawObservation]) -> ScanSnapshot {
    let mut by_mac: BTreeMap<MacAddress, SnapshotDevice> = BTreeMap::new();
    let mut mac_less = Vec::new();

    for obs in observations {
        match obs.mac {
            Some(mac) => by_mac
                .entry(mac)
                .or_insert_with(|| SnapshotDevice::with_mac(mac))
                .observe(obs),
            None => mac_less.push(obs),
        }
    }

    let conflicts = resolve_conflicts(&mut by_mac);

    let ip_owner: BTreeMap<IpAddr, MacAddress> = by_mac
        .iter()
        .flat_map(|(mac, d)| d.interfaces.keys().map(move |ip| (*ip, *mac)))
        .collect();

    let mut by_ip: BTreeMap<IpAddr, SnapshotDevice> = BTreeMap::new();
    for obs in mac_less {
        let owner = ip_owner.get(&obs.ip).and_then(|mac| by_mac.get_mut(mac));
        match owner {
            Some(device) => device.observe(obs),
            None => by_ip
                .entry(obs.ip)
                .or_insert_with(|| SnapshotDevice {
                    mac: None,
                    interfaces: BTreeMap::new(),
                })
                .observe(obs),
        }
    }

    let devices = by_mac.into_values().chain(by_ip.into_values()).collect();
    ScanSnapshot {
        devices,
        conflicts,
        observation_count: observations.len(),
    }
}

/// Keep each IP on exactly one MAC device: highest confidence, then the
/// later sighting, then the lower MAC.
fn resolve_conflicts(by_mac: &mut BTreeMap<MacAddress, SnapshotDevice>) -> Vec<IpConflict> {
    let mut claims: BTreeMap<IpAddr, Vec<(MacAddress, f64, DateTime<Utc>)>> = BTreeMap::new();
    for (mac, device) in by_mac.iter() {
        for interface in device.interfaces.values() {
            claims
                .entry(interface.ip)
                .or_default()
                .push((*mac, interface.confidence, interface.observed_at));
        }
    }

    let mut conflicts = Vec::new();
    for (ip, mut claimants) in claims {
        if claimants.len() < 2 {
            continue;
        }
        claimants.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        let winner = claimants[0].0;
        for (loser, _, _) in &claimants[1..] {
            let lost = by_mac
                .get_mut(loser)
                .and_then(|d| d.interfaces.remove(&ip));
            // Same IP, so the services seen on it still apply.
            if let (Some(lost), Some(kept)) = (
                lost,
                by_mac
                    .get_mut(&winner)
                    .and_then(|d| d.interfaces.get_mut(&ip)),
            ) {
                kept.services.extend(lost.services);
            }
            tracing::warn!(ip = %ip, winner = %winner, loser = %loser, "IP claimed by two MACs");
            conflicts.push(IpConflict {
                ip,
                winner,
                loser: *loser,
            });
        }
    }
    conflicts
}

/// OUI database, loaded on first lookup.
static OUI_DB: OnceLock<Option<Oui>> = OnceLock::new();

fn oui_db() -> Option<&'static Oui> {
    OUI_DB
        .get_or_init(|| match Oui::default() {
            Ok(db) => Some(db),
            Err(e) => {
                tracing::warn!(error = ?e, "OUI database unavailable; vendors will be empty");
                None
            }
        })
        .as_ref()
}

/// Vendor label for a MAC. Locally administered addresses are randomized or
/// virtual and have no registered vendor.
pub fn vendor_for(mac: &MacAddress) -> Option<String> {
    if mac.is_locally_administered() {
        return Some("Locally administered".to_string());
    }
    match oui_db()?.lookup_by_mac(&mac.to_string()) {
        Ok(Some(entry)) => Some(entry.company_name.clone()),
        _ => None,
    }
}
