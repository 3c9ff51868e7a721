//! Graph merge: fold one job's snapshot into the tenant's prior graph.
//!
//! Pure and deterministic. Identity is anchored on the MAC when there is
//! one; otherwise on a recent IP match, otherwise on a synthetic key. An IP
//! moves between devices only through an explicit [`Migration`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use netloom_core::{
    Device, DeviceId, DeviceKey, DeviceStatus, Interface, InterfaceRef, Link, LinkKey, LinkKind,
    Protocol, TargetSet, TopologyGraph,
};
use serde::Serialize;

use crate::config::MergePolicy;
use crate::resolve::{vendor_for, ScanSnapshot, SnapshotDevice};

/// What the job covered.
#[derive(Debug, Clone)]
pub struct MergeScope<'a> {
    pub targets: &'a TargetSet,
    /// Every selected protocol ran to completion. Absence only counts
    /// against a device when this is set.
    pub complete: bool,
    /// Explicit gateway for link inference.
    pub gateway: Option<IpAddr>,
}

/// An IP that moved from one device to another in this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub ip: IpAddr,
    pub from: DeviceId,
    pub to: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub device_id: DeviceId,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub graph: TopologyGraph,
    pub migrations: Vec<Migration>,
    /// Devices observed in this job.
    pub seen: BTreeSet<DeviceId>,
    pub transitions: Vec<Transition>,
}

/// One interface observed in this job, after identity resolution.
struct Sighting {
    device_id: DeviceId,
    confidence: f64,
    protocols: BTreeSet<Protocol>,
}

pub fn merge(
    prior: &TopologyGraph,
    snapshot: &ScanSnapshot,
    scope: &MergeScope<'_>,
    policy: &MergePolicy,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut graph = prior.clone();
    let tenant_id = graph.tenant_id;

    // 1. MAC-bearing devices.
    let mut claimed = BTreeSet::new();
    let mut assignments: Vec<(DeviceId, &SnapshotDevice)> = Vec::new();
    for candidate in snapshot.devices.iter() {
        let Some(mac) = candidate.mac else { continue };
        let id = match graph.device_by_mac(&mac) {
            Some(device) => device.id,
            None => {
                let device = Device::new(&tenant_id, DeviceKey::Mac(mac), now);
                let id = device.id;
                graph.devices.insert(id, device);
                id
            }
        };
        claimed.insert(id);
        assignments.push((id, candidate));
    }

    // 2. MAC-less devices.
    let retention = policy.ip_retention();
    for candidate in snapshot.devices.iter().filter(|d| d.mac.is_none()) {
        let Some(&ip) = candidate.interfaces.keys().next() else {
            continue;
        };
        let by_ip = graph
            .devices
            .values()
            .filter(|d| !claimed.contains(&d.id))
            .find(|d| {
                d.interfaces
                    .get(&ip)
                    .is_some_and(|i| now - i.last_seen <= retention)
            })
            .map(|d| d.id);

        let id = match by_ip {
            Some(id) => id,
            None => {
                let fingerprint = candidate
                    .hostname()
                    .map(str::to_string)
                    .or_else(|| {
                        candidate
                            .interfaces
                            .values()
                            .find_map(|i| i.services.iter().next().cloned())
                    });
                let key = DeviceKey::synthetic(ip, fingerprint.as_deref());
                let id = DeviceId::derive(&tenant_id, &key);
                graph
                    .devices
                    .entry(id)
                    .or_insert_with(|| Device::new(&tenant_id, key, now));
                id
            }
        };
        assignments.push((id, candidate));
    }

    // 3. Refresh what was seen. Several MAC-less candidates can land on one
    // device, so pruning waits until every candidate has been folded in.
    let mut observed: BTreeMap<DeviceId, BTreeSet<IpAddr>> = BTreeMap::new();
    for (id, candidate) in &assignments {
        observed
            .entry(*id)
            .or_default()
            .extend(candidate.interfaces.keys().copied());
        if let Some(device) = graph.devices.get_mut(id) {
            refresh(device, candidate, now);
        }
    }
    // A full scan that no longer sees an address in range means it moved.
    if scope.complete {
        for (id, ips) in &observed {
            if let Some(device) = graph.devices.get_mut(id) {
                device
                    .interfaces
                    .retain(|ip, _| !scope.targets.contains(ip) || ips.contains(ip));
            }
        }
    }
    let seen: BTreeSet<DeviceId> = observed.keys().copied().collect();

    // 4. Each observed IP lives on exactly one device.
    let mut migrations = Vec::new();
    for (id, candidate) in &assignments {
        for ip in candidate.interfaces.keys() {
            for other in graph.devices.values_mut() {
                if other.id != *id && other.interfaces.remove(ip).is_some() {
                    tracing::info!(ip = %ip, from = %other.id, to = %id, "IP migrated");
                    migrations.push(Migration {
                        ip: *ip,
                        from: other.id,
                        to: *id,
                    });
                }
            }
        }
    }

    // 5. Ageing.
    let mut transitions = Vec::new();
    if scope.complete {
        for device in graph.devices.values_mut() {
            if seen.contains(&device.id) || device.status == DeviceStatus::Removed {
                continue;
            }
            let in_scope = device.interfaces.is_empty()
                || device.interfaces.keys().any(|ip| scope.targets.contains(ip));
            if !in_scope {
                continue;
            }
            device.missed_scans += 1;

            let from = device.status;
            if from == DeviceStatus::Active && device.missed_scans >= policy.stale_after {
                device.status = DeviceStatus::Stale;
            } else if from == DeviceStatus::Stale
                && device.missed_scans >= policy.remove_after
                && now - device.last_seen >= policy.removal_grace()
            {
                device.status = DeviceStatus::Removed;
            }
            if device.status != from {
                tracing::info!(device_id = %device.id, from = %from, to = %device.status, "Device aged");
                transitions.push(Transition {
                    device_id: device.id,
                    from,
                    to: device.status,
                });
            }
        }
    }

    // 6. Links.
    let sightings = sightings(&graph, &assignments);
    infer_links(&mut graph, snapshot, &sightings, scope, policy, now);

    MergeOutcome {
        graph,
        migrations,
        seen,
        transitions,
    }
}

fn refresh(device: &mut Device, candidate: &SnapshotDevice, now: DateTime<Utc>) {
    device.last_seen = now;
    device.status = DeviceStatus::Active;
    device.missed_scans = 0;
    device.confidence = candidate.confidence();
    if let Some(hostname) = candidate.hostname() {
        device.hostname = Some(hostname.to_string());
    }
    if device.vendor.is_none() {
        device.vendor = device.mac.as_ref().and_then(vendor_for);
    }

    for (ip, observed) in &candidate.interfaces {
        let interface = device
            .interfaces
            .entry(*ip)
            .or_insert_with(|| Interface::new(*ip, now));
        interface.protocols.extend(observed.protocols.iter().copied());
        interface.services.extend(observed.services.iter().cloned());
        if observed.hostname.is_some() {
            interface.name = observed.hostname.clone();
        }
        interface.confidence = observed.confidence;
        interface.last_seen = now;
    }
}

fn sightings(
    graph: &TopologyGraph,
    assignments: &[(DeviceId, &SnapshotDevice)],
) -> BTreeMap<IpAddr, Sighting> {
    let mut out = BTreeMap::new();
    for (id, candidate) in assignments {
        let Some(device) = graph.devices.get(id) else { continue };
        for (ip, observed) in &candidate.interfaces {
            if device.interfaces.contains_key(ip) {
                out.insert(
                    *ip,
                    Sighting {
                        device_id: *id,
                        confidence: observed.confidence,
                        protocols: observed.protocols.clone(),
                    },
                );
            }
        }
    }
    out
}

fn infer_links(
    graph: &mut TopologyGraph,
    snapshot: &ScanSnapshot,
    sightings: &BTreeMap<IpAddr, Sighting>,
    scope: &MergeScope<'_>,
    policy: &MergePolicy,
    now: DateTime<Utc>,
) {
    let known_since: BTreeMap<LinkKey, DateTime<Utc>> =
        graph.links.iter().map(|(k, l)| (*k, l.first_seen)).collect();

    // Links whose endpoints no longer exist go regardless.
    let endpoints: BTreeSet<InterfaceRef> = graph
        .interfaces()
        .map(|(device_id, i)| InterfaceRef { device_id, ip: i.ip })
        .collect();
    graph
        .links
        .retain(|key, _| endpoints.contains(&key.a) && endpoints.contains(&key.b));

    if scope.complete {
        graph
            .links
            .retain(|key, _| !(scope.targets.contains(&key.a.ip) && scope.targets.contains(&key.b.ip)));
    }

    let endpoint = |ip: &IpAddr, s: &Sighting| InterfaceRef {
        device_id: s.device_id,
        ip: *ip,
    };
    let mut inferred: BTreeMap<LinkKey, (LinkKind, f64, BTreeSet<Protocol>)> = BTreeMap::new();

    for net in scope.targets.networks() {
        let gateway = scope
            .gateway
            .filter(|g| net.contains(g))
            .or_else(|| first_host(&net));
        let Some((gw_ip, gw)) = gateway.and_then(|g| sightings.get_key_value(&g)) else {
            continue;
        };
        for (ip, member) in sightings.iter().filter(|(ip, _)| *ip != gw_ip && net.contains(*ip)) {
            let key = LinkKey::new(endpoint(gw_ip, gw), endpoint(ip, member));
            let protocols = gw.protocols.union(&member.protocols).copied().collect();
            inferred.insert(
                key,
                (LinkKind::SubnetGateway, gw.confidence * member.confidence, protocols),
            );
        }
    }

    for interface in snapshot.interfaces() {
        let Some(source) = sightings.get(&interface.ip) else { continue };
        for (peer, protocols) in &interface.advertised_peers {
            let Some(owner) = graph.owner_of_ip(peer) else { continue };
            let key = LinkKey::new(
                endpoint(&interface.ip, source),
                InterfaceRef { device_id: owner, ip: *peer },
            );
            let entry = inferred.entry(key).or_insert_with(|| {
                (LinkKind::Advertised, policy.advertised_link_confidence, BTreeSet::new())
            });
            entry.1 = entry.1.max(policy.advertised_link_confidence);
            entry.2.extend(protocols.iter().copied());
        }
    }

    for (key, (kind, confidence, protocols)) in inferred {
        let first_seen = known_since.get(&key).copied().unwrap_or(now);
        graph.links.insert(
            key,
            Link {
                key,
                kind,
                confidence,
                protocols,
                first_seen,
                last_seen: now,
            },
        );
    }
}

/// The conventional gateway address of a network.
fn first_host(net: &IpNet) -> Option<IpAddr> {
    match net {
        IpNet::V4(n) => n.hosts().next().map(IpAddr::V4),
        // Skip the subnet-router anycast address.
        IpNet::V6(n) => n.hosts().nth(1).map(IpAddr::V6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use netloom_core::{MacAddress, RawObservation, ServiceMetadata, TenantId};
    use uuid::Uuid;

    use crate::resolve::assemble;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn arp(addr: &str, hw: &str) -> RawObservation {
        RawObservation::new(Protocol::Arp, ip(addr), Some(mac(hw))).at(t0())
    }

    fn icmp(addr: &str) -> RawObservation {
        RawObservation::new(Protocol::Icmp, ip(addr), None).at(t0())
    }

    fn targets() -> TargetSet {
        TargetSet::parse(&["192.168.1.0/24"]).unwrap()
    }

    fn run(
        prior: &TopologyGraph,
        observations: &[RawObservation],
        targets: &TargetSet,
        complete: bool,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        let scope = MergeScope {
            targets,
            complete,
            gateway: None,
        };
        merge(prior, &assemble(observations), &scope, &MergePolicy::default(), now)
    }

    #[test]
    fn new_devices_get_vendor_and_gateway_links() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let out = run(
            &prior,
            &[
                arp("192.168.1.1", "00:00:0c:00:00:01"),
                arp("192.168.1.20", "b8:27:eb:00:00:20"),
                icmp("192.168.1.30"),
            ],
            &targets(),
            true,
            t0(),
        );

        assert_eq!(out.graph.devices.len(), 3);
        assert_eq!(out.seen.len(), 3);
        let pi = out.graph.device_by_mac(&mac("b8:27:eb:00:00:20")).unwrap();
        assert!(pi.vendor.as_deref().is_some_and(|v| v.contains("Raspberry")));

        // .20 and .30 both hang off the .1 gateway.
        assert_eq!(out.graph.links.len(), 2);
        assert!(out
            .graph
            .links
            .values()
            .all(|l| l.kind == LinkKind::SubnetGateway && l.key.touches(&ip("192.168.1.1"))));
    }

    #[test]
    fn full_rescan_keeps_link_first_seen() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let observations = [
            arp("192.168.1.1", "00:00:0c:00:00:01"),
            arp("192.168.1.20", "b8:27:eb:00:00:20"),
        ];
        let first = run(&prior, &observations, &targets(), true, t0());
        let later = t0() + Duration::hours(2);
        let second = run(&first.graph, &observations, &targets(), true, later);

        let link = second.graph.links.values().next().unwrap();
        assert_eq!(second.graph.links.len(), 1);
        assert_eq!(link.first_seen, t0());
        assert_eq!(link.last_seen, later);
    }

    #[test]
    fn mac_identity_survives_ip_change() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let first = run(&prior, &[arp("192.168.1.20", "00:11:22:33:44:55")], &targets(), true, t0());
        let id = first.graph.device_by_mac(&mac("00:11:22:33:44:55")).unwrap().id;

        let later = t0() + Duration::hours(1);
        let second = run(
            &first.graph,
            &[arp("192.168.1.21", "00:11:22:33:44:55")],
            &targets(),
            true,
            later,
        );
        let device = &second.graph.devices[&id];
        assert_eq!(second.graph.devices.len(), 1);
        assert_eq!(device.interfaces.keys().copied().collect::<Vec<_>>(), vec![ip("192.168.1.21")]);
        assert_eq!(device.first_seen, t0());
    }

    #[test]
    fn ip_taken_by_another_mac_is_a_migration() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let first = run(&prior, &[arp("192.168.1.50", "00:11:22:00:00:01")], &targets(), false, t0());
        let old = first.graph.device_by_mac(&mac("00:11:22:00:00:01")).unwrap().id;

        // A partial job: the old holder is not pruned, so the IP must migrate.
        let second = run(
            &first.graph,
            &[arp("192.168.1.50", "00:11:22:00:00:02")],
            &targets(),
            false,
            t0() + Duration::minutes(5),
        );
        let new = second.graph.device_by_mac(&mac("00:11:22:00:00:02")).unwrap().id;
        assert_eq!(
            second.migrations,
            vec![Migration { ip: ip("192.168.1.50"), from: old, to: new }]
        );
        assert!(second.graph.devices[&old].interfaces.is_empty());
        assert_eq!(second.graph.owner_of_ip(&ip("192.168.1.50")), Some(new));
    }

    #[test]
    fn mac_less_observation_matches_recent_ip() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let first = run(&prior, &[arp("192.168.1.7", "00:11:22:00:00:07")], &targets(), true, t0());

        // ARP missed it this time, ICMP still answered.
        let second = run(&first.graph, &[icmp("192.168.1.7")], &targets(), true, t0() + Duration::hours(1));
        assert_eq!(second.graph.devices.len(), 1);
        let device = second.graph.devices.values().next().unwrap();
        assert_eq!(device.missed_scans, 0);
        assert_eq!(
            device.interfaces[&ip("192.168.1.7")].protocols,
            BTreeSet::from([Protocol::Arp, Protocol::Icmp])
        );

        // Past the retention window it is a different, synthetic device.
        let third = run(&first.graph, &[icmp("192.168.1.7")], &targets(), true, t0() + Duration::days(2));
        assert_eq!(third.graph.devices.len(), 2);
        assert_eq!(third.migrations.len(), 1);
    }

    #[test]
    fn mac_less_rescan_keeps_every_interface_of_a_multihomed_device() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let first = run(
            &prior,
            &[arp("192.168.1.7", "00:11:22:00:00:07"), arp("192.168.1.8", "00:11:22:00:00:07")],
            &targets(),
            true,
            t0(),
        );
        let id = first.graph.device_by_mac(&mac("00:11:22:00:00:07")).unwrap().id;
        assert_eq!(first.graph.devices[&id].interfaces.len(), 2);

        let second = run(
            &first.graph,
            &[icmp("192.168.1.7"), icmp("192.168.1.8")],
            &targets(),
            true,
            t0() + Duration::hours(1),
        );
        assert_eq!(second.graph.devices.len(), 1);
        assert_eq!(
            second.graph.devices[&id].interfaces.keys().copied().collect::<Vec<_>>(),
            vec![ip("192.168.1.7"), ip("192.168.1.8")]
        );
        assert!(second.migrations.is_empty());
    }

    #[test]
    fn staleness_ages_each_step_once() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let mut graph = run(&prior, &[arp("192.168.1.9", "00:11:22:00:00:09")], &targets(), true, t0()).graph;
        let policy = MergePolicy::default();

        let mut transitions = Vec::new();
        for n in 1..=(policy.remove_after + 2) {
            let out = run(&graph, &[], &targets(), true, t0() + Duration::hours(i64::from(n)));
            transitions.extend(out.transitions.into_iter().map(|t| (t.from, t.to)));
            graph = out.graph;
        }
        assert_eq!(
            transitions,
            vec![
                (DeviceStatus::Active, DeviceStatus::Stale),
                (DeviceStatus::Stale, DeviceStatus::Removed),
            ]
        );
    }

    #[test]
    fn partial_jobs_do_not_age() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let mut graph = run(&prior, &[arp("192.168.1.9", "00:11:22:00:00:09")], &targets(), true, t0()).graph;
        for n in 1..=10 {
            graph = run(&graph, &[], &targets(), false, t0() + Duration::hours(n)).graph;
        }
        let device = graph.devices.values().next().unwrap();
        assert_eq!(device.status, DeviceStatus::Active);
        assert_eq!(device.missed_scans, 0);
    }

    #[test]
    fn out_of_scope_devices_are_left_alone() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let graph = run(&prior, &[arp("10.9.0.5", "00:11:22:00:00:05")], &TargetSet::parse(&["10.9.0.0/24"]).unwrap(), true, t0()).graph;
        let out = run(&graph, &[], &targets(), true, t0() + Duration::hours(1));
        assert_eq!(out.graph.devices.values().next().unwrap().missed_scans, 0);
    }

    #[test]
    fn advertised_peer_links_to_owner() {
        let prior = TopologyGraph::new(TenantId(Uuid::nil()));
        let ssdp = RawObservation::new(Protocol::Ssdp, ip("192.168.1.60"), None)
            .at(t0())
            .with_metadata(ServiceMetadata {
                advertised_peer: Some(ip("192.168.1.70")),
                ..Default::default()
            });
        let out = run(
            &prior,
            &[arp("192.168.1.70", "00:11:22:00:00:70"), ssdp],
            &TargetSet::parse(&["192.168.1.60", "192.168.1.70"]).unwrap(),
            true,
            t0(),
        );
        assert_eq!(out.graph.links.len(), 1);
        let link = out.graph.links.values().next().unwrap();
        assert_eq!(link.kind, LinkKind::Advertised);
        assert_eq!(link.confidence, MergePolicy::default().advertised_link_confidence);
        assert_eq!(link.protocols, BTreeSet::from([Protocol::Ssdp]));
    }

    #[test]
    fn first_host_per_family() {
        assert_eq!(first_host(&"192.168.1.0/24".parse().unwrap()), Some(ip("192.168.1.1")));
        assert_eq!(first_host(&"fd00::/64".parse().unwrap()), Some(ip("fd00::1")));
    }
}
