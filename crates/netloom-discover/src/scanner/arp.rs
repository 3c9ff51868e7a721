//! ARP sweep over the local Ethernet segment.
//!
//! Requests go out through the rate limiter in rounds; a blocking receiver
//! thread reads replies off the datalink channel until the scan ends. Only
//! targets inside the chosen interface's IPv4 network are probed.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use netloom_core::{AddressTarget, MacAddress, Protocol, RawObservation, TargetSet};
use parking_lot::Mutex;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;

use super::{ScanContext, ScanError, ScanStats, Scanner};

const BROADCAST_MAC: MacAddr = MacAddr(0xff, 0xff, 0xff, 0xff, 0xff, 0xff);
const FRAME_LEN: usize = 42;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// The local interface an ARP sweep runs on.
struct LocalLink {
    interface: NetworkInterface,
    ip: Ipv4Addr,
    mac: MacAddr,
    network: Ipv4Net,
}

#[derive(Debug, Default)]
pub struct ArpScanner;

impl ArpScanner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Scanner for ArpScanner {
    fn protocol(&self) -> Protocol {
        Protocol::Arp
    }

    async fn preflight(&self, targets: &TargetSet) -> Result<(), ScanError> {
        let link = select_link(targets)?;
        // Opening the channel is the privileged step; drop it straight away.
        open_channel(&link.interface)?;
        tracing::debug!(
            interface = %link.interface.name,
            network = %link.network,
            "ARP preflight ok"
        );
        Ok(())
    }

    async fn scan(&self, ctx: ScanContext) -> Result<ScanStats, ScanError> {
        let link = select_link(&ctx.targets)?;
        let (mut tx, rx) = open_channel(&link.interface)?;

        let targets: Vec<Ipv4Addr> = ctx
            .targets
            .hosts()
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) if link.network.contains(&v4) && v4 != link.ip => Some(v4),
                _ => None,
            })
            .collect();
        let wanted: HashSet<Ipv4Addr> = targets.iter().copied().collect();
        let found = Arc::new(Mutex::new(HashSet::new()));
        let stop = ctx.cancel.child_token();

        tracing::info!(
            interface = %link.interface.name,
            hosts = targets.len(),
            "ARP sweep started"
        );

        let receiver = {
            let found = Arc::clone(&found);
            let stop = stop.clone();
            let sink = ctx.sink.clone();
            let deadline = ctx.deadline.into_std();
            tokio::task::spawn_blocking(move || {
                receive_replies(rx, wanted, found, sink, stop, deadline)
            })
        };

        let mut stats = ScanStats::default();
        'rounds: for round in 0..ctx.retry.attempts() {
            if round > 0 && !ctx.pause(ctx.retry.delay(round)).await {
                break;
            }

            let pending: Vec<Ipv4Addr> = {
                let found = found.lock();
                targets.iter().filter(|ip| !found.contains(ip)).copied().collect()
            };
            if pending.is_empty() {
                break;
            }
            tracing::debug!(round, pending = pending.len(), "ARP round");

            for target in pending {
                if ctx.is_done() {
                    break 'rounds;
                }
                let permit = match ctx.limiter.acquire(1, ctx.deadline).await {
                    Ok(permit) => permit,
                    Err(_) => break 'rounds,
                };
                let frame = request_frame(link.mac, link.ip, target);
                match tx.send_to(&frame, None) {
                    Some(Err(e)) => {
                        tracing::debug!(target = %target, error = %e, "ARP send failed");
                    }
                    _ => {
                        permit.spend();
                        stats.probes_sent += 1;
                    }
                }
            }

            // Give this round's replies time to arrive.
            if !ctx.pause(ctx.probe_timeout).await {
                break;
            }
        }

        stats.truncated = ctx.is_done();
        stop.cancel();
        let discarded = receiver
            .await
            .map_err(|e| ScanError::Io(std::io::Error::other(e)))?;

        let responded = found.lock().len() as u64;
        stats.responses = responded;
        stats.discarded = discarded;
        stats.unreachable = (targets.len() as u64).saturating_sub(responded);

        tracing::info!(
            probes = stats.probes_sent,
            responses = stats.responses,
            "ARP sweep finished"
        );
        Ok(stats)
    }
}

/// Blocking receive loop. Returns the number of replies from outside the
/// target set.
fn receive_replies(
    mut rx: Box<dyn DataLinkReceiver>,
    wanted: HashSet<Ipv4Addr>,
    found: Arc<Mutex<HashSet<Ipv4Addr>>>,
    sink: tokio::sync::mpsc::Sender<RawObservation>,
    stop: tokio_util::sync::CancellationToken,
    deadline: std::time::Instant,
) -> u64 {
    let mut discarded = 0;

    while !stop.is_cancelled() && std::time::Instant::now() < deadline {
        let frame = match rx.next() {
            Ok(frame) => frame,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(e) => {
                tracing::warn!(error = %e, "ARP receive failed, stopping receiver");
                break;
            }
        };

        let Some((ip, mac)) = parse_reply(frame) else {
            continue;
        };
        if !wanted.contains(&ip) {
            tracing::debug!(ip = %ip, "ARP reply outside targets discarded");
            discarded += 1;
            continue;
        }
        if !found.lock().insert(ip) {
            continue;
        }

        let observation = RawObservation::new(Protocol::Arp, IpAddr::V4(ip), Some(mac));
        if sink.blocking_send(observation).is_err() {
            break;
        }
    }

    discarded
}

fn select_link(targets: &TargetSet) -> Result<LocalLink, ScanError> {
    for interface in datalink::interfaces() {
        if interface.is_loopback() || !interface.is_up() {
            continue;
        }
        let mac = match interface.mac {
            Some(mac) if mac != MacAddr::zero() => mac,
            _ => continue,
        };

        let candidate = interface.ips.iter().find_map(|net| match net.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_link_local() && net.prefix() > 0 => {
                Ipv4Net::new(ip, net.prefix()).ok().map(|n| (ip, n.trunc()))
            }
            _ => None,
        });
        let Some((ip, network)) = candidate else {
            continue;
        };

        if targets.targets().iter().any(|t| overlaps(t, &network)) {
            return Ok(LocalLink {
                interface,
                ip,
                mac,
                network,
            });
        }
    }

    Err(ScanError::NoInterface {
        protocol: Protocol::Arp,
        reason: "no up interface has an IPv4 network overlapping the targets".into(),
    })
}

fn overlaps(target: &AddressTarget, network: &Ipv4Net) -> bool {
    match target {
        AddressTarget::Host(IpAddr::V4(ip)) => network.contains(ip),
        AddressTarget::Cidr(IpNet::V4(net)) => {
            network.contains(&net.network()) || net.contains(&network.network())
        }
        _ => false,
    }
}

fn open_channel(
    interface: &NetworkInterface,
) -> Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>), ScanError> {
    let config = datalink::Config {
        read_timeout: Some(READ_TIMEOUT),
        ..Default::default()
    };
    match datalink::channel(interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => Ok((tx, rx)),
        Ok(_) => Err(ScanError::NoInterface {
            protocol: Protocol::Arp,
            reason: format!("{} is not an Ethernet channel", interface.name),
        }),
        Err(e) => Err(ScanError::from_io(Protocol::Arp, e)),
    }
}

fn request_frame(source_mac: MacAddr, source_ip: Ipv4Addr, target_ip: Ipv4Addr) -> [u8; FRAME_LEN] {
    let mut buffer = [0u8; FRAME_LEN];

    if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer[..14]) {
        ethernet.set_destination(BROADCAST_MAC);
        ethernet.set_source(source_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
    }

    if let Some(mut arp) = MutableArpPacket::new(&mut buffer[14..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }

    buffer
}

/// Sender IP and MAC of an ARP reply frame.
fn parse_reply(frame: &[u8]) -> Option<(Ipv4Addr, MacAddress)> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }
    let MacAddr(a, b, c, d, e, f) = arp.get_sender_hw_addr();
    Some((arp.get_sender_proto_addr(), MacAddress([a, b, c, d, e, f])))
}
