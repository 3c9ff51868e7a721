//! Job runner tests against scripted scanners and the in-memory store.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use netloom_core::{
    ChangeSet, DeviceStatus, JobStatus, MacAddress, Protocol, RawObservation, ScanJob,
    ServiceMetadata, TargetSet, TenantId, TopologyGraph,
};
use netloom_discover::config::{Limits, MergePolicy, RetryPolicy};
use netloom_discover::orchestrator::Orchestrator;
use netloom_discover::queue::{self, JobSource};
use netloom_discover::report::{ChangeReporter, ReportError, ReportMeta};
use netloom_discover::runner::JobRunner;
use netloom_discover::scanner::{ScanContext, ScanError, ScanStats, Scanner, ScannerRegistry};
use netloom_graph::{GraphStore, MemoryStore, StoreError};

// ── Fixtures ──────────────────────────────────────────────────────

/// Emits a fixed list of observations, or is denied at preflight.
struct Scripted {
    protocol: Protocol,
    observations: Vec<RawObservation>,
    denied: bool,
}

impl Scripted {
    fn emitting(protocol: Protocol, observations: Vec<RawObservation>) -> Self {
        Self {
            protocol,
            observations,
            denied: false,
        }
    }

    fn denied(protocol: Protocol) -> Self {
        Self {
            protocol,
            observations: Vec::new(),
            denied: true,
        }
    }
}

#[async_trait]
impl Scanner for Scripted {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn preflight(&self, _targets: &TargetSet) -> Result<(), ScanError> {
        if self.denied {
            return Err(ScanError::PrivilegeDenied {
                protocol: self.protocol,
                reason: "operation not permitted".into(),
            });
        }
        Ok(())
    }

    async fn scan(&self, ctx: ScanContext) -> Result<ScanStats, ScanError> {
        for observation in &self.observations {
            ctx.emit(observation.clone()).await;
        }
        Ok(ScanStats {
            probes_sent: 254,
            responses: self.observations.len() as u64,
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct Recording {
    reports: Mutex<Vec<(ChangeSet, ReportMeta)>>,
}

#[async_trait]
impl ChangeReporter for Recording {
    async fn report(&self, changes: &ChangeSet, meta: &ReportMeta) -> Result<(), ReportError> {
        self.reports.lock().push((changes.clone(), meta.clone()));
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl ChangeReporter for Failing {
    async fn report(&self, _: &ChangeSet, _: &ReportMeta) -> Result<(), ReportError> {
        Err(ReportError::Failed("webhook returned 503".into()))
    }
}

/// Wraps a `MemoryStore` and never answers the chosen call.
struct Stalled {
    inner: MemoryStore,
    stall_load: bool,
}

#[async_trait]
impl GraphStore for Stalled {
    async fn load(&self, tenant_id: &TenantId) -> Result<TopologyGraph, StoreError> {
        if self.stall_load {
            std::future::pending::<()>().await;
        }
        self.inner.load(tenant_id).await
    }

    async fn commit(
        &self,
        tenant_id: &TenantId,
        graph: &TopologyGraph,
        changes: &ChangeSet,
    ) -> Result<(), StoreError> {
        if !self.stall_load {
            std::future::pending::<()>().await;
        }
        self.inner.commit(tenant_id, graph, changes).await
    }
}

fn arp(ip: &str, mac: &str) -> RawObservation {
    RawObservation::new(Protocol::Arp, ip.parse().unwrap(), Some(mac.parse().unwrap()))
}

fn icmp(ip: &str) -> RawObservation {
    RawObservation::new(Protocol::Icmp, ip.parse().unwrap(), None)
}

fn mdns(ip: &str, hostname: &str) -> RawObservation {
    RawObservation::new(Protocol::Mdns, ip.parse().unwrap(), None).with_metadata(ServiceMetadata {
        hostname: Some(hostname.to_string()),
        service_type: Some("_ipp._tcp.local".to_string()),
        ..Default::default()
    })
}

fn job(tenant_id: TenantId, protocols: &[Protocol]) -> ScanJob {
    let mut job = ScanJob::new(
        tenant_id,
        TargetSet::parse(&["192.168.1.0/24"]).unwrap(),
        protocols.iter().copied().collect::<BTreeSet<_>>(),
    );
    job.protocol_timeout = Duration::from_secs(5);
    job.deadline = Duration::from_secs(10);
    job
}

fn runner_with(
    scanners: Vec<Scripted>,
    store: Arc<dyn GraphStore>,
    reporter: Arc<dyn ChangeReporter>,
    policy: MergePolicy,
) -> JobRunner {
    let mut registry = ScannerRegistry::new();
    for scanner in scanners {
        registry.register(Arc::new(scanner));
    }
    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        RetryPolicy::default(),
        Duration::from_millis(100),
    )
    .with_grace(Duration::from_millis(50));
    JobRunner::new(
        store,
        reporter,
        orchestrator,
        policy,
        Limits {
            max_hosts_per_job: 65_536,
        },
    )
}

fn runner(scanners: Vec<Scripted>, store: Arc<MemoryStore>) -> JobRunner {
    runner_with(
        scanners,
        store,
        Arc::new(Recording::default()),
        MergePolicy::default(),
    )
}

fn mac(s: &str) -> MacAddress {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn arp_and_icmp_into_empty_graph_adds_three_devices() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let runner = runner(
        vec![
            Scripted::emitting(
                Protocol::Arp,
                vec![
                    arp("192.168.1.1", "00:11:22:33:44:01"),
                    arp("192.168.1.20", "00:11:22:33:44:55"),
                ],
            ),
            Scripted::emitting(Protocol::Icmp, vec![icmp("192.168.1.30")]),
        ],
        store.clone(),
    );

    let report = runner.run(&job(tenant_id, &[Protocol::Arp, Protocol::Icmp])).await;

    assert_eq!(report.status, JobStatus::Success);
    assert!(report.warnings.is_empty());
    let changes = report.change_set.unwrap();
    let summary = changes.summary();
    assert_eq!(summary.devices_added, 3);
    assert_eq!(summary.devices_modified, 0);
    assert_eq!(summary.devices_removed, 0);
    assert_eq!(changes.meta.total_observations, 3);
    assert!(!changes.meta.partial);

    let graph = store.load(&tenant_id).await.unwrap();
    assert_eq!(graph.devices.len(), 3);
    assert_eq!(graph.last_job, Some(report.job_id));
    // The first host is taken as the gateway.
    assert_eq!(graph.links.len(), 2);
    assert_eq!(store.change_sets(&tenant_id).await.len(), 1);
}

#[tokio::test]
async fn denied_mdns_degrades_to_partial_and_keeps_findings() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let reporter = Arc::new(Recording::default());
    let runner = runner_with(
        vec![
            Scripted::emitting(
                Protocol::Arp,
                vec![
                    arp("192.168.1.1", "00:11:22:33:44:01"),
                    arp("192.168.1.20", "00:11:22:33:44:55"),
                ],
            ),
            Scripted::emitting(Protocol::Icmp, vec![icmp("192.168.1.30")]),
            Scripted::denied(Protocol::Mdns),
        ],
        store.clone(),
        reporter.clone(),
        MergePolicy::default(),
    );

    let report = runner
        .run(&job(tenant_id, &[Protocol::Arp, Protocol::Icmp, Protocol::Mdns]))
        .await;

    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.warnings, vec!["PrivilegeDenied: mDNS".to_string()]);
    let changes = report.change_set.unwrap();
    assert_eq!(changes.summary().devices_added, 3);
    assert!(changes.meta.partial);

    let reports = reporter.reports.lock();
    assert_eq!(reports.len(), 1);
    let meta = &reports[0].1;
    assert_eq!(meta.status, JobStatus::Partial);
    assert_eq!(meta.protocols.len(), 3);
}

#[tokio::test]
async fn mac_keeps_identity_when_its_ip_changes() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let laptop = "00:11:22:33:44:55";
    let phone = "00:11:22:33:44:66";

    let first = runner(
        vec![Scripted::emitting(
            Protocol::Arp,
            vec![arp("192.168.1.10", laptop), arp("192.168.1.11", phone)],
        )],
        store.clone(),
    );
    first.run(&job(tenant_id, &[Protocol::Arp])).await;
    let before = store.load(&tenant_id).await.unwrap();
    let laptop_id = before.device_by_mac(&mac(laptop)).unwrap().id;
    let phone_id = before.device_by_mac(&mac(phone)).unwrap().id;

    // The phone left; the laptop took its address.
    let reporter = Arc::new(Recording::default());
    let second = runner_with(
        vec![Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.11", laptop)])],
        store.clone(),
        reporter.clone(),
        MergePolicy::default(),
    );
    let report = second.run(&job(tenant_id, &[Protocol::Arp])).await;
    assert_eq!(report.status, JobStatus::Success);

    let after = store.load(&tenant_id).await.unwrap();
    let laptop_device = after.device_by_mac(&mac(laptop)).unwrap();
    assert_eq!(laptop_device.id, laptop_id);
    assert_eq!(
        laptop_device.interfaces.keys().copied().collect::<Vec<_>>(),
        vec![ip("192.168.1.11")]
    );
    assert_eq!(after.owner_of_ip(&ip("192.168.1.11")), Some(laptop_id));
    assert!(after.devices[&phone_id].interfaces.is_empty());

    let reports = reporter.reports.lock();
    let migrations = &reports[0].1.migrations;
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].ip, ip("192.168.1.11"));
    assert_eq!(migrations[0].from, phone_id);
    assert_eq!(migrations[0].to, laptop_id);

    let changes = report.change_set.unwrap();
    assert!(changes.devices.added.is_empty());
    assert_eq!(changes.summary().devices_modified, 2);
}

#[tokio::test]
async fn arp_and_mdns_on_one_ip_make_one_device() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let runner = runner(
        vec![
            Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.40", "3c:22:fb:00:00:01")]),
            Scripted::emitting(Protocol::Mdns, vec![mdns("192.168.1.40", "printer.local")]),
        ],
        store.clone(),
    );

    let report = runner.run(&job(tenant_id, &[Protocol::Arp, Protocol::Mdns])).await;

    let changes = report.change_set.unwrap();
    assert_eq!(changes.devices.added.len(), 1);
    let device = &changes.devices.added[0];
    assert_eq!(device.mac, Some(mac("3c:22:fb:00:00:01")));
    assert_eq!(device.hostname.as_deref(), Some("printer.local"));
    let interface = &device.interfaces[&ip("192.168.1.40")];
    assert_eq!(
        interface.protocols,
        BTreeSet::from([Protocol::Arp, Protocol::Mdns])
    );
}

#[tokio::test]
async fn unseen_device_ages_through_each_status_once() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let policy = MergePolicy {
        stale_after: 1,
        remove_after: 2,
        ..MergePolicy::default()
    };
    let device_mac = "00:11:22:33:44:55";

    let seeding = runner_with(
        vec![Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.10", device_mac)])],
        store.clone(),
        Arc::new(Recording::default()),
        policy.clone(),
    );
    seeding.run(&job(tenant_id, &[Protocol::Arp])).await;

    let silent = runner_with(
        vec![Scripted::emitting(Protocol::Arp, vec![])],
        store.clone(),
        Arc::new(Recording::default()),
        policy,
    );
    let mut statuses = Vec::new();
    for _ in 0..3 {
        let report = silent.run(&job(tenant_id, &[Protocol::Arp])).await;
        let changes = report.change_set.unwrap();
        statuses.extend(changes.devices.modified.iter().map(|m| {
            let field = m.changed("status").unwrap();
            (
                field.before.as_str().unwrap().to_string(),
                field.after.as_str().unwrap().to_string(),
            )
        }));
    }

    assert_eq!(
        statuses,
        vec![
            ("active".to_string(), "stale".to_string()),
            ("stale".to_string(), "removed".to_string()),
        ]
    );
    let graph = store.load(&tenant_id).await.unwrap();
    let device = graph.device_by_mac(&mac(device_mac)).unwrap();
    assert_eq!(device.status, DeviceStatus::Removed);
}

#[tokio::test]
async fn rescanning_an_unchanged_network_changes_nothing() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let scanners = || {
        vec![
            Scripted::emitting(
                Protocol::Arp,
                vec![
                    arp("192.168.1.1", "00:11:22:33:44:01"),
                    arp("192.168.1.20", "00:11:22:33:44:55"),
                ],
            ),
            Scripted::emitting(
                Protocol::Mdns,
                vec![mdns("192.168.1.20", "nas.local"), mdns("192.168.1.50", "tv.local")],
            ),
        ]
    };

    let first = runner(scanners(), store.clone())
        .run(&job(tenant_id, &[Protocol::Arp, Protocol::Mdns]))
        .await;
    assert!(!first.change_set.unwrap().is_empty());

    let second = runner(scanners(), store.clone())
        .run(&job(tenant_id, &[Protocol::Arp, Protocol::Mdns]))
        .await;
    assert_eq!(second.status, JobStatus::Success);
    assert!(second.change_set.unwrap().is_empty());
}

#[tokio::test]
async fn unavailable_store_fails_without_writing() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    store.set_offline(true);
    let reporter = Arc::new(Recording::default());
    let runner = runner_with(
        vec![Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.10", "00:11:22:33:44:55")])],
        store.clone(),
        reporter.clone(),
        MergePolicy::default(),
    );

    let report = runner.run(&job(tenant_id, &[Protocol::Arp])).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.change_set.is_none());
    assert!(report.warnings[0].starts_with("StoreUnavailable"));
    assert!(reporter.reports.lock().is_empty());

    store.set_offline(false);
    assert!(store.change_sets(&tenant_id).await.is_empty());
    assert!(store.load(&tenant_id).await.unwrap().devices.is_empty());
}

#[tokio::test]
async fn store_that_never_answers_fails_the_job() {
    for stall_load in [true, false] {
        let tenant_id = TenantId::new();
        let store = Arc::new(Stalled {
            inner: MemoryStore::new(),
            stall_load,
        });
        let reporter = Arc::new(Recording::default());
        let runner = runner_with(
            vec![Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.10", "00:11:22:33:44:55")])],
            store.clone(),
            reporter.clone(),
            MergePolicy::default(),
        )
        .with_store_timeout(Duration::from_millis(100));

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(&job(tenant_id, &[Protocol::Arp])),
        )
        .await
        .expect("runner must not hang on the store");

        assert_eq!(report.status, JobStatus::Failed, "stall_load = {stall_load}");
        assert!(report.warnings[0].starts_with("StoreUnavailable"));
        assert!(report.change_set.is_none());
        assert!(reporter.reports.lock().is_empty());
        assert!(store.inner.change_sets(&tenant_id).await.is_empty());
    }
}

#[tokio::test]
async fn invalid_job_is_rejected_before_scanning() {
    let store = Arc::new(MemoryStore::new());
    let runner = runner(vec![], store.clone());
    let mut job = job(TenantId::new(), &[Protocol::Arp]);
    job.rate_limit_pps = 0;

    let report = runner.run(&job).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.warnings[0].starts_with("ConfigInvalid"));
    assert!(store.change_sets(&job.tenant_id).await.is_empty());
}

#[tokio::test]
async fn reporter_failure_is_a_warning_not_a_failure() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let runner = runner_with(
        vec![Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.10", "00:11:22:33:44:55")])],
        store.clone(),
        Arc::new(Failing),
        MergePolicy::default(),
    );

    let report = runner.run(&job(tenant_id, &[Protocol::Arp])).await;

    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].starts_with("ReportFailed"));
    assert_eq!(store.change_sets(&tenant_id).await.len(), 1);
}

#[tokio::test]
async fn every_protocol_skipped_is_partial_with_no_changes() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let runner = runner(vec![Scripted::denied(Protocol::Mdns)], store.clone());

    let report = runner.run(&job(tenant_id, &[Protocol::Mdns, Protocol::Ssdp])).await;

    assert_eq!(report.status, JobStatus::Partial);
    assert_eq!(report.warnings.len(), 2);
    assert!(report.change_set.unwrap().is_empty());
}

#[tokio::test]
async fn serve_acknowledges_every_queued_job() {
    let tenant_id = TenantId::new();
    let store = Arc::new(MemoryStore::new());
    let runner = runner(
        vec![Scripted::emitting(Protocol::Arp, vec![arp("192.168.1.10", "00:11:22:33:44:55")])],
        store.clone(),
    );
    let (submitter, jobs) = queue::channel(4);
    let mut acks = jobs.subscribe();

    let ok = job(tenant_id, &[Protocol::Arp]);
    let mut bad = job(tenant_id, &[Protocol::Arp]);
    bad.concurrency = 0;
    submitter.submit(ok.clone()).await.unwrap();
    submitter.submit(bad.clone()).await.unwrap();
    drop(submitter);

    runner.serve(&jobs).await;
    assert!(jobs.next_job().await.is_none());

    let first = acks.recv().await.unwrap();
    assert_eq!((first.job_id, first.status), (ok.id, JobStatus::Success));
    let second = acks.recv().await.unwrap();
    assert_eq!((second.job_id, second.status), (bad.id, JobStatus::Failed));
}
