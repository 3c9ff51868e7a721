//! CLI entry point for the netloom-discover engine.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use netloom_core::{JobOrigin, Protocol, ScanJob, TargetSet, TenantId};
use netloom_graph::{FileStore, GraphClient, GraphStore, MemoryStore};
use netloom_journal::FileJournal;

use netloom_discover::config::{DiscoverConfig, StoreBackend};
use netloom_discover::queue;
use netloom_discover::report::{ChangeReporter, FanoutReporter, JournalReporter, LogReporter};
use netloom_discover::runner::JobRunner;
use netloom_discover::scanner::ScannerRegistry;
use netloom_discover::scheduler::ScanScheduler;

#[derive(Parser)]
#[command(name = "netloom-discover")]
#[command(about = "Multi-protocol host discovery for the netloom topology graph")]
struct Cli {
    /// Config file prefix (default: netloom).
    #[arg(short, long, default_value = "netloom", global = true)]
    config: String,

    /// Override tenant ID (otherwise read from config).
    #[arg(long, global = true)]
    tenant_id: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Command {
    /// List the configured scans.
    ListConfigs,

    /// Run one configured scan now and print its report.
    Run {
        /// Scan config ID.
        config_id: String,
    },

    /// Run an ad-hoc scan without a config entry.
    Scan {
        /// CIDR range or address; repeatable.
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,

        /// arp, icmp, mdns or ssdp; repeatable. Defaults to all four.
        #[arg(short, long = "protocol")]
        protocols: Vec<Protocol>,

        /// Probe rate in packets per second.
        #[arg(long)]
        rate: Option<u32>,

        /// Job deadline in seconds.
        #[arg(long)]
        deadline: Option<u64>,

        /// Gateway address for link inference.
        #[arg(long)]
        gateway: Option<IpAddr>,
    },

    /// Submit configured scans on their intervals and run them.
    Schedule,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Json => fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => fmt().with_env_filter(filter).init(),
    }

    let mut config = DiscoverConfig::load(&cli.config)?;
    if let Some(tenant_id) = &cli.tenant_id {
        config.tenant_id = tenant_id.clone();
    }

    if let Command::ListConfigs = cli.command {
        list_configs(&config);
        return Ok(());
    }

    let tenant_id = config.tenant()?;
    let runner = build_runner(&config).await?;

    match cli.command {
        Command::ListConfigs => {}
        Command::Run { config_id } => {
            let scan = config
                .scan(&config_id)
                .ok_or_else(|| anyhow::anyhow!("No scan config with id {config_id}"))?;
            let job = scan.to_job(tenant_id, JobOrigin::AdHoc)?;
            let report = runner.run(&job).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Scan {
            targets,
            protocols,
            rate,
            deadline,
            gateway,
        } => {
            let job = adhoc_job(tenant_id, &targets, protocols, rate, deadline, gateway)?;
            let report = runner.run(&job).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Schedule => schedule(config, tenant_id, runner).await?,
    }

    Ok(())
}

fn list_configs(config: &DiscoverConfig) {
    if config.scans.is_empty() {
        println!("No scan configs defined.");
        return;
    }
    for scan in &config.scans {
        let protocols: Vec<&str> = scan.protocols.iter().map(|p| p.name()).collect();
        println!(
            "{:<16} {:<24} every {:>6}s  {:<8} {:<20} {}",
            scan.id,
            scan.display_name(),
            scan.interval_secs,
            if scan.enabled { "enabled" } else { "disabled" },
            protocols.join(","),
            scan.targets.join(" "),
        );
    }
}

fn adhoc_job(
    tenant_id: TenantId,
    targets: &[String],
    protocols: Vec<Protocol>,
    rate: Option<u32>,
    deadline: Option<u64>,
    gateway: Option<IpAddr>,
) -> anyhow::Result<ScanJob> {
    let protocols: BTreeSet<Protocol> = if protocols.is_empty() {
        Protocol::ALL.into_iter().collect()
    } else {
        protocols.into_iter().collect()
    };
    let mut job = ScanJob::new(tenant_id, TargetSet::parse(targets)?, protocols);
    if let Some(rate) = rate {
        job.rate_limit_pps = rate;
    }
    if let Some(secs) = deadline {
        job.deadline = Duration::from_secs(secs);
    }
    job.gateway = gateway;
    Ok(job)
}

async fn build_runner(config: &DiscoverConfig) -> anyhow::Result<JobRunner> {
    let store: Arc<dyn GraphStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory graph store; nothing survives exit");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::File => Arc::new(FileStore::open(&config.store.path).await?),
        StoreBackend::Neo4j => {
            let client = GraphClient::connect(&config.store.neo4j).await?;
            tracing::info!(uri = %config.store.neo4j.uri, "Connected to Neo4j");
            Arc::new(client)
        }
    };

    let journal = Arc::new(FileJournal::new(&config.journal_dir)?);
    let reporters: Vec<Arc<dyn ChangeReporter>> = vec![
        Arc::new(LogReporter),
        Arc::new(JournalReporter::new(journal)),
    ];
    let reporter = Arc::new(FanoutReporter::new(reporters));

    let registry = Arc::new(ScannerRegistry::system(config));
    Ok(JobRunner::from_config(config, registry, store, reporter))
}

async fn schedule(config: DiscoverConfig, tenant_id: TenantId, runner: JobRunner) -> anyhow::Result<()> {
    let (submitter, jobs) = queue::channel(config.queue_capacity);
    let scheduler = ScanScheduler::new(config, tenant_id, submitter);
    let cancel = CancellationToken::new();

    // The queue closes once the scheduler stops and drops its submitter.
    let scheduled = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::select! {
        _ = runner.serve(&jobs) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            cancel.cancel();
        }
    }
    scheduled.await??;
    Ok(())
}
