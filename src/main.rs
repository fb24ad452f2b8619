use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cred_scan_rs::commands::{run_command_loop, ChannelBus, ClientSettings, CommandHandler, ScanClient};
use cred_scan_rs::config::AppConfig;
use cred_scan_rs::dictionary::{DictionarySync, HttpDictionarySource};
use cred_scan_rs::inventory::JsonInventory;
use cred_scan_rs::notify::LogNotifier;
use cred_scan_rs::policy::PolicyResolver;
use cred_scan_rs::probe::{CommandBuilder, NmapHostProbe, ProbeSettings};
use cred_scan_rs::runner::NmapRunner;
use cred_scan_rs::scheduler::{Scheduler, SchedulerConfig};
use cred_scan_rs::server::{self, AppState};
use cred_scan_rs::store::{FileStore, KvStore, MemoryStore, ResultStore, StoreLimits};

const STATUS_TICK: Duration = Duration::from_secs(60);

/// cred-scan-rs: weak-credential scan scheduler for LAN devices.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cred-scan-rs",
    version,
    about = "Weak-credential scan scheduler for LAN devices, driving nmap brute scripts.",
    long_about = None
)]
struct Cli {
    /// JSON config file. Defaults to $CRED_SCAN_CONFIG or cred-scan.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HTTP API bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the inventory file.
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long = "log-json", default_value_t = false)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut cfg = AppConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    if let Some(inventory) = cli.inventory {
        cfg.inventory_path = inventory;
    }
    info!(
        bind = %cfg.bind,
        nmap = %cfg.nmap_path.display(),
        dict_dir = %cfg.dict_dir.display(),
        services = cfg.services.len(),
        max_concurrent = cfg.max_concurrent_tasks,
        "cred-scan-rs starting"
    );

    let inventory = Arc::new(
        JsonInventory::load(&cfg.inventory_path)
            .with_context(|| format!("loading inventory {}", cfg.inventory_path.display()))?,
    );
    let kv: Arc<dyn KvStore> = match &cfg.store_path {
        Some(path) => {
            let file = FileStore::open(path)
                .await
                .with_context(|| format!("opening store {}", path.display()))?;
            info!(path = %file.path().display(), "persisting scan state");
            Arc::new(file)
        }
        None => {
            warn!("no store path configured, scan state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let store = ResultStore::new(
        kv,
        StoreLimits {
            host_result_ttl: cfg.host_result_ttl(),
        },
    );
    tokio::fs::create_dir_all(&cfg.dict_dir)
        .await
        .with_context(|| format!("creating {}", cfg.dict_dir.display()))?;

    let probe = Arc::new(NmapHostProbe::new(
        Arc::new(NmapRunner::new(&cfg.nmap_path)),
        inventory.clone(),
        store.clone(),
        CommandBuilder::new(&cfg.dict_dir, &cfg.custom_scripts_dir).strict_http(cfg.strict_http),
        cfg.services.clone(),
        ProbeSettings {
            probe_timeout: cfg.probe_timeout(),
            recheck_timeout: cfg.recheck_timeout(),
            skip_verify: cfg.skip_verify,
        },
    ));
    let scheduler = Scheduler::new(
        probe,
        store.clone(),
        Arc::new(LogNotifier),
        SchedulerConfig {
            max_concurrent_tasks: cfg.max_concurrent_tasks,
            max_tasks: cfg.max_tasks,
            retention: cfg.task_retention(),
        },
    );
    let demoted = scheduler.recover().await;
    if demoted > 0 {
        info!(demoted, "stopped scan requests interrupted by restart");
    }

    let handler = CommandHandler::new(
        scheduler.clone(),
        PolicyResolver::new(inventory),
        store.clone(),
        cfg.cron_floor(),
    );
    if let Err(e) = handler.restore_policy().await {
        warn!(error = %e, "stored scan policy rejected");
    }

    let (bus, rx) = ChannelBus::new();
    tokio::spawn(run_command_loop(handler, rx));

    let shutdown = CancellationToken::new();
    {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_TICK);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => { scheduler.check_running_status().await; }
                }
            }
        });
    }
    if let Some(url) = cfg.dictionary_url.clone() {
        let sync = Arc::new(DictionarySync::new(
            Arc::new(HttpDictionarySource::new(url)),
            &cfg.dict_dir,
            store.clone(),
        ));
        tokio::spawn(sync.run(Duration::from_secs(cfg.dictionary_sync_secs), shutdown.clone()));
    }

    let client = ScanClient::new(
        Arc::new(bus),
        store.clone(),
        ClientSettings {
            schedule_wait: Duration::from_secs(cfg.schedule_wait_secs),
            stop_wait: Duration::from_secs(cfg.stop_wait_secs),
            latest: cfg.max_tasks,
            max_result_size: cfg.max_result_size,
            cron_floor: cfg.cron_floor(),
        },
    );

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        server_shutdown.cancel();
    });

    server::spawn_server(&cfg.bind, AppState { client, store }, shutdown.clone()).await?;
    scheduler.stop_all().await;
    Ok(())
}
