use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cwatcher::collector::CollectorScheduler;
use cwatcher::commands::CommandExecutor;
use cwatcher::config::Config;
use cwatcher::push::PushFabric;
use cwatcher::registry::ServerRegistry;
use cwatcher::ssh::{KnownHostsPolicy, SshPool};
use cwatcher::status::StatusEvaluator;
use cwatcher::store::{Flusher, SampleStore, SqliteSink};
use cwatcher::vault::CredentialVault;
use cwatcher::web::{start_web_server, AppState};

const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_MASTER_KEY: u8 = 2;
const EXIT_STORAGE_UNAVAILABLE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("cwatcher=info".parse().expect("valid directive"))
        .add_directive("tower_http=warn".parse().expect("valid directive"))
        .add_directive("hyper=warn".parse().expect("valid directive"))
        .add_directive("sqlx=warn".parse().expect("valid directive"));

    fmt().with_env_filter(env_filter).init();

    info!("starting CWatcher");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/cwatcher.toml"));

    let config = match Config::load(&config_path).await {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration invalid: {e:#}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    // A bad master key must fail now, not on the first session open.
    let vault = Arc::new(CredentialVault::new(config.master_key.clone()));
    if let Err(e) = vault.verify() {
        error!("master key unusable: {e}");
        return ExitCode::from(EXIT_MASTER_KEY);
    }

    match run(config, vault).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(EXIT_STORAGE_UNAVAILABLE)
        }
    }
}

async fn run(config: Arc<Config>, vault: Arc<CredentialVault>) -> Result<()> {
    let shutdown = CancellationToken::new();

    // Persistent storage: server records and the time-series sink share the
    // SQLite file. Unavailable storage at startup is fatal (exit 3).
    let sink = Arc::new(SqliteSink::new(&config.database_path).await?);
    let registry = Arc::new(ServerRegistry::new(sink.pool().clone(), vault.clone()).await?);

    let (store, flush_rx) = SampleStore::new(config.sample_ring_capacity);
    let flusher = Flusher::new(
        flush_rx,
        sink.clone(),
        cwatcher::store::sink::FlushPolicy {
            batch_size: config.sink_batch_size,
            flush_interval: config.sink_batch_flush(),
            ..Default::default()
        },
        store.sink_degraded_flag(),
    );
    let flusher_token = shutdown.child_token();
    let flusher_handle = tokio::spawn(flusher.run(flusher_token));

    let policy = KnownHostsPolicy::new(config.known_hosts_path.clone(), config.allow_tofu);
    let pool = Arc::new(SshPool::new(
        vault.clone(),
        policy,
        config.ssh_max_per_server,
        config.ssh_connect_timeout(),
        config.ssh_idle_ttl(),
    ));

    let server_count = registry.list_servers().len();
    let executor = Arc::new(CommandExecutor::new(pool.clone(), config.clone(), server_count));
    let evaluator = Arc::new(StatusEvaluator::new(&config.threshold_defaults));

    let fabric = PushFabric::new(&config, store.clone(), shutdown.child_token());

    let scheduler = Arc::new(CollectorScheduler::new(
        executor,
        store.clone(),
        evaluator,
        fabric.clone(),
        config.clone(),
        shutdown.child_token(),
    ));
    for server in registry.monitored_servers() {
        scheduler.add_server(server);
    }

    // Idle-session reaper.
    {
        let pool = pool.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => pool.reap_idle().await,
                }
            }
        });
    }

    // SIGINT / SIGTERM initiate the ordered shutdown.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                )
                .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let state = AppState {
        config: config.clone(),
        registry,
        store,
        fabric: fabric.clone(),
        pool: pool.clone(),
        scheduler: scheduler.clone(),
        sysinfo: scheduler.sysinfo_cache(),
    };
    start_web_server(state, shutdown.clone()).await?;

    // Ordered teardown: scheduler first (no new samples), then the fabric's
    // writers, then the pool, then the sink flusher.
    scheduler.shutdown().await;
    fabric.shutdown().await;
    pool.close().await;
    if tokio::time::timeout(std::time::Duration::from_secs(10), flusher_handle)
        .await
        .is_err()
    {
        warn!("flusher did not finish within the shutdown grace");
    }

    Ok(())
}
