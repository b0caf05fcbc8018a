use anyhow::Result;
use mailmon_notify::plugin::ChannelRegistry;
use mailmon_storage::sqlite::SqliteStore;
use mailmon_storage::StateStore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use mailmon_server::app;
use mailmon_server::config::ServerConfig;
use mailmon_server::scheduler::{self, RemediationScheduler, RuleScheduler};
use mailmon_server::seed::{self, ChannelsSeedFile, RulesSeedFile};
use mailmon_server::state;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  mailmon-server [config.toml]                              Start the server");
    eprintln!("  mailmon-server init-rules <config.toml> <seed.json>       Create alert rules from a seed file");
    eprintln!("  mailmon-server init-channels <config.toml> <seed.json>    Create notification channels from a seed file");
}

#[tokio::main]
async fn main() -> Result<()> {
    mailmon_common::id::init(1, 1).map_err(anyhow::Error::msg)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mailmon=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some(cmd @ ("init-rules" | "init-channels")) => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("{cmd} requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("{cmd} requires <seed.json> argument")
            })?;
            if cmd == "init-rules" {
                run_init_rules(config_path, seed_path).await
            } else {
                run_init_channels(config_path, seed_path).await
            }
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

/// Opens the store and proves it answers; any failure is fatal.
async fn open_store(config: &ServerConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(Path::new(&config.data_dir))
        .map_err(|e| anyhow::anyhow!("Cannot open store in '{}': {e}", config.data_dir))?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("Store health probe failed: {e}"))?;
    Ok(Arc::new(store))
}

async fn run_init_rules(config_path: &str, seed_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config).await?;
    let seed: RulesSeedFile = seed::load_seed(seed_path)?;

    let report = seed::init_rules(&store, &config.metric_whitelist()?, &seed).await?;
    tracing::info!(
        created = report.created,
        skipped = report.skipped,
        "init-rules completed"
    );
    Ok(())
}

async fn run_init_channels(config_path: &str, seed_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config).await?;
    let seed: ChannelsSeedFile = seed::load_seed(seed_path)?;

    let report = seed::init_channels(&store, &ChannelRegistry::default(), &seed).await?;
    tracing::info!(
        created = report.created,
        skipped = report.skipped,
        invalid = report.invalid,
        "init-channels completed"
    );
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;

    tracing::info!(
        http_port = config.http_port,
        data_dir = %config.data_dir,
        interval_secs = config.evaluation.interval_secs,
        remediation = config.remediation.enabled,
        "mailmon-server starting"
    );

    let store = open_store(&config).await?;
    let components = state::build_components(config.clone(), store.clone())?;
    let app_state = components.state;

    let rule_scheduler = RuleScheduler::new(
        components.engine,
        app_state.status.clone(),
        config.evaluation.interval_secs,
    );
    let rule_handle = tokio::spawn(async move {
        rule_scheduler.run().await;
    });

    let mut tier_handles = Vec::new();
    match &app_state.remediator {
        Some(remediator) => {
            for tier in &config.remediation.tiers {
                let scheduler = RemediationScheduler::new(remediator.clone(), &tier.name, tier.interval_secs);
                tier_handles.push(tokio::spawn(async move {
                    scheduler.run().await;
                }));
            }
        }
        None => tracing::info!("Auto-remediation disabled"),
    }

    let cleanup_store = store.clone();
    let retention_days = config.retention_days;
    let cleanup_handle = tokio::spawn(async move {
        scheduler::run_cleanup(cleanup_store, retention_days).await;
    });

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_app = app::build_http_app(app_state);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let http_server = axum::serve(listener, http_app);

    tracing::info!(http = %http_addr, "Server started");

    tokio::select! {
        result = http_server.with_graceful_shutdown(async { signal::ctrl_c().await.ok(); }) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server error");
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully");
        }
    }

    rule_handle.abort();
    cleanup_handle.abort();
    for h in tier_handles {
        h.abort();
    }
    tracing::info!("Server stopped");

    Ok(())
}
