use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use bayslot::clock::SystemClock;
use bayslot::config::ServiceConfig;
use bayslot::engine::{self, Engine};
use bayslot::ledger::Ledger;
use bayslot::notify::NotifyHub;
use bayslot::reaper;
use bayslot::schedule::StaticSchedule;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env()?;
    bayslot::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let ledger = Arc::new(Ledger::open(config.data_dir.join("ledger.wal"), notify.clone())?);
    let schedule = Arc::new(StaticSchedule::load(&config.schedule_file)?);
    let engine = Arc::new(Engine::new(
        config.engine.clone(),
        schedule,
        ledger.clone(),
        Arc::new(SystemClock),
    ));

    info!("bayslot started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  schedule: {}", config.schedule_file.display());
    info!("  timezone: {}", config.engine.timezone);
    info!("  granularity: {} min", config.engine.granularity_ms / 60_000);
    info!("  token ttl: {} s", config.engine.token_ttl_ms / 1_000);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(engine::run_invalidation_listener(
            engine.clone(),
            notify.subscribe_all(),
            shutdown.clone(),
        )),
        tokio::spawn(reaper::run_reaper(engine.clone(), shutdown.clone())),
        tokio::spawn(reaper::run_compactor(ledger.clone(), config.compact_threshold, shutdown.clone())),
        tokio::spawn(engine::run_materializer(engine.clone(), shutdown.clone())),
    ];

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("background task failed: {e}");
        }
    }

    info!("bayslot stopped");
    Ok(())
}
