// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

mod adapters;
mod app;
mod config;
mod logging;

use app::allocator::{AllocatorConfig, PortAllocator, PortSpan};
use app::ports::EventSinkPort;
use app::procman::{ProcessManager, ProcessManagerConfig};
use app::reconcile::{ReconcilerConfig, ReconciliationLoop};
use app::scheduler::SchedulerClient;
use app::services::breaker::BreakerConfig;
use app::tunnels::{TunnelOrchestrator, TunnelOrchestratorConfig};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::info!("config path: (none)");
        }
    }
    tracing::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    tracing::info!(
        "config reconcile_interval_secs: {} (source={})",
        report.reconcile_interval_secs.value,
        report.reconcile_interval_secs.source.as_str()
    );
    tracing::info!(
        "config scheduler host: {} (source={})",
        report.scheduler_host.value,
        report.scheduler_host.source.as_str()
    );
    tracing::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let verbose_override = parsed.verbose_override;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            reconcile_interval_secs: opts.reconcile_interval_secs,
            verbose: verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);
    config::ensure_database_dir(&config.database_path)?;

    let db = adapters::db::Store::open(&config.database_path).await?;
    let store = Arc::new(adapters::db::SqliteStoreAdapter::new(db));
    let network = Arc::new(adapters::network::NetworkProbe::new());
    let os_proc = Arc::new(adapters::os::OsProcessControl::new());
    let clock = Arc::new(adapters::time::SystemClock::new());
    let events: Arc<dyn EventSinkPort> = Arc::new(adapters::events::LogEventSink::new());
    let proxy = Arc::new(adapters::proxy::LoggingProxyRoutes::new());

    let mut ssh_config = adapters::ssh::SshExecConfig::new(
        config.scheduler.user.clone(),
        config.scheduler.host.clone(),
    );
    ssh_config.port = config.scheduler.port;
    ssh_config.identity_path = config.scheduler.identity_path.clone();
    let remote = Arc::new(adapters::ssh::OpenSshExec::new(ssh_config));

    let allocator = Arc::new(PortAllocator::new(
        AllocatorConfig {
            job_ports: PortSpan::new(config.job_ports.start, config.job_ports.end),
            tunnel_ports: PortSpan::new(config.tunnel_ports.start, config.tunnel_ports.end),
            ..AllocatorConfig::default()
        },
        store.clone(),
        store.clone(),
        network.clone(),
        clock.clone(),
    ));

    let mut procman_config =
        ProcessManagerConfig::new(&config.scheduler.user, &config.scheduler.host);
    procman_config.ssh_identity_path = config.scheduler.identity_path.clone();
    let procman = Arc::new(ProcessManager::new(
        procman_config,
        os_proc.clone(),
        network.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(TunnelOrchestrator::new(
        TunnelOrchestratorConfig {
            establish_concurrency: config.establish_concurrency,
            max_tunnel_age: Duration::from_secs(config.max_tunnel_age_hours * 3600),
            connect_host: "127.0.0.1".to_string(),
        },
        store.clone(),
        store.clone(),
        allocator.clone(),
        procman.clone(),
        clock.clone(),
        events.clone(),
        shutdown_rx.clone(),
    ));
    // Rebuild port bookkeeping and re-attach (or bury) tunnels that
    // survived the previous daemon before anything new is scheduled.
    orchestrator.recover().await?;

    let scheduler = Arc::new(SchedulerClient::new(remote, BreakerConfig::default()));
    let reconciler = Arc::new(ReconciliationLoop::new(
        ReconcilerConfig {
            completion_miss_threshold: config.completion_miss_threshold,
            adopt_orphans: config.adopt_orphans,
            default_account: config.default_account.clone(),
        },
        scheduler,
        store.clone(),
        store.clone(),
        store.clone(),
        orchestrator.clone(),
        proxy,
        events,
        clock,
    ));

    let reconcile_handle = tokio::spawn(reconciler.run_loop(
        Duration::from_secs(config.reconcile_interval_secs),
        shutdown_rx.clone(),
    ));
    let health_handle = tokio::spawn(
        orchestrator
            .clone()
            .run_health_loop(Duration::from_secs(config.health_check_interval_secs)),
    );
    let cleanup_handle = tokio::spawn(
        orchestrator
            .clone()
            .run_cleanup_loop(Duration::from_secs(config.cleanup_interval_secs)),
    );

    tracing::info!(
        "causewayd running against {} (reconcile every {}s)",
        config.scheduler.host,
        config.reconcile_interval_secs
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining background loops");
    let _ = shutdown_tx.send(true);
    let _ = reconcile_handle.await;
    let _ = health_handle.await;
    let _ = cleanup_handle.await;
    tracing::info!("causewayd stopped");
    Ok(())
}
