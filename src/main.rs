use axum::serve;
use clap::Parser;
use hostwatch::alerts::AlertEngine;
use hostwatch::config::Config;
use hostwatch::devices::{DeviceMonitor, SimulatedDevices};
use hostwatch::diagnostics::{CleanupRoots, DiagnosticsRunner};
use hostwatch::http::{self, HttpAppState};
use hostwatch::metrics::Metrics;
use hostwatch::probes::gpu::{GpuProbe, GpuStrategy};
use hostwatch::probes::sensor_tree::MonitorEndpoint;
use hostwatch::probes::HostSensors;
use hostwatch::report::HostInfo;
use hostwatch::sampler::{AlertNotification, Sampler, SamplerContext};
use hostwatch::settings::Settings;
use hostwatch::store::TimeSeriesStore;
use reqwest::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `settings_path` from the config file.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let settings_path = cli
        .settings
        .or_else(|| cfg.settings_path.clone())
        .unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_default(&settings_path);

    info!(
        listen = %cfg.listen,
        poll_interval_ms = settings.poll_interval,
        settings = %settings_path.display(),
        "starting hostwatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let client = Client::builder()
        .user_agent(concat!("hostwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new());

    let sensors = build_sensors(&cfg, &client);
    let store = Arc::new(TimeSeriesStore::new(cfg.history_capacity, cfg.window_capacity));
    let alerts = Arc::new(RwLock::new(AlertEngine::new(
        Duration::from_secs(cfg.alert_cooldown_secs),
        cfg.alert_history_capacity,
    )));
    let (settings_tx, settings_rx) = watch::channel(settings);
    let settings_tx = Arc::new(settings_tx);
    let (snapshots_tx, _) = broadcast::channel(16);
    let (notifications_tx, notifications_rx) = broadcast::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (http_shutdown_tx, mut http_shutdown_rx) = watch::channel(false);

    let notice_task = tokio::spawn(log_notifications(notifications_rx));

    let sampler = Sampler::start(
        sensors,
        SamplerContext {
            store: store.clone(),
            alerts: alerts.clone(),
            settings: settings_rx,
            snapshots: snapshots_tx,
            notifications: notifications_tx,
            metrics: Some(metrics.clone()),
        },
    );

    let (devices, devices_task) = DeviceMonitor::start(
        SimulatedDevices::new(),
        Duration::from_secs(cfg.device_refresh_secs),
        shutdown_rx.clone(),
    );
    let mut diagnostics = DiagnosticsRunner::new(client.clone());
    if cfg.allow_disk_cleanup {
        diagnostics = diagnostics.with_cleanup(CleanupRoots::for_current_user());
    }
    let diagnostics = Arc::new(diagnostics);

    let http_task = {
        let listen = cfg.listen.clone();
        let state = HttpAppState {
            metrics: metrics.clone(),
            store: store.clone(),
            alerts: alerts.clone(),
            settings: settings_tx.clone(),
            settings_path: Arc::new(settings_path.clone()),
            devices,
            diagnostics: diagnostics.clone(),
            host: Arc::new(HostInfo::collect()),
        };
        tokio::spawn(async move {
            let app = http::build_router(state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = http_shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    // Stop accepting connections first; requests already in flight drain below.
    let _ = http_shutdown_tx.send(true);
    sampler.stop();
    sampler.join().await;
    // Cancelling the diagnostic releases any request waiting on its report.
    diagnostics.shutdown().await;
    let _ = http_task.await;

    let current = settings_tx.borrow().clone();
    if let Err(err) = current.save(&settings_path) {
        warn!(error = %err, "failed to persist settings");
    }

    let _ = shutdown_tx.send(true);
    let _ = devices_task.await;
    // Dropping the sampler closed the notification channel.
    let _ = notice_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_sensors(cfg: &Config, client: &Client) -> HostSensors {
    let mut strategies = Vec::new();
    let endpoint = if cfg.monitor_endpoint.enabled {
        strategies.push(GpuStrategy::MonitorEndpoint);
        Some(MonitorEndpoint::new(
            client.clone(),
            cfg.monitor_endpoint.url.clone(),
            Duration::from_millis(cfg.monitor_endpoint.timeout_ms),
        ))
    } else {
        None
    };
    strategies.push(GpuStrategy::nvidia_smi(Duration::from_millis(
        cfg.vendor_cli_timeout_ms,
    )));
    HostSensors::new(endpoint, GpuProbe::new(strategies))
}

async fn log_notifications(mut rx: broadcast::Receiver<AlertNotification>) {
    loop {
        match rx.recv().await {
            Ok(notice) => warn!(title = %notice.title, "{}", notice.message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "alert notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
