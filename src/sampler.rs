use crate::alerts::{AlertEngine, AlertRecord, Component, Thresholds};
use crate::error::ProbeError;
use crate::metrics::Metrics;
use crate::probes::SensorSuite;
use crate::settings::Settings;
use crate::snapshot::{Domain, Snapshot};
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub type SharedAlerts = Arc<RwLock<AlertEngine>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerState {
    Idle,
    Ticking,
    Stopped,
}

/// Popup-style notice for a fired alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertNotification {
    pub title: String,
    pub message: String,
    pub component: Component,
    pub time: DateTime<Utc>,
}

impl From<&AlertRecord> for AlertNotification {
    fn from(record: &AlertRecord) -> Self {
        Self {
            title: format!("Alert: {}", record.component),
            message: record.message.clone(),
            component: record.component,
            time: record.time,
        }
    }
}

/// Everything the sampler writes to or publishes on.
#[derive(Clone)]
pub struct SamplerContext {
    pub store: Arc<TimeSeriesStore>,
    pub alerts: SharedAlerts,
    pub settings: watch::Receiver<Settings>,
    pub snapshots: broadcast::Sender<Arc<Snapshot>>,
    pub notifications: broadcast::Sender<AlertNotification>,
    pub metrics: Option<Arc<Metrics>>,
}

/// Handle to a running acquisition loop.
///
/// The poll interval is taken from the settings once, when the loop starts.
pub struct Sampler {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SamplerState>,
    task: JoinHandle<()>,
}

impl Sampler {
    pub fn start<S: SensorSuite>(suite: S, ctx: SamplerContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SamplerState::Idle);
        let period = Duration::from_millis(ctx.settings.borrow().poll_interval.max(1));
        let task = tokio::spawn(run(suite, ctx, period, stop_rx, state_tx));
        Self {
            stop_tx,
            state_rx,
            task,
        }
    }

    /// Requests a stop; the tick in progress, if any, still completes.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn state(&self) -> watch::Receiver<SamplerState> {
        self.state_rx.clone()
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "sampler task ended abnormally");
        }
    }
}

async fn run<S: SensorSuite>(
    mut suite: S,
    ctx: SamplerContext,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SamplerState>,
) {
    info!(interval_ms = period.as_millis() as u64, "sampler started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failures = FailureLog::default();

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                if *stop_rx.borrow() {
                    break;
                }
                state_tx.send_replace(SamplerState::Ticking);
                tick(&mut suite, &ctx, &mut failures).await;
                state_tx.send_replace(SamplerState::Idle);
            }
        }
    }

    state_tx.send_replace(SamplerState::Stopped);
    info!("sampler stopped");
}

async fn tick<S: SensorSuite>(suite: &mut S, ctx: &SamplerContext, failures: &mut FailureLog) {
    let timestamp = Utc::now();
    suite.begin_tick().await;

    let metrics = ctx.metrics.as_deref();
    let snapshot = Arc::new(Snapshot {
        timestamp,
        cpu: failures.absorb(Domain::Cpu, suite.cpu().await, metrics),
        memory: failures.absorb(Domain::Memory, suite.memory().await, metrics),
        disk: failures.absorb(Domain::Disk, suite.disk().await, metrics),
        gpu: failures.absorb(Domain::Gpu, suite.gpu().await, metrics),
        network: failures.absorb(Domain::Network, suite.network().await, metrics),
    });

    ctx.store.append(snapshot.clone());

    let (thresholds, popup_alerts) = {
        let settings = ctx.settings.borrow();
        (Thresholds::from(&*settings), settings.popup_alerts)
    };
    let fired = ctx
        .alerts
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .evaluate(&snapshot, &thresholds);
    for record in &fired {
        info!(component = %record.component, message = %record.message, "alert fired");
        if let Some(m) = metrics {
            m.inc_alert_fired(record.component);
        }
        if popup_alerts {
            let _ = ctx.notifications.send(AlertNotification::from(record));
        }
    }

    if let Some(m) = metrics {
        m.update_from_snapshot(&snapshot, &ctx.store.network_rates());
        m.inc_tick();
    }

    // No subscribers is fine.
    let _ = ctx.snapshots.send(snapshot);
}

/// Remembers which (domain, cause) pairs were already reported at `warn`.
#[derive(Debug, Default)]
struct FailureLog {
    seen: HashSet<(Domain, String)>,
}

impl FailureLog {
    fn absorb<T>(
        &mut self,
        domain: Domain,
        result: Result<T, ProbeError>,
        metrics: Option<&Metrics>,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                let before = self.seen.len();
                self.seen.retain(|(d, _)| *d != domain);
                if self.seen.len() != before {
                    info!(%domain, "probe recovered");
                }
                Some(value)
            }
            Err(err) => {
                if let Some(m) = metrics {
                    m.inc_probe_failure(domain);
                }
                if self.seen.insert((domain, err.cause_key())) {
                    warn!(%domain, error = %err, "probe failed, domain absent from snapshot");
                } else {
                    debug!(%domain, error = %err, "probe still failing");
                }
                None
            }
        }
    }
}
