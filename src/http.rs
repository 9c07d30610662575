use crate::alerts::AlertRecord;
use crate::devices::{DeviceMonitor, DeviceStatus};
use crate::diagnostics::{DiagnosticKind, DiagnosticReport, DiagnosticsRunner};
use crate::error::{DiagnosticError, ReportError, SettingsError};
use crate::metrics::Metrics;
use crate::report::{self, HostInfo, Report, ReportKind};
use crate::sampler::SharedAlerts;
use crate::settings::{Settings, SettingsPatch};
use crate::snapshot::Snapshot;
use crate::store::{MetricSelector, NetRate, SeriesPoint, TimeSeriesStore};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use tokio::sync::watch;

const DEFAULT_PING_TARGET: &str = "8.8.8.8";

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<TimeSeriesStore>,
    pub alerts: SharedAlerts,
    pub settings: Arc<watch::Sender<Settings>>,
    pub settings_path: Arc<PathBuf>,
    pub devices: DeviceMonitor,
    pub diagnostics: Arc<DiagnosticsRunner>,
    pub host: Arc<HostInfo>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        let status = match err {
            SettingsError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ReportError> for ApiError {
    fn from(err: ReportError) -> Self {
        let status = match err {
            ReportError::EmptyHistory => StatusCode::NOT_FOUND,
            ReportError::GenerationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<DiagnosticError> for ApiError {
    fn from(err: DiagnosticError) -> Self {
        let status = match err {
            DiagnosticError::Busy => StatusCode::CONFLICT,
            DiagnosticError::InvalidTarget(_) | DiagnosticError::NothingToClean => {
                StatusCode::BAD_REQUEST
            }
            DiagnosticError::CleanupDisabled => StatusCode::FORBIDDEN,
            DiagnosticError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

pub fn build_router(state: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/history", get(history_handler))
        .route("/api/window", get(window_handler))
        .route("/api/network/rates", get(rates_handler))
        .route("/api/alerts", get(alerts_handler).delete(clear_alerts_handler))
        .route("/api/settings", get(settings_handler).put(update_settings_handler))
        .route("/api/settings/save", post(save_settings_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/discover", post(discover_handler))
        .route("/api/report/tabular", get(report_tabular))
        .route("/api/report/hierarchical", get(report_hierarchical))
        .route("/api/report/charts", get(report_charts))
        .route("/api/report/series", get(report_series))
        .route("/api/diagnostics/speedtest", post(speedtest_handler))
        .route("/api/diagnostics/ping", post(ping_handler))
        .route("/api/diagnostics/disk-health", post(disk_health_handler))
        .route("/api/diagnostics/cleanup", post(cleanup_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<Arc<Snapshot>>, ApiError> {
    state
        .store
        .latest()
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no snapshot yet"))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn history_handler(
    State(state): State<HttpAppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<Arc<Snapshot>>> {
    Json(match params.limit {
        Some(n) => state.store.read_recent(n),
        None => state.store.read_all(),
    })
}

#[derive(Debug, Deserialize)]
struct MetricParams {
    metric: MetricSelector,
}

#[derive(Debug, Serialize)]
struct WindowResponse {
    metric: MetricSelector,
    capacity: usize,
    points: Vec<SeriesPoint>,
}

async fn window_handler(
    State(state): State<HttpAppState>,
    Query(params): Query<MetricParams>,
) -> Json<WindowResponse> {
    let points = state.store.read_window(&params.metric);
    Json(WindowResponse {
        metric: params.metric,
        capacity: state.store.window_capacity(),
        points,
    })
}

async fn rates_handler(State(state): State<HttpAppState>) -> Json<BTreeMap<String, NetRate>> {
    Json(state.store.network_rates())
}

async fn alerts_handler(State(state): State<HttpAppState>) -> Json<Vec<AlertRecord>> {
    let history = state
        .alerts
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .history();
    Json(history)
}

async fn clear_alerts_handler(State(state): State<HttpAppState>) -> StatusCode {
    state
        .alerts
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear_history();
    StatusCode::NO_CONTENT
}

async fn settings_handler(State(state): State<HttpAppState>) -> Json<Settings> {
    Json(state.settings.borrow().clone())
}

async fn update_settings_handler(
    State(state): State<HttpAppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Settings>, ApiError> {
    // Applied under the channel lock so concurrent updates compose.
    let mut applied = None;
    state.settings.send_if_modified(|current| {
        let result = patch.apply(current);
        let changed = match &result {
            Ok(next) if *next != *current => {
                *current = next.clone();
                true
            }
            _ => false,
        };
        applied = Some(result);
        changed
    });
    let next = applied.unwrap_or_else(|| Ok(state.settings.borrow().clone()))?;
    Ok(Json(next))
}

async fn save_settings_handler(State(state): State<HttpAppState>) -> Result<StatusCode, ApiError> {
    let current = state.settings.borrow().clone();
    let path = state.settings_path.clone();
    tokio::task::spawn_blocking(move || current.save(path.as_path()))
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;
    Ok(StatusCode::NO_CONTENT)
}

async fn devices_handler(State(state): State<HttpAppState>) -> Json<Vec<DeviceStatus>> {
    Json(state.devices.devices())
}

async fn discover_handler(State(state): State<HttpAppState>) -> Json<Vec<DeviceStatus>> {
    Json(state.devices.discover().await)
}

fn build_report(state: &HttpAppState, kind: ReportKind) -> Result<Json<Report>, ApiError> {
    let history = state.store.read_all();
    Ok(Json(report::generate(kind, &state.host, &history)?))
}

async fn report_tabular(State(state): State<HttpAppState>) -> Result<Json<Report>, ApiError> {
    build_report(&state, ReportKind::Tabular)
}

async fn report_hierarchical(
    State(state): State<HttpAppState>,
) -> Result<Json<Report>, ApiError> {
    build_report(&state, ReportKind::Hierarchical)
}

async fn report_charts(State(state): State<HttpAppState>) -> Result<Json<Report>, ApiError> {
    build_report(&state, ReportKind::Charts)
}

async fn report_series(
    State(state): State<HttpAppState>,
    Query(params): Query<MetricParams>,
) -> Json<Vec<SeriesPoint>> {
    let history = state.store.read_all();
    Json(report::to_chart_series(&history, &params.metric))
}

#[derive(Debug, Default, Deserialize)]
struct PingRequest {
    target: Option<String>,
}

async fn run_diagnostic(
    state: &HttpAppState,
    kind: DiagnosticKind,
) -> Result<Json<DiagnosticReport>, ApiError> {
    let rx = state.diagnostics.start(kind)?;
    rx.await.map(Json).map_err(|_| {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "diagnostic was cancelled")
    })
}

async fn speedtest_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    run_diagnostic(&state, DiagnosticKind::SpeedTest).await
}

async fn ping_handler(
    State(state): State<HttpAppState>,
    body: Option<Json<PingRequest>>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    let target = body
        .and_then(|Json(req)| req.target)
        .unwrap_or_else(|| DEFAULT_PING_TARGET.to_string());
    run_diagnostic(&state, DiagnosticKind::Ping { target }).await
}

async fn disk_health_handler(
    State(state): State<HttpAppState>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    run_diagnostic(&state, DiagnosticKind::DiskHealth).await
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default)]
    temp: bool,
    #[serde(default)]
    cache: bool,
}

impl Default for CleanupRequest {
    fn default() -> Self {
        Self {
            temp: true,
            cache: true,
        }
    }
}

async fn cleanup_handler(
    State(state): State<HttpAppState>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<DiagnosticReport>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    run_diagnostic(
        &state,
        DiagnosticKind::Cleanup {
            temp: req.temp,
            cache: req.cache,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertEngine;
    use crate::devices::SimulatedDevices;
    use crate::store::fixtures::{with_cpu, with_net};
    use axum::body::to_bytes;
    use axum::http::Request;
    use reqwest::Client;
    use std::sync::RwLock;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: HttpAppState,
        _shutdown: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (devices, _task) = DeviceMonitor::start(
            SimulatedDevices::new(),
            std::time::Duration::from_secs(3),
            shutdown_rx,
        );
        let (settings_tx, _settings_rx) = watch::channel(Settings::default());
        let state = HttpAppState {
            metrics: Metrics::new().unwrap(),
            store: Arc::new(TimeSeriesStore::new(10, 5)),
            alerts: Arc::new(RwLock::new(AlertEngine::default())),
            settings: Arc::new(settings_tx),
            settings_path: Arc::new(dir.path().join("settings.yaml")),
            devices,
            diagnostics: Arc::new(DiagnosticsRunner::new(Client::new())),
            host: Arc::new(HostInfo::default()),
        };
        TestApp {
            router: build_router(state.clone()),
            state,
            _shutdown: shutdown_tx,
            _dir: dir,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = test_app();
        let (status, body) = send(&app.router, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_counts_scrapes() {
        let app = test_app();
        let (status, body) = send(&app.router, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hostwatch_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn snapshot_is_not_found_until_first_tick() {
        let app = test_app();
        let (status, _) = send(&app.router, "GET", "/api/snapshot", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.state.store.append(Arc::new(with_cpu(0, 33.0)));
        let (status, body) = send(&app.router, "GET", "/api/snapshot", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"percent\":33.0"));
        assert!(!body.contains("\"gpu\""));
    }

    #[tokio::test]
    async fn window_and_rates_read_from_store() {
        let app = test_app();
        app.state.store.append(Arc::new(with_net(0, 0, 0)));
        app.state.store.append(Arc::new(with_net(2, 200, 400)));

        let (status, body) = send(
            &app.router,
            "GET",
            "/api/window?metric=network%5Beth0%5D.recv_rate",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["metric"], "network[eth0].recv_rate");
        assert_eq!(parsed["points"][0]["value"], 200.0);

        let (_, body) = send(&app.router, "GET", "/api/network/rates", None).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["eth0"]["sent_per_sec"], 100.0);
    }

    #[tokio::test]
    async fn unknown_metric_is_rejected() {
        let app = test_app();
        let (status, _) = send(&app.router, "GET", "/api/window?metric=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_update_validates_and_publishes() {
        let app = test_app();
        let (status, body) = send(
            &app.router,
            "PUT",
            "/api/settings",
            Some(r#"{"cpu_temp_threshold": 70}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"cpu_temp_threshold\":70.0"));
        assert_eq!(app.state.settings.borrow().cpu_temp_threshold, 70.0);

        let (status, _) = send(
            &app.router,
            "PUT",
            "/api/settings",
            Some(r#"{"ram_threshold": 120}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(app.state.settings.borrow().ram_threshold, 90.0);

        let (status, _) = send(&app.router, "POST", "/api/settings/save", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let saved = Settings::load(app.state.settings_path.as_path()).unwrap();
        assert_eq!(saved.cpu_temp_threshold, 70.0);
    }

    #[tokio::test]
    async fn alerts_can_be_listed_and_cleared() {
        let app = test_app();
        let mut snap = with_cpu(0, 10.0);
        if let Some(cpu) = snap.cpu.as_mut() {
            cpu.temperature = Some(95.0);
        }
        app.state
            .alerts
            .write()
            .unwrap()
            .evaluate(&snap, &(&Settings::default()).into());

        let (_, body) = send(&app.router, "GET", "/api/alerts", None).await;
        assert!(body.contains("High temperature: 95°C"));

        let (status, _) = send(&app.router, "DELETE", "/api/alerts", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&app.router, "GET", "/api/alerts", None).await;
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn reports_need_history() {
        let app = test_app();
        let (status, _) = send(&app.router, "GET", "/api/report/tabular", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.state.store.append(Arc::new(with_cpu(0, 5.0)));
        let (status, body) = send(&app.router, "GET", "/api/report/tabular", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"timestamp\""));
        assert!(body.contains("cpu.percent"));

        let (status, body) = send(&app.router, "GET", "/api/report/charts", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("CPU Usage and Temperature"));

        let (_, body) =
            send(&app.router, "GET", "/api/report/series?metric=cpu.percent", None).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed[0]["value"], 5.0);
    }

    #[tokio::test]
    async fn discovery_populates_devices() {
        let app = test_app();
        let (_, body) = send(&app.router, "GET", "/api/devices", None).await;
        assert_eq!(body, "[]");
        let (status, body) = send(&app.router, "POST", "/api/devices/discover", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("192.168.1.10"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_settings_updates_all_land() {
        let app = test_app();
        let mut requests = Vec::new();
        for (field, value) in [
            ("cpu_temp_threshold", 71),
            ("gpu_temp_threshold", 72),
            ("ram_threshold", 73),
            ("disk_threshold", 74),
        ] {
            let router = app.router.clone();
            let body = format!(r#"{{"{field}": {value}}}"#);
            requests.push(tokio::spawn(async move {
                send(&router, "PUT", "/api/settings", Some(&body)).await.0
            }));
        }
        for request in requests {
            assert_eq!(request.await.unwrap(), StatusCode::OK);
        }

        let settings = app.state.settings.borrow().clone();
        assert_eq!(settings.cpu_temp_threshold, 71.0);
        assert_eq!(settings.gpu_temp_threshold, 72.0);
        assert_eq!(settings.ram_threshold, 73.0);
        assert_eq!(settings.disk_threshold, 74.0);
    }

    #[tokio::test]
    async fn cleanup_is_forbidden_unless_enabled() {
        let app = test_app();
        let (status, body) = send(&app.router, "POST", "/api/diagnostics/cleanup", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("disabled"));
    }

    #[tokio::test]
    async fn diagnostics_after_shutdown_are_unavailable() {
        let app = test_app();
        app.state.diagnostics.shutdown().await;
        let (status, _) = send(&app.router, "POST", "/api/diagnostics/disk-health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn bad_ping_target_is_rejected() {
        let app = test_app();
        let (status, _) = send(
            &app.router,
            "POST",
            "/api/diagnostics/ping",
            Some(r#"{"target": "-f"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
