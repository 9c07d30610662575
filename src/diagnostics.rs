use crate::error::DiagnosticError;
use crate::snapshot::format_bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use walkdir::WalkDir;

const SPEEDTEST_BASE: &str = "https://speed.cloudflare.com";
const DOWNLOAD_BYTES: usize = 10_000_000;
const LATENCY_TIMEOUT: Duration = Duration::from_secs(6);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);
const PING_COUNT: &str = "4";
const PING_TIMEOUT: Duration = Duration::from_secs(20);
const DISK_HEALTH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    SpeedTest,
    Ping {
        target: String,
    },
    DiskHealth,
    /// Deletes files (never directories) under the selected locations.
    Cleanup {
        #[serde(default)]
        temp: bool,
        #[serde(default)]
        cache: bool,
    },
}

impl DiagnosticKind {
    fn label(&self) -> &'static str {
        match self {
            Self::SpeedTest => "speedtest",
            Self::Ping { .. } => "ping",
            Self::DiskHealth => "disk-health",
            Self::Cleanup { .. } => "cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTestResult {
    pub download_mbps: f64,
    pub latency_ms: f64,
    pub downloaded_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub files: u64,
    pub bytes: u64,
    pub failures: u64,
}

impl CleanupSummary {
    fn add(&mut self, other: CleanupSummary) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.failures += other.failures;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<SpeedTestResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
}

#[derive(Default)]
struct Outcome {
    success: bool,
    output: String,
    speed: Option<SpeedTestResult>,
    cleanup: Option<CleanupSummary>,
}

impl Outcome {
    fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }
}

/// Locations the cleanup diagnostic may empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRoots {
    pub temp: PathBuf,
    pub cache: Option<PathBuf>,
}

impl CleanupRoots {
    pub fn for_current_user() -> Self {
        let cache = if cfg!(target_os = "windows") {
            dirs::data_local_dir().map(|dir| dir.join("Temp"))
        } else {
            dirs::cache_dir()
        };
        Self {
            temp: std::env::temp_dir(),
            cache,
        }
    }

    fn select(&self, temp: bool, cache: bool) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if temp {
            paths.push(self.temp.clone());
        }
        if cache {
            paths.extend(self.cache.clone());
        }
        paths
    }
}

#[derive(Default)]
struct Slot {
    task: Option<JoinHandle<()>>,
    closed: bool,
}

/// Runs one network or disk diagnostic at a time on a short-lived task.
pub struct DiagnosticsRunner {
    client: Client,
    cleanup: Option<CleanupRoots>,
    slot: Mutex<Slot>,
}

impl DiagnosticsRunner {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cleanup: None,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Enables [`DiagnosticKind::Cleanup`] over `roots`. Without it cleanup is refused.
    pub fn with_cleanup(mut self, roots: CleanupRoots) -> Self {
        self.cleanup = Some(roots);
        self
    }

    /// Starts `kind`; the report arrives on the returned receiver.
    pub fn start(
        &self,
        kind: DiagnosticKind,
    ) -> Result<oneshot::Receiver<DiagnosticReport>, DiagnosticError> {
        let label = kind.label();
        match kind {
            DiagnosticKind::SpeedTest => {
                let client = self.client.clone();
                self.spawn(label, async move { speed_test(&client).await })
            }
            DiagnosticKind::Ping { target } => {
                validate_target(&target)?;
                self.spawn(label, async move { ping(&target).await })
            }
            DiagnosticKind::DiskHealth => self.spawn(label, disk_health()),
            DiagnosticKind::Cleanup { temp, cache } => {
                let roots = self.cleanup.as_ref().ok_or(DiagnosticError::CleanupDisabled)?;
                let paths = roots.select(temp, cache);
                if paths.is_empty() {
                    return Err(DiagnosticError::NothingToClean);
                }
                self.spawn(label, clean_up(paths))
            }
        }
    }

    fn spawn<F>(
        &self,
        label: &'static str,
        job: F,
    ) -> Result<oneshot::Receiver<DiagnosticReport>, DiagnosticError>
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            return Err(DiagnosticError::Closed);
        }
        if slot.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(DiagnosticError::Busy);
        }

        let (tx, rx) = oneshot::channel();
        slot.task = Some(tokio::spawn(async move {
            let started_at = Utc::now();
            info!(kind = label, "diagnostic started");
            let outcome = job.await;
            info!(kind = label, success = outcome.success, "diagnostic finished");
            let _ = tx.send(DiagnosticReport {
                kind: label.to_string(),
                started_at,
                finished_at: Utc::now(),
                success: outcome.success,
                output: outcome.output,
                speed: outcome.speed,
                cleanup: outcome.cleanup,
            });
        }));
        Ok(rx)
    }

    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Refuses further starts, then cancels the in-flight diagnostic and waits for it.
    pub async fn shutdown(&self) {
        let task = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.closed = true;
            slot.task.take()
        };
        if let Some(task) = task {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "diagnostic task ended abnormally");
                }
            }
        }
    }
}

fn validate_target(target: &str) -> Result<(), DiagnosticError> {
    let ok = !target.is_empty()
        && !target.starts_with('-')
        && target.len() <= 253
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if ok {
        Ok(())
    } else {
        Err(DiagnosticError::InvalidTarget(target.to_string()))
    }
}

async fn speed_test(client: &Client) -> Outcome {
    match measure_speed(client).await {
        Ok(result) => Outcome {
            success: true,
            output: format!(
                "Download: {:.2} Mbps\nLatency: {:.0} ms\nTransferred: {}",
                result.download_mbps,
                result.latency_ms,
                format_bytes(result.downloaded_bytes as f64)
            ),
            speed: Some(result),
            ..Outcome::default()
        },
        Err(err) => Outcome::failed(format!("Speed test failed: {err}")),
    }
}

async fn timed<T>(work: impl Future<Output = T>) -> (T, Duration) {
    let started = Instant::now();
    let out = work.await;
    (out, started.elapsed())
}

fn megabits_per_sec(bytes: usize, elapsed: Duration) -> f64 {
    (bytes as f64 * 8.0 / 1_000_000.0) / elapsed.as_secs_f64().max(0.001)
}

async fn download(client: &Client, url: String) -> Result<usize, reqwest::Error> {
    let response = client
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.bytes().await?.len())
}

/// Round trip of a HEAD request, then one timed download.
async fn measure_speed(client: &Client) -> Result<SpeedTestResult, reqwest::Error> {
    let (head, latency) =
        timed(client.head(SPEEDTEST_BASE).timeout(LATENCY_TIMEOUT).send()).await;
    head?;

    let url = format!("{SPEEDTEST_BASE}/__down?bytes={DOWNLOAD_BYTES}");
    let (received, elapsed) = timed(download(client, url)).await;
    let received = received?;

    Ok(SpeedTestResult {
        download_mbps: megabits_per_sec(received, elapsed),
        latency_ms: latency.as_secs_f64() * 1000.0,
        downloaded_bytes: received as u64,
    })
}

async fn ping(target: &str) -> Outcome {
    let count_flag = if cfg!(target_os = "windows") { "-n" } else { "-c" };
    run_command("ping", &[count_flag, PING_COUNT, target], PING_TIMEOUT).await
}

#[cfg(target_os = "windows")]
async fn disk_health() -> Outcome {
    run_command("chkdsk", &["C:"], DISK_HEALTH_TIMEOUT).await
}

#[cfg(not(target_os = "windows"))]
async fn disk_health() -> Outcome {
    use sysinfo::{DiskExt, System, SystemExt};

    let mut system = System::new();
    system.refresh_disks_list();
    let device = system
        .disks()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .map(|d| d.name().to_string_lossy().into_owned());
    match device {
        Some(device) => run_command("smartctl", &["-H", &device], DISK_HEALTH_TIMEOUT).await,
        None => Outcome::failed("Root partition not found"),
    }
}

async fn clean_up(paths: Vec<PathBuf>) -> Outcome {
    match tokio::task::spawn_blocking(move || clean_paths(&paths)).await {
        Ok((summary, log)) => Outcome {
            success: summary.failures == 0,
            output: log.join("\n"),
            cleanup: Some(summary),
            ..Outcome::default()
        },
        Err(err) => Outcome::failed(format!("Error: cleanup task failed: {err}")),
    }
}

/// Removes every file below each root, keeping the directory structure.
fn clean_paths(paths: &[PathBuf]) -> (CleanupSummary, Vec<String>) {
    let mut log = vec!["Starting disk cleanup...".to_string()];
    let mut total = CleanupSummary::default();

    for root in paths {
        if !root.exists() {
            log.push(format!("Skipping non-existent path: {}", root.display()));
            continue;
        }
        log.push(format!("Cleaning: {}", root.display()));

        let mut here = CleanupSummary::default();
        for entry in WalkDir::new(root).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    here.failures += 1;
                    log.push(format!("Error: {err}"));
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    here.files += 1;
                    here.bytes += size;
                }
                Err(err) => {
                    here.failures += 1;
                    log.push(format!("Error deleting {}: {err}", entry.path().display()));
                }
            }
        }
        log.push(format!(
            "Deleted {} files ({})",
            here.files,
            format_bytes(here.bytes as f64)
        ));
        total.add(here);
    }

    log.push(format!(
        "Total deleted: {} files ({})",
        total.files,
        format_bytes(total.bytes as f64)
    ));
    (total, log)
}

/// Runs a tool to completion, combining stdout and stderr.
async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Outcome {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Outcome {
                success: output.status.success(),
                output: text,
                ..Outcome::default()
            }
        }
        Ok(Err(err)) => Outcome::failed(format!("Error: {program}: {err}")),
        Err(_elapsed) => Outcome::failed(format!(
            "Error: {program} timed out after {}",
            humantime::format_duration(timeout)
        )),
    }
}
