use super::sensor_tree::{
    SensorNode, GPU_CORE_LOAD, GPU_CORE_TEMP, GPU_MEMORY_TOTAL, GPU_MEMORY_USED,
};
use crate::error::ProbeError;
use crate::snapshot::{Domain, GpuReading};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

pub const NVIDIA_SMI_ARGS: [&str; 2] = [
    "--query-gpu=utilization.gpu,temperature.gpu,memory.used,memory.total",
    "--format=csv,noheader,nounits",
];

/// One way of obtaining a GPU reading. Strategies are tried in order; the first success wins.
#[derive(Debug, Clone)]
pub enum GpuStrategy {
    MonitorEndpoint,
    VendorCli { program: String, timeout: Duration },
}

impl GpuStrategy {
    pub fn nvidia_smi(timeout: Duration) -> Self {
        Self::VendorCli {
            program: "nvidia-smi".to_string(),
            timeout,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::MonitorEndpoint => "monitor-endpoint",
            Self::VendorCli { program, .. } => program,
        }
    }
}

pub struct GpuProbe {
    strategies: Vec<GpuStrategy>,
}

impl GpuProbe {
    pub fn new(strategies: Vec<GpuStrategy>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &[GpuStrategy] {
        &self.strategies
    }

    pub async fn read(&self, tree: Option<&SensorNode>) -> Result<GpuReading, ProbeError> {
        let mut failures: Vec<(&str, ProbeError)> = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let attempt = match strategy {
                GpuStrategy::MonitorEndpoint => tree
                    .ok_or_else(|| "endpoint tree unavailable".to_string())
                    .and_then(gpu_from_tree)
                    .map_err(|reason| ProbeError::unavailable(Domain::Gpu, reason)),
                GpuStrategy::VendorCli { program, timeout } => {
                    run_vendor_cli(program, *timeout).await
                }
            };
            match attempt {
                Ok(reading) => {
                    debug!(strategy = strategy.name(), "gpu reading obtained");
                    return Ok(reading);
                }
                Err(err) => failures.push((strategy.name(), err)),
            }
        }

        match failures.len() {
            0 => Err(ProbeError::unavailable(
                Domain::Gpu,
                "no gpu backend configured",
            )),
            // A lone strategy keeps its own error, timeouts included.
            1 => Err(failures.remove(0).1),
            _ => {
                let reason = failures
                    .iter()
                    .map(|(name, err)| match err {
                        ProbeError::Unavailable { reason, .. } => format!("{name}: {reason}"),
                        ProbeError::Timeout { .. } => format!("{name}: timeout"),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(ProbeError::unavailable(Domain::Gpu, reason))
            }
        }
    }
}

pub fn gpu_from_tree(tree: &SensorNode) -> Result<GpuReading, String> {
    let reading = GpuReading {
        load: tree.lookup_number(&GPU_CORE_LOAD),
        temperature: tree.lookup_number(&GPU_CORE_TEMP),
        mem_used: tree.lookup_number(&GPU_MEMORY_USED).map(mib_to_bytes),
        mem_total: tree.lookup_number(&GPU_MEMORY_TOTAL).map(mib_to_bytes),
    };
    if reading.is_empty() {
        return Err("no gpu sensors in endpoint tree".to_string());
    }
    Ok(reading)
}

async fn run_vendor_cli(program: &str, timeout: Duration) -> Result<GpuReading, ProbeError> {
    let child = Command::new(program)
        .args(NVIDIA_SMI_ARGS)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return Err(ProbeError::unavailable(Domain::Gpu, err.to_string())),
        Err(_elapsed) => {
            return Err(ProbeError::Timeout {
                domain: Domain::Gpu,
                after: timeout,
            })
        }
    };
    if !output.status.success() {
        return Err(ProbeError::unavailable(
            Domain::Gpu,
            format!("exited with {}", output.status),
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    parse_vendor_csv(&text)
        .ok_or_else(|| ProbeError::unavailable(Domain::Gpu, "unparseable output"))
}

/// Parses the first line of `load, temp, mem_used_mib, mem_total_mib`.
pub fn parse_vendor_csv(text: &str) -> Option<GpuReading> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let fields: Vec<f64> = line
        .split(',')
        .map(|v| v.trim().parse::<f64>().ok().filter(|f| f.is_finite()))
        .collect::<Option<Vec<f64>>>()?;
    if fields.len() < 4 {
        return None;
    }
    Some(GpuReading {
        load: Some(fields[0]),
        temperature: Some(fields[1]),
        mem_used: Some(mib_to_bytes(fields[2])),
        mem_total: Some(mib_to_bytes(fields[3])),
    })
}

fn mib_to_bytes(mib: f64) -> u64 {
    (mib.max(0.0) as u64).saturating_mul(MIB)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::sensor_tree::sample_tree;

    #[test]
    fn vendor_csv_is_parsed_into_bytes() {
        let reading = parse_vendor_csv("37, 64, 1024, 8192\n").unwrap();
        assert_eq!(reading.load, Some(37.0));
        assert_eq!(reading.temperature, Some(64.0));
        assert_eq!(reading.mem_used, Some(1024 * MIB));
        assert_eq!(reading.mem_total, Some(8192 * MIB));
    }

    #[test]
    fn vendor_csv_with_bad_field_is_rejected() {
        assert!(parse_vendor_csv("[N/A], 64, 1024, 8192").is_none());
        assert!(parse_vendor_csv("37, 64").is_none());
        assert!(parse_vendor_csv("").is_none());
    }

    #[test]
    fn tree_strategy_reads_gpu_core_leaves() {
        let reading = gpu_from_tree(&sample_tree()).unwrap();
        assert_eq!(reading.load, Some(7.0));
        assert_eq!(reading.temperature, Some(54.0));
        assert_eq!(reading.mem_used, Some(512 * MIB));
    }

    #[tokio::test]
    async fn first_successful_strategy_wins() {
        let probe = GpuProbe::new(vec![
            GpuStrategy::MonitorEndpoint,
            GpuStrategy::VendorCli {
                program: "hostwatch-missing-vendor-tool".to_string(),
                timeout: Duration::from_millis(200),
            },
        ]);
        let tree = sample_tree();
        let reading = probe.read(Some(&tree)).await.unwrap();
        assert_eq!(reading.temperature, Some(54.0));
    }

    #[tokio::test]
    async fn all_strategies_failing_is_unavailable() {
        let probe = GpuProbe::new(vec![
            GpuStrategy::MonitorEndpoint,
            GpuStrategy::VendorCli {
                program: "hostwatch-missing-vendor-tool".to_string(),
                timeout: Duration::from_millis(200),
            },
        ]);
        let err = probe.read(None).await.unwrap_err();
        assert_eq!(err.domain(), Domain::Gpu);
        assert!(matches!(err, ProbeError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn lone_missing_vendor_tool_keeps_its_error() {
        let probe = GpuProbe::new(vec![GpuStrategy::VendorCli {
            program: "hostwatch-missing-vendor-tool".to_string(),
            timeout: Duration::from_secs(2),
        }]);
        let err = probe.read(None).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable { .. }));
        assert_ne!(err.cause_key(), "timeout");
    }

    #[tokio::test]
    async fn empty_strategy_list_is_unavailable() {
        let probe = GpuProbe::new(Vec::new());
        assert!(probe.read(None).await.is_err());
    }
}
