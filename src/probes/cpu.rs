use super::sensor_tree::{SensorNode, CPU_PACKAGE_TEMP};
use crate::error::ProbeError;
use crate::snapshot::{CpuReading, Domain};
#[cfg(target_os = "linux")]
use std::fs;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};

/// Component labels preferred for the CPU temperature, in priority order.
const PRIMARY_TEMP_MARKERS: [&str; 6] = [
    "coretemp",
    "k10temp",
    "cpu_thermal",
    "package",
    "tctl",
    "tdie",
];
const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

pub struct CpuProbe {
    system: System,
    primed: bool,
    max_frequency: Option<f64>,
}

impl CpuProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_components_list();
        Self {
            system,
            primed: false,
            max_frequency: read_max_frequency_mhz(),
        }
    }

    pub fn read(&mut self, tree: Option<&SensorNode>) -> Result<CpuReading, ProbeError> {
        self.system.refresh_cpu();
        self.system.refresh_components();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(ProbeError::unavailable(Domain::Cpu, "no cpus reported"));
        }

        // Usage is a delta between two refreshes; the first one has no baseline.
        let percent = if self.primed {
            Some(f64::from(self.system.global_cpu_info().cpu_usage()).clamp(0.0, 100.0))
        } else {
            self.primed = true;
            None
        };

        let frequency_current = cpus
            .first()
            .map(|c| c.frequency() as f64)
            .filter(|f| *f > 0.0);

        let components: Vec<(String, f64)> = self
            .system
            .components()
            .iter()
            .map(|c| (c.label().to_string(), f64::from(c.temperature())))
            .collect();
        let temperature = pick_cpu_temperature(&components)
            .or_else(|| tree.and_then(|t| t.lookup_number(&CPU_PACKAGE_TEMP)));

        Ok(CpuReading {
            percent,
            temperature,
            cores_physical: self.system.physical_core_count().map(|n| n as u32),
            cores_logical: cpus.len() as u32,
            frequency_current,
            frequency_max: self.max_frequency,
        })
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks the CPU temperature from labelled OS sensor components.
pub fn pick_cpu_temperature(components: &[(String, f64)]) -> Option<f64> {
    let plausible = |v: &f64| *v > 0.0 && *v <= 130.0;
    let candidates: Vec<(String, f64)> = components
        .iter()
        .filter(|(_, v)| plausible(v))
        .map(|(label, v)| (label.to_lowercase(), *v))
        .filter(|(label, _)| !GPU_MARKERS.iter().any(|m| label.contains(m)))
        .collect();

    for marker in PRIMARY_TEMP_MARKERS {
        if let Some((_, v)) = candidates.iter().find(|(label, _)| label.contains(marker)) {
            return Some(*v);
        }
    }

    candidates
        .iter()
        .filter(|(label, _)| label.contains("cpu") || label.contains("core"))
        .map(|(_, v)| *v)
        .max_by(|a, b| a.total_cmp(b))
}

#[cfg(target_os = "linux")]
fn read_max_frequency_mhz() -> Option<f64> {
    let raw = fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq").ok()?;
    let khz = raw.trim().parse::<f64>().ok()?;
    (khz > 0.0).then_some(khz / 1000.0)
}

#[cfg(not(target_os = "linux"))]
fn read_max_frequency_mhz() -> Option<f64> {
    None
}
