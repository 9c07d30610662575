use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Cpu,
    Memory,
    Disk,
    Gpu,
    Network,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Cpu,
        Domain::Memory,
        Domain::Disk,
        Domain::Gpu,
        Domain::Network,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Cpu => "cpu",
            Domain::Memory => "memory",
            Domain::Disk => "disk",
            Domain::Gpu => "gpu",
            Domain::Network => "network",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tick worth of readings. A `None` domain means its probe failed on that tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<BTreeMap<String, DiskUsage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<BTreeMap<String, NetCounters>>,
}

impl Snapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu: None,
            memory: None,
            disk: None,
            gpu: None,
            network: None,
        }
    }

    pub fn has_domain(&self, domain: Domain) -> bool {
        match domain {
            Domain::Cpu => self.cpu.is_some(),
            Domain::Memory => self.memory.is_some(),
            Domain::Disk => self.disk.is_some(),
            Domain::Gpu => self.gpu.is_some(),
            Domain::Network => self.network.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores_physical: Option<u32>,
    pub cores_logical: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

impl MemoryUsage {
    pub fn new(total: u64, used: u64, free: u64) -> Self {
        Self {
            total,
            used,
            free,
            percent: percent(used, total),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryReading {
    #[serde(rename = "virtual")]
    pub virtual_memory: MemoryUsage,
    pub swap: MemoryUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

impl DiskUsage {
    pub fn from_total_and_free(total: u64, free: u64) -> Self {
        let used = total.saturating_sub(free);
        Self {
            total,
            used,
            free,
            percent: percent(used, total),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GpuReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_total: Option<u64>,
}

impl GpuReading {
    pub fn is_empty(&self) -> bool {
        self.load.is_none()
            && self.temperature.is_none()
            && self.mem_used.is_none()
            && self.mem_total.is_none()
    }

    pub fn memory_percent(&self) -> Option<f64> {
        match (self.mem_used, self.mem_total) {
            (Some(used), Some(total)) if total > 0 => Some(percent(used, total)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64) * 100.0
}

pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes;
    for unit in UNITS {
        if size.abs() < 1024.0 {
            if unit == "B" {
                return format!("{size:.0} {unit}");
            }
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}
