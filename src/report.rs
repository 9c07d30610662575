//! Pure projections of a snapshot history into interchange shapes for report writers.
//!
//! Nothing here touches the store or performs I/O apart from [`HostInfo::collect`].

use crate::error::ReportError;
use crate::snapshot::{format_bytes, Snapshot};
use crate::store::{self, MetricSelector, SeriesPoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use sysinfo::{CpuExt, CpuRefreshKind, RefreshKind, System, SystemExt};

/// Snapshot fields whose children are keyed by name (mount, interface) rather than fixed.
const KEYED_FIELDS: [&str; 2] = ["disk", "network"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportNode {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ReportNode>,
}

impl ReportNode {
    fn branch(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: BTreeMap::new(),
            text: None,
            children: Vec::new(),
        }
    }

    fn leaf(name: &str, text: impl ToString) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::branch(name)
        }
    }

    fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    fn push_opt(&mut self, name: &str, value: Option<impl ToString>) {
        if let Some(v) = value {
            self.children.push(Self::leaf(name, v));
        }
    }

    pub fn child(&self, name: &str) -> Option<&ReportNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

/// Host identification for the `SystemInfo` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub system: Option<String>,
    pub node: Option<String>,
    pub release: Option<String>,
    pub version: Option<String>,
    pub machine: Option<String>,
    pub processor: Option<String>,
    pub memory_total: Option<u64>,
}

impl HostInfo {
    pub fn collect() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new()),
        );
        system.refresh_memory();
        let processor = system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty());
        Self {
            system: system.name(),
            node: system.host_name(),
            release: system.kernel_version(),
            version: system.os_version(),
            machine: Some(std::env::consts::ARCH.to_string()),
            processor,
            memory_total: Some(system.total_memory()).filter(|m| *m > 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartLine {
    pub label: String,
    pub unit: String,
    pub metric: MetricSelector,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartDescriptor {
    pub title: String,
    pub lines: Vec<ChartLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Tabular,
    Hierarchical,
    Charts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Report {
    Tabular(Table),
    Hierarchical(ReportNode),
    Charts(Vec<ChartDescriptor>),
}

/// Projects `history` into the requested shape. An empty history is refused.
pub fn generate(
    kind: ReportKind,
    host: &HostInfo,
    history: &[Arc<Snapshot>],
) -> Result<Report, ReportError> {
    if history.is_empty() {
        return Err(ReportError::EmptyHistory);
    }
    Ok(match kind {
        ReportKind::Tabular => Report::Tabular(to_tabular(history)?),
        ReportKind::Hierarchical => Report::Hierarchical(to_hierarchical(host, history)),
        ReportKind::Charts => Report::Charts(chart_descriptors(history)),
    })
}

/// One row per snapshot: `timestamp` first, then every flattened key in sorted order.
pub fn to_tabular(history: &[Arc<Snapshot>]) -> Result<Table, ReportError> {
    let mut flattened = Vec::with_capacity(history.len());
    for snap in history {
        flattened.push(flatten_snapshot(snap)?);
    }

    let keys: BTreeSet<&String> = flattened.iter().flat_map(|row| row.keys()).collect();
    let mut columns = Vec::with_capacity(keys.len() + 1);
    columns.push("timestamp".to_string());
    columns.extend(keys.iter().map(|k| k.to_string()));

    let rows = history
        .iter()
        .zip(&flattened)
        .map(|(snap, values)| {
            let mut row = Vec::with_capacity(columns.len());
            row.push(Cell::Text(snap.timestamp.to_rfc3339()));
            row.extend(
                keys.iter()
                    .map(|k| values.get(*k).cloned().unwrap_or(Cell::Empty)),
            );
            row
        })
        .collect();

    Ok(Table { columns, rows })
}

fn flatten_snapshot(snap: &Snapshot) -> Result<BTreeMap<String, Cell>, ReportError> {
    let value =
        serde_json::to_value(snap).map_err(|e| ReportError::GenerationFailed(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(ReportError::GenerationFailed(
            "snapshot did not serialize to an object".to_string(),
        ));
    };

    let mut out = BTreeMap::new();
    for (field, value) in fields {
        if field == "timestamp" {
            continue;
        }
        if KEYED_FIELDS.contains(&field.as_str()) {
            if let Value::Object(entries) = value {
                for (key, inner) in entries {
                    flatten_into(&format!("{field}[{key}]"), inner, &mut out);
                }
                continue;
            }
        }
        flatten_into(&field, value, &mut out);
    }
    Ok(out)
}

fn flatten_into(prefix: &str, value: Value, out: &mut BTreeMap<String, Cell>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                flatten_into(&format!("{prefix}.{key}"), inner, out);
            }
        }
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                out.insert(prefix.to_string(), Cell::Number(v));
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), Cell::Text(s));
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), Cell::Text(b.to_string()));
        }
        Value::Null | Value::Array(_) => {}
    }
}

/// `SystemReport` tree: host identification plus one `Sample` per snapshot.
pub fn to_hierarchical(host: &HostInfo, history: &[Arc<Snapshot>]) -> ReportNode {
    let mut info = ReportNode::branch("SystemInfo");
    info.push_opt("System", host.system.as_ref());
    info.push_opt("Node", host.node.as_ref());
    info.push_opt("Release", host.release.as_ref());
    info.push_opt("Version", host.version.as_ref());
    info.push_opt("Machine", host.machine.as_ref());
    info.push_opt("Processor", host.processor.as_ref());
    info.push_opt("Memory", host.memory_total.map(|m| format_bytes(m as f64)));

    let mut metrics = ReportNode::branch("Metrics");
    metrics.children = history.iter().map(|s| sample_node(s)).collect();

    let mut root = ReportNode::branch("SystemReport");
    root.children = vec![info, metrics];
    root
}

fn sample_node(snap: &Snapshot) -> ReportNode {
    let mut sample =
        ReportNode::branch("Sample").with_attribute("timestamp", snap.timestamp.to_rfc3339());

    if let Some(cpu) = &snap.cpu {
        let mut node = ReportNode::branch("CPU");
        node.push_opt("Usage", cpu.percent);
        node.push_opt("Temperature", cpu.temperature);
        node.push_opt("PhysicalCores", cpu.cores_physical);
        node.push_opt("LogicalCores", Some(cpu.cores_logical));
        node.push_opt("Frequency", cpu.frequency_current);
        node.push_opt("MaxFrequency", cpu.frequency_max);
        sample.children.push(node);
    }

    if let Some(mem) = &snap.memory {
        let mut node = ReportNode::branch("Memory");
        for (name, usage) in [("Virtual", &mem.virtual_memory), ("Swap", &mem.swap)] {
            let mut part = ReportNode::branch(name);
            part.push_opt("Total", Some(usage.total));
            part.push_opt("Used", Some(usage.used));
            part.push_opt("Free", Some(usage.free));
            part.push_opt("Percent", Some(usage.percent));
            node.children.push(part);
        }
        sample.children.push(node);
    }

    if let Some(disks) = &snap.disk {
        let mut node = ReportNode::branch("Disks");
        for (mount, usage) in disks {
            let mut disk = ReportNode::branch("Disk").with_attribute("mount", mount.as_str());
            disk.push_opt("Total", Some(usage.total));
            disk.push_opt("Used", Some(usage.used));
            disk.push_opt("Free", Some(usage.free));
            disk.push_opt("Percent", Some(usage.percent));
            node.children.push(disk);
        }
        sample.children.push(node);
    }

    if let Some(gpu) = &snap.gpu {
        let mut node = ReportNode::branch("GPU");
        node.push_opt("Load", gpu.load);
        node.push_opt("Temperature", gpu.temperature);
        node.push_opt("MemoryUsed", gpu.mem_used);
        node.push_opt("MemoryTotal", gpu.mem_total);
        sample.children.push(node);
    }

    if let Some(ifaces) = &snap.network {
        let mut node = ReportNode::branch("Network");
        for (name, counters) in ifaces {
            let mut iface = ReportNode::branch("Interface").with_attribute("name", name.as_str());
            iface.push_opt("BytesSent", Some(counters.bytes_sent));
            iface.push_opt("BytesRecv", Some(counters.bytes_recv));
            node.children.push(iface);
        }
        sample.children.push(node);
    }

    sample
}

pub fn to_chart_series(history: &[Arc<Snapshot>], selector: &MetricSelector) -> Vec<SeriesPoint> {
    store::series(history, selector)
}

/// The two charts embedded in the printable report.
pub fn chart_descriptors(history: &[Arc<Snapshot>]) -> Vec<ChartDescriptor> {
    let line = |label: &str, unit: &str, metric: MetricSelector| ChartLine {
        label: label.to_string(),
        unit: unit.to_string(),
        points: to_chart_series(history, &metric),
        metric,
    };
    vec![
        ChartDescriptor {
            title: "CPU Usage and Temperature".to_string(),
            lines: vec![
                line("CPU Usage", "%", MetricSelector::CpuPercent),
                line("CPU Temperature", "°C", MetricSelector::CpuTemperature),
            ],
        },
        ChartDescriptor {
            title: "GPU Usage and Temperature".to_string(),
            lines: vec![
                line("GPU Usage", "%", MetricSelector::GpuLoad),
                line("GPU Temperature", "°C", MetricSelector::GpuTemperature),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{DiskUsage, GpuReading, MemoryReading, MemoryUsage};
    use crate::store::fixtures::{at, with_cpu, with_net};

    fn history() -> Vec<Arc<Snapshot>> {
        let mut first = with_cpu(0, 10.0);
        let mut disks = BTreeMap::new();
        disks.insert("/home".to_string(), DiskUsage::from_total_and_free(200, 50));
        first.disk = Some(disks);
        first.memory = Some(MemoryReading {
            virtual_memory: MemoryUsage::new(100, 25, 75),
            swap: MemoryUsage::new(0, 0, 0),
        });

        let mut second = with_net(2, 1000, 2000);
        second.gpu = Some(GpuReading {
            load: Some(30.0),
            temperature: Some(60.0),
            ..GpuReading::default()
        });
        vec![Arc::new(first), Arc::new(second)]
    }

    #[test]
    fn tabular_columns_are_timestamp_then_sorted_keys() {
        let table = to_tabular(&history()).unwrap();
        assert_eq!(table.columns[0], "timestamp");
        let rest = &table.columns[1..];
        let mut sorted = rest.to_vec();
        sorted.sort();
        assert_eq!(rest, sorted.as_slice());
        assert!(table.columns.contains(&"memory.virtual.percent".to_string()));
        assert!(table.columns.contains(&"disk[/home].percent".to_string()));
        assert!(table.columns.contains(&"network[eth0].bytes_sent".to_string()));
        assert!(!table.columns.contains(&"gpu.mem_used".to_string()));
    }

    #[test]
    fn tabular_absent_values_are_empty_cells() {
        let table = to_tabular(&history()).unwrap();
        let col = |name: &str| table.columns.iter().position(|c| c == name).unwrap();

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][col("disk[/home].percent")], Cell::Number(75.0));
        assert_eq!(table.rows[1][col("disk[/home].percent")], Cell::Empty);
        assert_eq!(table.rows[0][col("gpu.load")], Cell::Empty);
        assert_eq!(table.rows[1][col("gpu.load")], Cell::Number(30.0));
        assert_eq!(table.rows[0][0], Cell::Text(at(0).to_rfc3339()));
    }

    #[test]
    fn hierarchical_omits_absent_sections() {
        let host = HostInfo {
            system: Some("Linux".to_string()),
            node: Some("box".to_string()),
            ..HostInfo::default()
        };
        let root = to_hierarchical(&host, &history());
        assert_eq!(root.name, "SystemReport");

        let info = root.child("SystemInfo").unwrap();
        assert_eq!(info.children.len(), 2);
        assert_eq!(info.child("Node").and_then(|n| n.text.as_deref()), Some("box"));

        let samples = &root.child("Metrics").unwrap().children;
        assert_eq!(samples.len(), 2);
        assert_eq!(
            samples[0].attributes.get("timestamp"),
            Some(&at(0).to_rfc3339())
        );
        assert!(samples[0].child("GPU").is_none());
        assert!(samples[0].child("Network").is_none());
        let cpu = samples[0].child("CPU").unwrap();
        assert!(cpu.child("Temperature").is_none());
        assert_eq!(cpu.child("Usage").and_then(|n| n.text.as_deref()), Some("10"));

        let gpu = samples[1].child("GPU").unwrap();
        assert!(gpu.child("MemoryUsed").is_none());
        let json = serde_json::to_string(&root).unwrap();
        assert!(!json.contains("null"));
    }

    #[test]
    fn chart_series_skips_absent_points() {
        let points = to_chart_series(&history(), &MetricSelector::CpuPercent);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].time, at(0));

        let charts = chart_descriptors(&history());
        assert_eq!(charts[0].title, "CPU Usage and Temperature");
        assert_eq!(charts[1].title, "GPU Usage and Temperature");
        assert_eq!(charts[1].lines[0].points.len(), 1);
    }

    #[test]
    fn projections_are_deterministic() {
        let h = history();
        assert_eq!(to_tabular(&h).unwrap(), to_tabular(&h).unwrap());
        let host = HostInfo::default();
        assert_eq!(to_hierarchical(&host, &h), to_hierarchical(&host, &h));
    }

    #[test]
    fn empty_history_is_refused() {
        let err = generate(ReportKind::Tabular, &HostInfo::default(), &[]).unwrap_err();
        assert!(matches!(err, ReportError::EmptyHistory));
    }
}
