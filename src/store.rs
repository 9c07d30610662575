use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// A plottable scalar derived from one snapshot (and, for rates, its predecessor).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetricSelector {
    CpuPercent,
    CpuTemperature,
    CpuFrequency,
    MemoryPercent,
    SwapPercent,
    GpuLoad,
    GpuTemperature,
    GpuMemoryPercent,
    DiskPercent(String),
    NetSentRate(String),
    NetRecvRate(String),
}

impl MetricSelector {
    pub fn needs_previous(&self) -> bool {
        matches!(self, Self::NetSentRate(_) | Self::NetRecvRate(_))
    }

    pub fn value(&self, prev: Option<&Snapshot>, cur: &Snapshot) -> Option<f64> {
        match self {
            Self::CpuPercent => cur.cpu.as_ref()?.percent,
            Self::CpuTemperature => cur.cpu.as_ref()?.temperature,
            Self::CpuFrequency => cur.cpu.as_ref()?.frequency_current,
            Self::MemoryPercent => Some(cur.memory.as_ref()?.virtual_memory.percent),
            Self::SwapPercent => Some(cur.memory.as_ref()?.swap.percent),
            Self::GpuLoad => cur.gpu.as_ref()?.load,
            Self::GpuTemperature => cur.gpu.as_ref()?.temperature,
            Self::GpuMemoryPercent => cur.gpu.as_ref()?.memory_percent(),
            Self::DiskPercent(mount) => Some(cur.disk.as_ref()?.get(mount)?.percent),
            Self::NetSentRate(iface) => Some(interface_rate(prev?, cur, iface)?.sent_per_sec),
            Self::NetRecvRate(iface) => Some(interface_rate(prev?, cur, iface)?.recv_per_sec),
        }
    }
}

impl fmt::Display for MetricSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuPercent => f.write_str("cpu.percent"),
            Self::CpuTemperature => f.write_str("cpu.temperature"),
            Self::CpuFrequency => f.write_str("cpu.frequency_current"),
            Self::MemoryPercent => f.write_str("memory.virtual.percent"),
            Self::SwapPercent => f.write_str("memory.swap.percent"),
            Self::GpuLoad => f.write_str("gpu.load"),
            Self::GpuTemperature => f.write_str("gpu.temperature"),
            Self::GpuMemoryPercent => f.write_str("gpu.mem_percent"),
            Self::DiskPercent(mount) => write!(f, "disk[{mount}].percent"),
            Self::NetSentRate(iface) => write!(f, "network[{iface}].sent_rate"),
            Self::NetRecvRate(iface) => write!(f, "network[{iface}].recv_rate"),
        }
    }
}

impl FromStr for MetricSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let simple = match s {
            "cpu.percent" => Some(Self::CpuPercent),
            "cpu.temperature" => Some(Self::CpuTemperature),
            "cpu.frequency_current" => Some(Self::CpuFrequency),
            "memory.virtual.percent" => Some(Self::MemoryPercent),
            "memory.swap.percent" => Some(Self::SwapPercent),
            "gpu.load" => Some(Self::GpuLoad),
            "gpu.temperature" => Some(Self::GpuTemperature),
            "gpu.mem_percent" => Some(Self::GpuMemoryPercent),
            _ => None,
        };
        if let Some(sel) = simple {
            return Ok(sel);
        }

        let keyed = |prefix: &str, suffix: &str| -> Option<String> {
            s.strip_prefix(prefix)?
                .strip_suffix(suffix)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
        };
        if let Some(mount) = keyed("disk[", "].percent") {
            return Ok(Self::DiskPercent(mount));
        }
        if let Some(iface) = keyed("network[", "].sent_rate") {
            return Ok(Self::NetSentRate(iface));
        }
        if let Some(iface) = keyed("network[", "].recv_rate") {
            return Ok(Self::NetRecvRate(iface));
        }
        Err(format!("unknown metric '{s}'"))
    }
}

impl Serialize for MetricSelector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MetricSelector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NetRate {
    pub sent_per_sec: f64,
    pub recv_per_sec: f64,
}

/// Bytes/sec between two cumulative counter samples of one interface.
///
/// `None` when elapsed time is not positive, the interface is missing from either sample
/// or a counter went backwards (interface reset).
pub fn interface_rate(prev: &Snapshot, cur: &Snapshot, iface: &str) -> Option<NetRate> {
    let elapsed = (cur.timestamp - prev.timestamp).num_milliseconds();
    if elapsed <= 0 {
        return None;
    }
    let secs = elapsed as f64 / 1000.0;
    let before = prev.network.as_ref()?.get(iface)?;
    let after = cur.network.as_ref()?.get(iface)?;
    let sent = after.bytes_sent.checked_sub(before.bytes_sent)?;
    let recv = after.bytes_recv.checked_sub(before.bytes_recv)?;
    Some(NetRate {
        sent_per_sec: sent as f64 / secs,
        recv_per_sec: recv as f64 / secs,
    })
}

pub fn network_rates(prev: &Snapshot, cur: &Snapshot) -> BTreeMap<String, NetRate> {
    let Some(ifaces) = cur.network.as_ref() else {
        return BTreeMap::new();
    };
    ifaces
        .keys()
        .filter_map(|iface| Some((iface.clone(), interface_rate(prev, cur, iface)?)))
        .collect()
}

/// Scalar series for `selector` across `history`, absent values skipped.
pub fn series(history: &[Arc<Snapshot>], selector: &MetricSelector) -> Vec<SeriesPoint> {
    history
        .iter()
        .enumerate()
        .filter_map(|(i, snap)| {
            let prev = i.checked_sub(1).map(|p| history[p].as_ref());
            let value = selector.value(prev, snap)?;
            value.is_finite().then_some(SeriesPoint {
                time: snap.timestamp,
                value,
            })
        })
        .collect()
}

/// Fixed-capacity snapshot history, oldest evicted first.
///
/// The sampler is the only writer; readers always get an owned copy of the retained
/// `Arc`s so they never observe a half-applied append.
pub struct TimeSeriesStore {
    history_capacity: usize,
    window_capacity: usize,
    inner: RwLock<VecDeque<Arc<Snapshot>>>,
}

impl TimeSeriesStore {
    pub fn new(history_capacity: usize, window_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        Self {
            history_capacity,
            window_capacity: window_capacity.clamp(1, history_capacity),
            inner: RwLock::new(VecDeque::with_capacity(history_capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.history_capacity
    }

    pub fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    pub fn append(&self, snapshot: Arc<Snapshot>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while guard.len() >= self.history_capacity {
            guard.pop_front();
        }
        guard.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    pub fn read_all(&self) -> Vec<Arc<Snapshot>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Most recent `n` snapshots, oldest first.
    pub fn read_recent(&self, n: usize) -> Vec<Arc<Snapshot>> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = guard.len().saturating_sub(n);
        guard.iter().skip(skip).cloned().collect()
    }

    /// Rolling chart window for one metric over the last `window_capacity` snapshots.
    pub fn read_window(&self, selector: &MetricSelector) -> Vec<SeriesPoint> {
        // One extra snapshot gives rate metrics a predecessor for the oldest point.
        let extra = usize::from(selector.needs_previous());
        let recent = self.read_recent(self.window_capacity + extra);
        let mut points = series(&recent, selector);
        if points.len() > self.window_capacity {
            let excess = points.len() - self.window_capacity;
            points.drain(..excess);
        }
        points
    }

    pub fn network_rates(&self) -> BTreeMap<String, NetRate> {
        let recent = self.read_recent(2);
        match recent.as_slice() {
            [prev, cur] => network_rates(prev, cur),
            _ => BTreeMap::new(),
        }
    }
}

impl Default for TimeSeriesStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::snapshot::{CpuReading, NetCounters, Snapshot};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeMap;

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn with_cpu(secs: i64, percent: f64) -> Snapshot {
        let mut snap = Snapshot::empty(at(secs));
        snap.cpu = Some(CpuReading {
            percent: Some(percent),
            temperature: None,
            cores_physical: Some(4),
            cores_logical: 8,
            frequency_current: None,
            frequency_max: None,
        });
        snap
    }

    pub fn with_net(secs: i64, sent: u64, recv: u64) -> Snapshot {
        let mut snap = Snapshot::empty(at(secs));
        let mut net = BTreeMap::new();
        net.insert(
            "eth0".to_string(),
            NetCounters {
                bytes_sent: sent,
                bytes_recv: recv,
            },
        );
        snap.network = Some(net);
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::thread;

    #[test]
    fn keeps_most_recent_n_in_arrival_order() {
        let store = TimeSeriesStore::new(3, 3);
        for i in 1..=5 {
            store.append(Arc::new(with_cpu(i, i as f64)));
        }
        let all = store.read_all();
        assert_eq!(all.len(), 3);
        let percents: Vec<f64> = all
            .iter()
            .map(|s| s.cpu.as_ref().unwrap().percent.unwrap())
            .collect();
        assert_eq!(percents, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn retained_count_never_exceeds_capacity() {
        let store = TimeSeriesStore::new(7, 3);
        for i in 0..50 {
            store.append(Arc::new(with_cpu(i, 1.0)));
            assert!(store.len() <= 7);
        }
        assert_eq!(store.len(), 7);
        assert_eq!(store.latest().unwrap().timestamp, at(49));
    }

    #[test]
    fn window_is_bounded_view_over_history() {
        let store = TimeSeriesStore::new(10, 4);
        for i in 0..10 {
            store.append(Arc::new(with_cpu(i, i as f64)));
        }
        let window = store.read_window(&MetricSelector::CpuPercent);
        let values: Vec<f64> = window.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn window_skips_absent_values() {
        let store = TimeSeriesStore::new(10, 10);
        store.append(Arc::new(with_cpu(0, 10.0)));
        store.append(Arc::new(Snapshot::empty(at(1))));
        store.append(Arc::new(with_cpu(2, 30.0)));
        let window = store.read_window(&MetricSelector::CpuPercent);
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].time, at(2));
    }

    #[test]
    fn rate_over_two_samples() {
        let prev = with_net(0, 1_000, 4_000);
        let cur = with_net(2, 3_000, 10_000);
        let rate = interface_rate(&prev, &cur, "eth0").unwrap();
        assert_eq!(rate.sent_per_sec, 1_000.0);
        assert_eq!(rate.recv_per_sec, 3_000.0);
    }

    #[test]
    fn zero_elapsed_rate_is_unavailable() {
        let prev = with_net(5, 1_000, 1_000);
        let cur = with_net(5, 9_000, 9_000);
        assert!(interface_rate(&prev, &cur, "eth0").is_none());
        assert!(network_rates(&prev, &cur).is_empty());
    }

    #[test]
    fn counter_reset_is_unavailable() {
        let prev = with_net(0, 9_000, 9_000);
        let cur = with_net(1, 10, 10);
        assert!(interface_rate(&prev, &cur, "eth0").is_none());
    }

    #[test]
    fn store_rates_need_two_samples() {
        let store = TimeSeriesStore::new(5, 5);
        assert!(store.network_rates().is_empty());
        store.append(Arc::new(with_net(0, 0, 0)));
        assert!(store.network_rates().is_empty());
        store.append(Arc::new(with_net(1, 100, 200)));
        let rates = store.network_rates();
        assert_eq!(rates["eth0"].recv_per_sec, 200.0);
    }

    #[test]
    fn rate_window_uses_predecessor_outside_window() {
        let store = TimeSeriesStore::new(10, 2);
        for i in 0..4 {
            store.append(Arc::new(with_net(i, (i as u64) * 100, 0)));
        }
        let window = store.read_window(&MetricSelector::NetSentRate("eth0".to_string()));
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|p| p.value == 100.0));
    }

    #[test]
    fn selector_names_round_trip() {
        for name in [
            "cpu.percent",
            "memory.virtual.percent",
            "disk[/mnt/data].percent",
            "network[eth0].recv_rate",
        ] {
            let sel: MetricSelector = name.parse().unwrap();
            assert_eq!(sel.to_string(), name);
        }
        assert!("disk[].percent".parse::<MetricSelector>().is_err());
        assert!("bogus".parse::<MetricSelector>().is_err());
    }

    #[test]
    fn concurrent_readers_see_consistent_copies() {
        let store = Arc::new(TimeSeriesStore::new(16, 8));
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    store.append(Arc::new(with_cpu(i, i as f64)));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let all = store.read_all();
                        assert!(all.len() <= 16);
                        assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.len(), 16);
    }
}
