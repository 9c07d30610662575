use crate::alerts::Component;
use crate::snapshot::{Domain, Snapshot};
use crate::store::NetRate;
use chrono::{DateTime, Utc};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: DateTime<Utc>,
    pub cpu_usage_percent: Gauge,
    pub cpu_temperature_celsius: Gauge,
    pub cpu_frequency_mhz: Gauge,
    pub cpu_logical_cores: Gauge,
    pub memory_used_bytes: Gauge,
    pub memory_total_bytes: Gauge,
    pub memory_usage_percent: Gauge,
    pub swap_used_bytes: Gauge,
    pub swap_usage_percent: Gauge,
    pub disk_used_bytes: GaugeVec,
    pub disk_total_bytes: GaugeVec,
    pub disk_usage_percent: GaugeVec,
    pub disk_count: Gauge,
    pub gpu_load_percent: Gauge,
    pub gpu_temperature_celsius: Gauge,
    pub gpu_memory_used_bytes: Gauge,
    pub gpu_memory_total_bytes: Gauge,
    pub net_sent_bytes_total: GaugeVec,
    pub net_recv_bytes_total: GaugeVec,
    pub net_sent_bytes_per_sec: GaugeVec,
    pub net_recv_bytes_per_sec: GaugeVec,
    pub net_iface_count: Gauge,
    pub uptime_seconds: Gauge,
    pub last_tick_timestamp_seconds: Gauge,
    pub ticks_total: Counter,
    pub scrape_count_total: Counter,
    pub probe_failures_total: CounterVec,
    pub alerts_fired_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let cpu_usage_percent = Gauge::with_opts(opts!(
            "hostwatch_cpu_usage_percent",
            "Overall CPU usage in percent (0..100), NaN until the second sample"
        ))?;
        let cpu_temperature_celsius = Gauge::with_opts(opts!(
            "hostwatch_cpu_temperature_celsius",
            "CPU package temperature in Celsius, NaN if unavailable"
        ))?;
        let cpu_frequency_mhz = Gauge::with_opts(opts!(
            "hostwatch_cpu_frequency_mhz",
            "Current CPU frequency in MHz, NaN if unavailable"
        ))?;
        let cpu_logical_cores = Gauge::with_opts(opts!(
            "hostwatch_cpu_logical_cores",
            "Number of logical CPU cores"
        ))?;
        let memory_used_bytes =
            Gauge::with_opts(opts!("hostwatch_memory_used_bytes", "Used RAM in bytes"))?;
        let memory_total_bytes =
            Gauge::with_opts(opts!("hostwatch_memory_total_bytes", "Total RAM in bytes"))?;
        let memory_usage_percent = Gauge::with_opts(opts!(
            "hostwatch_memory_usage_percent",
            "RAM usage in percent"
        ))?;
        let swap_used_bytes =
            Gauge::with_opts(opts!("hostwatch_swap_used_bytes", "Used swap in bytes"))?;
        let swap_usage_percent = Gauge::with_opts(opts!(
            "hostwatch_swap_usage_percent",
            "Swap usage in percent"
        ))?;
        let disk_used_bytes = GaugeVec::new(
            opts!("hostwatch_disk_used_bytes", "Disk used bytes by mount"),
            &["mount"],
        )?;
        let disk_total_bytes = GaugeVec::new(
            opts!("hostwatch_disk_total_bytes", "Disk total bytes by mount"),
            &["mount"],
        )?;
        let disk_usage_percent = GaugeVec::new(
            opts!("hostwatch_disk_usage_percent", "Disk usage in percent by mount"),
            &["mount"],
        )?;
        let disk_count = Gauge::with_opts(opts!(
            "hostwatch_disk_count",
            "Number of fixed-storage mounts"
        ))?;
        let gpu_load_percent = Gauge::with_opts(opts!(
            "hostwatch_gpu_load_percent",
            "GPU core load in percent, NaN if unavailable"
        ))?;
        let gpu_temperature_celsius = Gauge::with_opts(opts!(
            "hostwatch_gpu_temperature_celsius",
            "GPU core temperature in Celsius, NaN if unavailable"
        ))?;
        let gpu_memory_used_bytes = Gauge::with_opts(opts!(
            "hostwatch_gpu_memory_used_bytes",
            "GPU memory used in bytes, NaN if unavailable"
        ))?;
        let gpu_memory_total_bytes = Gauge::with_opts(opts!(
            "hostwatch_gpu_memory_total_bytes",
            "GPU memory total in bytes, NaN if unavailable"
        ))?;
        let net_sent_bytes_total = GaugeVec::new(
            opts!(
                "hostwatch_net_sent_bytes_total",
                "Cumulative transmitted bytes per interface"
            ),
            &["iface"],
        )?;
        let net_recv_bytes_total = GaugeVec::new(
            opts!(
                "hostwatch_net_recv_bytes_total",
                "Cumulative received bytes per interface"
            ),
            &["iface"],
        )?;
        let net_sent_bytes_per_sec = GaugeVec::new(
            opts!(
                "hostwatch_net_sent_bytes_per_sec",
                "Transmit rate in bytes per second by interface"
            ),
            &["iface"],
        )?;
        let net_recv_bytes_per_sec = GaugeVec::new(
            opts!(
                "hostwatch_net_recv_bytes_per_sec",
                "Receive rate in bytes per second by interface"
            ),
            &["iface"],
        )?;
        let net_iface_count = Gauge::with_opts(opts!(
            "hostwatch_net_iface_count",
            "Number of network interfaces"
        ))?;
        let uptime_seconds = Gauge::with_opts(opts!(
            "hostwatch_uptime_seconds",
            "Seconds since the service started"
        ))?;
        let last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "hostwatch_last_tick_timestamp_seconds",
            "Unix timestamp of the last published snapshot"
        ))?;
        let ticks_total = Counter::with_opts(opts!(
            "hostwatch_ticks_total",
            "Number of sampler ticks completed"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "hostwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let probe_failures_total = CounterVec::new(
            opts!(
                "hostwatch_probe_failures_total",
                "Probe failures by domain"
            ),
            &["domain"],
        )?;
        let alerts_fired_total = CounterVec::new(
            opts!(
                "hostwatch_alerts_fired_total",
                "Alerts fired by component"
            ),
            &["component"],
        )?;

        register(&registry, &cpu_usage_percent)?;
        register(&registry, &cpu_temperature_celsius)?;
        register(&registry, &cpu_frequency_mhz)?;
        register(&registry, &cpu_logical_cores)?;
        register(&registry, &memory_used_bytes)?;
        register(&registry, &memory_total_bytes)?;
        register(&registry, &memory_usage_percent)?;
        register(&registry, &swap_used_bytes)?;
        register(&registry, &swap_usage_percent)?;
        register(&registry, &disk_used_bytes)?;
        register(&registry, &disk_total_bytes)?;
        register(&registry, &disk_usage_percent)?;
        register(&registry, &disk_count)?;
        register(&registry, &gpu_load_percent)?;
        register(&registry, &gpu_temperature_celsius)?;
        register(&registry, &gpu_memory_used_bytes)?;
        register(&registry, &gpu_memory_total_bytes)?;
        register(&registry, &net_sent_bytes_total)?;
        register(&registry, &net_recv_bytes_total)?;
        register(&registry, &net_sent_bytes_per_sec)?;
        register(&registry, &net_recv_bytes_per_sec)?;
        register(&registry, &net_iface_count)?;
        register(&registry, &uptime_seconds)?;
        register(&registry, &last_tick_timestamp_seconds)?;
        register(&registry, &ticks_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &probe_failures_total)?;
        register(&registry, &alerts_fired_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Utc::now(),
            cpu_usage_percent,
            cpu_temperature_celsius,
            cpu_frequency_mhz,
            cpu_logical_cores,
            memory_used_bytes,
            memory_total_bytes,
            memory_usage_percent,
            swap_used_bytes,
            swap_usage_percent,
            disk_used_bytes,
            disk_total_bytes,
            disk_usage_percent,
            disk_count,
            gpu_load_percent,
            gpu_temperature_celsius,
            gpu_memory_used_bytes,
            gpu_memory_total_bytes,
            net_sent_bytes_total,
            net_recv_bytes_total,
            net_sent_bytes_per_sec,
            net_recv_bytes_per_sec,
            net_iface_count,
            uptime_seconds,
            last_tick_timestamp_seconds,
            ticks_total,
            scrape_count_total,
            probe_failures_total,
            alerts_fired_total,
        }))
    }

    /// Mirrors one snapshot into the gauges. Absent readings become NaN or drop their labels.
    pub fn update_from_snapshot(&self, snapshot: &Snapshot, rates: &BTreeMap<String, NetRate>) {
        let cpu = snapshot.cpu.as_ref();
        self.cpu_usage_percent
            .set(or_nan(cpu.and_then(|c| c.percent)));
        self.cpu_temperature_celsius
            .set(or_nan(cpu.and_then(|c| c.temperature)));
        self.cpu_frequency_mhz
            .set(or_nan(cpu.and_then(|c| c.frequency_current)));
        self.cpu_logical_cores
            .set(cpu.map(|c| c.cores_logical as f64).unwrap_or(f64::NAN));

        match snapshot.memory.as_ref() {
            Some(mem) => {
                self.memory_used_bytes
                    .set(mem.virtual_memory.used as f64);
                self.memory_total_bytes
                    .set(mem.virtual_memory.total as f64);
                self.memory_usage_percent.set(mem.virtual_memory.percent);
                self.swap_used_bytes.set(mem.swap.used as f64);
                self.swap_usage_percent.set(mem.swap.percent);
            }
            None => {
                for gauge in [
                    &self.memory_used_bytes,
                    &self.memory_total_bytes,
                    &self.memory_usage_percent,
                    &self.swap_used_bytes,
                    &self.swap_usage_percent,
                ] {
                    gauge.set(f64::NAN);
                }
            }
        }

        self.disk_used_bytes.reset();
        self.disk_total_bytes.reset();
        self.disk_usage_percent.reset();
        let disks = snapshot.disk.as_ref();
        for (mount, usage) in disks.into_iter().flatten() {
            self.disk_used_bytes
                .with_label_values(&[mount])
                .set(usage.used as f64);
            self.disk_total_bytes
                .with_label_values(&[mount])
                .set(usage.total as f64);
            self.disk_usage_percent
                .with_label_values(&[mount])
                .set(usage.percent);
        }
        self.disk_count
            .set(disks.map(|d| d.len()).unwrap_or(0) as f64);

        let gpu = snapshot.gpu.as_ref();
        self.gpu_load_percent.set(or_nan(gpu.and_then(|g| g.load)));
        self.gpu_temperature_celsius
            .set(or_nan(gpu.and_then(|g| g.temperature)));
        self.gpu_memory_used_bytes
            .set(or_nan(gpu.and_then(|g| g.mem_used).map(|v| v as f64)));
        self.gpu_memory_total_bytes
            .set(or_nan(gpu.and_then(|g| g.mem_total).map(|v| v as f64)));

        self.net_sent_bytes_total.reset();
        self.net_recv_bytes_total.reset();
        self.net_sent_bytes_per_sec.reset();
        self.net_recv_bytes_per_sec.reset();
        let ifaces = snapshot.network.as_ref();
        for (iface, counters) in ifaces.into_iter().flatten() {
            self.net_sent_bytes_total
                .with_label_values(&[iface])
                .set(counters.bytes_sent as f64);
            self.net_recv_bytes_total
                .with_label_values(&[iface])
                .set(counters.bytes_recv as f64);
        }
        for (iface, rate) in rates {
            self.net_sent_bytes_per_sec
                .with_label_values(&[iface])
                .set(rate.sent_per_sec);
            self.net_recv_bytes_per_sec
                .with_label_values(&[iface])
                .set(rate.recv_per_sec);
        }
        self.net_iface_count
            .set(ifaces.map(|n| n.len()).unwrap_or(0) as f64);

        self.last_tick_timestamp_seconds
            .set(snapshot.timestamp.timestamp() as f64);
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0);
        self.uptime_seconds.set(uptime as f64);
    }

    pub fn inc_tick(&self) {
        self.ticks_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn inc_probe_failure(&self, domain: Domain) {
        self.probe_failures_total
            .with_label_values(&[domain.as_str()])
            .inc();
    }

    pub fn inc_alert_fired(&self, component: Component) {
        self.alerts_fired_total
            .with_label_values(&[&component.to_string()])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn or_nan(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NAN)
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
