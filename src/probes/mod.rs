pub mod cpu;
pub mod disk;
pub mod gpu;
pub mod memory;
pub mod network;
pub mod sensor_tree;

use crate::error::ProbeError;
use crate::snapshot::{CpuReading, DiskUsage, GpuReading, MemoryReading, NetCounters};
use cpu::CpuProbe;
use disk::DiskProbe;
use gpu::GpuProbe;
use memory::MemoryProbe;
use network::NetworkProbe;
use sensor_tree::{MonitorEndpoint, SensorNode};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::debug;

/// The set of domain probes driven by the sampler, one call per domain per tick.
pub trait SensorSuite: Send + 'static {
    /// Refreshes sources shared by several probes. Failures here only make the dependent
    /// fields absent.
    fn begin_tick(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn cpu(&mut self) -> impl Future<Output = Result<CpuReading, ProbeError>> + Send;

    fn memory(&mut self) -> impl Future<Output = Result<MemoryReading, ProbeError>> + Send;

    fn disk(
        &mut self,
    ) -> impl Future<Output = Result<BTreeMap<String, DiskUsage>, ProbeError>> + Send;

    fn gpu(&mut self) -> impl Future<Output = Result<GpuReading, ProbeError>> + Send;

    fn network(
        &mut self,
    ) -> impl Future<Output = Result<BTreeMap<String, NetCounters>, ProbeError>> + Send;
}

/// Probes backed by the local OS, an optional hardware-monitor endpoint and vendor tools.
pub struct HostSensors {
    endpoint: Option<MonitorEndpoint>,
    tree: Option<SensorNode>,
    cpu: CpuProbe,
    memory: MemoryProbe,
    disk: DiskProbe,
    gpu: GpuProbe,
    network: NetworkProbe,
}

impl HostSensors {
    pub fn new(endpoint: Option<MonitorEndpoint>, gpu: GpuProbe) -> Self {
        Self {
            endpoint,
            tree: None,
            cpu: CpuProbe::new(),
            memory: MemoryProbe::new(),
            disk: DiskProbe::new(),
            gpu,
            network: NetworkProbe::new(),
        }
    }
}

impl SensorSuite for HostSensors {
    async fn begin_tick(&mut self) {
        self.tree = None;
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        match endpoint.fetch().await {
            Ok(tree) => self.tree = Some(tree),
            Err(err) => debug!(url = endpoint.url(), error = %err, "monitoring endpoint unavailable"),
        }
    }

    async fn cpu(&mut self) -> Result<CpuReading, ProbeError> {
        self.cpu.read(self.tree.as_ref())
    }

    async fn memory(&mut self) -> Result<MemoryReading, ProbeError> {
        self.memory.read()
    }

    async fn disk(&mut self) -> Result<BTreeMap<String, DiskUsage>, ProbeError> {
        self.disk.read()
    }

    async fn gpu(&mut self) -> Result<GpuReading, ProbeError> {
        self.gpu.read(self.tree.as_ref()).await
    }

    async fn network(&mut self) -> Result<BTreeMap<String, NetCounters>, ProbeError> {
        self.network.read()
    }
}
