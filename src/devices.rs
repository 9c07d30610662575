use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const SIMULATED_NAMES: [&str; 5] = [
    "WEB-SRV-01",
    "DB-MASTER",
    "APP-WORKER",
    "NAS-STORAGE",
    "DEV-CLIENT",
];
const CPU_STEP: i16 = 5;
const RAM_STEP: i16 = 3;
/// Per-refresh chance that an online device drops off, and that an offline one returns.
const DROP_CHANCE: f64 = 0.02;
const RECOVER_CHANCE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Availability {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub ip: String,
    pub status: Availability,
    pub cpu_percent: u8,
    pub ram_percent: u8,
}

/// Source of other machines' status. The only implementation simulates them.
pub trait DeviceStatusProvider: Send + 'static {
    /// Replaces the known device list.
    fn discover(&mut self) -> Vec<DeviceStatus>;

    /// Advances the known devices by one refresh period.
    fn refresh(&mut self) -> Vec<DeviceStatus>;
}

/// Random-walk stand-in for real network discovery. Offline devices keep their last readings.
pub struct SimulatedDevices<R = StdRng> {
    rng: R,
    devices: Vec<DeviceStatus>,
}

impl SimulatedDevices<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl Default for SimulatedDevices<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> SimulatedDevices<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            devices: Vec::new(),
        }
    }
}

impl<R: Rng + Send + 'static> DeviceStatusProvider for SimulatedDevices<R> {
    fn discover(&mut self) -> Vec<DeviceStatus> {
        self.devices = SIMULATED_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| DeviceStatus {
                name: name.to_string(),
                ip: format!("192.168.1.{}", 10 + i),
                status: Availability::Online,
                cpu_percent: self.rng.gen_range(5..=70),
                ram_percent: self.rng.gen_range(20..=80),
            })
            .collect();
        self.devices.clone()
    }

    fn refresh(&mut self) -> Vec<DeviceStatus> {
        for device in &mut self.devices {
            device.status = match device.status {
                Availability::Online if self.rng.gen_bool(DROP_CHANCE) => Availability::Offline,
                Availability::Offline if self.rng.gen_bool(RECOVER_CHANCE) => Availability::Online,
                status => status,
            };
            if device.status == Availability::Offline {
                continue;
            }
            device.cpu_percent = walk(device.cpu_percent, self.rng.gen_range(-CPU_STEP..=CPU_STEP));
            device.ram_percent = walk(device.ram_percent, self.rng.gen_range(-RAM_STEP..=RAM_STEP));
        }
        self.devices.clone()
    }
}

fn walk(value: u8, step: i16) -> u8 {
    (i16::from(value) + step).clamp(0, 100) as u8
}

enum Command {
    Discover(oneshot::Sender<Vec<DeviceStatus>>),
}

/// Handle to the refresher task, which owns the provider and republishes its list every
/// period until shutdown.
#[derive(Clone)]
pub struct DeviceMonitor {
    commands: mpsc::Sender<Command>,
    devices: watch::Receiver<Vec<DeviceStatus>>,
}

impl DeviceMonitor {
    pub fn start<P: DeviceStatusProvider>(
        provider: P,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(8);
        let (devices_tx, devices) = watch::channel(Vec::new());
        let task = tokio::spawn(run(provider, period, command_rx, devices_tx, shutdown));
        (Self { commands, devices }, task)
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.devices.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceStatus>> {
        self.devices.clone()
    }

    /// Repopulates the device list and returns it.
    pub async fn discover(&self) -> Vec<DeviceStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Discover(reply_tx)).await.is_err() {
            return self.devices();
        }
        reply_rx.await.unwrap_or_else(|_| self.devices())
    }
}

async fn run<P: DeviceStatusProvider>(
    mut provider: P,
    period: Duration,
    mut commands: mpsc::Receiver<Command>,
    devices_tx: watch::Sender<Vec<DeviceStatus>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately and there is nothing to refresh yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = commands.recv() => match command {
                Some(Command::Discover(reply)) => {
                    let list = provider.discover();
                    info!(count = list.len(), "devices discovered");
                    devices_tx.send_replace(list.clone());
                    let _ = reply.send(list);
                }
                None => break,
            },
            _ = ticker.tick() => {
                let list = provider.refresh();
                if !list.is_empty() {
                    debug!(count = list.len(), "device statuses refreshed");
                    devices_tx.send_replace(list);
                }
            }
        }
    }
    debug!("device refresher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> SimulatedDevices<StdRng> {
        SimulatedDevices::with_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn discovery_populates_five_online_devices() {
        let devices = seeded().discover();
        assert_eq!(devices.len(), 5);
        assert_eq!(devices[0].name, "WEB-SRV-01");
        assert_eq!(devices[0].ip, "192.168.1.10");
        assert_eq!(devices[4].ip, "192.168.1.14");
        for d in &devices {
            assert_eq!(d.status, Availability::Online);
            assert!((5..=70).contains(&d.cpu_percent));
            assert!((20..=80).contains(&d.ram_percent));
        }
    }

    #[test]
    fn refresh_before_discovery_is_empty() {
        assert!(seeded().refresh().is_empty());
    }

    #[test]
    fn random_walk_stays_in_bounds_and_moves_in_small_steps() {
        let mut sim = seeded();
        let mut prev = sim.discover();
        for _ in 0..500 {
            let next = sim.refresh();
            for (a, b) in prev.iter().zip(&next) {
                assert!(b.cpu_percent <= 100 && b.ram_percent <= 100);
                assert!(a.cpu_percent.abs_diff(b.cpu_percent) <= CPU_STEP as u8);
                assert!(a.ram_percent.abs_diff(b.ram_percent) <= RAM_STEP as u8);
            }
            prev = next;
        }
    }

    #[test]
    fn devices_drop_off_and_come_back() {
        let mut sim = seeded();
        sim.discover();
        let mut went_offline = false;
        let mut came_back = false;
        let mut prev = sim.devices.clone();
        for _ in 0..2000 {
            let next = sim.refresh();
            for (a, b) in prev.iter().zip(&next) {
                match (a.status, b.status) {
                    (Availability::Online, Availability::Offline) => went_offline = true,
                    (Availability::Offline, Availability::Online) => came_back = true,
                    (Availability::Offline, Availability::Offline) => {
                        assert_eq!((a.cpu_percent, a.ram_percent), (b.cpu_percent, b.ram_percent));
                    }
                    _ => {}
                }
            }
            prev = next;
        }
        assert!(went_offline && came_back);
    }

    #[test]
    fn walk_clamps() {
        assert_eq!(walk(2, -5), 0);
        assert_eq!(walk(98, 5), 100);
        assert_eq!(walk(50, 3), 53);
    }

    #[tokio::test]
    async fn monitor_publishes_discovered_devices_and_stops() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (monitor, task) =
            DeviceMonitor::start(seeded(), Duration::from_millis(10), shutdown_rx);
        assert!(monitor.devices().is_empty());

        let found = monitor.discover().await;
        assert_eq!(found.len(), 5);
        assert_eq!(monitor.devices().len(), 5);

        let mut rx = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().len(), 5);

        shutdown_tx.send_replace(true);
        task.await.unwrap();

        // With the task gone, discovery falls back to the last published list.
        assert_eq!(monitor.discover().await.len(), 5);
    }
}
