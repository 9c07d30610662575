use crate::settings::Settings;
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_ALERT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Component {
    #[serde(rename = "CPU")]
    Cpu,
    Memory,
    #[serde(rename = "GPU")]
    Gpu,
    Disk,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Cpu => "CPU",
            Component::Memory => "Memory",
            Component::Gpu => "GPU",
            Component::Disk => "Disk",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    HighTemperature,
    HighUsage,
    HighUsageOn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub component: Component,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub time: DateTime<Utc>,
    pub component: Component,
    pub message: String,
}

/// Thresholds in effect for one evaluation. Breach means strictly greater.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_temp: f64,
    pub gpu_temp: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
}

impl From<&Settings> for Thresholds {
    fn from(s: &Settings) -> Self {
        Self {
            cpu_temp: s.cpu_temp_threshold,
            gpu_temp: s.gpu_temp_threshold,
            ram_percent: s.ram_threshold,
            disk_percent: s.disk_threshold,
        }
    }
}

struct Breach {
    key: AlertKey,
    message: String,
}

pub struct AlertEngine {
    cooldown: chrono::Duration,
    capacity: usize,
    history: VecDeque<AlertRecord>,
    last_fired: HashMap<AlertKey, DateTime<Utc>>,
}

impl AlertEngine {
    pub fn new(cooldown: Duration, capacity: usize) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            capacity: capacity.max(1),
            history: VecDeque::with_capacity(capacity.max(1)),
            last_fired: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, snapshot: &Snapshot, thresholds: &Thresholds) -> Vec<AlertRecord> {
        self.evaluate_at(snapshot, thresholds, snapshot.timestamp)
    }

    pub fn evaluate_at(
        &mut self,
        snapshot: &Snapshot,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> Vec<AlertRecord> {
        breaches(snapshot, thresholds)
            .into_iter()
            .filter_map(|breach| self.fire(breach, now))
            .collect()
    }

    fn fire(&mut self, breach: Breach, now: DateTime<Utc>) -> Option<AlertRecord> {
        if let Some(last) = self.last_fired.get(&breach.key) {
            if now - *last < self.cooldown {
                return None;
            }
        }
        self.last_fired.insert(breach.key.clone(), now);

        let record = AlertRecord {
            time: now,
            component: breach.key.component,
            message: breach.message,
        };
        self.history.push_front(record.clone());
        self.history.truncate(self.capacity);
        Some(record)
    }

    /// Newest first.
    pub fn history(&self) -> Vec<AlertRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn last_fired(&self, key: &AlertKey) -> Option<DateTime<Utc>> {
        self.last_fired.get(key).copied()
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN, DEFAULT_ALERT_HISTORY_CAPACITY)
    }
}

fn breaches(snapshot: &Snapshot, t: &Thresholds) -> Vec<Breach> {
    let mut out = Vec::new();

    if let Some(temp) = snapshot.cpu.as_ref().and_then(|c| c.temperature) {
        if temp > t.cpu_temp {
            out.push(Breach {
                key: AlertKey {
                    component: Component::Cpu,
                    condition: Condition::HighTemperature,
                },
                message: format!("High temperature: {temp:.0}°C"),
            });
        }
    }

    if let Some(mem) = snapshot.memory.as_ref() {
        let pct = mem.virtual_memory.percent;
        if pct > t.ram_percent {
            out.push(Breach {
                key: AlertKey {
                    component: Component::Memory,
                    condition: Condition::HighUsage,
                },
                message: format!("High usage: {pct:.0}%"),
            });
        }
    }

    if let Some(temp) = snapshot.gpu.as_ref().and_then(|g| g.temperature) {
        if temp > t.gpu_temp {
            out.push(Breach {
                key: AlertKey {
                    component: Component::Gpu,
                    condition: Condition::HighTemperature,
                },
                message: format!("High temperature: {temp:.0}°C"),
            });
        }
    }

    if let Some(disks) = snapshot.disk.as_ref() {
        for (mount, usage) in disks {
            if usage.percent > t.disk_percent {
                out.push(Breach {
                    key: AlertKey {
                        component: Component::Disk,
                        condition: Condition::HighUsageOn(mount.clone()),
                    },
                    message: format!("High usage on {mount}: {:.0}%", usage.percent),
                });
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{CpuReading, DiskUsage, GpuReading, MemoryReading, MemoryUsage};
    use crate::store::fixtures::at;
    use std::collections::BTreeMap;

    fn thresholds() -> Thresholds {
        Thresholds::from(&Settings::default())
    }

    fn cpu_temp(secs: i64, temp: f64) -> Snapshot {
        let mut snap = Snapshot::empty(at(secs));
        snap.cpu = Some(CpuReading {
            percent: Some(10.0),
            temperature: Some(temp),
            cores_physical: None,
            cores_logical: 4,
            frequency_current: None,
            frequency_max: None,
        });
        snap
    }

    fn disks(secs: i64, mounts: &[(&str, u64)]) -> Snapshot {
        let mut snap = Snapshot::empty(at(secs));
        let map: BTreeMap<String, DiskUsage> = mounts
            .iter()
            .map(|(m, free)| (m.to_string(), DiskUsage::from_total_and_free(100, *free)))
            .collect();
        snap.disk = Some(map);
        snap
    }

    #[test]
    fn cpu_temperature_scenario_fires_once() {
        let mut engine = AlertEngine::default();
        let t = thresholds();
        let fired: Vec<usize> = [79.0, 81.0, 82.0, 70.0, 85.0]
            .iter()
            .enumerate()
            .map(|(i, temp)| engine.evaluate(&cpu_temp(i as i64, *temp), &t).len())
            .collect();
        assert_eq!(fired, vec![0, 1, 0, 0, 0]);

        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].component, Component::Cpu);
        assert_eq!(history[0].time, at(1));
        assert_eq!(history[0].message, "High temperature: 81°C");
    }

    #[test]
    fn exactly_threshold_does_not_fire() {
        let mut engine = AlertEngine::default();
        assert!(engine.evaluate(&cpu_temp(0, 80.0), &thresholds()).is_empty());
    }

    #[test]
    fn breaches_separated_by_more_than_cooldown_fire_twice() {
        let mut engine = AlertEngine::new(Duration::from_secs(300), 100);
        let t = thresholds();
        assert_eq!(engine.evaluate(&cpu_temp(0, 90.0), &t).len(), 1);
        assert_eq!(engine.evaluate(&cpu_temp(299, 90.0), &t).len(), 0);
        assert_eq!(engine.evaluate(&cpu_temp(301, 90.0), &t).len(), 1);
        assert_eq!(engine.history().len(), 2);
    }

    #[test]
    fn absent_fields_are_not_breaches() {
        let mut engine = AlertEngine::default();
        let mut snap = Snapshot::empty(at(0));
        snap.gpu = Some(GpuReading {
            load: Some(99.0),
            ..GpuReading::default()
        });
        snap.cpu = Some(CpuReading {
            percent: None,
            temperature: None,
            cores_physical: None,
            cores_logical: 1,
            frequency_current: None,
            frequency_max: None,
        });
        assert!(engine.evaluate(&snap, &thresholds()).is_empty());
    }

    #[test]
    fn each_disk_mount_has_its_own_cooldown() {
        let mut engine = AlertEngine::default();
        let t = thresholds();
        let fired = engine.evaluate(&disks(0, &[("/", 5), ("/mnt/data", 2), ("/home", 50)]), &t);
        assert_eq!(fired.len(), 2);
        assert!(fired.iter().all(|r| r.component == Component::Disk));

        let fired = engine.evaluate(&disks(10, &[("/", 5), ("/srv", 1)]), &t);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].message, "High usage on /srv: 99%");
    }

    #[test]
    fn memory_and_gpu_alerts_use_their_thresholds() {
        let mut engine = AlertEngine::default();
        let mut snap = Snapshot::empty(at(0));
        snap.memory = Some(MemoryReading {
            virtual_memory: MemoryUsage::new(100, 95, 5),
            swap: MemoryUsage::new(0, 0, 0),
        });
        snap.gpu = Some(GpuReading {
            temperature: Some(86.0),
            ..GpuReading::default()
        });
        let fired = engine.evaluate(&snap, &thresholds());
        let components: Vec<Component> = fired.iter().map(|r| r.component).collect();
        assert_eq!(components, vec![Component::Memory, Component::Gpu]);
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let mut engine = AlertEngine::new(Duration::from_secs(1), 3);
        let t = thresholds();
        for i in 0..6 {
            engine.evaluate(&cpu_temp(i * 10, 90.0 + i as f64), &t);
        }
        let history = engine.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].time, at(50));
        assert_eq!(history[2].time, at(30));
    }

    #[test]
    fn clearing_history_keeps_cooldowns() {
        let mut engine = AlertEngine::default();
        let t = thresholds();
        engine.evaluate(&cpu_temp(0, 95.0), &t);
        engine.clear_history();
        assert!(engine.history().is_empty());
        assert!(engine.evaluate(&cpu_temp(5, 95.0), &t).is_empty());
        let key = AlertKey {
            component: Component::Cpu,
            condition: Condition::HighTemperature,
        };
        assert_eq!(engine.last_fired(&key), Some(at(0)));
    }
}
