use crate::error::ProbeError;
use crate::snapshot::{Domain, NetCounters};
use std::collections::BTreeMap;
use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};

/// Reports cumulative per-interface byte counters; rates are derived by readers.
pub struct NetworkProbe {
    system: System,
}

impl NetworkProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_networks_list();
        Self { system }
    }

    pub fn read(&mut self) -> Result<BTreeMap<String, NetCounters>, ProbeError> {
        self.system.refresh_networks_list();
        self.system.refresh_networks();

        let counters: BTreeMap<String, NetCounters> = self
            .system
            .networks()
            .iter()
            .map(|(iface, data)| {
                (
                    iface.to_string(),
                    NetCounters {
                        bytes_sent: data.total_transmitted(),
                        bytes_recv: data.total_received(),
                    },
                )
            })
            .collect();

        if counters.is_empty() {
            return Err(ProbeError::unavailable(
                Domain::Network,
                "no network interfaces reported",
            ));
        }
        Ok(counters)
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}
