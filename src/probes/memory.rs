use crate::error::ProbeError;
use crate::snapshot::{Domain, MemoryReading, MemoryUsage};
use sysinfo::{System, SystemExt};

pub struct MemoryProbe {
    system: System,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn read(&mut self) -> Result<MemoryReading, ProbeError> {
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProbeError::unavailable(
                Domain::Memory,
                "total memory reported as zero",
            ));
        }

        Ok(MemoryReading {
            virtual_memory: MemoryUsage::new(
                total,
                self.system.used_memory(),
                self.system.free_memory(),
            ),
            swap: MemoryUsage::new(
                self.system.total_swap(),
                self.system.used_swap(),
                self.system.free_swap(),
            ),
        })
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
