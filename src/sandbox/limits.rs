use serde::{Deserialize, Serialize};

const MIB: i64 = 1024 * 1024;

/// Engine default relative CPU weight.
pub const DEFAULT_CPU_SHARES: i64 = 1024;

/// Resource ceilings applied to every compute container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Apply the ceilings at all
    pub limit_resources: bool,
    /// Memory granted, in units of `memory_unit_bytes`
    pub memory_units: u32,
    /// Size of one memory unit
    pub memory_unit_bytes: i64,
    /// Memory + swap ceiling as a multiple of the memory ceiling
    pub swap_multiplier: u32,
    /// Relative CPU weight (the engine default is 1024)
    pub cpu_shares: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            limit_resources: true,
            memory_units: 1,
            memory_unit_bytes: 256 * MIB,
            swap_multiplier: 4,
            // Four sandboxes get the CPU time of one default container.
            cpu_shares: 256,
        }
    }
}

impl ResourceLimits {
    /// Memory ceiling in bytes, `None` when unlimited.
    pub fn memory(&self) -> Option<i64> {
        self.limit_resources
            .then(|| i64::from(self.memory_units).saturating_mul(self.memory_unit_bytes))
    }

    /// Memory + swap ceiling in bytes, `None` when unlimited.
    pub fn memory_swap(&self) -> Option<i64> {
        self.memory()
            .map(|memory| memory.saturating_mul(i64::from(self.swap_multiplier)))
    }

    /// Relative CPU weight.
    pub fn cpu_shares(&self) -> i64 {
        if self.limit_resources {
            self.cpu_shares
        } else {
            DEFAULT_CPU_SHARES
        }
    }
}
