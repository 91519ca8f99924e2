// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-12-02

//! Run-time PMU description.
//!
//! Discovered once at subsystem init and read-only afterwards. Counts
//! and implemented-register masks are configuration data, not
//! compile-time constants, so one binary serves different PMU models.

use once_cell::sync::OnceCell;

use crate::regset::RegisterSet;
use crate::types::{PerfmonError, PerfmonResult};

/// Protocol version reported by `GetFeatures` (major.minor packed).
pub const PFM_VERSION: u32 = 0x0002_0000;

/// Sampling buffer format version (major.minor packed).
pub const PFM_SMPL_VERSION: u32 = 0x0001_0000;

/// Backing page granularity for sampling buffer allocations.
pub const PAGE_SIZE: usize = 4096;

/// Description of the PMU model this subsystem drives.
#[derive(Clone, Debug)]
pub struct PmuDescription {
    /// Logical CPUs carrying a PMU instance.
    pub num_cpus: u32,
    /// Hardware counter width in bits.
    pub counter_width: u32,
    /// Implemented control registers.
    pub num_pmcs: usize,
    /// Implemented data registers.
    pub num_pmds: usize,
    pub impl_pmcs: RegisterSet,
    pub impl_pmds: RegisterSet,
    /// PMCs configuring an event monitor (privilege + event select).
    pub monitor_pmcs: RegisterSet,
    /// PMDs that free-run as event counters.
    pub counting_pmds: RegisterSet,
    /// Low control registers owned by the platform, never writable here.
    pub reserved_pmcs: RegisterSet,
    /// Low data registers owned by the platform, never writable here.
    pub reserved_pmds: RegisterSet,
    /// Instruction / data breakpoint register pairs.
    pub num_ibrs: usize,
    pub num_dbrs: usize,
}

impl PmuDescription {
    /// Mask covering the hardware counter width.
    pub fn ovfl_mask(&self) -> u64 {
        (1u64 << self.counter_width) - 1
    }

    /// Description of the simulated PMU used by tests and by hosts
    /// without a probed model: 4 CPUs, 8 PMC/PMD pairs, indices 4..8
    /// acting as monitored counters, 47-bit counters.
    pub fn sim() -> Self {
        PmuDescription {
            num_cpus: 4,
            counter_width: 47,
            num_pmcs: 8,
            num_pmds: 8,
            impl_pmcs: RegisterSet::range(0, 8),
            impl_pmds: RegisterSet::range(0, 8),
            monitor_pmcs: RegisterSet::range(4, 8),
            counting_pmds: RegisterSet::range(4, 8),
            reserved_pmcs: RegisterSet::range(0, 4),
            reserved_pmds: RegisterSet::range(0, 4),
            num_ibrs: 8,
            num_dbrs: 8,
        }
    }
}

static DESCRIPTION: OnceCell<PmuDescription> = OnceCell::new();

/// Install the probed PMU description. May only happen once; a second
/// attempt reports `Busy` and leaves the installed description alone.
pub fn install(desc: PmuDescription) -> PerfmonResult<()> {
    DESCRIPTION.set(desc).map_err(|_| PerfmonError::Busy)
}

/// Installed PMU description, falling back to the simulated model.
pub fn description() -> &'static PmuDescription {
    DESCRIPTION.get_or_init(PmuDescription::sim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_description_is_consistent() {
        let d = PmuDescription::sim();
        assert!(d.counting_pmds.weight() <= d.num_pmds);
        assert!(!d.counting_pmds.intersects(&d.reserved_pmds));
        assert!(!d.monitor_pmcs.intersects(&d.reserved_pmcs));
        assert_eq!(d.ovfl_mask(), (1u64 << 47) - 1);
    }

    #[test]
    fn second_install_is_rejected() {
        // First access pins the sim description for the whole test
        // process, so install() must refuse afterwards.
        let _ = description();
        assert_eq!(install(PmuDescription::sim()), Err(PerfmonError::Busy));
    }
}
