// CLASSIFICATION: COMMUNITY
// Filename: hw.rs v0.6
// Author: Lukas Bower
// Date Modified: 2027-01-06

//! Register file adapter over the per-CPU PMU hardware.
//!
//! The PMU is modeled as an opaque indexed register file per CPU: PMC
//! control registers, PMD data registers, a latched overflow status
//! word and a freeze bit. On real hardware these calls wrap the
//! privileged move-to/from-register instructions; here they drive an
//! in-process machine so the whole subsystem runs and tests hosted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::config;
use crate::types::{CpuId, PerfmonError, PerfmonResult};

struct CpuPmu {
    pmcs: Mutex<Vec<u64>>,
    pmds: Mutex<Vec<u64>>,
    ibrs: Mutex<Vec<u64>>,
    dbrs: Mutex<Vec<u64>>,
    /// Latched overflow bits, one per PMD index.
    ovfl_status: AtomicU64,
    /// Set by overflow delivery, cleared by `unfreeze`.
    frozen: AtomicBool,
    /// Monitoring-enable bit toggled by start/stop.
    counting: AtomicBool,
}

impl CpuPmu {
    fn new() -> Self {
        let d = config::description();
        CpuPmu {
            pmcs: Mutex::new(vec![0; d.num_pmcs]),
            pmds: Mutex::new(vec![0; d.num_pmds]),
            ibrs: Mutex::new(vec![0; d.num_ibrs]),
            dbrs: Mutex::new(vec![0; d.num_dbrs]),
            ovfl_status: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
            counting: AtomicBool::new(false),
        }
    }
}

static MACHINE: Lazy<Vec<CpuPmu>> = Lazy::new(|| {
    (0..config::description().num_cpus)
        .map(|_| CpuPmu::new())
        .collect()
});

/// Monotonic cycle counter standing in for the hardware timestamp.
static STAMP: AtomicU64 = AtomicU64::new(0);

fn cpu(cpu: CpuId) -> PerfmonResult<&'static CpuPmu> {
    MACHINE
        .get(cpu as usize)
        .ok_or(PerfmonError::InvalidArgument)
}

fn reg_read(regs: &Mutex<Vec<u64>>, idx: usize) -> PerfmonResult<u64> {
    let regs = regs.lock().map_err(|_| PerfmonError::Fault)?;
    regs.get(idx).copied().ok_or(PerfmonError::InvalidArgument)
}

fn reg_write(regs: &Mutex<Vec<u64>>, idx: usize, val: u64) -> PerfmonResult<()> {
    let mut regs = regs.lock().map_err(|_| PerfmonError::Fault)?;
    match regs.get_mut(idx) {
        Some(slot) => {
            *slot = val;
            Ok(())
        }
        None => Err(PerfmonError::InvalidArgument),
    }
}

pub fn read_pmc(c: CpuId, idx: usize) -> PerfmonResult<u64> {
    reg_read(&cpu(c)?.pmcs, idx)
}

pub fn write_pmc(c: CpuId, idx: usize, val: u64) -> PerfmonResult<()> {
    reg_write(&cpu(c)?.pmcs, idx, val)
}

pub fn read_pmd(c: CpuId, idx: usize) -> PerfmonResult<u64> {
    reg_read(&cpu(c)?.pmds, idx)
}

pub fn write_pmd(c: CpuId, idx: usize, val: u64) -> PerfmonResult<()> {
    reg_write(&cpu(c)?.pmds, idx, val)
}

pub fn read_ibr(c: CpuId, idx: usize) -> PerfmonResult<u64> {
    reg_read(&cpu(c)?.ibrs, idx)
}

pub fn write_ibr(c: CpuId, idx: usize, val: u64) -> PerfmonResult<()> {
    reg_write(&cpu(c)?.ibrs, idx, val)
}

pub fn read_dbr(c: CpuId, idx: usize) -> PerfmonResult<u64> {
    reg_read(&cpu(c)?.dbrs, idx)
}

pub fn write_dbr(c: CpuId, idx: usize, val: u64) -> PerfmonResult<()> {
    reg_write(&cpu(c)?.dbrs, idx, val)
}

/// Serialization point after a batch of register writes. The simulated
/// machine is sequentially consistent so this is a no-op, but call
/// sites keep it where real hardware requires the fence.
pub fn fence() {}

/// Freeze counting on one CPU. Overflow delivery freezes implicitly.
pub fn freeze(c: CpuId) -> PerfmonResult<()> {
    cpu(c)?.frozen.store(true, Ordering::SeqCst);
    Ok(())
}

pub fn unfreeze(c: CpuId) -> PerfmonResult<()> {
    cpu(c)?.frozen.store(false, Ordering::SeqCst);
    Ok(())
}

pub fn frozen(c: CpuId) -> bool {
    cpu(c).map(|p| p.frozen.load(Ordering::SeqCst)).unwrap_or(false)
}

/// Toggle the monitoring-enable bit (start/stop).
pub fn set_counting(c: CpuId, on: bool) -> PerfmonResult<()> {
    cpu(c)?.counting.store(on, Ordering::SeqCst);
    Ok(())
}

pub fn counting(c: CpuId) -> bool {
    cpu(c)
        .map(|p| p.counting.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Read-and-clear the latched overflow status word.
pub fn take_overflow_status(c: CpuId) -> u64 {
    cpu(c)
        .map(|p| p.ovfl_status.swap(0, Ordering::SeqCst))
        .unwrap_or(0)
}

/// Hardware timestamp for sample entries.
pub fn timestamp() -> u64 {
    STAMP.fetch_add(1, Ordering::Relaxed) + 1
}

/// Advance a counting PMD by `n` events. Wraps at the configured
/// counter width, latches the overflow status bit and freezes the PMU,
/// exactly like overflow delivery on the real unit. Returns true when
/// the counter wrapped. No effect while stopped or frozen.
pub fn tick(c: CpuId, idx: usize, n: u64) -> PerfmonResult<bool> {
    let p = cpu(c)?;
    if !p.counting.load(Ordering::SeqCst) || p.frozen.load(Ordering::SeqCst) {
        return Ok(false);
    }
    let mask = config::description().ovfl_mask();
    let mut pmds = p.pmds.lock().map_err(|_| PerfmonError::Fault)?;
    let slot = pmds.get_mut(idx).ok_or(PerfmonError::InvalidArgument)?;
    let before = *slot & mask;
    let after = before.wrapping_add(n) & mask;
    *slot = after;
    let wrapped = n > mask - before;
    if wrapped {
        p.ovfl_status.fetch_or(1 << idx, Ordering::SeqCst);
        p.frozen.store(true, Ordering::SeqCst);
        log::debug!("hw: pmd{idx} wrapped on cpu{c}, pmu frozen");
    }
    Ok(wrapped)
}

/// Clear one CPU's register file back to power-on state. Test hook and
/// enable-time reset path.
pub fn reset_cpu(c: CpuId) -> PerfmonResult<()> {
    let p = cpu(c)?;
    for r in p.pmcs.lock().map_err(|_| PerfmonError::Fault)?.iter_mut() {
        *r = 0;
    }
    for r in p.pmds.lock().map_err(|_| PerfmonError::Fault)?.iter_mut() {
        *r = 0;
    }
    for r in p.ibrs.lock().map_err(|_| PerfmonError::Fault)?.iter_mut() {
        *r = 0;
    }
    for r in p.dbrs.lock().map_err(|_| PerfmonError::Fault)?.iter_mut() {
        *r = 0;
    }
    p.ovfl_status.store(0, Ordering::SeqCst);
    p.frozen.store(false, Ordering::SeqCst);
    p.counting.store(false, Ordering::SeqCst);
    Ok(())
}

/// Reset every CPU. Only used by tests.
pub fn reset_all() {
    for c in 0..config::description().num_cpus {
        let _ = reset_cpu(c);
    }
}
