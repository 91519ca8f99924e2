// CLASSIFICATION: COMMUNITY
// Filename: overflow.rs v0.6
// Author: Lukas Bower
// Date Modified: 2027-02-17

//! Overflow interrupt handler.
//!
//! Runs in interrupt context when a hardware counter wraps. It extends
//! the virtual 64-bit counters, optionally records a sample, and
//! decides whether the PMU may resume immediately or stays frozen
//! until a restart acknowledges the overflow. The handler never
//! propagates errors to the interrupt dispatch; every anomaly is
//! absorbed and counted.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::config;
use crate::context::{self, PfmContext};
use crate::hw;
use crate::ownership;
use crate::regset::RegisterSet;
use crate::sampling::RecordOutcome;
use crate::tasks::{self, PendingWork};
use crate::types::CpuId;

/// Handler verdict handed back to the interrupt dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreezeAction {
    /// Counting may resume immediately.
    Unfreeze,
    /// PMU stays frozen until a restart request.
    KeepFrozen,
    /// No owner or no status; nothing was touched.
    Spurious,
}

/// Diagnostic counters, monotonically increasing since boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OverflowStats {
    pub interrupts: u64,
    pub spurious: u64,
    pub samples_recorded: u64,
    pub samples_dropped: u64,
    pub buffer_drains: u64,
}

static INTERRUPTS: AtomicU64 = AtomicU64::new(0);
static SPURIOUS: AtomicU64 = AtomicU64::new(0);
static SAMPLES_RECORDED: AtomicU64 = AtomicU64::new(0);
static SAMPLES_DROPPED: AtomicU64 = AtomicU64::new(0);
static BUFFER_DRAINS: AtomicU64 = AtomicU64::new(0);

/// Snapshot the diagnostic counters.
pub fn stats() -> OverflowStats {
    OverflowStats {
        interrupts: INTERRUPTS.load(Ordering::Relaxed),
        spurious: SPURIOUS.load(Ordering::Relaxed),
        samples_recorded: SAMPLES_RECORDED.load(Ordering::Relaxed),
        samples_dropped: SAMPLES_DROPPED.load(Ordering::Relaxed),
        buffer_drains: BUFFER_DRAINS.load(Ordering::Relaxed),
    }
}

/// Zero the diagnostic counters. Only used in tests.
pub fn reset_stats() {
    INTERRUPTS.store(0, Ordering::Relaxed);
    SPURIOUS.store(0, Ordering::Relaxed);
    SAMPLES_RECORDED.store(0, Ordering::Relaxed);
    SAMPLES_DROPPED.store(0, Ordering::Relaxed);
    BUFFER_DRAINS.store(0, Ordering::Relaxed);
}

/// Service a PMU overflow interrupt on `cpu`. `ip` is the interrupted
/// instruction pointer from the trap frame.
pub fn handle_overflow(cpu: CpuId, ip: u64) -> FreezeAction {
    INTERRUPTS.fetch_add(1, Ordering::Relaxed);
    let status = hw::take_overflow_status(cpu);
    if status == 0 {
        SPURIOUS.fetch_add(1, Ordering::Relaxed);
        warn!("overflow: spurious interrupt on cpu{cpu}, empty status");
        return FreezeAction::Spurious;
    }
    let ctx = match ownership::current_owner(cpu).and_then(context::get) {
        Some(c) => c,
        None => {
            SPURIOUS.fetch_add(1, Ordering::Relaxed);
            warn!("overflow: interrupt on cpu{cpu} with no owning context");
            return FreezeAction::Spurious;
        }
    };
    match service(&ctx, cpu, ip, status) {
        Some(action) => action,
        None => {
            // internal fault: leave the unit frozen, never crash the
            // interrupt path
            SPURIOUS.fetch_add(1, Ordering::Relaxed);
            FreezeAction::KeepFrozen
        }
    }
}

fn service(ctx: &PfmContext, cpu: CpuId, ip: u64, status: u64) -> Option<FreezeAction> {
    let d = config::description();
    let mask = d.ovfl_mask();
    let mut inner = ctx.inner_for_interrupt().ok()?;

    // step 1: extend the virtual counters and collect the overflow set
    let mut ovfl = RegisterSet::new();
    let mut notify_requested = false;
    for i in 0..d.num_pmds {
        if status & (1 << i) == 0 {
            continue;
        }
        if !d.counting_pmds.test(i) || !inner.used_pmds.test(i) {
            debug!("overflow: ignoring status bit for unused pmd{i}");
            continue;
        }
        // one wrap's worth; the hardware remainder stays live in the
        // register and is added back at read time
        let c = &mut inner.soft_pmds[i];
        c.val = c.val.wrapping_add(mask.wrapping_add(1));
        ovfl.set(i);
        notify_requested |= c.notify;
    }
    if ovfl.is_empty() {
        SPURIOUS.fetch_add(1, Ordering::Relaxed);
        let _ = hw::unfreeze(cpu);
        return Some(FreezeAction::Unfreeze);
    }

    // step 2: sampling
    if let Some(buf) = ctx.sampling_buffer() {
        let owner = ctx.owner_task().ok()?;
        let values: Vec<u64> = buf
            .header()
            .pmd_mask_indices()
            .map(|i| {
                let raw = hw::read_pmd(cpu, i).unwrap_or(0);
                if d.counting_pmds.test(i) {
                    inner.soft_pmds[i].val.wrapping_add(raw & mask)
                } else {
                    raw
                }
            })
            .collect();
        match buf.record_sample(owner, cpu, ip, ovfl.low_mask(), hw::timestamp(), &values) {
            RecordOutcome::Full if !notify_requested => {
                // nobody is listening: drain and keep going
                buf.reset();
                BUFFER_DRAINS.fetch_add(1, Ordering::Relaxed);
                SAMPLES_RECORDED.fetch_add(1, Ordering::Relaxed);
            }
            RecordOutcome::Full => {
                SAMPLES_RECORDED.fetch_add(1, Ordering::Relaxed);
            }
            RecordOutcome::NotFull => {
                SAMPLES_RECORDED.fetch_add(1, Ordering::Relaxed);
                // sample absorbed the event; notification waits for a
                // full buffer
                notify_requested = false;
            }
            RecordOutcome::Dropped => {
                SAMPLES_DROPPED.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // step 3: silent overflow, reload and resume
    if !notify_requested {
        context::reset_after_overflow(&mut inner, &ovfl, false, cpu, true);
        let _ = hw::unfreeze(cpu);
        return Some(FreezeAction::Unfreeze);
    }

    // step 4: freeze until acknowledged, notify best-effort
    inner.ovfl_regs.merge(&ovfl);
    inner.frozen = true;
    drop(inner);
    let owner = ctx.owner_task().ok()?;
    let notify = ctx.notify_task().ok()?;
    match notify {
        Some(target) => match tasks::notify_overflow(target, ovfl.low_mask()) {
            Ok(()) => {
                if ctx.is_blocking() && target != owner {
                    let _ = tasks::set_pending(owner, PendingWork::BLOCK_ON_RESTART);
                }
            }
            Err(_) => {
                // target vanished between the link read and delivery;
                // monitoring stays frozen rather than failing loud
                warn!(
                    "overflow: notify target {target} gone, context {:?} stays frozen",
                    ctx.handle()
                );
            }
        },
        None => {
            warn!(
                "overflow: no notify target, context {:?} stays frozen",
                ctx.handle()
            );
        }
    }
    Some(FreezeAction::KeepFrozen)
}
