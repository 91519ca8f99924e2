// CLASSIFICATION: COMMUNITY
// Filename: ownership.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-12-18

//! Per-CPU PMU ownership tracker.
//!
//! One word per CPU holding the packed handle of the context whose
//! state is live on that CPU's PMU, or zero for none. Ownership is
//! lazy: it only changes when a context is enabled, saved or torn
//! down, never on a plain context switch that keeps the hardware
//! state useful. Every path that touches hardware registers confirms
//! ownership here first.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

use crate::config;
use crate::types::{ContextHandle, CpuId};

static OWNERS: Lazy<Vec<AtomicU64>> = Lazy::new(|| {
    (0..config::description().num_cpus)
        .map(|_| AtomicU64::new(0))
        .collect()
});

/// Context currently owning the live PMU state on `cpu`.
pub fn current_owner(cpu: CpuId) -> Option<ContextHandle> {
    OWNERS
        .get(cpu as usize)
        .and_then(|w| ContextHandle::unpack(w.load(Ordering::Acquire)))
}

/// Record `owner` as the live-state holder on `cpu`. Single atomic
/// store; readers never observe a torn handle.
pub fn set_owner(cpu: CpuId, owner: Option<ContextHandle>) {
    if let Some(w) = OWNERS.get(cpu as usize) {
        w.store(owner.map_or(0, ContextHandle::pack), Ordering::Release);
    }
}

/// Clear ownership only if `owner` still holds it. Used by the remote
/// save protocol so a racing local save cannot be double-cleared.
pub fn clear_if(cpu: CpuId, owner: ContextHandle) -> bool {
    OWNERS
        .get(cpu as usize)
        .map(|w| {
            w.compare_exchange(owner.pack(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Drop every ownership record. Only used by tests.
pub fn reset() {
    for w in OWNERS.iter() {
        w.store(0, Ordering::Release);
    }
}
