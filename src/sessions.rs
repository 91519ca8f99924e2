// CLASSIFICATION: COMMUNITY
// Filename: sessions.rs v0.5
// Author: Lukas Bower
// Date Modified: 2027-01-12

//! Global monitoring session registry.
//!
//! Counts per-task and system-wide sessions and keeps the two classes
//! mutually exclusive, pins system-wide sessions to their CPU, and
//! arbitrates debug-register use between monitoring and external
//! debuggers. All failures are synchronous `Busy`; callers decide
//! whether to retry.

use std::sync::Mutex;

use log::debug;
use once_cell::sync::Lazy;

use crate::config;
use crate::types::{CpuId, PerfmonError, PerfmonResult, TaskId};

#[derive(Debug, Default)]
struct SessionTable {
    task_sessions: u32,
    sys_sessions: u32,
    /// Which task holds the system-wide session pinned to each CPU.
    sys_session_owner: Vec<Option<TaskId>>,
    /// Debug registers claimed by monitoring sessions.
    dbg_monitoring: u32,
    /// A system-wide session holds the exclusive monitoring claim.
    dbg_sys_claim: bool,
    /// Debug registers claimed by external debuggers (ptrace-style).
    dbg_external: u32,
}

static SESSIONS: Lazy<Mutex<SessionTable>> = Lazy::new(|| {
    Mutex::new(SessionTable {
        sys_session_owner: vec![None; config::description().num_cpus as usize],
        ..SessionTable::default()
    })
});

fn table() -> PerfmonResult<std::sync::MutexGuard<'static, SessionTable>> {
    SESSIONS.lock().map_err(|_| PerfmonError::Fault)
}

/// Reserve a session slot. System-wide reservations name their pinned
/// CPU; at most one system-wide session per CPU, and the two session
/// classes never coexist.
pub fn try_reserve(system_wide: bool, cpu: Option<CpuId>, task: TaskId) -> PerfmonResult<()> {
    let mut t = table()?;
    if system_wide {
        let cpu = cpu.ok_or(PerfmonError::InvalidArgument)? as usize;
        if t.task_sessions > 0 {
            return Err(PerfmonError::Busy);
        }
        let slot = t
            .sys_session_owner
            .get_mut(cpu)
            .ok_or(PerfmonError::InvalidArgument)?;
        if slot.is_some() {
            return Err(PerfmonError::Busy);
        }
        *slot = Some(task);
        t.sys_sessions += 1;
        debug!("sessions: system-wide reserved on cpu{cpu} by task {task}");
    } else {
        if t.sys_sessions > 0 {
            return Err(PerfmonError::Busy);
        }
        t.task_sessions += 1;
        debug!("sessions: per-task reserved by task {task}");
    }
    Ok(())
}

/// Release a previously reserved slot.
pub fn release(system_wide: bool, cpu: Option<CpuId>) -> PerfmonResult<()> {
    let mut t = table()?;
    if system_wide {
        let cpu = cpu.ok_or(PerfmonError::InvalidArgument)? as usize;
        if let Some(slot) = t.sys_session_owner.get_mut(cpu) {
            *slot = None;
        }
        t.sys_sessions = t.sys_sessions.saturating_sub(1);
    } else {
        t.task_sessions = t.task_sessions.saturating_sub(1);
    }
    Ok(())
}

/// Claim the debug registers for monitoring. Any external-debugger use
/// blocks the claim; a system-wide claim is additionally exclusive
/// against every other monitoring claim, since it programs the
/// breakpoints for the whole CPU.
pub fn try_reserve_debug_regs(system_wide: bool) -> PerfmonResult<()> {
    let mut t = table()?;
    if t.dbg_external > 0 {
        return Err(PerfmonError::Busy);
    }
    if system_wide {
        if t.dbg_monitoring > 0 {
            return Err(PerfmonError::Busy);
        }
        t.dbg_sys_claim = true;
    } else if t.dbg_sys_claim {
        return Err(PerfmonError::Busy);
    }
    t.dbg_monitoring += 1;
    Ok(())
}

pub fn release_debug_regs(system_wide: bool) -> PerfmonResult<()> {
    let mut t = table()?;
    if system_wide {
        t.dbg_sys_claim = false;
    }
    t.dbg_monitoring = t.dbg_monitoring.saturating_sub(1);
    Ok(())
}

/// External-debugger attach notification. Mutually exclusive with any
/// monitoring use of the debug registers.
pub fn note_external_debugger_attach() -> PerfmonResult<()> {
    let mut t = table()?;
    if t.dbg_monitoring > 0 {
        return Err(PerfmonError::Busy);
    }
    t.dbg_external += 1;
    Ok(())
}

pub fn note_external_debugger_detach() -> PerfmonResult<()> {
    let mut t = table()?;
    t.dbg_external = t.dbg_external.saturating_sub(1);
    Ok(())
}

/// Snapshot of the two session counts, for diagnostics and tests.
pub fn counts() -> PerfmonResult<(u32, u32)> {
    let t = table()?;
    Ok((t.task_sessions, t.sys_sessions))
}

/// Clear all registry state. Only used in tests.
pub fn reset() -> PerfmonResult<()> {
    let mut t = table()?;
    t.task_sessions = 0;
    t.sys_sessions = 0;
    t.dbg_monitoring = 0;
    t.dbg_sys_claim = false;
    t.dbg_external = 0;
    for slot in t.sys_session_owner.iter_mut() {
        *slot = None;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn classes_are_mutually_exclusive() {
        reset().unwrap();
        try_reserve(false, None, 10).unwrap();
        assert_eq!(try_reserve(true, Some(0), 11), Err(PerfmonError::Busy));
        release(false, None).unwrap();
        try_reserve(true, Some(0), 11).unwrap();
        assert_eq!(try_reserve(false, None, 10), Err(PerfmonError::Busy));
        // same class, different CPU is fine
        try_reserve(true, Some(1), 12).unwrap();
        // but the pinned CPU is single-occupancy
        assert_eq!(try_reserve(true, Some(1), 13), Err(PerfmonError::Busy));
        reset().unwrap();
    }

    #[test]
    #[serial]
    fn debug_register_split() {
        reset().unwrap();
        note_external_debugger_attach().unwrap();
        assert_eq!(try_reserve_debug_regs(false), Err(PerfmonError::Busy));
        note_external_debugger_detach().unwrap();
        try_reserve_debug_regs(false).unwrap();
        assert_eq!(note_external_debugger_attach(), Err(PerfmonError::Busy));
        release_debug_regs(false).unwrap();
        reset().unwrap();
    }

    #[test]
    #[serial]
    fn system_wide_debug_claim_is_exclusive() {
        reset().unwrap();
        // per-task claims may coexist with each other
        try_reserve_debug_regs(false).unwrap();
        try_reserve_debug_regs(false).unwrap();
        assert_eq!(try_reserve_debug_regs(true), Err(PerfmonError::Busy));
        release_debug_regs(false).unwrap();
        release_debug_regs(false).unwrap();
        // a system-wide claim shuts out every other monitoring claim
        try_reserve_debug_regs(true).unwrap();
        assert_eq!(try_reserve_debug_regs(false), Err(PerfmonError::Busy));
        assert_eq!(try_reserve_debug_regs(true), Err(PerfmonError::Busy));
        release_debug_regs(true).unwrap();
        try_reserve_debug_regs(false).unwrap();
        reset().unwrap();
    }

    #[test]
    #[serial]
    fn counts_never_both_nonzero() {
        reset().unwrap();
        for _ in 0..4 {
            try_reserve(false, None, 1).unwrap();
            let (t, s) = counts().unwrap();
            assert!(!(t > 0 && s > 0));
        }
        for _ in 0..4 {
            release(false, None).unwrap();
        }
        reset().unwrap();
    }
}
