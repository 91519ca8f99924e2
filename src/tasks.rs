// CLASSIFICATION: COMMUNITY
// Filename: tasks.rs v0.5
// Author: Lukas Bower
// Date Modified: 2027-01-28

//! Task-side collaborator surface.
//!
//! The process manager owns tasks; cohperf only needs this narrow
//! slice of it: existence and scheduling state, signal permission, a
//! best-effort overflow notification channel, CPU affinity for pinned
//! system-wide sessions, and the per-task pending-action bits that are
//! consumed at the single return-to-user re-entry point.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use bitflags::bitflags;
use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::types::{PerfmonError, PerfmonResult, TaskId};

/// Scheduling state as far as this subsystem cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Stopped or otherwise quiescent; its register file is stable.
    Stopped,
    Zombie,
}

bitflags! {
    /// Deferred work consumed on the way back to user mode.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PendingWork: u32 {
        /// Perform the overflow long-reset sequence before resuming.
        const SELF_RESTART = 1 << 0;
        /// Block until another task issues a restart.
        const BLOCK_ON_RESTART = 1 << 1;
    }
}

#[derive(Debug)]
struct TaskEntry {
    uid: u32,
    state: TaskState,
    pending: PendingWork,
    /// Restart permits posted by cross-task restart requests.
    permits: u32,
    /// Overflow notifications delivered, newest last. Test-visible
    /// stand-in for signal delivery.
    notifications: Vec<u64>,
    /// Allowed-CPU mask, mutated when a system-wide session pins us.
    affinity: u64,
}

struct TaskTable {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    restart_cv: Condvar,
}

static TABLE: Lazy<TaskTable> = Lazy::new(|| TaskTable {
    tasks: Mutex::new(HashMap::new()),
    restart_cv: Condvar::new(),
});

fn with_entry<T>(
    task: TaskId,
    f: impl FnOnce(&mut TaskEntry) -> T,
) -> PerfmonResult<T> {
    let mut map = TABLE.tasks.lock().map_err(|_| PerfmonError::Fault)?;
    map.get_mut(&task).map(f).ok_or(PerfmonError::NotFound)
}

/// Register a task with its credential uid. All CPUs allowed initially.
pub fn register(task: TaskId, uid: u32) -> PerfmonResult<()> {
    let mut map = TABLE.tasks.lock().map_err(|_| PerfmonError::Fault)?;
    map.insert(
        task,
        TaskEntry {
            uid,
            state: TaskState::Running,
            pending: PendingWork::empty(),
            permits: 0,
            notifications: Vec::new(),
            affinity: u64::MAX,
        },
    );
    Ok(())
}

/// Drop a task from the table. The caller must already have torn down
/// any monitoring context attached to it.
pub fn remove(task: TaskId) -> PerfmonResult<()> {
    let mut map = TABLE.tasks.lock().map_err(|_| PerfmonError::Fault)?;
    map.remove(&task)
        .map(|_| ())
        .ok_or(PerfmonError::NotFound)
}

pub fn exists(task: TaskId) -> bool {
    TABLE
        .tasks
        .lock()
        .map(|m| m.contains_key(&task))
        .unwrap_or(false)
}

pub fn set_state(task: TaskId, state: TaskState) -> PerfmonResult<()> {
    with_entry(task, |e| e.state = state)
}

pub fn state(task: TaskId) -> PerfmonResult<TaskState> {
    with_entry(task, |e| e.state)
}

/// Signal-permission check: root may signal anyone, otherwise the uids
/// must match.
pub fn can_signal(from: TaskId, to: TaskId) -> bool {
    let map = match TABLE.tasks.lock() {
        Ok(m) => m,
        Err(_) => return false,
    };
    match (map.get(&from), map.get(&to)) {
        (Some(a), Some(b)) => a.uid == 0 || a.uid == b.uid,
        _ => false,
    }
}

/// Best-effort overflow notification. `NotFound` when the target has
/// vanished; the caller absorbs that.
pub fn notify_overflow(to: TaskId, ovfl_mask: u64) -> PerfmonResult<()> {
    with_entry(to, |e| {
        e.notifications.push(ovfl_mask);
        debug!("tasks: overflow notification 0x{ovfl_mask:x} -> task {to}");
    })
}

/// Delivered notifications, oldest first. Test observation point.
pub fn notifications(task: TaskId) -> Vec<u64> {
    with_entry(task, |e| e.notifications.clone()).unwrap_or_default()
}

/// Queue deferred work for `task`, consumed at return-to-user.
pub fn set_pending(task: TaskId, work: PendingWork) -> PerfmonResult<()> {
    with_entry(task, |e| e.pending |= work)
}

/// Take and clear the pending-work bits.
pub fn take_pending(task: TaskId) -> PerfmonResult<PendingWork> {
    with_entry(task, |e| std::mem::take(&mut e.pending))
}

/// Post one restart permit and wake any blocked waiter.
pub fn post_restart_permit(task: TaskId) -> PerfmonResult<()> {
    with_entry(task, |e| e.permits += 1)?;
    TABLE.restart_cv.notify_all();
    Ok(())
}

/// Block until a restart permit is available, then consume it. Used by
/// the blocking-overflow path on the way back to user mode.
pub fn wait_restart_permit(task: TaskId) -> PerfmonResult<()> {
    let mut map = TABLE.tasks.lock().map_err(|_| PerfmonError::Fault)?;
    loop {
        match map.get_mut(&task) {
            Some(e) if e.permits > 0 => {
                e.permits -= 1;
                return Ok(());
            }
            Some(_) => {
                map = TABLE
                    .restart_cv
                    .wait(map)
                    .map_err(|_| PerfmonError::Fault)?;
            }
            None => {
                warn!("tasks: task {task} vanished while awaiting restart");
                return Err(PerfmonError::NotFound);
            }
        }
    }
}

/// Restrict `task` to one CPU, returning the previous affinity mask so
/// it can be restored at context destroy.
pub fn pin_to_cpu(task: TaskId, cpu: u32) -> PerfmonResult<u64> {
    with_entry(task, |e| {
        let old = e.affinity;
        e.affinity = 1 << cpu;
        old
    })
}

pub fn set_affinity(task: TaskId, mask: u64) -> PerfmonResult<()> {
    with_entry(task, |e| e.affinity = mask)
}

pub fn affinity(task: TaskId) -> PerfmonResult<u64> {
    with_entry(task, |e| e.affinity)
}

/// Clear the whole table. Only used in tests.
pub fn reset() {
    if let Ok(mut map) = TABLE.tasks.lock() {
        map.clear();
    }
}
