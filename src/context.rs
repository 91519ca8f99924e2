// CLASSIFICATION: COMMUNITY
// Filename: context.rs v0.9
// Author: Lukas Bower
// Date Modified: 2027-02-21

//! Monitoring context lifecycle.
//!
//! A context holds all software state for one monitoring session: the
//! virtualised 64-bit counters, saved control-register images, usage
//! bitmasks, the optional sampling buffer, and the links back to the
//! owning / creating / notify tasks. Contexts live in an arena and are
//! addressed by generation-checked handles, so a stale handle resolves
//! to `None` rather than a recycled slot.
//!
//! Live hardware state moves between the register file and a context
//! lazily. A single-acquire save gate (`Idle -> InProgress -> Saved`)
//! guarantees exactly one saver wins when a local context-switch save
//! races a cross-CPU fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::config::{self, PAGE_SIZE};
use crate::hw;
use crate::ownership;
use crate::regset::RegisterSet;
use crate::sampling::{BufferHandle, SamplingBuffer};
use crate::sessions;
use crate::tasks::{self, PendingWork};
use crate::types::{
    ContextFlags, ContextHandle, CpuId, InheritMode, PerfmonError, PerfmonResult, RegFlags,
    TaskId,
};

/// Privilege-level bits in a monitor PMC value.
pub const PMC_PLM_MASK: u64 = 0xf;
/// Count at user privilege only: the per-task session setting.
pub const PMC_PLM_TASK: u64 = 0x1;
/// Count at all privilege levels: the system-wide session setting.
pub const PMC_PLM_SYS: u64 = 0x4;
/// Overflow-interrupt request bit; forced on for every monitor.
pub const PMC_OI: u64 = 1 << 5;

/// Locked-memory quota applied to sampling buffer allocations. Stands
/// in for the caller's resource-limit, which the process manager owns.
pub const MEMLOCK_QUOTA: usize = 64 * PAGE_SIZE;

const NO_CPU: u32 = u32::MAX;

const SAVE_IDLE: u8 = 0;
const SAVE_IN_PROGRESS: u8 = 1;
const SAVE_DONE: u8 = 2;

/// Spin bound for waiting out a concurrent save. The remote save runs
/// a short fixed instruction sequence, so exhaustion means a wedged
/// peer, reported instead of hanging.
const SAVE_SPIN_LIMIT: u32 = 1_000_000;

/// Observable context state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Disabled,
    Enabled,
}

/// Per-counter software state.
#[derive(Clone, Debug, Default)]
pub struct SoftCounter {
    /// Software-extended high part of the 64-bit virtual counter.
    pub val: u64,
    /// Initial full value as last written.
    pub ival: u64,
    pub long_reset: u64,
    pub short_reset: u64,
    /// Sibling counters reloaded when this one overflows.
    pub reset_pmds: RegisterSet,
    pub notify: bool,
}

/// One control-register write record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmcEntry {
    pub index: usize,
    pub value: u64,
    pub flags: RegFlags,
}

/// One data-register write record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmdEntry {
    pub index: usize,
    pub value: u64,
    pub long_reset: u64,
    pub short_reset: u64,
    /// Sibling reload mask, low-64 form.
    pub reset_pmds: u64,
    pub flags: RegFlags,
}

/// One data-register read record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadEntry {
    pub index: usize,
    pub value: u64,
    pub flags: RegFlags,
}

/// One breakpoint-register write record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrkEntry {
    pub index: usize,
    pub value: u64,
    pub flags: RegFlags,
}

struct Links {
    owner: TaskId,
    creator: TaskId,
    notify: Option<TaskId>,
}

pub(crate) struct CtxInner {
    pub(crate) state: ContextState,
    /// Overflow seen, restart not yet issued.
    pub(crate) frozen: bool,
    pub(crate) soft_pmds: Vec<SoftCounter>,
    /// Raw hardware remainder per PMD, reloaded on context load.
    pub(crate) pmds_raw: Vec<u64>,
    /// Saved control-register images.
    pub(crate) pmcs: Vec<u64>,
    pub(crate) used_pmds: RegisterSet,
    pub(crate) used_pmcs: RegisterSet,
    /// Saved breakpoint-register images, replayed on context load.
    pub(crate) ibrs: Vec<u64>,
    pub(crate) dbrs: Vec<u64>,
    pub(crate) used_ibrs: RegisterSet,
    pub(crate) used_dbrs: RegisterSet,
    /// Debug-register claim held in the session registry.
    pub(crate) dbg_reserved: bool,
    /// Registers that overflowed and await the restart long-reset.
    pub(crate) ovfl_regs: RegisterSet,
    /// Pre-pin affinity of the owner, system-wide sessions only.
    pub(crate) saved_affinity: Option<u64>,
}

pub struct PfmContext {
    handle: ContextHandle,
    flags: ContextFlags,
    inherit: InheritMode,
    pinned_cpu: Option<CpuId>,
    protected: AtomicBool,
    last_cpu: AtomicU32,
    save_state: AtomicU8,
    links: Mutex<Links>,
    inner: Mutex<CtxInner>,
    smpl: Option<BufferHandle>,
}

impl PfmContext {
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn is_system_wide(&self) -> bool {
        self.flags.contains(ContextFlags::SYSTEM_WIDE)
    }

    pub fn is_blocking(&self) -> bool {
        self.flags.contains(ContextFlags::BLOCK_ON_OVFL)
    }

    pub fn inherit_mode(&self) -> InheritMode {
        self.inherit
    }

    pub fn sampling_buffer(&self) -> Option<&BufferHandle> {
        self.smpl.as_ref()
    }

    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::Acquire)
    }

    pub fn last_cpu(&self) -> Option<CpuId> {
        match self.last_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            c => Some(c),
        }
    }

    pub fn owner_task(&self) -> PerfmonResult<TaskId> {
        Ok(self.links.lock().map_err(|_| PerfmonError::Fault)?.owner)
    }

    pub fn creator_task(&self) -> PerfmonResult<TaskId> {
        Ok(self.links.lock().map_err(|_| PerfmonError::Fault)?.creator)
    }

    pub fn notify_task(&self) -> PerfmonResult<Option<TaskId>> {
        Ok(self.links.lock().map_err(|_| PerfmonError::Fault)?.notify)
    }

    /// Drop the notify link if it points at `task`. Called from task
    /// teardown under the links lock so the overflow path never reads
    /// a dangling target.
    fn clear_notify_if(&self, task: TaskId) {
        if let Ok(mut l) = self.links.lock() {
            if l.notify == Some(task) {
                l.notify = None;
            }
        }
    }

    pub fn state(&self) -> PerfmonResult<(ContextState, bool)> {
        let inner = self.inner.lock().map_err(|_| PerfmonError::Fault)?;
        Ok((inner.state, inner.frozen))
    }

    /// Interrupt-path access to the register state. Kept narrow; the
    /// overflow handler is the only caller outside this module.
    pub(crate) fn inner_for_interrupt(
        &self,
    ) -> PerfmonResult<std::sync::MutexGuard<'_, CtxInner>> {
        self.inner.lock().map_err(|_| PerfmonError::Fault)
    }

    fn owns_cpu(&self, cpu: CpuId) -> bool {
        ownership::current_owner(cpu) == Some(self.handle)
    }
}

struct Arena {
    slots: Vec<Option<Arc<PfmContext>>>,
    generations: Vec<u32>,
    /// task -> its attached context.
    attached: HashMap<TaskId, ContextHandle>,
    /// task -> contexts holding it as notify target.
    notify_refs: HashMap<TaskId, HashSet<ContextHandle>>,
}

static ARENA: Lazy<Mutex<Arena>> = Lazy::new(|| {
    Mutex::new(Arena {
        slots: Vec::new(),
        generations: Vec::new(),
        attached: HashMap::new(),
        notify_refs: HashMap::new(),
    })
});

fn arena() -> PerfmonResult<std::sync::MutexGuard<'static, Arena>> {
    ARENA.lock().map_err(|_| PerfmonError::Fault)
}

/// Resolve a handle, `None` once the slot was destroyed or recycled.
pub fn get(handle: ContextHandle) -> Option<Arc<PfmContext>> {
    let a = ARENA.lock().ok()?;
    if a.generations.get(handle.slot as usize) != Some(&handle.generation) {
        return None;
    }
    a.slots.get(handle.slot as usize)?.clone()
}

/// Context attached to `task`, if any.
pub fn context_of(task: TaskId) -> Option<Arc<PfmContext>> {
    let handle = {
        let a = ARENA.lock().ok()?;
        a.attached.get(&task).copied()?
    };
    get(handle)
}

fn arena_insert(
    a: &mut Arena,
    build: impl FnOnce(ContextHandle) -> PfmContext,
) -> Arc<PfmContext> {
    let slot = a.slots.iter().position(Option::is_none).unwrap_or_else(|| {
        a.slots.push(None);
        a.generations.push(0);
        a.slots.len() - 1
    });
    a.generations[slot] += 1;
    let handle = ContextHandle {
        slot: slot as u32,
        generation: a.generations[slot],
    };
    let ctx = Arc::new(build(handle));
    a.slots[slot] = Some(Arc::clone(&ctx));
    ctx
}

fn arena_remove(a: &mut Arena, handle: ContextHandle) {
    if a.generations.get(handle.slot as usize) == Some(&handle.generation) {
        a.slots[handle.slot as usize] = None;
        // bump so stale handles can never resolve to a future tenant
        a.generations[handle.slot as usize] += 1;
    }
    a.attached.retain(|_, h| *h != handle);
    for refs in a.notify_refs.values_mut() {
        refs.remove(&handle);
    }
    a.notify_refs.retain(|_, refs| !refs.is_empty());
}

fn fresh_inner(d: &config::PmuDescription) -> CtxInner {
    CtxInner {
        state: ContextState::Disabled,
        frozen: false,
        soft_pmds: vec![SoftCounter::default(); d.num_pmds],
        pmds_raw: vec![0; d.num_pmds],
        pmcs: vec![0; d.num_pmcs],
        used_pmds: RegisterSet::new(),
        used_pmcs: RegisterSet::new(),
        ibrs: vec![0; d.num_ibrs],
        dbrs: vec![0; d.num_dbrs],
        used_ibrs: RegisterSet::new(),
        used_dbrs: RegisterSet::new(),
        dbg_reserved: false,
        ovfl_regs: RegisterSet::new(),
        saved_affinity: None,
    }
}

/// Simulated user-mapping base allocator for sampling buffers. The
/// page-mapping collaborator would normally pick this address.
static NEXT_MAP_ADDR: AtomicU64 = AtomicU64::new(0x2000_0000);

/// Sampling request at creation time.
#[derive(Clone, Copy, Debug)]
pub struct SamplingSpec {
    pub entries: u64,
    pub pmd_mask: u64,
}

/// Create a context for `caller`. At most one per task; the session
/// slot, sampling buffer and CPU pinning are all rolled back if any
/// later step fails.
pub fn create(
    caller: TaskId,
    flags: ContextFlags,
    notify_task: Option<TaskId>,
    cpu_mask: u64,
    sampling: Option<SamplingSpec>,
) -> PerfmonResult<(ContextHandle, Option<u64>)> {
    if !tasks::exists(caller) {
        return Err(PerfmonError::NotFound);
    }
    let system_wide = flags.contains(ContextFlags::SYSTEM_WIDE);
    let pinned_cpu = if system_wide {
        if cpu_mask.count_ones() != 1 {
            return Err(PerfmonError::InvalidArgument);
        }
        let cpu = cpu_mask.trailing_zeros();
        if cpu >= config::description().num_cpus {
            return Err(PerfmonError::InvalidArgument);
        }
        Some(cpu)
    } else {
        if cpu_mask != 0 {
            return Err(PerfmonError::InvalidArgument);
        }
        None
    };

    let notify = match notify_task {
        None | Some(0) => Some(caller),
        Some(t) if t == caller => Some(caller),
        Some(t) => {
            if !tasks::exists(t) {
                return Err(PerfmonError::NotFound);
            }
            if !tasks::can_signal(caller, t) {
                return Err(PerfmonError::PermissionDenied);
            }
            Some(t)
        }
    };

    if context_of(caller).is_some() {
        return Err(PerfmonError::Busy);
    }

    sessions::try_reserve(system_wide, pinned_cpu, caller)?;

    let smpl = match sampling {
        Some(spec) => {
            let addr = NEXT_MAP_ADDR.fetch_add(0x0100_0000, Ordering::Relaxed);
            match SamplingBuffer::allocate(spec.entries, spec.pmd_mask, MEMLOCK_QUOTA, addr) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    let _ = sessions::release(system_wide, pinned_cpu);
                    return Err(e);
                }
            }
        }
        None => None,
    };

    let saved_affinity = match pinned_cpu {
        Some(cpu) => match tasks::pin_to_cpu(caller, cpu) {
            Ok(old) => Some(old),
            Err(e) => {
                let _ = sessions::release(system_wide, pinned_cpu);
                return Err(e);
            }
        },
        None => None,
    };

    let d = config::description();
    let user_addr = smpl.as_ref().map(|b| b.user_addr());
    let mut a = arena()?;
    let ctx = arena_insert(&mut a, |handle| PfmContext {
        handle,
        flags,
        inherit: flags.inherit_mode(),
        pinned_cpu,
        protected: AtomicBool::new(false),
        last_cpu: AtomicU32::new(NO_CPU),
        save_state: AtomicU8::new(SAVE_IDLE),
        links: Mutex::new(Links {
            owner: caller,
            creator: caller,
            notify,
        }),
        inner: Mutex::new(CtxInner {
            saved_affinity,
            ..fresh_inner(d)
        }),
        smpl,
    });
    a.attached.insert(caller, ctx.handle);
    if let Some(t) = notify {
        a.notify_refs.entry(t).or_default().insert(ctx.handle);
    }
    info!(
        "context {:?} created by task {caller} (system_wide={system_wide})",
        ctx.handle
    );
    Ok((ctx.handle, user_addr))
}

// ---------------------------------------------------------------------------
// save / load

fn copy_live_into(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    let d = config::description();
    let mask = d.ovfl_mask();
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    let used_pmds = inner.used_pmds;
    let used_pmcs = inner.used_pmcs;
    for i in used_pmds.iter() {
        let raw = hw::read_pmd(cpu, i)?;
        inner.pmds_raw[i] = if d.counting_pmds.test(i) { raw & mask } else { raw };
    }
    for i in used_pmcs.iter() {
        inner.pmcs[i] = hw::read_pmc(cpu, i)?;
    }
    Ok(())
}

/// Commit live hardware state into `ctx` and drop ownership. Exactly
/// one saver wins the gate; a concurrent caller waits for the winner
/// and then no-ops.
pub fn perform_save(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    match ctx.save_state.compare_exchange(
        SAVE_IDLE,
        SAVE_IN_PROGRESS,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            if ctx.owns_cpu(cpu) {
                copy_live_into(ctx, cpu)?;
                hw::set_counting(cpu, false)?;
                ownership::clear_if(cpu, ctx.handle);
            }
            ctx.save_state.store(SAVE_DONE, Ordering::Release);
            Ok(())
        }
        Err(SAVE_IN_PROGRESS) => {
            let mut spins = 0u32;
            while ctx.save_state.load(Ordering::Acquire) == SAVE_IN_PROGRESS {
                spins += 1;
                if spins > SAVE_SPIN_LIMIT {
                    warn!("context {:?}: save wait exhausted", ctx.handle);
                    return Err(PerfmonError::Fault);
                }
                std::hint::spin_loop();
            }
            Ok(())
        }
        Err(_) => Ok(()), // already saved
    }
}

/// Process context on this CPU needs `ctx`'s committed state while it
/// may be live elsewhere. Resolves via the save gate; on return all
/// reads of the context storage observe the fully saved state.
pub fn force_remote_save(ctx: &PfmContext) -> PerfmonResult<()> {
    if let Some(cpu) = ctx.last_cpu() {
        if ctx.owns_cpu(cpu) {
            perform_save(ctx, cpu)?;
        }
    }
    Ok(())
}

fn load_onto(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    // evict whoever holds the hardware now
    if let Some(victim) = ownership::current_owner(cpu) {
        if victim != ctx.handle {
            if let Some(vctx) = get(victim) {
                perform_save(&vctx, cpu)?;
            } else {
                // owner died without teardown; drop the stale claim
                ownership::set_owner(cpu, None);
            }
        }
    }
    hw::reset_cpu(cpu)?;
    let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    for i in inner.used_pmcs.iter() {
        hw::write_pmc(cpu, i, inner.pmcs[i])?;
    }
    for i in inner.used_pmds.iter() {
        hw::write_pmd(cpu, i, inner.pmds_raw[i])?;
    }
    for i in inner.used_ibrs.iter() {
        hw::write_ibr(cpu, i, inner.ibrs[i])?;
    }
    for i in inner.used_dbrs.iter() {
        hw::write_dbr(cpu, i, inner.dbrs[i])?;
    }
    drop(inner);
    hw::fence();
    ownership::set_owner(cpu, Some(ctx.handle));
    ctx.last_cpu.store(cpu, Ordering::Release);
    ctx.save_state.store(SAVE_IDLE, Ordering::Release);
    Ok(())
}

/// Scheduler switch-out hook. Lazy: counting stops but the register
/// file stays live and owned, so switching straight back costs
/// nothing. A full save happens only when someone else needs the PMU.
pub fn save_regs(task: TaskId, cpu: CpuId) -> PerfmonResult<()> {
    let ctx = match context_of(task) {
        Some(c) => c,
        None => return Ok(()),
    };
    if ctx.is_system_wide() {
        // the session owns the CPU outright, switches do not touch it
        return Ok(());
    }
    if ctx.owns_cpu(cpu) {
        hw::set_counting(cpu, false)?;
    }
    Ok(())
}

/// Scheduler switch-in hook. Reloads only on migration or after an
/// eviction; the lazy hit just re-arms counting.
pub fn load_regs(task: TaskId, cpu: CpuId) -> PerfmonResult<()> {
    let ctx = match context_of(task) {
        Some(c) => c,
        None => return Ok(()),
    };
    if ctx.is_system_wide() {
        return Ok(());
    }
    let (state, frozen) = ctx.state()?;
    if state != ContextState::Enabled {
        return Ok(());
    }
    if ctx.owns_cpu(cpu) {
        if !frozen {
            hw::set_counting(cpu, true)?;
        }
        return Ok(());
    }
    force_remote_save(&ctx)?;
    load_onto(&ctx, cpu)?;
    if !frozen {
        hw::set_counting(cpu, true)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// register access

fn require_enabled(inner: &CtxInner) -> PerfmonResult<()> {
    if inner.state != ContextState::Enabled {
        return Err(PerfmonError::InvalidState);
    }
    Ok(())
}

/// Apply a batch of control-register writes. Entries are validated
/// independently; the first failure marks itself and every later entry
/// failed and stops applying, while earlier entries stay applied.
pub fn write_pmcs(ctx: &PfmContext, cpu: CpuId, entries: &mut [PmcEntry]) -> PerfmonResult<()> {
    let d = config::description();
    let plm_wanted = if ctx.is_system_wide() {
        PMC_PLM_SYS
    } else {
        PMC_PLM_TASK
    };
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    require_enabled(&inner)?;
    let live = ctx.owns_cpu(cpu);
    let mut failed = false;
    for e in entries.iter_mut() {
        if failed {
            e.flags |= RegFlags::ERROR;
            continue;
        }
        let i = e.index;
        let ok = d.impl_pmcs.test(i)
            && !d.reserved_pmcs.test(i)
            && (!d.monitor_pmcs.test(i) || e.value & PMC_PLM_MASK == plm_wanted);
        if !ok {
            debug!("write_pmcs: entry pmc{i} rejected");
            e.flags |= RegFlags::ERROR;
            failed = true;
            continue;
        }
        let mut value = e.value;
        if d.monitor_pmcs.test(i) {
            value |= PMC_OI;
            if d.counting_pmds.test(i) {
                inner.used_pmds.set(i);
                inner.soft_pmds[i].notify = e.flags.contains(RegFlags::OVFL_NOTIFY);
            }
        }
        inner.pmcs[i] = value;
        inner.used_pmcs.set(i);
        if live {
            hw::write_pmc(cpu, i, value)?;
        }
    }
    if live {
        hw::fence();
    }
    if failed {
        return Err(PerfmonError::InvalidArgument);
    }
    Ok(())
}

/// Apply a batch of data-register writes; same partial-batch contract
/// as [`write_pmcs`].
pub fn write_pmds(ctx: &PfmContext, cpu: CpuId, entries: &mut [PmdEntry]) -> PerfmonResult<()> {
    let d = config::description();
    let mask = d.ovfl_mask();
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    require_enabled(&inner)?;
    let live = ctx.owns_cpu(cpu);
    let mut failed = false;
    for e in entries.iter_mut() {
        if failed {
            e.flags |= RegFlags::ERROR;
            continue;
        }
        let i = e.index;
        if !d.impl_pmds.test(i) || d.reserved_pmds.test(i) {
            debug!("write_pmds: entry pmd{i} rejected");
            e.flags |= RegFlags::ERROR;
            failed = true;
            continue;
        }
        if d.counting_pmds.test(i) {
            let c = &mut inner.soft_pmds[i];
            c.val = e.value & !mask;
            c.ival = e.value;
            c.long_reset = e.long_reset;
            c.short_reset = e.short_reset;
            c.reset_pmds = RegisterSet::from_low_mask(e.reset_pmds);
            inner.pmds_raw[i] = e.value & mask;
        } else {
            inner.pmds_raw[i] = e.value;
        }
        inner.used_pmds.set(i);
        if live {
            hw::write_pmd(cpu, i, inner.pmds_raw[i])?;
        }
    }
    if live {
        hw::fence();
    }
    if failed {
        return Err(PerfmonError::InvalidArgument);
    }
    Ok(())
}

/// Read data registers, combining the hardware remainder with the
/// software extension for counting registers. When the live state sits
/// on another CPU it is fetched through the remote-save protocol
/// first, so only committed values are ever observed.
pub fn read_pmds(ctx: &PfmContext, cpu: CpuId, entries: &mut [ReadEntry]) -> PerfmonResult<()> {
    let d = config::description();
    let mask = d.ovfl_mask();
    // reads are legal in any state; a disabled context serves its
    // committed storage
    if !ctx.owns_cpu(cpu) {
        force_remote_save(ctx)?;
    }
    let live = ctx.owns_cpu(cpu);
    let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    let mut failed = false;
    for e in entries.iter_mut() {
        if failed {
            e.flags |= RegFlags::ERROR;
            continue;
        }
        let i = e.index;
        if !d.impl_pmds.test(i) || !inner.used_pmds.test(i) {
            e.flags |= RegFlags::ERROR;
            failed = true;
            continue;
        }
        let raw = if live {
            let r = hw::read_pmd(cpu, i)?;
            if d.counting_pmds.test(i) {
                r & mask
            } else {
                r
            }
        } else {
            inner.pmds_raw[i]
        };
        e.value = if d.counting_pmds.test(i) {
            inner.soft_pmds[i].val.wrapping_add(raw)
        } else {
            raw
        };
    }
    if failed {
        return Err(PerfmonError::InvalidArgument);
    }
    Ok(())
}

/// Write instruction or data breakpoint registers. First use claims
/// the debug registers from the session registry. The images are kept
/// in the context like the PMC images, so a write while evicted takes
/// effect on the next load.
pub fn write_breakpoints(
    ctx: &PfmContext,
    cpu: CpuId,
    instruction: bool,
    entries: &mut [BrkEntry],
) -> PerfmonResult<()> {
    let d = config::description();
    let count = if instruction { d.num_ibrs } else { d.num_dbrs };
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    require_enabled(&inner)?;
    if !inner.dbg_reserved {
        sessions::try_reserve_debug_regs(ctx.is_system_wide())?;
        inner.dbg_reserved = true;
    }
    let live = ctx.owns_cpu(cpu);
    let mut failed = false;
    for e in entries.iter_mut() {
        if failed || e.index >= count {
            e.flags |= RegFlags::ERROR;
            failed = true;
            continue;
        }
        if instruction {
            inner.ibrs[e.index] = e.value;
            inner.used_ibrs.set(e.index);
            if live {
                hw::write_ibr(cpu, e.index, e.value)?;
            }
        } else {
            inner.dbrs[e.index] = e.value;
            inner.used_dbrs.set(e.index);
            if live {
                hw::write_dbr(cpu, e.index, e.value)?;
            }
        }
    }
    if live {
        hw::fence();
    }
    if failed {
        return Err(PerfmonError::InvalidArgument);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// state machine

/// `Disabled -> Enabled`: claim the PMU on `cpu`, evicting and saving
/// any current owner, and load this context's register images.
pub fn enable(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    if let Some(pinned) = ctx.pinned_cpu {
        if pinned != cpu {
            return Err(PerfmonError::InvalidArgument);
        }
    }
    {
        let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
        if inner.state != ContextState::Disabled {
            return Err(PerfmonError::InvalidState);
        }
    }
    load_onto(ctx, cpu)?;
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    inner.state = ContextState::Enabled;
    inner.frozen = false;
    info!("context {:?} enabled on cpu{cpu}", ctx.handle);
    Ok(())
}

/// Flush live state into storage and return to `Disabled`.
pub fn disable(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    {
        let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
        if inner.state != ContextState::Enabled {
            return Err(PerfmonError::InvalidState);
        }
    }
    if ctx.owns_cpu(cpu) {
        perform_save(ctx, cpu)?;
    } else {
        force_remote_save(ctx)?;
    }
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    inner.state = ContextState::Disabled;
    inner.frozen = false;
    Ok(())
}

/// Arm the monitoring-enable bit. Only the task holding the live PMU
/// may start it.
pub fn start(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    require_enabled(&inner)?;
    if !ctx.owns_cpu(cpu) {
        return Err(PerfmonError::InvalidState);
    }
    hw::set_counting(cpu, true)
}

/// Disarm the monitoring-enable bit without touching configuration.
pub fn stop(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    require_enabled(&inner)?;
    if ctx.owns_cpu(cpu) {
        hw::set_counting(cpu, false)?;
    }
    Ok(())
}

fn reload_counter(inner: &mut CtxInner, i: usize, long: bool, cpu: CpuId, live: bool) {
    let mask = config::description().ovfl_mask();
    let reset = if long {
        inner.soft_pmds[i].long_reset
    } else {
        inner.soft_pmds[i].short_reset
    };
    inner.pmds_raw[i] = reset & mask;
    if live {
        let _ = hw::write_pmd(cpu, i, reset & mask);
    }
}

/// Reload every overflowed counter (and its reset siblings) from the
/// long or short reset values. Live registers are rewritten when this
/// context currently owns `cpu`.
pub(crate) fn reset_after_overflow(
    inner: &mut CtxInner,
    ovfl: &RegisterSet,
    long: bool,
    cpu: CpuId,
    live: bool,
) {
    let counting = config::description().counting_pmds;
    let mut to_reload = *ovfl;
    for i in ovfl.iter() {
        let siblings = inner.soft_pmds[i].reset_pmds;
        to_reload.merge(&siblings);
    }
    for i in to_reload.iter() {
        if counting.test(i) {
            reload_counter(inner, i, long, cpu, live);
        }
    }
}

/// Acknowledge an overflow. Only legal while `Enabled+Frozen`; the
/// strict rejection replaces the historical warn-and-continue.
///
/// Restarting oneself applies the long resets synchronously. A
/// restart aimed at another task's context never mutates the context
/// here: blocking sessions get their waiter woken, non-blocking ones
/// have the owner flagged to self-restart on its way back to user
/// mode.
pub fn restart(ctx: &PfmContext, caller: TaskId, cpu: CpuId) -> PerfmonResult<()> {
    let owner = ctx.owner_task()?;
    {
        let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
        require_enabled(&inner)?;
        if !inner.frozen {
            warn!(
                "context {:?}: restart while not frozen (task {caller})",
                ctx.handle
            );
            return Err(PerfmonError::InvalidState);
        }
    }
    if caller == owner {
        restart_self(ctx, cpu)
    } else if ctx.is_blocking() {
        tasks::post_restart_permit(owner)
    } else {
        tasks::set_pending(owner, PendingWork::SELF_RESTART)
    }
}

fn restart_self(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    let live = ctx.owns_cpu(cpu);
    let mut inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
    let ovfl = inner.ovfl_regs;
    reset_after_overflow(&mut inner, &ovfl, true, cpu, live);
    inner.ovfl_regs.clear_all();
    inner.frozen = false;
    if let Some(buf) = ctx.sampling_buffer() {
        buf.reset();
    }
    drop(inner);
    if live {
        hw::unfreeze(cpu)?;
    }
    debug!("context {:?} restarted", ctx.handle);
    Ok(())
}

/// Return-to-user re-entry point: consume deferred overflow work for
/// `task`. The scheduler calls this where it checks pending signals.
pub fn resume_to_user(task: TaskId, cpu: CpuId) -> PerfmonResult<()> {
    let pending = tasks::take_pending(task)?;
    if pending.is_empty() {
        return Ok(());
    }
    let ctx = context_of(task).ok_or(PerfmonError::NotFound)?;
    if pending.contains(PendingWork::BLOCK_ON_RESTART) {
        tasks::wait_restart_permit(task)?;
        restart_self(&ctx, cpu)?;
    } else if pending.contains(PendingWork::SELF_RESTART) {
        restart_self(&ctx, cpu)?;
    }
    Ok(())
}

/// One-way restriction of all further access to the creator.
pub fn protect(ctx: &PfmContext, caller: TaskId) -> PerfmonResult<()> {
    if ctx.creator_task()? != caller {
        return Err(PerfmonError::PermissionDenied);
    }
    ctx.protected.store(true, Ordering::Release);
    Ok(())
}

/// Creator-only undo of [`protect`].
pub fn unprotect(ctx: &PfmContext, caller: TaskId) -> PerfmonResult<()> {
    if ctx.creator_task()? != caller {
        return Err(PerfmonError::PermissionDenied);
    }
    ctx.protected.store(false, Ordering::Release);
    Ok(())
}

/// Tear a context down: flush if enabled, drop the sampling mapping,
/// release the session slot and any debug-register claim, restore the
/// owner's affinity and clear every back-reference.
pub fn destroy(ctx: &PfmContext, cpu: CpuId) -> PerfmonResult<()> {
    let (state, _) = ctx.state()?;
    if state == ContextState::Enabled {
        disable(ctx, cpu)?;
    }
    if let Some(buf) = ctx.sampling_buffer() {
        buf.mapping_removed();
        buf.release_reference();
    }
    let owner = ctx.owner_task()?;
    let (dbg_reserved, saved_affinity) = {
        let inner = ctx.inner.lock().map_err(|_| PerfmonError::Fault)?;
        (inner.dbg_reserved, inner.saved_affinity)
    };
    if dbg_reserved {
        sessions::release_debug_regs(ctx.is_system_wide())?;
    }
    sessions::release(ctx.is_system_wide(), ctx.pinned_cpu)?;
    if let Some(mask) = saved_affinity {
        let _ = tasks::set_affinity(owner, mask);
    }
    let mut a = arena()?;
    arena_remove(&mut a, ctx.handle);
    info!("context {:?} destroyed", ctx.handle);
    Ok(())
}

/// Fork hook. Applies the inheritance policy and hands the child its
/// own context where the policy grants one.
pub fn fork_inherit(parent: TaskId, child: TaskId) -> PerfmonResult<Option<ContextHandle>> {
    let pctx = match context_of(parent) {
        Some(c) => c,
        None => return Ok(None),
    };
    if pctx.is_system_wide() {
        // CPU-wide sessions follow the CPU, not the process tree
        return Ok(None);
    }
    let child_inherit = match pctx.inherit_mode() {
        InheritMode::None => return Ok(None),
        InheritMode::Once => InheritMode::None,
        InheritMode::All => InheritMode::All,
    };
    if !tasks::exists(child) {
        return Err(PerfmonError::NotFound);
    }
    // the copy is an ordinary per-task session and needs its own slot
    sessions::try_reserve(false, None, child)?;
    let d = config::description();
    let mask = d.ovfl_mask();
    let notify = pctx.notify_task()?;
    let child_inner = {
        let pinner = match pctx.inner.lock() {
            Ok(g) => g,
            Err(_) => {
                let _ = sessions::release(false, None);
                return Err(PerfmonError::Fault);
            }
        };
        let mut inner = fresh_inner(d);
        inner.state = pinner.state;
        inner.used_pmds = pinner.used_pmds;
        inner.used_pmcs = pinner.used_pmcs;
        inner.pmcs = pinner.pmcs.clone();
        inner.soft_pmds = pinner.soft_pmds.clone();
        // counters restart from their initial values in the child
        for i in inner.used_pmds.iter() {
            if d.counting_pmds.test(i) {
                let ival = inner.soft_pmds[i].ival;
                inner.soft_pmds[i].val = ival & !mask;
                inner.pmds_raw[i] = ival & mask;
            } else {
                inner.pmds_raw[i] = pinner.pmds_raw[i];
            }
        }
        inner
    };
    let smpl = pctx.sampling_buffer().map(|buf| {
        buf.acquire_reference();
        BufferHandle::clone(buf)
    });
    let mut a = arena()?;
    let ctx = arena_insert(&mut a, |handle| PfmContext {
        handle,
        flags: pctx.flags,
        inherit: child_inherit,
        pinned_cpu: None,
        protected: AtomicBool::new(false),
        last_cpu: AtomicU32::new(NO_CPU),
        save_state: AtomicU8::new(SAVE_IDLE),
        links: Mutex::new(Links {
            owner: child,
            creator: child,
            notify,
        }),
        inner: Mutex::new(child_inner),
        smpl,
    });
    a.attached.insert(child, ctx.handle);
    if let Some(t) = notify {
        a.notify_refs.entry(t).or_default().insert(ctx.handle);
    }
    debug!(
        "context {:?} inherited by task {child} from task {parent}",
        ctx.handle
    );
    Ok(Some(ctx.handle))
}

/// Task teardown hook. Flushes and frees the task's own context and
/// severs notify links held by other contexts, then drops the task.
pub fn task_exit(task: TaskId, cpu: CpuId) -> PerfmonResult<()> {
    if let Some(ctx) = context_of(task) {
        destroy(&ctx, cpu)?;
    }
    let referencing: Vec<ContextHandle> = {
        let a = arena()?;
        a.notify_refs
            .get(&task)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    };
    for h in referencing {
        if let Some(ctx) = get(h) {
            ctx.clear_notify_if(task);
        }
    }
    {
        let mut a = arena()?;
        a.notify_refs.remove(&task);
    }
    let _ = tasks::remove(task);
    Ok(())
}

/// Empty the arena and side tables. Only used in tests.
pub fn reset() {
    if let Ok(mut a) = ARENA.lock() {
        a.slots.clear();
        a.generations.clear();
        a.attached.clear();
        a.notify_refs.clear();
    }
}
