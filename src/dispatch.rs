// CLASSIFICATION: COMMUNITY
// Filename: dispatch.rs v0.7
// Author: Lukas Bower
// Date Modified: 2027-03-02

//! Request dispatcher.
//!
//! The single multiplexed entry point of the subsystem, in the style
//! of the kernel syscall table: a fixed descriptor table keyed by
//! command code drives validation (target-task rules, context
//! requirement, argument cardinality) before the matching context
//! operation runs.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::config::{PFM_SMPL_VERSION, PFM_VERSION};
use crate::context::{self, BrkEntry, PmcEntry, PmdEntry, ReadEntry, SamplingSpec};
use crate::tasks::{self, TaskState};
use crate::types::{ContextFlags, ContextHandle, CpuId, PerfmonError, PerfmonResult, TaskId};

/// Monitoring request, one variant per command code.
#[derive(Clone, Debug)]
pub enum Request {
    CreateContext {
        flags: u32,
        notify_task: TaskId,
        cpu_mask: u64,
        sampling_entries: u64,
        sampling_pmd_mask: u64,
    },
    WriteControlRegisters(Vec<PmcEntry>),
    WriteDataRegisters(Vec<PmdEntry>),
    ReadDataRegisters(Vec<ReadEntry>),
    Start,
    Stop,
    Enable,
    Disable,
    Restart,
    Protect,
    Unprotect,
    DestroyContext,
    GetFeatures,
    WriteInstructionBreakpoints(Vec<BrkEntry>),
    WriteDataBreakpoints(Vec<BrkEntry>),
    SetDebugMode(bool),
}

/// Reply payloads. Batch replies carry the per-entry error flags even
/// when only a prefix of the batch was applied; partial success is a
/// first-class outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Context {
        handle: ContextHandle,
        sampling_addr: Option<u64>,
    },
    ControlRegisters(Vec<PmcEntry>),
    DataRegisters(Vec<PmdEntry>),
    ReadRegisters(Vec<ReadEntry>),
    Features {
        protocol_version: u32,
        sampling_version: u32,
    },
    InstructionBreakpoints(Vec<BrkEntry>),
    DataBreakpoints(Vec<BrkEntry>),
    Done,
}

/// Argument shape accepted by one command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// No payload beyond the implicit context lookup.
    None,
    /// One or more fixed-size records.
    Records,
}

/// Static description of one command code.
pub struct CmdDesc {
    pub name: &'static str,
    pub needs_context: bool,
    pub accepts_task: bool,
    /// Exempt from the quiescent-target scheduling-state check.
    pub no_state_check: bool,
    pub arg: Cardinality,
}

/// Command table, indexed by [`Request::code`].
pub const COMMANDS: &[CmdDesc] = &[
    CmdDesc { name: "create_context", needs_context: false, accepts_task: false, no_state_check: true, arg: Cardinality::None },
    CmdDesc { name: "write_pmcs", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::Records },
    CmdDesc { name: "write_pmds", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::Records },
    CmdDesc { name: "read_pmds", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::Records },
    CmdDesc { name: "start", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "stop", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "enable", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "disable", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "restart", needs_context: true, accepts_task: true, no_state_check: true, arg: Cardinality::None },
    CmdDesc { name: "protect", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "unprotect", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "destroy_context", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::None },
    CmdDesc { name: "get_features", needs_context: false, accepts_task: false, no_state_check: true, arg: Cardinality::None },
    CmdDesc { name: "write_ibrs", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::Records },
    CmdDesc { name: "write_dbrs", needs_context: true, accepts_task: true, no_state_check: false, arg: Cardinality::Records },
    CmdDesc { name: "set_debug_mode", needs_context: false, accepts_task: false, no_state_check: true, arg: Cardinality::None },
];

impl Request {
    /// Command code, the index into [`COMMANDS`].
    pub fn code(&self) -> u32 {
        match self {
            Request::CreateContext { .. } => 0,
            Request::WriteControlRegisters(_) => 1,
            Request::WriteDataRegisters(_) => 2,
            Request::ReadDataRegisters(_) => 3,
            Request::Start => 4,
            Request::Stop => 5,
            Request::Enable => 6,
            Request::Disable => 7,
            Request::Restart => 8,
            Request::Protect => 9,
            Request::Unprotect => 10,
            Request::DestroyContext => 11,
            Request::GetFeatures => 12,
            Request::WriteInstructionBreakpoints(_) => 13,
            Request::WriteDataBreakpoints(_) => 14,
            Request::SetDebugMode(_) => 15,
        }
    }

    fn record_count(&self) -> Option<usize> {
        match self {
            Request::WriteControlRegisters(v) => Some(v.len()),
            Request::WriteDataRegisters(v) => Some(v.len()),
            Request::ReadDataRegisters(v) => Some(v.len()),
            Request::WriteInstructionBreakpoints(v) => Some(v.len()),
            Request::WriteDataBreakpoints(v) => Some(v.len()),
            _ => None,
        }
    }
}

/// Descriptor for a raw command code, `None` when out of range.
pub fn describe(code: u32) -> Option<&'static CmdDesc> {
    COMMANDS.get(code as usize)
}

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

/// Process-wide diagnostic verbosity toggle.
pub fn debug_mode() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

#[cfg(not(feature = "perfmon"))]
pub fn perfmonctl(
    _caller: TaskId,
    _cpu: CpuId,
    _target: Option<TaskId>,
    _req: Request,
) -> PerfmonResult<Reply> {
    Err(PerfmonError::NotSupported)
}

/// Entry point for monitoring requests issued from process context.
///
/// `target` of `None` or `Some(0)` means the caller itself; any other
/// target needs signal permission and, unless the command is exempt, a
/// quiescent target whose register file cannot change underneath us.
#[cfg(feature = "perfmon")]
pub fn perfmonctl(
    caller: TaskId,
    cpu: CpuId,
    target: Option<TaskId>,
    req: Request,
) -> PerfmonResult<Reply> {
    let desc = describe(req.code()).ok_or(PerfmonError::InvalidArgument)?;
    if debug_mode() {
        debug!("perfmonctl: task {caller} cpu{cpu} {} {:?}", desc.name, target);
    }
    if let Some(n) = req.record_count() {
        if desc.arg != Cardinality::Records || n == 0 {
            return Err(PerfmonError::InvalidArgument);
        }
    }

    let target_task = match target {
        None | Some(0) => caller,
        Some(t) => t,
    };
    if target_task != caller {
        if !desc.accepts_task {
            return Err(PerfmonError::InvalidArgument);
        }
        if !tasks::exists(target_task) {
            return Err(PerfmonError::NotFound);
        }
        if !tasks::can_signal(caller, target_task) {
            return Err(PerfmonError::PermissionDenied);
        }
        if !desc.no_state_check && tasks::state(target_task)? == TaskState::Running {
            warn!(
                "perfmonctl: target task {target_task} not quiescent for {}",
                desc.name
            );
            return Err(PerfmonError::Busy);
        }
    }

    match req {
        Request::GetFeatures => Ok(Reply::Features {
            protocol_version: PFM_VERSION,
            sampling_version: PFM_SMPL_VERSION,
        }),
        Request::SetDebugMode(on) => {
            DEBUG_MODE.store(on, Ordering::Relaxed);
            Ok(Reply::Done)
        }
        Request::CreateContext {
            flags,
            notify_task,
            cpu_mask,
            sampling_entries,
            sampling_pmd_mask,
        } => {
            let flags =
                ContextFlags::from_bits(flags).ok_or(PerfmonError::InvalidArgument)?;
            let sampling = if sampling_entries > 0 {
                Some(SamplingSpec {
                    entries: sampling_entries,
                    pmd_mask: sampling_pmd_mask,
                })
            } else {
                None
            };
            let notify = if notify_task == 0 { None } else { Some(notify_task) };
            let (handle, sampling_addr) =
                context::create(caller, flags, notify, cpu_mask, sampling)?;
            Ok(Reply::Context {
                handle,
                sampling_addr,
            })
        }
        Request::WriteControlRegisters(mut entries) => {
            let ctx = resolve_context(caller, target_task)?;
            match context::write_pmcs(&ctx, cpu, &mut entries) {
                Ok(()) | Err(PerfmonError::InvalidArgument) => {
                    Ok(Reply::ControlRegisters(entries))
                }
                Err(e) => Err(e),
            }
        }
        Request::WriteDataRegisters(mut entries) => {
            let ctx = resolve_context(caller, target_task)?;
            match context::write_pmds(&ctx, cpu, &mut entries) {
                Ok(()) | Err(PerfmonError::InvalidArgument) => {
                    Ok(Reply::DataRegisters(entries))
                }
                Err(e) => Err(e),
            }
        }
        Request::ReadDataRegisters(mut entries) => {
            let ctx = resolve_context(caller, target_task)?;
            match context::read_pmds(&ctx, cpu, &mut entries) {
                Ok(()) | Err(PerfmonError::InvalidArgument) => {
                    Ok(Reply::ReadRegisters(entries))
                }
                Err(e) => Err(e),
            }
        }
        Request::Start => ctx_op(caller, target_task, |ctx| context::start(ctx, cpu)),
        Request::Stop => ctx_op(caller, target_task, |ctx| context::stop(ctx, cpu)),
        Request::Enable => ctx_op(caller, target_task, |ctx| context::enable(ctx, cpu)),
        Request::Disable => ctx_op(caller, target_task, |ctx| context::disable(ctx, cpu)),
        Request::Restart => {
            ctx_op(caller, target_task, |ctx| context::restart(ctx, caller, cpu))
        }
        Request::Protect => ctx_op(caller, target_task, |ctx| context::protect(ctx, caller)),
        Request::Unprotect => {
            ctx_op(caller, target_task, |ctx| context::unprotect(ctx, caller))
        }
        Request::DestroyContext => {
            ctx_op(caller, target_task, |ctx| context::destroy(ctx, cpu))
        }
        Request::WriteInstructionBreakpoints(mut entries) => {
            let ctx = resolve_context(caller, target_task)?;
            match context::write_breakpoints(&ctx, cpu, true, &mut entries) {
                Ok(()) | Err(PerfmonError::InvalidArgument) => {
                    Ok(Reply::InstructionBreakpoints(entries))
                }
                Err(e) => Err(e),
            }
        }
        Request::WriteDataBreakpoints(mut entries) => {
            let ctx = resolve_context(caller, target_task)?;
            match context::write_breakpoints(&ctx, cpu, false, &mut entries) {
                Ok(()) | Err(PerfmonError::InvalidArgument) => {
                    Ok(Reply::DataBreakpoints(entries))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Locate the target's context and enforce the protected-access rule.
#[cfg(feature = "perfmon")]
fn resolve_context(
    caller: TaskId,
    target_task: TaskId,
) -> PerfmonResult<std::sync::Arc<context::PfmContext>> {
    let ctx = context::context_of(target_task).ok_or(PerfmonError::NotFound)?;
    if ctx.is_protected() && ctx.creator_task()? != caller {
        return Err(PerfmonError::PermissionDenied);
    }
    Ok(ctx)
}

#[cfg(feature = "perfmon")]
fn ctx_op(
    caller: TaskId,
    target_task: TaskId,
    op: impl FnOnce(&context::PfmContext) -> PerfmonResult<()>,
) -> PerfmonResult<Reply> {
    let ctx = resolve_context(caller, target_task)?;
    op(&ctx).map(|_| Reply::Done)
}
