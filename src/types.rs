// CLASSIFICATION: COMMUNITY
// Filename: types.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-11-08

//! Shared types for the cohperf subsystem.

use bitflags::bitflags;
use thiserror::Error;

/// Logical CPU number.
pub type CpuId = u32;

/// Task identifier handed to us by the process manager.
pub type TaskId = u32;

/// Stable handle addressing a monitoring context in the arena.
///
/// Slot plus generation; a destroyed slot bumps its generation so stale
/// handles resolve to `None` instead of a recycled context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    pub slot: u32,
    pub generation: u32,
}

impl ContextHandle {
    /// Pack into a single word. Generation zero is never issued, so the
    /// packed form of a live handle is never zero.
    pub fn pack(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.slot)
    }

    /// Reverse of [`ContextHandle::pack`]; zero means "no handle".
    pub fn unpack(raw: u64) -> Option<ContextHandle> {
        if raw == 0 {
            return None;
        }
        Some(ContextHandle {
            slot: (raw & 0xffff_ffff) as u32,
            generation: (raw >> 32) as u32,
        })
    }
}

/// Context inheritance across fork.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InheritMode {
    /// Child gets no monitoring context.
    None,
    /// Child gets a copy, copy does not propagate further.
    Once,
    /// Child gets a copy and keeps propagating to grandchildren.
    All,
}

bitflags! {
    /// Creation-time mode flags for a monitoring context.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// Monitor a whole CPU instead of one task.
        const SYSTEM_WIDE   = 1 << 0;
        /// Block the monitored task on overflow until restart.
        const BLOCK_ON_OVFL = 1 << 1;
        /// Inherit once across fork.
        const INHERIT_ONCE  = 1 << 2;
        /// Inherit across all forks.
        const INHERIT_ALL   = 1 << 3;
    }
}

impl ContextFlags {
    /// Decode the inheritance policy bits. `INHERIT_ALL` wins when both
    /// bits are set, matching the strongest-policy reading.
    pub fn inherit_mode(self) -> InheritMode {
        if self.contains(ContextFlags::INHERIT_ALL) {
            InheritMode::All
        } else if self.contains(ContextFlags::INHERIT_ONCE) {
            InheritMode::Once
        } else {
            InheritMode::None
        }
    }
}

bitflags! {
    /// Per-entry flags on register read/write records.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RegFlags: u32 {
        /// Request an overflow notification for this counter.
        const OVFL_NOTIFY = 1 << 0;
        /// Set on return when this entry failed validation.
        const ERROR       = 1 << 31;
    }
}

/// Errors surfaced by cohperf operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PerfmonError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such context or task")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("resource busy")]
    Busy,
    #[error("operation not legal in current context state")]
    InvalidState,
    #[error("out of memory")]
    OutOfMemory,
    #[error("sampling buffer exceeds resource quota")]
    QuotaExceeded,
    #[error("argument copy fault")]
    IoFault,
    #[error("performance monitoring support not compiled in")]
    NotSupported,
    #[error("internal fault")]
    Fault,
}

/// Shorthand used throughout the crate.
pub type PerfmonResult<T> = Result<T, PerfmonError>;
