// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-03-02

//! cohperf: PMU session and context manager.
//!
//! Lets tasks and system-wide tools program the per-CPU performance
//! monitoring unit, receive overflow notifications, and keep their
//! counter state correct across context switches and CPU migration.
//! Each CPU carries one PMU with room for a single owner at a time;
//! the ownership tracker, session registry and lazy save/restore
//! protocol arbitrate it.

/// Shared ids, flags and the error taxonomy.
pub mod types;

/// Named 256-bit register index set.
pub mod regset;

/// Run-time PMU description, installed once at init.
pub mod config;

/// Register file adapter and the simulated per-CPU PMU behind it.
pub mod hw;

/// Per-CPU owner table for the live hardware state.
pub mod ownership;

/// Session accounting: per-task vs system-wide exclusion, debug regs.
pub mod sessions;

/// Overflow sampling ring buffer.
pub mod sampling;

/// Task-side collaborator surface (state, signals, pending work).
pub mod tasks;

/// Monitoring context arena and lifecycle operations.
pub mod context;

/// Overflow interrupt handling.
pub mod overflow;

/// Request dispatch: the external command table.
pub mod dispatch;

pub use crate::dispatch::{perfmonctl, Reply, Request};
pub use crate::types::{ContextFlags, ContextHandle, CpuId, PerfmonError, TaskId};
