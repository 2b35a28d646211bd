// src/supervisor/mod.rs

//! The parent side of the fork cycle.
//!
//! - [`core`]: pure state machine deciding what to do next.
//! - [`runtime`]: async shell owning the live executor handle.
//! - [`orphan`]: failing jobs whose executor went away.

pub mod core;
pub mod orphan;
pub mod runtime;

pub use self::core::{
    CoreOptions, StopReason, SupervisorCommand, SupervisorCore, SupervisorEvent, SupervisorState,
    SupervisorStep,
};
pub use orphan::OrphanRecovery;
pub use runtime::{RunSummary, SupervisorSettings, WorkerSupervisor};
