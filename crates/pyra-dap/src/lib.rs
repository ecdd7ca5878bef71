//! Pyra execution and debug session manager.
//!
//! This crate provides:
//! - A DAP client (framing codec, request/response correlation) for talking to
//!   `debugpy`.
//! - The debug session state machine and the lazily fetched, generation-scoped
//!   inspection tree behind the debug panel.
//! - An event router that fans process output and debug events out to the UI.
//! - [`ExecutionManager`], which ties plain runs and debug launches to a single
//!   [`pyra_process::Supervisor`].

pub mod breakpoints;
pub mod client;
pub mod dap;
pub mod dap_tokio;
pub mod error;
pub mod hardening;
pub mod inspection;
pub mod launch;
pub mod manager;
pub mod router;
pub mod session;

pub use crate::dap::types;
pub use crate::error::{DebugError, DebugResult};
pub use crate::inspection::{FrameRef, Generation, InspectionTree, Scope, StackFrame, VarRef, Variable};
pub use crate::launch::{DebugLaunch, LaunchRequest};
pub use crate::manager::ExecutionManager;
pub use crate::router::{EventRouter, RouterEvent, Subscription, Topic};
pub use crate::session::{
    DebugEvent, DebugSession, RunState, SessionId, SessionStatus, StepKind, TerminationCause,
};
