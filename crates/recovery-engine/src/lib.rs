//! # Recovery Engine
//!
//! Turns health poll results into logged recovery decisions and runs the
//! deploy-then-supervise loop for a fleet.
//!
//! ## Decisions
//! - RESTART with capped exponential backoff while the rolling-window budget lasts
//! - ESCALATE once the budget is spent, or when an agent never started
//! - Cascading failures grouped behind one upstream restart

pub mod action;
pub mod backoff;
pub mod controller;
pub mod runtime;
pub mod sink;

pub use action::{ActionKind, ActionLog, RecoveryAction};
pub use backoff::Backoff;
pub use controller::{RecoveryController, RecoveryState};
pub use runtime::FleetRuntime;
pub use sink::{emit_detached, HttpSink, RecoverySink, SinkError, TracingSink};
