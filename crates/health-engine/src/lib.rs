//! # Health Engine
//!
//! Per-agent health state machine, protocol probes and the concurrent
//! polling loop that feeds recovery decisions.

pub mod probe;
pub mod record;
pub mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use probe::{probe_for, HealthProbe, HttpProbe, NoProbe, RpcProbe};
pub use record::{CheckOutcome, HealthRecord, HealthStatus, Transition};
pub use supervisor::{FleetSnapshot, HealthSupervisor, PollReport};
