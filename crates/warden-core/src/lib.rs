//! # Warden Core
//!
//! Fleet model and pre-launch validation for the Warden supervision engine.
//!
//! ## What lives here
//! - Per-host manifests merged into one immutable [`Fleet`]
//! - Effective port resolution with host offsets and conflict detection
//! - Dependency graph validation and batched launch planning
//! - Supervisor settings shared by the runtime crates
//!
//! Nothing in this crate touches processes or the network.

pub mod agent;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod ports;
pub mod settings;
pub mod validation;

pub use agent::{
    AgentId, AgentSpec, CommandSpec, HealthCheckSpec, HealthProtocol, Host, PayloadMatcher,
    ResourceHints, RestartPolicy,
};
pub use error::{FleetError, Result};
pub use graph::{DependencyGraph, LaunchPlan};
pub use manifest::{AgentEntry, ConfigLoader, Fleet, Manifest, ManifestDocument, ManifestFormat};
pub use ports::{PortAssignments, PortKind, PortResolver, PortWarning, ResolvedPorts};
pub use settings::SupervisorSettings;
pub use validation::{validate, validate_paths, ValidatedFleet, ValidationReport};

/// Current Warden version for compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Warden build information for telemetry and debugging
pub const BUILD_INFO: &str = concat!(
    "Warden ",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_NAME"),
    ")"
);

/// Standard API endpoints for Warden services
pub mod endpoints {
    pub const HEALTH: &str = "/health";
    pub const API_V1_AGENTS: &str = "/api/v1/agents";
    pub const API_V1_AGENT: &str = "/api/v1/agents/{id}";
    pub const API_V1_PLAN: &str = "/api/v1/plan";
    pub const API_V1_ACTIONS: &str = "/api/v1/actions";
}
