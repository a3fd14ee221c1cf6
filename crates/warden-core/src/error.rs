//! Error types for the Warden supervision engine

use crate::agent::{AgentId, Host};
use crate::ports::PortKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Config error in {manifest}{}: {reason}", entry_suffix(.entry))]
    Config {
        manifest: String,
        entry: Option<String>,
        reason: String,
    },

    #[error("Duplicate agent '{name}' declared on {first} and {second} without the replica flag")]
    DuplicateAgent {
        name: String,
        first: Host,
        second: Host,
    },

    #[error(
        "Port conflict on {host}: port {port} claimed by {first} ({first_kind}) \
         and {second} ({second_kind})"
    )]
    PortConflict {
        host: Host,
        port: u16,
        first: AgentId,
        first_kind: PortKind,
        second: AgentId,
        second_kind: PortKind,
    },

    #[error("Port out of range for {agent} ({kind}): declared {declared} with offset {offset}")]
    PortOutOfRange {
        agent: AgentId,
        kind: PortKind,
        declared: u16,
        offset: i32,
    },

    #[error("Unknown dependency: {agent} depends on '{dependency}' which is not declared")]
    UnknownDependency { agent: AgentId, dependency: String },

    #[error("Cyclic dependency: {}", format_cycle(.path))]
    CyclicDependency { path: Vec<AgentId> },

    #[error("{} validation error(s) found", .0.len())]
    Validation(Vec<FleetError>),

    #[error("Agent {agent} failed to start: {reason}")]
    StartingFailed { agent: AgentId, reason: String },

    #[error("Launch operation failed for {agent}: {reason}")]
    Launch { agent: AgentId, reason: String },

    #[error("Agent not found: {agent}")]
    AgentNotFound { agent: String },

    #[error("Settings error: {reason}")]
    Settings { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

impl FleetError {
    pub fn config(manifest: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            manifest: manifest.into(),
            entry: None,
            reason: reason.into(),
        }
    }

    pub fn config_entry(
        manifest: impl Into<String>,
        entry: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            manifest: manifest.into(),
            entry: Some(entry.into()),
            reason: reason.into(),
        }
    }

    /// Whether this error must abort a deployment cycle before any launch.
    pub fn is_pre_launch(&self) -> bool {
        match self {
            Self::Config { .. }
            | Self::DuplicateAgent { .. }
            | Self::PortConflict { .. }
            | Self::PortOutOfRange { .. }
            | Self::UnknownDependency { .. }
            | Self::CyclicDependency { .. }
            | Self::Yaml { .. }
            | Self::Serialization { .. } => true,
            Self::Validation(errors) => errors.iter().all(FleetError::is_pre_launch),
            _ => false,
        }
    }

    /// Flatten nested validation errors into a single list.
    pub fn into_issues(self) -> Vec<FleetError> {
        match self {
            Self::Validation(errors) => errors
                .into_iter()
                .flat_map(FleetError::into_issues)
                .collect(),
            other => vec![other],
        }
    }
}

fn entry_suffix(entry: &Option<String>) -> String {
    entry
        .as_ref()
        .map(|name| format!(" (agent '{}')", name))
        .unwrap_or_default()
}

fn format_cycle(path: &[AgentId]) -> String {
    path.iter()
        .map(AgentId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
