//! Agent types

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Machines known to the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Host {
    /// High-VRAM primary machine
    Primary,
    /// Lower-VRAM secondary machine
    Secondary,
}

impl Host {
    pub const ALL: [Host; 2] = [Host::Primary, Host::Secondary];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Fleet-unique agent identity.
///
/// Plain agents are identified by their name; cross-machine replicas by
/// `name@host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn replica(name: &str, host: Host) -> Self {
        Self(format!("{}@{}", name, host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Agent name without any replica host suffix.
    pub fn name(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Wire mechanism used to query an agent's liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthProtocol {
    /// `GET` on the health port, expecting a JSON body
    Http {
        #[serde(default = "default_http_path")]
        path: String,
    },
    /// One newline-delimited JSON request/reply exchange over TCP
    Rpc {
        #[serde(default = "default_rpc_action")]
        action: String,
    },
    /// No probe; the agent is considered healthy while supervised
    None,
}

impl Default for HealthProtocol {
    fn default() -> Self {
        Self::Http {
            path: default_http_path(),
        }
    }
}

fn default_http_path() -> String {
    "/health".to_string()
}

fn default_rpc_action() -> String {
    "health_check".to_string()
}

/// Expected health payload: a top-level JSON field and its required string value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadMatcher {
    #[serde(default = "default_matcher_field")]
    pub field: String,
    #[serde(default = "default_matcher_expected")]
    pub expected: String,
}

impl PayloadMatcher {
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        payload
            .get(&self.field)
            .and_then(serde_json::Value::as_str)
            .is_some_and(|value| value == self.expected)
    }

    /// Describe a mismatching payload for the health record's error detail.
    pub fn describe_mismatch(&self, payload: &serde_json::Value) -> String {
        match payload.get(&self.field) {
            Some(value) => format!("{} = {}, expected \"{}\"", self.field, value, self.expected),
            None => format!("missing field '{}'", self.field),
        }
    }
}

impl Default for PayloadMatcher {
    fn default() -> Self {
        Self {
            field: default_matcher_field(),
            expected: default_matcher_expected(),
        }
    }
}

fn default_matcher_field() -> String {
    "status".to_string()
}

fn default_matcher_expected() -> String {
    "ok".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub protocol: HealthProtocol,
    #[serde(default)]
    pub matcher: PayloadMatcher,
    /// Per-check deadline
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            protocol: HealthProtocol::default(),
            matcher: PayloadMatcher::default(),
            timeout: default_check_timeout(),
        }
    }
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Restart budget and backoff schedule for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff", with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Rolling window restart attempts are counted in
    #[serde(default = "default_restart_window", with = "humantime_serde")]
    pub window: Duration,
    /// Consecutive healthy checks after which backoff returns to base
    #[serde(default = "default_healthy_reset_checks")]
    pub healthy_reset_checks: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            window: default_restart_window(),
            healthy_reset_checks: default_healthy_reset_checks(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

fn default_restart_window() -> Duration {
    Duration::from_secs(600)
}

fn default_healthy_reset_checks() -> u32 {
    5
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceHints {
    pub memory_mb: Option<u64>,
    pub vram_mb: Option<u64>,
    pub cpu_share: Option<f32>,
}

/// How to spawn an agent process. Agents without one are attached: started
/// elsewhere and only supervised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Fully normalized agent declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub name: String,
    pub host: Host,
    pub service_port: u16,
    pub health_port: u16,
    pub dependencies: Vec<String>,
    pub health: HealthCheckSpec,
    pub restart: RestartPolicy,
    pub resources: ResourceHints,
    pub command: Option<CommandSpec>,
    pub replica: bool,
}

impl AgentSpec {
    /// Minimal spec with defaults, mostly useful for tests and fixtures.
    pub fn new(name: &str, host: Host, service_port: u16, health_port: u16) -> Self {
        Self {
            id: AgentId::new(name),
            name: name.to_string(),
            host,
            service_port,
            health_port,
            dependencies: Vec::new(),
            health: HealthCheckSpec::default(),
            restart: RestartPolicy::default(),
            resources: ResourceHints::default(),
            command: None,
            replica: false,
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_protocol(mut self, protocol: HealthProtocol) -> Self {
        self.health.protocol = protocol;
        self
    }

    pub fn as_replica(mut self) -> Self {
        self.replica = true;
        self.id = AgentId::replica(&self.name, self.host);
        self
    }
}
