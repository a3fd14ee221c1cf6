//! Supervisor runtime settings
//!
//! Layered with figment: built-in defaults, then `warden.toml` (or an explicit
//! path), then `WARDEN_`-prefixed environment variables.

use crate::agent::Host;
use crate::error::{FleetError, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SETTINGS_FILE: &str = "warden.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Interval between fleet-wide health polling cycles
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Consecutive failed checks before recovery is consulted
    pub failure_threshold: u32,
    /// How long one launch batch may take to become healthy
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    /// How long a single-agent restart may take to become healthy
    #[serde(with = "humantime_serde")]
    pub restart_timeout: Duration,
    /// Spacing between readiness probes while an agent is starting
    #[serde(with = "humantime_serde")]
    pub readiness_interval: Duration,
    /// Address health probes use to reach each host
    pub host_addresses: BTreeMap<Host, String>,
    /// Error-aggregation endpoint that receives recovery events
    pub sink_endpoint: Option<String>,
    /// Optional JSONL mirror of the recovery action log
    pub action_journal: Option<PathBuf>,
    /// Bind address of the status API
    pub listen_addr: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            failure_threshold: 3,
            batch_timeout: Duration::from_secs(120),
            restart_timeout: Duration::from_secs(60),
            readiness_interval: Duration::from_secs(1),
            host_addresses: Host::ALL
                .iter()
                .map(|host| (*host, "127.0.0.1".to_string()))
                .collect(),
            sink_endpoint: None,
            action_journal: None,
            listen_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

impl SupervisorSettings {
    /// Load defaults, `warden.toml` and `WARDEN_*` overrides.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment(Path::new(DEFAULT_SETTINGS_FILE)))
    }

    /// Load from an explicit file, still honoring environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FleetError::Settings {
                reason: format!("settings file {} not found", path.display()),
            });
        }
        Self::from_figment(Self::figment(path))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("WARDEN_").split("__"))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Self = figment.extract().map_err(|e| FleetError::Settings {
            reason: format!("Failed to load settings: {}", e),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(FleetError::Settings {
                reason: "failure_threshold must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() || self.readiness_interval.is_zero() {
            return Err(FleetError::Settings {
                reason: "poll_interval and readiness_interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn address_of(&self, host: Host) -> &str {
        self.host_addresses
            .get(&host)
            .map(String::as_str)
            .unwrap_or("127.0.0.1")
    }
}
