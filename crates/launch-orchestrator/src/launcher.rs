//! Process launching

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};
use warden_core::{AgentId, AgentSpec, FleetError, ResolvedPorts, Result};

pub const ENV_AGENT: &str = "WARDEN_AGENT";
pub const ENV_HOST: &str = "WARDEN_HOST";
pub const ENV_SERVICE_PORT: &str = "WARDEN_SERVICE_PORT";
pub const ENV_HEALTH_PORT: &str = "WARDEN_HEALTH_PORT";

/// Starts and stops agent processes. Readiness is not the launcher's concern.
#[async_trait]
pub trait Launcher: Send + Sync + fmt::Debug {
    async fn start(&self, spec: &AgentSpec, ports: &ResolvedPorts) -> Result<()>;

    async fn stop(&self, agent: &AgentId) -> Result<()>;
}

/// Spawns local child processes and keeps their handles.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    children: DashMap<AgentId, Child>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, agent: &str) -> bool {
        self.children.contains_key(agent)
    }

    fn command_for(spec: &AgentSpec, ports: &ResolvedPorts) -> Option<Command> {
        let command = spec.command.as_ref()?;
        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .env(ENV_AGENT, spec.id.as_str())
            .env(ENV_HOST, spec.host.as_str())
            .env(ENV_SERVICE_PORT, ports.service.to_string())
            .env(ENV_HEALTH_PORT, ports.health.to_string())
            .stdin(Stdio::null());
        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }
        Some(process)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    #[instrument(skip(self, spec, ports), fields(agent = %spec.id))]
    async fn start(&self, spec: &AgentSpec, ports: &ResolvedPorts) -> Result<()> {
        let Some(mut process) = Self::command_for(spec, ports) else {
            debug!("Attached agent; nothing to spawn");
            return Ok(());
        };

        let child = process.spawn().map_err(|e| FleetError::Launch {
            agent: spec.id.clone(),
            reason: format!("spawn failed: {}", e),
        })?;
        info!(
            pid = child.id().unwrap_or_default(),
            service_port = ports.service,
            health_port = ports.health,
            "Agent process spawned"
        );

        if let Some(mut previous) = self.children.insert(spec.id.clone(), child) {
            warn!("Replacing a process that was still tracked");
            if let Err(e) = previous.start_kill() {
                warn!("Failed to kill replaced process: {}", e);
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(agent = %agent))]
    async fn stop(&self, agent: &AgentId) -> Result<()> {
        let Some((_, mut child)) = self.children.remove(agent) else {
            debug!("No tracked process to stop");
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(%status, "Process had already exited");
            return Ok(());
        }
        child.kill().await.map_err(|e| FleetError::Launch {
            agent: agent.clone(),
            reason: format!("kill failed: {}", e),
        })?;
        info!("Agent process stopped");
        Ok(())
    }
}
