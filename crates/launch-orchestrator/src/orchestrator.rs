//! Batch-by-batch fleet launch gated on agent health.

use crate::launcher::Launcher;
use futures::future::join_all;
use health_engine::{HealthStatus, HealthSupervisor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use warden_core::{AgentId, FleetError, LaunchPlan, Result, SupervisorSettings, ValidatedFleet};

/// Deadlines and pacing for launching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchTimings {
    pub batch_timeout: Duration,
    pub restart_timeout: Duration,
    pub readiness_interval: Duration,
}

impl Default for LaunchTimings {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

impl From<&SupervisorSettings> for LaunchTimings {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            batch_timeout: settings.batch_timeout,
            restart_timeout: settings.restart_timeout,
            readiness_interval: settings.readiness_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchFailure {
    pub agent: AgentId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedAgent {
    pub agent: AgentId,
    /// Failed or skipped dependency that blocked this agent
    pub blocked_by: AgentId,
}

/// Outcome of one deployment cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchReport {
    pub started: Vec<AgentId>,
    pub failed: Vec<LaunchFailure>,
    pub skipped: Vec<SkippedAgent>,
    /// Agents whose batch was cut short by shutdown, plus those never reached
    pub interrupted: Vec<AgentId>,
    pub complete: bool,
}

impl LaunchReport {
    pub fn is_success(&self) -> bool {
        self.complete && self.failed.is_empty() && self.skipped.is_empty()
    }
}

pub struct LaunchOrchestrator {
    fleet: Arc<ValidatedFleet>,
    health: Arc<HealthSupervisor>,
    launcher: Arc<dyn Launcher>,
    timings: LaunchTimings,
}

impl LaunchOrchestrator {
    pub fn new(
        fleet: Arc<ValidatedFleet>,
        health: Arc<HealthSupervisor>,
        launcher: Arc<dyn Launcher>,
        timings: LaunchTimings,
    ) -> Self {
        Self {
            fleet,
            health,
            launcher,
            timings,
        }
    }

    pub fn fleet(&self) -> &ValidatedFleet {
        &self.fleet
    }

    pub fn timings(&self) -> LaunchTimings {
        self.timings
    }

    /// Start one agent and wait until it is HEALTHY or `deadline` passes.
    ///
    /// Readiness is probed every `readiness_interval`. Failed probes while
    /// STARTING are expected and do not count as health failures.
    #[instrument(skip_all, fields(agent = %id))]
    pub async fn launch_agent(&self, id: &AgentId, deadline: Instant) -> Result<()> {
        let spec = self
            .fleet
            .fleet
            .get(id.as_str())
            .ok_or_else(|| FleetError::AgentNotFound {
                agent: id.to_string(),
            })?;
        let ports = self
            .fleet
            .ports
            .get(id.as_str())
            .ok_or_else(|| FleetError::AgentNotFound {
                agent: id.to_string(),
            })?;

        self.health.mark_starting(id.as_str())?;
        self.launcher
            .start(spec, ports)
            .await
            .map_err(|e| FleetError::StartingFailed {
                agent: id.clone(),
                reason: e.to_string(),
            })?;

        let ready = timeout_at(deadline, async {
            loop {
                match self.health.probe_now(id.as_str()).await? {
                    HealthStatus::Healthy => return Ok::<(), FleetError>(()),
                    status => debug!(%status, "Agent not ready yet"),
                }
                sleep(self.timings.readiness_interval).await;
            }
        })
        .await;

        match ready {
            Ok(result) => {
                result?;
                info!("Agent healthy");
                Ok(())
            }
            Err(_) => {
                let last_error = self
                    .health
                    .record(id.as_str())
                    .and_then(|record| record.last_error)
                    .unwrap_or_else(|| "no successful health check".to_string());
                Err(FleetError::StartingFailed {
                    agent: id.clone(),
                    reason: format!("not healthy before deadline: {}", last_error),
                })
            }
        }
    }

    /// Stop the agent and re-enter the launch sequence for it alone.
    #[instrument(skip_all, fields(agent = %id))]
    pub async fn restart_agent(&self, id: &AgentId) -> Result<()> {
        if let Err(e) = self.launcher.stop(id).await {
            warn!("Stop before restart failed: {}", e);
        }
        let deadline = Instant::now() + self.timings.restart_timeout;
        self.launch_agent(id, deadline).await
    }

    /// Launch the plan batch by batch.
    ///
    /// Batch N starts only after batch N-1 has fully resolved. Agents whose
    /// dependencies failed are never started. Cancelling `shutdown` abandons
    /// the wait; agents already started keep running.
    #[instrument(skip(self, plan, shutdown), fields(batches = plan.batches().len()))]
    pub async fn run(&self, plan: &LaunchPlan, shutdown: CancellationToken) -> LaunchReport {
        let mut report = LaunchReport::default();
        let mut blocked: BTreeSet<AgentId> = BTreeSet::new();

        for (index, batch) in plan.batches().iter().enumerate() {
            if shutdown.is_cancelled() {
                report.interrupted.extend(unlaunched(plan, index));
                return report;
            }

            let mut runnable = Vec::new();
            for id in batch {
                match self
                    .fleet
                    .graph
                    .dependencies_of(id.as_str())
                    .find(|dependency| blocked.contains(*dependency))
                {
                    Some(dependency) => {
                        warn!(agent = %id, blocked_by = %dependency, "Skipping launch");
                        report.skipped.push(SkippedAgent {
                            agent: id.clone(),
                            blocked_by: dependency.clone(),
                        });
                    }
                    None => runnable.push(id),
                }
            }
            for skipped in &report.skipped {
                blocked.insert(skipped.agent.clone());
            }
            if runnable.is_empty() {
                continue;
            }

            info!(batch = index + 1, agents = runnable.len(), "Launching batch");
            let in_flight: Vec<AgentId> = runnable.iter().map(|id| (*id).clone()).collect();
            let deadline = Instant::now() + self.timings.batch_timeout;
            let launches = join_all(runnable.iter().map(|id| async move {
                ((*id).clone(), self.launch_agent(id, deadline).await)
            }));

            let results = tokio::select! {
                results = launches => results,
                _ = shutdown.cancelled() => {
                    warn!(
                        batch = index + 1,
                        "Shutdown during launch; leaving started agents running"
                    );
                    let (ready, waiting): (Vec<AgentId>, Vec<AgentId>) =
                        in_flight.into_iter().partition(|id| {
                            self.health.status(id.as_str()) == Some(HealthStatus::Healthy)
                        });
                    report.started.extend(ready);
                    report.interrupted.extend(waiting);
                    report.interrupted.extend(unlaunched(plan, index + 1));
                    return report;
                }
            };

            for (id, result) in results {
                match result {
                    Ok(()) => report.started.push(id),
                    Err(e) => {
                        let reason = match e {
                            FleetError::StartingFailed { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        error!(agent = %id, %reason, "Agent failed to start");
                        if let Err(e) = self.health.mark_starting_failed(id.as_str(), &reason) {
                            warn!(agent = %id, "Could not record start failure: {}", e);
                        }
                        blocked.insert(id.clone());
                        report.failed.push(LaunchFailure { agent: id, reason });
                    }
                }
            }
        }

        report.complete = true;
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Launch cycle finished"
        );
        report
    }
}

fn unlaunched(plan: &LaunchPlan, from_batch: usize) -> impl Iterator<Item = AgentId> + '_ {
    plan.batches().iter().skip(from_batch).flatten().cloned()
}
