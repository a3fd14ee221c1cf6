//! Deploy-then-supervise control loop

use crate::action::{ActionKind, ActionLog, RecoveryAction};
use crate::controller::{RecoveryController, RecoveryState};
use crate::sink::{HttpSink, TracingSink};
use dashmap::DashMap;
use health_engine::{FleetSnapshot, HealthSupervisor};
use launch_orchestrator::{LaunchOrchestrator, LaunchReport, LaunchTimings, Launcher};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use warden_core::{AgentId, LaunchPlan, Result, SupervisorSettings, ValidatedFleet};

/// Owns one validated fleet and the components that launch, watch and
/// heal it.
pub struct FleetRuntime {
    fleet: Arc<ValidatedFleet>,
    health: Arc<HealthSupervisor>,
    orchestrator: Arc<LaunchOrchestrator>,
    controller: Arc<RecoveryController>,
    poll_interval: Duration,
    restarting: Arc<DashMap<AgentId, ()>>,
    tasks: TaskTracker,
    launch_report: RwLock<Option<LaunchReport>>,
}

impl FleetRuntime {
    /// Wire the runtime from settings: HTTP/RPC probes, the given launcher,
    /// the optional journal and the configured sinks.
    pub fn new(
        validated: ValidatedFleet,
        settings: &SupervisorSettings,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let health = Arc::new(HealthSupervisor::for_fleet(
            &validated.fleet,
            &validated.ports,
            settings,
        ));
        let log = match &settings.action_journal {
            Some(path) => ActionLog::with_journal(path)?,
            None => ActionLog::new(),
        };
        let fleet = Arc::new(validated);
        let mut controller =
            RecoveryController::new(fleet.clone(), Arc::new(log)).with_sink(Arc::new(TracingSink));
        if let Some(endpoint) = &settings.sink_endpoint {
            info!(%endpoint, "Recovery events will be posted to the error sink");
            controller = controller.with_sink(Arc::new(HttpSink::new(endpoint.clone())));
        }
        Ok(Self::from_parts(
            fleet,
            health,
            launcher,
            controller,
            LaunchTimings::from(settings),
            settings.poll_interval,
        ))
    }

    pub fn from_parts(
        fleet: Arc<ValidatedFleet>,
        health: Arc<HealthSupervisor>,
        launcher: Arc<dyn Launcher>,
        controller: RecoveryController,
        timings: LaunchTimings,
        poll_interval: Duration,
    ) -> Self {
        let orchestrator = Arc::new(LaunchOrchestrator::new(
            fleet.clone(),
            health.clone(),
            launcher,
            timings,
        ));
        Self {
            fleet,
            health,
            orchestrator,
            controller: Arc::new(controller),
            poll_interval,
            restarting: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            launch_report: RwLock::new(None),
        }
    }

    /// Launch the plan. Each agent that failed to start is escalated once.
    #[instrument(skip_all)]
    pub async fn deploy(&self, shutdown: CancellationToken) -> LaunchReport {
        let report = self.orchestrator.run(&self.fleet.plan, shutdown).await;
        for failure in &report.failed {
            self.controller
                .escalate_start_failure(&failure.agent, &failure.reason);
        }
        if !report.complete {
            warn!("Launch cycle incomplete");
        }
        *self.launch_report.write() = Some(report.clone());
        report
    }

    /// Poll, decide and restart until `shutdown` is cancelled.
    ///
    /// Pending restarts are abandoned on shutdown; the loop waits for them
    /// to observe the cancellation before returning.
    #[instrument(skip_all, fields(poll_interval = ?self.poll_interval))]
    pub async fn supervise(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Supervising {} agents", self.fleet.fleet.len());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.supervise_once(&shutdown).await;
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!("Supervision stopped");
    }

    /// One poll-and-decide cycle. Returns the actions it logged.
    pub async fn supervise_once(&self, shutdown: &CancellationToken) -> Vec<RecoveryAction> {
        let report = self.health.poll_once().await;
        let in_flight: BTreeSet<AgentId> = self
            .restarting
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let actions = self
            .controller
            .evaluate_pending(&report, &in_flight, Instant::now());
        for action in &actions {
            if action.action == ActionKind::Restart {
                self.spawn_restart(action.agent.clone(), action.delay(), shutdown.clone());
            }
        }
        actions
    }

    fn spawn_restart(&self, agent: AgentId, delay: Duration, shutdown: CancellationToken) {
        if self.restarting.insert(agent.clone(), ()).is_some() {
            debug!(%agent, "Restart already in flight");
            return;
        }
        let orchestrator = self.orchestrator.clone();
        let health = self.health.clone();
        let restarting = self.restarting.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(%agent, "Shutdown before scheduled restart");
                    restarting.remove(&agent);
                    return;
                }
                _ = sleep(delay) => {}
            }
            match orchestrator.restart_agent(&agent).await {
                Ok(()) => info!(%agent, "Agent restarted"),
                Err(e) => {
                    warn!(%agent, "Restart failed: {}", e);
                    if let Err(e) = health.record_launch_failure(agent.as_str(), &e.to_string()) {
                        warn!(%agent, "Could not record restart failure: {}", e);
                    }
                }
            }
            restarting.remove(&agent);
        });
    }

    /// Wait for every restart spawned so far to finish.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub fn fleet(&self) -> &ValidatedFleet {
        &self.fleet
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.fleet.plan
    }

    pub fn health(&self) -> &HealthSupervisor {
        &self.health
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.health.snapshot()
    }

    pub fn actions(&self) -> Vec<RecoveryAction> {
        self.controller.log().entries()
    }

    pub fn recovery_state(&self, id: &str) -> Option<RecoveryState> {
        self.controller.state(id)
    }

    pub fn launch_report(&self) -> Option<LaunchReport> {
        self.launch_report.read().clone()
    }
}
