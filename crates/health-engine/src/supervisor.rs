//! Fleet-wide health table and polling loop.

use crate::probe::{probe_for, HealthProbe};
use crate::record::{CheckOutcome, HealthRecord, HealthStatus, Transition};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use warden_core::{AgentId, Fleet, FleetError, PortAssignments, Result, SupervisorSettings};

#[derive(Debug, Clone)]
struct RegisteredProbe {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
}

/// Copy of the health table taken under a single read lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub records: BTreeMap<AgentId, HealthRecord>,
}

impl FleetSnapshot {
    pub fn get(&self, id: &str) -> Option<&HealthRecord> {
        self.records.get(id)
    }

    pub fn status(&self, id: &str) -> Option<HealthStatus> {
        self.get(id).map(|record| record.status)
    }

    pub fn count(&self, status: HealthStatus) -> usize {
        self.records
            .values()
            .filter(|record| record.status == status)
            .count()
    }
}

/// Result of one polling cycle.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub transitions: Vec<Transition>,
    pub snapshot: FleetSnapshot,
    /// Failing agents whose consecutive failures reached the threshold
    pub over_threshold: Vec<AgentId>,
}

/// Owns the health table. Nothing else writes agent health.
#[derive(Debug)]
pub struct HealthSupervisor {
    records: RwLock<HashMap<AgentId, HealthRecord>>,
    probes: DashMap<AgentId, RegisteredProbe>,
    failure_threshold: u32,
}

impl HealthSupervisor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            probes: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Register a probe for every agent, chosen from its declared protocol.
    pub fn for_fleet(
        fleet: &Fleet,
        ports: &PortAssignments,
        settings: &SupervisorSettings,
    ) -> Self {
        let supervisor = Self::new(settings.failure_threshold);
        let client = reqwest::Client::new();
        for spec in fleet.agents() {
            let Some(resolved) = ports.get(spec.id.as_str()) else {
                warn!(agent = %spec.id, "No resolved ports; agent will not be supervised");
                continue;
            };
            let probe = probe_for(spec, resolved, settings.address_of(spec.host), &client);
            debug!(agent = %spec.id, protocol = probe.protocol(), "Selected health probe");
            supervisor.register(spec.id.clone(), probe, spec.health.timeout);
        }
        info!("Health supervisor tracking {} agents", supervisor.len());
        supervisor
    }

    pub fn register(&self, id: AgentId, probe: Arc<dyn HealthProbe>, timeout: Duration) {
        self.records
            .write()
            .entry(id.clone())
            .or_insert_with(|| HealthRecord::new(id.clone()));
        self.probes.insert(id, RegisteredProbe { probe, timeout });
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    #[instrument(skip(self), fields(agent = %id))]
    pub fn mark_starting(&self, id: &str) -> Result<Transition> {
        self.force(id, HealthStatus::Starting, None)
    }

    #[instrument(skip(self), fields(agent = %id))]
    pub fn mark_starting_failed(&self, id: &str, reason: &str) -> Result<Transition> {
        self.force(id, HealthStatus::StartingFailed, Some(reason.to_string()))
    }

    /// A restart that never became healthy. The agent stays supervised in
    /// ERROR so the recovery policy keeps counting it.
    #[instrument(skip(self), fields(agent = %id))]
    pub fn record_launch_failure(&self, id: &str, reason: &str) -> Result<Transition> {
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        let transition = record.force(HealthStatus::Error, Some(reason.to_string()));
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.consecutive_successes = 0;
        record.last_check = Some(transition.at);
        Ok(transition)
    }

    #[instrument(skip(self), fields(agent = %id))]
    pub fn retire(&self, id: &str) -> Result<Transition> {
        self.force(id, HealthStatus::Retired, None)
    }

    fn force(&self, id: &str, status: HealthStatus, error: Option<String>) -> Result<Transition> {
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        let transition = record.force(status, error);
        debug!(from = %transition.from, to = %transition.to, "Health status forced");
        Ok(transition)
    }

    fn registered(&self, id: &str) -> Option<RegisteredProbe> {
        self.probes.get(id).map(|entry| entry.value().clone())
    }

    /// Check one agent immediately and fold the outcome into its record.
    pub async fn probe_now(&self, id: &str) -> Result<HealthStatus> {
        let registered = self.registered(id).ok_or_else(|| not_found(id))?;
        let outcome = run_check(&registered).await;

        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(transition) = record.apply(&outcome, Utc::now()) {
            log_transition(&transition, record);
        }
        Ok(record.status)
    }

    /// Check every supervised agent concurrently, each bounded by its own
    /// deadline, then apply all outcomes under one write lock.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> PollReport {
        let targets: Vec<(AgentId, RegisteredProbe)> = {
            let records = self.records.read();
            records
                .values()
                .filter(|record| record.status.is_supervised())
                .filter_map(|record| {
                    self.registered(record.agent.as_str())
                        .map(|probe| (record.agent.clone(), probe))
                })
                .collect()
        };

        let outcomes = join_all(targets.iter().map(|(id, registered)| async move {
            (id.clone(), run_check(registered).await)
        }))
        .await;

        let at = Utc::now();
        let mut transitions = Vec::new();
        let mut over_threshold = Vec::new();
        let snapshot = {
            let mut records = self.records.write();
            for (id, outcome) in &outcomes {
                let Some(record) = records.get_mut(id.as_str()) else {
                    continue;
                };
                if let Some(transition) = record.apply(outcome, at) {
                    log_transition(&transition, record);
                    transitions.push(transition);
                }
                if record.status.is_failing()
                    && record.consecutive_failures >= self.failure_threshold
                {
                    over_threshold.push(id.clone());
                }
            }
            snapshot_of(&records)
        };
        over_threshold.sort();

        debug!(
            checked = outcomes.len(),
            transitions = transitions.len(),
            over_threshold = over_threshold.len(),
            "Poll cycle complete"
        );
        PollReport {
            transitions,
            snapshot,
            over_threshold,
        }
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        snapshot_of(&self.records.read())
    }

    pub fn record(&self, id: &str) -> Option<HealthRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<HealthStatus> {
        self.records.read().get(id).map(|record| record.status)
    }
}

async fn run_check(registered: &RegisteredProbe) -> CheckOutcome {
    match tokio::time::timeout(registered.timeout, registered.probe.check()).await {
        Ok(outcome) => outcome,
        Err(_) => CheckOutcome::Timeout {
            after: registered.timeout,
        },
    }
}

fn snapshot_of(records: &HashMap<AgentId, HealthRecord>) -> FleetSnapshot {
    FleetSnapshot {
        taken_at: Utc::now(),
        records: records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect(),
    }
}

fn log_transition(transition: &Transition, record: &HealthRecord) {
    if transition.to.is_failing() {
        warn!(
            agent = %transition.agent,
            from = %transition.from,
            to = %transition.to,
            error = record.last_error.as_deref().unwrap_or(""),
            "Agent health degraded"
        );
    } else {
        info!(
            agent = %transition.agent,
            from = %transition.from,
            to = %transition.to,
            "Agent health changed"
        );
    }
}

fn not_found(id: &str) -> FleetError {
    FleetError::AgentNotFound {
        agent: id.to_string(),
    }
}
