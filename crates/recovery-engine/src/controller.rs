//! Restart / escalate policy over health poll results

use crate::action::{ActionKind, ActionLog, RecoveryAction};
use crate::backoff::Backoff;
use crate::sink::{emit_detached, RecoverySink};
use health_engine::{FleetSnapshot, HealthStatus, PollReport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use warden_core::{AgentId, RestartPolicy, ValidatedFleet};

#[derive(Debug)]
struct AgentRecovery {
    policy: RestartPolicy,
    backoff: Backoff,
    restarts: VecDeque<Instant>,
    next_allowed: Option<Instant>,
    escalated: bool,
}

impl AgentRecovery {
    fn new(policy: RestartPolicy) -> Self {
        Self {
            backoff: Backoff::from_policy(&policy),
            policy,
            restarts: VecDeque::new(),
            next_allowed: None,
            escalated: false,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_pristine(&self) -> bool {
        self.backoff.is_reset() && self.restarts.is_empty() && !self.escalated
    }

    fn reset(&mut self) {
        self.backoff.reset();
        self.restarts.clear();
        self.next_allowed = None;
        self.escalated = false;
    }
}

/// Read-only view of an agent's recovery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub agent: AgentId,
    pub restarts_in_window: usize,
    #[serde(with = "duration_ms")]
    pub next_backoff: Duration,
    pub escalated: bool,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Decides RESTART, ESCALATE or nothing for agents over the failure
/// threshold, grouping cascades behind their shared upstream.
///
/// Every decision is appended to the [`ActionLog`] before it is returned.
#[derive(Debug)]
pub struct RecoveryController {
    fleet: Arc<ValidatedFleet>,
    states: Mutex<HashMap<AgentId, AgentRecovery>>,
    log: Arc<ActionLog>,
    sinks: Vec<Arc<dyn RecoverySink>>,
}

impl RecoveryController {
    pub fn new(fleet: Arc<ValidatedFleet>, log: Arc<ActionLog>) -> Self {
        let states = fleet
            .fleet
            .agents()
            .map(|spec| (spec.id.clone(), AgentRecovery::new(spec.restart.clone())))
            .collect();
        Self {
            fleet,
            states: Mutex::new(states),
            log,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecoverySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn log(&self) -> &Arc<ActionLog> {
        &self.log
    }

    pub fn evaluate(&self, report: &PollReport) -> Vec<RecoveryAction> {
        self.evaluate_at(report, Instant::now())
    }

    /// Apply one poll report at `now`. Returns the actions appended to the log.
    pub fn evaluate_at(&self, report: &PollReport, now: Instant) -> Vec<RecoveryAction> {
        self.evaluate_pending(report, &BTreeSet::new(), now)
    }

    /// Apply one poll report while the agents in `in_flight` are still being
    /// restarted. A group whose target is in flight gets no decision and no
    /// log entry; its restart was already logged when it was scheduled.
    #[instrument(
        skip_all,
        fields(failing = report.over_threshold.len(), in_flight = in_flight.len())
    )]
    pub fn evaluate_pending(
        &self,
        report: &PollReport,
        in_flight: &BTreeSet<AgentId>,
        now: Instant,
    ) -> Vec<RecoveryAction> {
        for record in report.snapshot.records.values() {
            if record.status == HealthStatus::Healthy {
                self.observe_healthy(&record.agent, record.consecutive_successes);
            }
        }

        let failing: BTreeSet<AgentId> = report
            .over_threshold
            .iter()
            .filter(|id| self.fleet.fleet.get(id.as_str()).is_some())
            .cloned()
            .collect();
        if failing.is_empty() {
            return Vec::new();
        }

        let groups = self.group_cascades(&failing);
        let mut decided = Vec::new();
        let mut states = self.states.lock();
        for (target, deferred) in &groups {
            if in_flight.contains(target) {
                debug!(agent = %target, deferred = deferred.len(), "Restart in flight");
                continue;
            }

            let upstream_escalated = states.get(target).is_some_and(|state| state.escalated);
            if upstream_escalated && !deferred.is_empty() {
                debug!(upstream = %target, "Upstream escalated; dependents decided on their own");
                decided.extend(self.decide_each(deferred, &mut states, in_flight, report, now));
                continue;
            }

            let Some(state) = states.get_mut(target) else {
                continue;
            };
            let reason = failure_reason(target, deferred, &report.snapshot);
            let Some(action) = decide(target, state, now, reason) else {
                for downstream in deferred {
                    debug!(agent = %downstream, upstream = %target, "Failure deferred to upstream");
                }
                continue;
            };
            let upstream_gave_up = action.action == ActionKind::Escalate;
            decided.push(self.record(action));
            if upstream_gave_up {
                decided.extend(self.decide_each(deferred, &mut states, in_flight, report, now));
                continue;
            }
            for downstream in deferred {
                decided.push(self.record(RecoveryAction::noop(
                    downstream.clone(),
                    format!("deferred to upstream restart of {}", target),
                )));
            }
        }
        decided
    }

    /// Record a healthy streak; a long enough one forgets past failures.
    pub fn observe_healthy(&self, id: &AgentId, streak: u32) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(id) else {
            return;
        };
        if streak >= state.policy.healthy_reset_checks && !state.is_pristine() {
            info!(agent = %id, streak, "Sustained health; recovery state reset");
            state.reset();
        }
    }

    /// An agent that never became healthy during launch. Escalated once.
    #[instrument(skip(self, reason), fields(agent = %id))]
    pub fn escalate_start_failure(&self, id: &AgentId, reason: &str) -> Option<RecoveryAction> {
        {
            let mut states = self.states.lock();
            let state = states.get_mut(id)?;
            if state.escalated {
                debug!("Start failure already escalated");
                return None;
            }
            state.escalated = true;
        }
        Some(self.record(RecoveryAction::escalate(
            id.clone(),
            format!("failed to start: {}", reason),
        )))
    }

    pub fn is_escalated(&self, id: &str) -> bool {
        self.states
            .lock()
            .get(id)
            .map(|state| state.escalated)
            .unwrap_or(false)
    }

    pub fn state(&self, id: &str) -> Option<RecoveryState> {
        let states = self.states.lock();
        let state = states.get(id)?;
        Some(RecoveryState {
            agent: AgentId::new(id),
            restarts_in_window: state.restarts.len(),
            next_backoff: state.backoff.current(),
            escalated: state.escalated,
        })
    }

    /// Ungrouped decisions for agents whose upstream will not be restarted.
    fn decide_each(
        &self,
        agents: &[AgentId],
        states: &mut HashMap<AgentId, AgentRecovery>,
        in_flight: &BTreeSet<AgentId>,
        report: &PollReport,
        now: Instant,
    ) -> Vec<RecoveryAction> {
        let mut decided = Vec::new();
        for agent in agents {
            if in_flight.contains(agent) {
                continue;
            }
            let Some(state) = states.get_mut(agent) else {
                continue;
            };
            let reason = failure_reason(agent, &[], &report.snapshot);
            if let Some(action) = decide(agent, state, now, reason) {
                decided.push(self.record(action));
            }
        }
        decided
    }

    fn record(&self, action: RecoveryAction) -> RecoveryAction {
        let action = self.log.append(action);
        emit_detached(&self.sinks, &action);
        action
    }

    /// Map each decision target to the failing agents deferred to it.
    ///
    /// A direct dependency qualifies as upstream when it is failing itself or
    /// is shared by at least two failing agents. Ties prefer the upstream
    /// covering the most failing agents, then the lowest id.
    fn group_cascades(&self, failing: &BTreeSet<AgentId>) -> BTreeMap<AgentId, Vec<AgentId>> {
        let graph = &self.fleet.graph;
        let mut coverage: BTreeMap<&AgentId, usize> = BTreeMap::new();
        for agent in failing {
            for dependency in graph.dependencies_of(agent.as_str()) {
                *coverage.entry(dependency).or_default() += 1;
            }
        }

        let upstream_of: BTreeMap<&AgentId, &AgentId> = failing
            .iter()
            .filter_map(|agent| {
                graph
                    .dependencies_of(agent.as_str())
                    .filter(|dependency| {
                        failing.contains(*dependency)
                            || coverage.get(dependency).copied().unwrap_or(0) >= 2
                    })
                    .max_by(|a, b| {
                        coverage[a]
                            .cmp(&coverage[b])
                            .then_with(|| b.cmp(a))
                    })
                    .map(|upstream| (agent, upstream))
            })
            .collect();

        let mut groups: BTreeMap<AgentId, Vec<AgentId>> = BTreeMap::new();
        for agent in failing {
            let mut target = agent;
            while let Some(upstream) = upstream_of.get(target) {
                target = *upstream;
            }
            let deferred = groups.entry(target.clone()).or_default();
            if target != agent {
                deferred.push(agent.clone());
            }
        }
        for (upstream, deferred) in &groups {
            if !deferred.is_empty() {
                warn!(
                    upstream = %upstream,
                    downstream = deferred.len(),
                    "Grouping cascading failure"
                );
            }
        }
        groups
    }
}

fn decide(
    target: &AgentId,
    state: &mut AgentRecovery,
    now: Instant,
    reason: String,
) -> Option<RecoveryAction> {
    if state.escalated {
        debug!(agent = %target, "Already escalated; not restarting");
        return None;
    }

    state.prune(now);
    if state.restarts.len() >= state.policy.max_retries as usize {
        state.escalated = true;
        return Some(RecoveryAction::escalate(
            target.clone(),
            format!(
                "{}; {} restart(s) within {:?} reached the limit of {}",
                reason,
                state.restarts.len(),
                state.policy.window,
                state.policy.max_retries
            ),
        ));
    }

    if let Some(next_allowed) = state.next_allowed {
        if now < next_allowed {
            debug!(
                agent = %target,
                remaining = ?(next_allowed - now),
                "Restart backoff still pending"
            );
            return None;
        }
    }

    let delay = state.backoff.next_delay();
    state.restarts.push_back(now);
    state.next_allowed = Some(now + delay);
    Some(RecoveryAction::restart(target.clone(), delay, reason))
}

fn failure_reason(target: &AgentId, deferred: &[AgentId], snapshot: &FleetSnapshot) -> String {
    let own = snapshot.get(target.as_str()).and_then(|record| {
        record.status.is_failing().then(|| {
            let mut reason = format!(
                "{} after {} consecutive failed check(s)",
                record.status, record.consecutive_failures
            );
            if let Some(error) = &record.last_error {
                reason.push_str(": ");
                reason.push_str(error);
            }
            reason
        })
    });
    match (own, deferred.is_empty()) {
        (Some(own), true) => own,
        (Some(own), false) => format!("{} (upstream of {})", own, join(deferred)),
        (None, _) => format!("shared upstream of failing {}", join(deferred)),
    }
}

fn join(agents: &[AgentId]) -> String {
    agents
        .iter()
        .map(AgentId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use health_engine::HealthRecord;
    use warden_core::{AgentSpec, Fleet, Host};

    fn policy(max_retries: u32) -> RestartPolicy {
        RestartPolicy {
            max_retries,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            window: Duration::from_secs(600),
            healthy_reset_checks: 3,
        }
    }

    fn controller(specs: Vec<AgentSpec>) -> RecoveryController {
        let fleet = ValidatedFleet::from_fleet(Fleet::from_specs(specs)).unwrap();
        RecoveryController::new(Arc::new(fleet), Arc::new(ActionLog::new()))
    }

    fn record(id: &str, status: HealthStatus, failures: u32, successes: u32) -> HealthRecord {
        let mut record = HealthRecord::new(AgentId::new(id));
        record.status = status;
        record.consecutive_failures = failures;
        record.consecutive_successes = successes;
        if status.is_failing() {
            record.last_error = Some("connection refused".to_string());
        }
        record
    }

    fn report(records: Vec<HealthRecord>) -> PollReport {
        let over_threshold = records
            .iter()
            .filter(|record| record.status.is_failing())
            .map(|record| record.agent.clone())
            .collect();
        PollReport {
            transitions: Vec::new(),
            snapshot: FleetSnapshot {
                taken_at: Utc::now(),
                records: records.into_iter().map(|r| (r.agent.clone(), r)).collect(),
            },
            over_threshold,
        }
    }

    fn failing(id: &str) -> PollReport {
        report(vec![record(id, HealthStatus::Error, 3, 0)])
    }

    fn kinds(actions: &[RecoveryAction]) -> Vec<ActionKind> {
        actions.iter().map(|action| action.action).collect()
    }

    #[test]
    fn test_restart_then_escalate_when_budget_exhausted() {
        let controller = controller(vec![
            AgentSpec::new("llm", Host::Primary, 7000, 7001).with_restart(policy(2)),
        ]);
        let t0 = Instant::now();

        let first = controller.evaluate_at(&failing("llm"), t0);
        assert_eq!(kinds(&first), vec![ActionKind::Restart]);
        assert_eq!(first[0].delay(), Duration::from_secs(5));

        let second = controller.evaluate_at(&failing("llm"), t0 + Duration::from_secs(5));
        assert_eq!(kinds(&second), vec![ActionKind::Restart]);
        assert_eq!(second[0].delay(), Duration::from_secs(10));

        let third = controller.evaluate_at(&failing("llm"), t0 + Duration::from_secs(15));
        assert_eq!(kinds(&third), vec![ActionKind::Escalate]);
        assert!(controller.is_escalated("llm"));

        assert!(controller
            .evaluate_at(&failing("llm"), t0 + Duration::from_secs(100))
            .is_empty());
        assert_eq!(controller.log().len(), 3);
    }

    #[test]
    fn test_pending_backoff_logs_nothing() {
        let controller = controller(vec![
            AgentSpec::new("llm", Host::Primary, 7000, 7001).with_restart(policy(5)),
        ]);
        let t0 = Instant::now();
        controller.evaluate_at(&failing("llm"), t0);

        assert!(controller
            .evaluate_at(&failing("llm"), t0 + Duration::from_secs(2))
            .is_empty());
        assert_eq!(controller.log().len(), 1);
        assert!(!controller.is_escalated("llm"));
    }

    #[test]
    fn test_restarts_outside_window_are_forgotten() {
        let mut tight = policy(1);
        tight.window = Duration::from_secs(30);
        let controller = controller(vec![
            AgentSpec::new("llm", Host::Primary, 7000, 7001).with_restart(tight),
        ]);
        let t0 = Instant::now();

        controller.evaluate_at(&failing("llm"), t0);
        let later = controller.evaluate_at(&failing("llm"), t0 + Duration::from_secs(31));
        assert_eq!(kinds(&later), vec![ActionKind::Restart]);
    }

    #[test]
    fn test_healthy_streak_resets_backoff_and_escalation() {
        let controller = controller(vec![
            AgentSpec::new("llm", Host::Primary, 7000, 7001).with_restart(policy(1)),
        ]);
        let t0 = Instant::now();
        controller.evaluate_at(&failing("llm"), t0);
        controller.evaluate_at(&failing("llm"), t0 + Duration::from_secs(5));
        assert!(controller.is_escalated("llm"));

        let short = report(vec![record("llm", HealthStatus::Healthy, 0, 2)]);
        controller.evaluate_at(&short, t0 + Duration::from_secs(10));
        assert!(controller.is_escalated("llm"));

        let sustained = report(vec![record("llm", HealthStatus::Healthy, 0, 3)]);
        controller.evaluate_at(&sustained, t0 + Duration::from_secs(15));
        let state = controller.state("llm").unwrap();
        assert!(!state.escalated);
        assert_eq!(state.restarts_in_window, 0);
        assert_eq!(state.next_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_shared_upstream_restarted_once() {
        let controller = controller(vec![
            AgentSpec::new("a", Host::Primary, 7000, 7001),
            AgentSpec::new("b", Host::Primary, 7002, 7003).with_dependencies(["a"]),
            AgentSpec::new("c", Host::Secondary, 7004, 7005).with_dependencies(["a"]),
        ]);
        let cycle = report(vec![
            record("a", HealthStatus::Healthy, 0, 4),
            record("b", HealthStatus::Error, 3, 0),
            record("c", HealthStatus::Error, 3, 0),
        ]);

        let actions = controller.evaluate(&cycle);
        let restarts: Vec<&RecoveryAction> = actions
            .iter()
            .filter(|action| action.action == ActionKind::Restart)
            .collect();
        assert_eq!(restarts.len(), 1);
        assert_eq!(restarts[0].agent.as_str(), "a");
        assert!(restarts[0].reason.contains("shared upstream of failing b, c"));

        let noops: Vec<&str> = actions
            .iter()
            .filter(|action| action.action == ActionKind::Noop)
            .map(|action| action.agent.as_str())
            .collect();
        assert_eq!(noops, vec!["b", "c"]);
        assert!(actions[1].reason.contains("deferred to upstream restart of a"));
    }

    fn cascade(upstream_policy: RestartPolicy) -> RecoveryController {
        controller(vec![
            AgentSpec::new("a", Host::Primary, 7000, 7001).with_restart(upstream_policy),
            AgentSpec::new("b", Host::Primary, 7002, 7003)
                .with_dependencies(["a"])
                .with_restart(policy(3)),
            AgentSpec::new("c", Host::Secondary, 7004, 7005)
                .with_dependencies(["a"])
                .with_restart(policy(3)),
        ])
    }

    fn dependents_failing() -> PollReport {
        report(vec![
            record("a", HealthStatus::Healthy, 0, 1),
            record("b", HealthStatus::Error, 3, 0),
            record("c", HealthStatus::Error, 3, 0),
        ])
    }

    #[test]
    fn test_upstream_restart_in_flight_is_not_decided_again() {
        let controller = cascade(policy(3));
        let t0 = Instant::now();

        let first = controller.evaluate_at(&dependents_failing(), t0);
        assert_eq!(first[0].agent.as_str(), "a");
        assert_eq!(first[0].action, ActionKind::Restart);

        let restarting: BTreeSet<AgentId> = [AgentId::new("a")].into_iter().collect();
        let during = controller.evaluate_pending(
            &dependents_failing(),
            &restarting,
            t0 + Duration::from_secs(10),
        );
        assert!(during.is_empty());
        assert_eq!(controller.log().count(ActionKind::Restart), 1);
        assert_eq!(controller.state("a").unwrap().restarts_in_window, 1);

        let after = controller.evaluate_at(&dependents_failing(), t0 + Duration::from_secs(20));
        assert_eq!(kinds(&after)[0], ActionKind::Restart);
        assert_eq!(after[0].delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_dependents_of_escalated_upstream_recover_on_their_own() {
        let controller = cascade(policy(1));
        let t0 = Instant::now();

        controller.evaluate_at(&dependents_failing(), t0);
        let second = controller.evaluate_at(&dependents_failing(), t0 + Duration::from_secs(5));
        assert_eq!(
            kinds(&second),
            vec![ActionKind::Escalate, ActionKind::Restart, ActionKind::Restart]
        );
        let agents: Vec<&str> = second.iter().map(|action| action.agent.as_str()).collect();
        assert_eq!(agents, vec!["a", "b", "c"]);
        assert!(second[1].reason.starts_with("ERROR after 3 consecutive failed check(s)"));

        let third = controller.evaluate_at(&dependents_failing(), t0 + Duration::from_secs(10));
        let restarted: Vec<&str> = third
            .iter()
            .filter(|action| action.action == ActionKind::Restart)
            .map(|action| action.agent.as_str())
            .collect();
        assert_eq!(restarted, vec!["b", "c"]);
        assert_eq!(controller.log().for_agent("a").len(), 2);
    }

    #[test]
    fn test_failing_chain_collapses_to_root() {
        let controller = controller(vec![
            AgentSpec::new("a", Host::Primary, 7000, 7001),
            AgentSpec::new("b", Host::Primary, 7002, 7003).with_dependencies(["a"]),
            AgentSpec::new("c", Host::Primary, 7004, 7005).with_dependencies(["b"]),
        ]);
        let cycle = report(vec![
            record("a", HealthStatus::Timeout, 3, 0),
            record("b", HealthStatus::Error, 3, 0),
            record("c", HealthStatus::Unhealthy, 3, 0),
        ]);

        let actions = controller.evaluate(&cycle);
        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Restart, ActionKind::Noop, ActionKind::Noop]
        );
        assert_eq!(actions[0].agent.as_str(), "a");
    }

    #[test]
    fn test_single_failing_dependent_is_restarted_itself() {
        let controller = controller(vec![
            AgentSpec::new("a", Host::Primary, 7000, 7001),
            AgentSpec::new("b", Host::Primary, 7002, 7003).with_dependencies(["a"]),
        ]);
        let actions = controller.evaluate(&failing("b"));
        assert_eq!(kinds(&actions), vec![ActionKind::Restart]);
        assert_eq!(actions[0].agent.as_str(), "b");
    }

    #[test]
    fn test_upstream_choice_prefers_widest_coverage() {
        let controller = controller(vec![
            AgentSpec::new("gpu", Host::Primary, 7000, 7001),
            AgentSpec::new("bus", Host::Primary, 7002, 7003),
            AgentSpec::new("x", Host::Primary, 7004, 7005).with_dependencies(["bus", "gpu"]),
            AgentSpec::new("y", Host::Primary, 7006, 7007).with_dependencies(["bus", "gpu"]),
            AgentSpec::new("z", Host::Primary, 7008, 7009).with_dependencies(["gpu"]),
        ]);
        let cycle = report(vec![
            record("x", HealthStatus::Error, 3, 0),
            record("y", HealthStatus::Error, 3, 0),
            record("z", HealthStatus::Error, 3, 0),
        ]);

        let actions = controller.evaluate(&cycle);
        let restarts: Vec<&str> = actions
            .iter()
            .filter(|action| action.action == ActionKind::Restart)
            .map(|action| action.agent.as_str())
            .collect();
        assert_eq!(restarts, vec!["gpu"]);
    }

    #[test]
    fn test_start_failure_escalated_exactly_once() {
        let controller = controller(vec![AgentSpec::new("a", Host::Primary, 7000, 7001)]);
        let id = AgentId::new("a");

        let action = controller
            .escalate_start_failure(&id, "not healthy before deadline")
            .unwrap();
        assert_eq!(action.action, ActionKind::Escalate);
        assert!(controller.escalate_start_failure(&id, "again").is_none());
        assert_eq!(controller.log().count(ActionKind::Escalate), 1);
    }
}
