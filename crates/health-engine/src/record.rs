//! Per-agent health state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use warden_core::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Timeout,
    Error,
    StartingFailed,
    Retired,
}

impl HealthStatus {
    /// States polled by the supervisor each cycle.
    pub fn is_supervised(self) -> bool {
        matches!(
            self,
            Self::Healthy | Self::Unhealthy | Self::Timeout | Self::Error
        )
    }

    pub fn is_failing(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Timeout | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
            Self::StartingFailed => "STARTING_FAILED",
            Self::Retired => "RETIRED",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Response matched the expected payload
    Healthy,
    /// Response received but did not match
    Unhealthy { detail: String },
    /// No response within the deadline
    Timeout { after: Duration },
    /// The transport itself failed; the agent is not reachable
    Error { detail: String },
}

impl CheckOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    fn failure_status(&self) -> Option<HealthStatus> {
        match self {
            Self::Healthy => None,
            Self::Unhealthy { .. } => Some(HealthStatus::Unhealthy),
            Self::Timeout { .. } => Some(HealthStatus::Timeout),
            Self::Error { .. } => Some(HealthStatus::Error),
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Healthy => None,
            Self::Unhealthy { detail } | Self::Error { detail } => Some(detail.clone()),
            Self::Timeout { after } => Some(format!("no response within {:?}", after)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent: AgentId,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub agent: AgentId,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            status: HealthStatus::Pending,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }

    /// Fold one check outcome into the record.
    ///
    /// Failures while STARTING keep the agent STARTING and do not count
    /// towards the recovery threshold. PENDING, STARTING_FAILED and RETIRED
    /// records ignore outcomes.
    pub fn apply(&mut self, outcome: &CheckOutcome, at: DateTime<Utc>) -> Option<Transition> {
        let from = self.status;
        match from {
            HealthStatus::Pending | HealthStatus::StartingFailed | HealthStatus::Retired => {
                return None
            }
            HealthStatus::Starting => {
                self.last_check = Some(at);
                if outcome.is_healthy() {
                    self.status = HealthStatus::Healthy;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 1;
                    self.last_error = None;
                } else {
                    self.last_error = outcome.detail();
                }
            }
            _ => {
                self.last_check = Some(at);
                match outcome.failure_status() {
                    None => {
                        self.status = HealthStatus::Healthy;
                        self.consecutive_failures = 0;
                        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                        self.last_error = None;
                    }
                    Some(status) => {
                        self.status = status;
                        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                        self.consecutive_successes = 0;
                        self.last_error = outcome.detail();
                    }
                }
            }
        }

        (self.status != from).then(|| Transition {
            agent: self.agent.clone(),
            from,
            to: self.status,
            at,
        })
    }

    pub(crate) fn force(&mut self, status: HealthStatus, error: Option<String>) -> Transition {
        let from = self.status;
        self.status = status;
        if status == HealthStatus::Starting {
            self.consecutive_failures = 0;
            self.consecutive_successes = 0;
        }
        if error.is_some() {
            self.last_error = error;
        }
        Transition {
            agent: self.agent.clone(),
            from,
            to: status,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: HealthStatus) -> HealthRecord {
        let mut record = HealthRecord::new(AgentId::new("asr"));
        record.status = status;
        record
    }

    fn unhealthy() -> CheckOutcome {
        CheckOutcome::Unhealthy {
            detail: "status = \"degraded\"".to_string(),
        }
    }

    #[test]
    fn test_starting_becomes_healthy_on_first_match() {
        let mut rec = record(HealthStatus::Starting);
        let transition = rec.apply(&CheckOutcome::Healthy, Utc::now()).unwrap();
        assert_eq!(transition.from, HealthStatus::Starting);
        assert_eq!(transition.to, HealthStatus::Healthy);
        assert_eq!(rec.consecutive_successes, 1);
    }

    #[test]
    fn test_starting_failures_do_not_count() {
        let mut rec = record(HealthStatus::Starting);
        assert!(rec
            .apply(
                &CheckOutcome::Error {
                    detail: "connection refused".to_string()
                },
                Utc::now()
            )
            .is_none());
        assert_eq!(rec.status, HealthStatus::Starting);
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_failure_kinds_map_to_distinct_states() {
        let cases = [
            (unhealthy(), HealthStatus::Unhealthy),
            (
                CheckOutcome::Timeout {
                    after: Duration::from_secs(5),
                },
                HealthStatus::Timeout,
            ),
            (
                CheckOutcome::Error {
                    detail: "refused".to_string(),
                },
                HealthStatus::Error,
            ),
        ];
        for (outcome, expected) in cases {
            let mut rec = record(HealthStatus::Healthy);
            rec.apply(&outcome, Utc::now());
            assert_eq!(rec.status, expected);
            assert_eq!(rec.consecutive_failures, 1);
        }
    }

    #[test]
    fn test_recovery_resets_failure_counter() {
        let mut rec = record(HealthStatus::Healthy);
        rec.apply(&unhealthy(), Utc::now());
        rec.apply(&unhealthy(), Utc::now());
        assert_eq!(rec.consecutive_failures, 2);
        assert!(rec.apply(&unhealthy(), Utc::now()).is_none());

        let transition = rec.apply(&CheckOutcome::Healthy, Utc::now()).unwrap();
        assert_eq!(transition.from, HealthStatus::Unhealthy);
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.last_error, None);
    }

    #[test]
    fn test_terminal_states_ignore_outcomes() {
        for status in [
            HealthStatus::Pending,
            HealthStatus::StartingFailed,
            HealthStatus::Retired,
        ] {
            let mut rec = record(status);
            assert!(rec.apply(&CheckOutcome::Healthy, Utc::now()).is_none());
            assert_eq!(rec.status, status);
            assert_eq!(rec.last_check, None);
        }
    }
}
