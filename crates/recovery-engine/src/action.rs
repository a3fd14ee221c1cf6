//! Recovery decisions and their append-only log

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_core::{AgentId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Restart,
    Escalate,
    Noop,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "RESTART",
            Self::Escalate => "ESCALATE",
            Self::Noop => "NOOP",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One recovery decision. Never mutated once logged.
///
/// Serialized form is the event sent to the error-aggregation sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: Uuid,
    pub agent: AgentId,
    pub action: ActionKind,
    pub reason: String,
    pub delay_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryAction {
    fn new(agent: AgentId, action: ActionKind, delay: Duration, reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent,
            action,
            reason,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        }
    }

    pub fn restart(agent: AgentId, delay: Duration, reason: impl Into<String>) -> Self {
        Self::new(agent, ActionKind::Restart, delay, reason.into())
    }

    pub fn escalate(agent: AgentId, reason: impl Into<String>) -> Self {
        Self::new(agent, ActionKind::Escalate, Duration::ZERO, reason.into())
    }

    pub fn noop(agent: AgentId, reason: impl Into<String>) -> Self {
        Self::new(agent, ActionKind::Noop, Duration::ZERO, reason.into())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
}

/// Append-only, in-memory audit log of recovery decisions, optionally
/// mirrored line by line to a JSONL journal.
#[derive(Debug, Default)]
pub struct ActionLog {
    entries: RwLock<Vec<RecoveryAction>>,
    journal: Option<Mutex<Journal>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every appended action to `path`, creating it if needed.
    pub fn with_journal(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(journal = %path.display(), "Recovery journal opened");
        Ok(Self {
            entries: RwLock::new(Vec::new()),
            journal: Some(Mutex::new(Journal { path, file })),
        })
    }

    /// Read a journal written by a previous run.
    pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<RecoveryAction>> {
        let reader = BufReader::new(File::open(path)?);
        let mut actions = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            actions.push(serde_json::from_str(&line)?);
        }
        Ok(actions)
    }

    pub fn append(&self, action: RecoveryAction) -> RecoveryAction {
        if let Some(journal) = &self.journal {
            let mut journal = journal.lock();
            let written = serde_json::to_string(&action)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(journal.file, "{}", line));
            if let Err(e) = written {
                warn!(journal = %journal.path.display(), "Failed to mirror recovery action: {}", e);
            }
        }
        self.entries.write().push(action.clone());
        action
    }

    pub fn entries(&self) -> Vec<RecoveryAction> {
        self.entries.read().clone()
    }

    pub fn for_agent(&self, agent: &str) -> Vec<RecoveryAction> {
        self.entries
            .read()
            .iter()
            .filter(|action| action.agent.as_str() == agent)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|action| action.action == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let action = RecoveryAction::restart(
            AgentId::new("llm"),
            Duration::from_secs(5),
            "ERROR after 3 consecutive failures",
        );
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["agent"], json!("llm"));
        assert_eq!(value["action"], json!("RESTART"));
        assert_eq!(value["delay_ms"], json!(5000));
        for field in ["id", "reason", "timestamp"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_log_preserves_append_order() {
        let log = ActionLog::new();
        log.append(RecoveryAction::restart(AgentId::new("a"), Duration::from_secs(5), "first"));
        log.append(RecoveryAction::noop(AgentId::new("b"), "deferred to upstream restart of a"));
        log.append(RecoveryAction::escalate(AgentId::new("a"), "budget exhausted"));

        let kinds: Vec<ActionKind> = log.entries().iter().map(|a| a.action).collect();
        assert_eq!(kinds, vec![ActionKind::Restart, ActionKind::Noop, ActionKind::Escalate]);
        assert_eq!(log.for_agent("a").len(), 2);
        assert_eq!(log.count(ActionKind::Escalate), 1);
    }

    #[test]
    fn test_journal_mirrors_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.jsonl");

        let log = ActionLog::with_journal(&path).unwrap();
        log.append(RecoveryAction::restart(AgentId::new("a"), Duration::from_secs(5), "first"));
        log.append(RecoveryAction::escalate(AgentId::new("a"), "budget exhausted"));

        let replayed = ActionLog::read_journal(&path).unwrap();
        assert_eq!(replayed, log.entries());

        let reopened = ActionLog::with_journal(&path).unwrap();
        reopened.append(RecoveryAction::noop(AgentId::new("b"), "deferred"));
        assert_eq!(ActionLog::read_journal(&path).unwrap().len(), 3);
    }
}
