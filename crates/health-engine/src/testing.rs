//! Scripted probes for driving the supervisor without real agents.

use crate::probe::HealthProbe;
use crate::record::CheckOutcome;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct Script {
    queue: VecDeque<CheckOutcome>,
    fallback: CheckOutcome,
    calls: usize,
}

/// Replays queued outcomes, then repeats the fallback forever.
///
/// Clones share the same script, so a test can keep a handle and push
/// outcomes after the probe has been registered.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProbe {
    pub fn always(outcome: CheckOutcome) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                queue: VecDeque::new(),
                fallback: outcome,
                calls: 0,
            })),
        }
    }

    pub fn healthy() -> Self {
        Self::always(CheckOutcome::Healthy)
    }

    pub fn refusing() -> Self {
        Self::always(CheckOutcome::Error {
            detail: "connection refused".to_string(),
        })
    }

    pub fn push(&self, outcome: CheckOutcome) -> &Self {
        self.script.lock().queue.push_back(outcome);
        self
    }

    pub fn set_fallback(&self, outcome: CheckOutcome) {
        self.script.lock().fallback = outcome;
    }

    pub fn calls(&self) -> usize {
        self.script.lock().calls
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self) -> CheckOutcome {
        let mut script = self.script.lock();
        script.calls += 1;
        match script.queue.pop_front() {
            Some(outcome) => outcome,
            None => script.fallback.clone(),
        }
    }

    fn protocol(&self) -> &'static str {
        "scripted"
    }
}
