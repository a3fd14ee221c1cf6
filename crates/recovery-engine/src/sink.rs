//! Fire-and-forget delivery of recovery events

use crate::action::{ActionKind, RecoveryAction};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Sink rejected event with HTTP {status}")]
    Rejected { status: u16 },
}

/// Destination for recovery events. The engine never waits on a sink.
#[async_trait]
pub trait RecoverySink: Send + Sync + fmt::Debug {
    async fn emit(&self, action: &RecoveryAction) -> Result<(), SinkError>;

    fn name(&self) -> &'static str;
}

/// Emits each event as a structured tracing record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl RecoverySink for TracingSink {
    async fn emit(&self, action: &RecoveryAction) -> Result<(), SinkError> {
        match action.action {
            ActionKind::Escalate => error!(
                target: "warden::recovery",
                id = %action.id,
                agent = %action.agent,
                action = %action.action,
                reason = %action.reason,
                "Agent escalated"
            ),
            _ => info!(
                target: "warden::recovery",
                id = %action.id,
                agent = %action.agent,
                action = %action.action,
                delay_ms = action.delay_ms,
                reason = %action.reason,
                "Recovery action"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

/// POSTs each event as JSON to an error-aggregation endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RecoverySink for HttpSink {
    async fn emit(&self, action: &RecoveryAction) -> Result<(), SinkError> {
        let response = self.client.post(&self.endpoint).json(action).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(endpoint = %self.endpoint, id = %action.id, "Recovery event delivered");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Hand the action to every sink on detached tasks.
///
/// Failures are logged and dropped. Outside a runtime nothing is emitted.
pub fn emit_detached(sinks: &[Arc<dyn RecoverySink>], action: &RecoveryAction) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!(id = %action.id, "No runtime; recovery event not emitted");
        return;
    };
    for sink in sinks {
        let sink = Arc::clone(sink);
        let action = action.clone();
        handle.spawn(async move {
            if let Err(e) = sink.emit(&action).await {
                warn!(sink = sink.name(), id = %action.id, "Recovery event dropped: {}", e);
            }
        });
    }
}
