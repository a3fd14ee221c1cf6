//! Health check protocols
//!
//! Each agent gets exactly one [`HealthProbe`], chosen from its declared
//! protocol when it is registered. Probes never enforce their own deadline;
//! the supervisor wraps every check in the agent's timeout.

use crate::record::CheckOutcome;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::trace;
use warden_core::{AgentSpec, HealthProtocol, PayloadMatcher, ResolvedPorts};

#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    async fn check(&self) -> CheckOutcome;

    fn protocol(&self) -> &'static str;
}

/// `GET http://{address}:{health_port}{path}` expecting a JSON body.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    matcher: PayloadMatcher,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: impl Into<String>, matcher: PayloadMatcher) -> Self {
        Self {
            client,
            url: url.into(),
            matcher,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> CheckOutcome {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                return CheckOutcome::Error {
                    detail: format!("GET {} failed: {}", self.url, e),
                }
            }
        };

        let status = response.status();
        match response.json::<Value>().await {
            Ok(body) if self.matcher.matches(&body) => CheckOutcome::Healthy,
            Ok(body) => CheckOutcome::Unhealthy {
                detail: format!("HTTP {}: {}", status, self.matcher.describe_mismatch(&body)),
            },
            Err(e) => CheckOutcome::Unhealthy {
                detail: format!("HTTP {}: unreadable body: {}", status, e),
            },
        }
    }

    fn protocol(&self) -> &'static str {
        "http"
    }
}

/// One request/reply exchange of newline-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct RpcProbe {
    address: String,
    action: String,
    matcher: PayloadMatcher,
}

impl RpcProbe {
    pub fn new(
        address: impl Into<String>,
        action: impl Into<String>,
        matcher: PayloadMatcher,
    ) -> Self {
        Self {
            address: address.into(),
            action: action.into(),
            matcher,
        }
    }

    async fn exchange(&self) -> Result<String, String> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| format!("connect {} failed: {}", self.address, e))?;

        let mut request = json!({ "action": self.action }).to_string();
        request.push('\n');
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| format!("request to {} failed: {}", self.address, e))?;

        let mut reply = String::new();
        let read = BufReader::new(stream)
            .read_line(&mut reply)
            .await
            .map_err(|e| format!("reply from {} failed: {}", self.address, e))?;
        if read == 0 {
            return Err(format!("{} closed the connection without replying", self.address));
        }
        Ok(reply)
    }
}

#[async_trait]
impl HealthProbe for RpcProbe {
    async fn check(&self) -> CheckOutcome {
        let reply = match self.exchange().await {
            Ok(reply) => reply,
            Err(detail) => return CheckOutcome::Error { detail },
        };
        trace!(address = %self.address, reply = reply.trim_end(), "RPC health reply");

        match serde_json::from_str::<Value>(reply.trim_end()) {
            Ok(envelope) if self.matcher.matches(&envelope) => CheckOutcome::Healthy,
            Ok(envelope) => CheckOutcome::Unhealthy {
                detail: self.matcher.describe_mismatch(&envelope),
            },
            Err(e) => CheckOutcome::Unhealthy {
                detail: format!("malformed reply envelope: {}", e),
            },
        }
    }

    fn protocol(&self) -> &'static str {
        "rpc"
    }
}

/// For agents that declare no health protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

#[async_trait]
impl HealthProbe for NoProbe {
    async fn check(&self) -> CheckOutcome {
        CheckOutcome::Healthy
    }

    fn protocol(&self) -> &'static str {
        "none"
    }
}

/// Select the probe for an agent once, from its declared protocol.
pub fn probe_for(
    spec: &AgentSpec,
    ports: &ResolvedPorts,
    address: &str,
    client: &reqwest::Client,
) -> Arc<dyn HealthProbe> {
    match &spec.health.protocol {
        HealthProtocol::Http { path } => Arc::new(HttpProbe::new(
            client.clone(),
            format!("http://{}:{}{}", address, ports.health, path),
            spec.health.matcher.clone(),
        )),
        HealthProtocol::Rpc { action } => Arc::new(RpcProbe::new(
            format!("{}:{}", address, ports.health),
            action.clone(),
            spec.health.matcher.clone(),
        )),
        HealthProtocol::None => Arc::new(NoProbe),
    }
}
