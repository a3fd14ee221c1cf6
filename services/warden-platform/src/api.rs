//! Read-only status API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use health_engine::HealthStatus;
use recovery_engine::FleetRuntime;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::instrument;
use warden_core::{endpoints, VERSION};

pub fn router(runtime: Arc<FleetRuntime>) -> Router {
    Router::new()
        .route(endpoints::HEALTH, get(health_check))
        .route(endpoints::API_V1_AGENTS, get(list_agents))
        .route(endpoints::API_V1_AGENT, get(get_agent))
        .route(endpoints::API_V1_PLAN, get(get_plan))
        .route(endpoints::API_V1_ACTIONS, get(list_actions))
        .with_state(runtime)
}

#[instrument(skip_all)]
async fn health_check(State(runtime): State<Arc<FleetRuntime>>) -> Result<Json<Value>, StatusCode> {
    let snapshot = runtime.snapshot();
    Ok(Json(json!({
        "status": "healthy",
        "service": "warden-platform",
        "version": VERSION,
        "agents": snapshot.records.len(),
        "healthy_agents": snapshot.count(HealthStatus::Healthy)
    })))
}

#[instrument(skip_all)]
async fn list_agents(State(runtime): State<Arc<FleetRuntime>>) -> Result<Json<Value>, StatusCode> {
    let snapshot = runtime.snapshot();
    let agents: Vec<Value> = snapshot
        .records
        .values()
        .map(|record| {
            json!({
                "health": record,
                "recovery": runtime.recovery_state(record.agent.as_str()),
            })
        })
        .collect();
    Ok(Json(json!({
        "taken_at": snapshot.taken_at,
        "agents": agents,
        "total": agents.len()
    })))
}

#[instrument(skip(runtime))]
async fn get_agent(
    State(runtime): State<Arc<FleetRuntime>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let spec = runtime.fleet().fleet.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let record = runtime.health().record(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "id": spec.id,
        "host": spec.host,
        "ports": runtime.fleet().ports.get(&id),
        "dependencies": runtime.fleet().graph.dependencies_of(&id).collect::<Vec<_>>(),
        "health": record,
        "recovery": runtime.recovery_state(&id),
    })))
}

#[instrument(skip_all)]
async fn get_plan(State(runtime): State<Arc<FleetRuntime>>) -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "batches": runtime.plan().batches(),
        "launch": runtime.launch_report(),
    })))
}

#[instrument(skip_all)]
async fn list_actions(State(runtime): State<Arc<FleetRuntime>>) -> Result<Json<Value>, StatusCode> {
    let actions = runtime.actions();
    Ok(Json(json!({
        "total": actions.len(),
        "actions": actions
    })))
}
