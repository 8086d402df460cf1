//! `rest` — read-only HTTP surface for the audit log.
//!
//! Loopback only. Exposes the persisted audit chain and its verification to
//! the dashboard and operational tooling; nothing here can mutate core state.
//!
//! Endpoints:
//!   GET /api/v1/health
//!   GET /api/v1/audit?from=<seq>&limit=<n>
//!   GET /api/v1/audit/verify

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::audit::{AuditEntry, AuditLogger, VerifyReport};

pub const DEFAULT_REST_PORT: u16 = 4310;

#[derive(Clone)]
pub struct RestState {
    pub audit: Arc<AuditLogger>,
}

pub async fn serve(audit: Arc<AuditLogger>, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let router = build_router(RestState { audit });

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(state: RestState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/audit", get(list_audit))
        .route("/api/v1/audit/verify", get(verify_audit))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    from: u64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn list_audit(
    State(state): State<RestState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, (StatusCode, String)> {
    state
        .audit
        .read_range(query.from, query.limit.min(1000))
        .map(Json)
        .map_err(internal)
}

async fn verify_audit(
    State(state): State<RestState>,
) -> Result<Json<VerifyReport>, (StatusCode, String)> {
    state.audit.verify_all().map(Json).map_err(internal)
}

fn internal(e: crate::audit::AuditError) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
