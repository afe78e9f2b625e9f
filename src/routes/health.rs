//! Health check endpoints
//!
//! - /health, /healthz - Liveness probe (is the process serving?)
//! - /ready, /readyz - Readiness probe (should traffic be sent here?)
//!
//! Readiness fails once shutdown has begun, and when MongoDB is configured
//! but not answering pings.

use hyper::StatusCode;
use serde::Serialize;

use crate::queue::ClassStatus;
use crate::routes::{json_response, JsonResponse};
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub ready: bool,
    pub version: &'static str,
    pub timestamp: String,
    pub mode: &'static str,
    pub node_id: String,
    pub broker: BrokerHealth,
    /// `None` when running on in-memory stores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct BrokerHealth {
    /// Handles replaced since startup
    pub rebuilds: u64,
    pub classes: Vec<ClassStatus>,
}

fn build_health_response(state: &AppState, database: Option<bool>) -> HealthResponse {
    let ready = state.is_ready() && database.unwrap_or(true);
    let error = if !state.is_ready() {
        Some("shutting down".to_string())
    } else if database == Some(false) {
        Some("MongoDB is not reachable".to_string())
    } else {
        None
    };

    HealthResponse {
        healthy: true,
        ready,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode { "development" } else { "production" },
        node_id: state.args.node_id.to_string(),
        broker: BrokerHealth {
            rebuilds: state.queues.rebuilds(),
            classes: state.queues.status(),
        },
        database,
        error,
    }
}

/// Build stamp written by build.rs
pub fn version_info() -> JsonResponse {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "commit": env!("GIT_COMMIT_SHORT"),
            "commit_full": env!("GIT_COMMIT_FULL"),
            "built_at": env!("BUILD_TIMESTAMP"),
        }),
    )
}

/// Liveness probe. Always 200 while the process can answer.
pub fn health_check(state: &AppState) -> JsonResponse {
    json_response(StatusCode::OK, &build_health_response(state, None))
}

/// Readiness probe. 503 while draining or when the database is down.
pub async fn readiness_check(state: &AppState) -> JsonResponse {
    let database = match &state.mongo {
        Some(mongo) => Some(mongo.ping().await.is_ok()),
        None => None,
    };
    let response = build_health_response(state, database);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &response)
}
