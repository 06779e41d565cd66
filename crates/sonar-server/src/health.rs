//! `/health` endpoint.

use serde::Serialize;
use sonar_core::time::iso_now;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub time: String,
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
}

pub fn health_check(start_time: Instant, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        time: iso_now(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}
