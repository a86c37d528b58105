use serde::Serialize;

use ralock_core::state::StateSnapshot;
use ralock_core::types::{NodeId, Phase};

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node: NodeId,
    pub phase: Phase,
    pub peers: usize,
}

impl HealthResponse {
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node: snapshot.node,
            phase: snapshot.phase,
            peers: snapshot.grants_needed,
        }
    }
}
