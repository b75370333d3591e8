//! HTTP handlers for the operator surface (SPEC_FULL section 6): a
//! read-only status endpoint over the controller's per-level regions,
//! and a policy-push endpoint that writes into the same
//! [`crate::global_policy::GlobalPolicy`] slot the root
//! [`crate::tree::TreeCommunicator`] reads. Grounded on the teacher's
//! `handlers.rs` response-shape conventions (`ErrorResponse`,
//! `SuccessResponse`, request-id echo).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::controller::RegionStatus;
use crate::global_policy::GlobalPolicy;
use crate::policy::{Affinity, Goal, Mode};
use crate::region::RegionState;

/// Shared state every handler in this module receives: the operator's
/// output-side [`GlobalPolicy`] and the latest status snapshot published
/// by the controller task.
#[derive(Clone)]
pub struct AppState {
    pub global_policy: Arc<Mutex<GlobalPolicy>>,
    pub status: Arc<std::sync::RwLock<Vec<RegionStatus>>>,
}

/// API error response, RFC 7807 problem+json shape (teacher's
/// `ErrorResponse`).
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub title: String,
    pub status: u16,
    pub detail: String,
}

impl ErrorResponse {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        ErrorResponse {
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: detail.into(),
        }
    }
}

pub struct ApiError(StatusCode, ErrorResponse);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(err: crate::error::Error) -> Self {
        let status = match &err {
            crate::error::Error::Typed { code, .. } => match code {
                crate::error::ErrorCode::Invalid
                | crate::error::ErrorCode::FileParse
                | crate::error::ErrorCode::PolicyNull => StatusCode::BAD_REQUEST,
                crate::error::ErrorCode::LevelRange => StatusCode::NOT_FOUND,
                crate::error::ErrorCode::Logic | crate::error::ErrorCode::Runtime => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, ErrorResponse::new(status, err.to_string()))
    }
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)), tag = "health")]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string(), version: env!("CARGO_PKG_VERSION").to_string() })
}

/// One level's region status, serialized for the status endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegionStatusDto {
    pub level: usize,
    pub region_id: u64,
    pub state: String,
    pub total_energy_j: f64,
    pub max_runtime_s: f64,
    pub mean_frequency_mhz: f64,
    pub num_children: usize,
    pub policy_mode: String,
    pub policy_budget_watts: f64,
}

impl From<RegionStatus> for RegionStatusDto {
    fn from(status: RegionStatus) -> Self {
        RegionStatusDto {
            level: status.level,
            region_id: status.region_id,
            state: region_state_str(status.state).to_string(),
            total_energy_j: status.telemetry.total_energy,
            max_runtime_s: status.telemetry.max_runtime,
            mean_frequency_mhz: status.telemetry.mean_frequency,
            num_children: status.telemetry.num_children,
            policy_mode: status.policy_mode.as_json_str().to_string(),
            policy_budget_watts: status.policy_budget_watts,
        }
    }
}

fn region_state_str(state: RegionState) -> &'static str {
    match state {
        RegionState::Unobserved => "unobserved",
        RegionState::Active => "active",
        RegionState::Shutdown => "shutdown",
    }
}

/// Per-level region telemetry and current policy, as last published by
/// the controller task.
#[utoipa::path(
    get,
    path = "/api/v1/status",
    responses((status = 200, body = [RegionStatusDto])),
    tag = "status"
)]
pub async fn get_status(State(state): State<AppState>) -> Json<Vec<RegionStatusDto>> {
    let snapshot = state.status.read().expect("status lock poisoned").clone();
    Json(snapshot.into_iter().map(RegionStatusDto::from).collect())
}

/// Request body for `POST /api/v1/policy`: the fields an operator is
/// allowed to push, matching [`crate::global_policy`]'s JSON schema
/// (SPEC_FULL section 4.6).
#[derive(Debug, Deserialize, ToSchema)]
pub struct PushPolicyRequest {
    pub mode: String,
    #[serde(default)]
    pub budget_watts: Option<f64>,
    #[serde(default)]
    pub frequency_mhz: Option<u32>,
    #[serde(default)]
    pub tdp_percent: Option<u32>,
    #[serde(default)]
    pub num_max_perf: Option<u32>,
    #[serde(default)]
    pub affinity: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PushPolicyResponse {
    pub message: String,
}

/// Publishes an operator-authored policy into the shared [`GlobalPolicy`]
/// slot the root `TreeCommunicator` reads — the HTTP analogue of
/// `geopm_policy_write` (SPEC_FULL section 6).
#[utoipa::path(
    post,
    path = "/api/v1/policy",
    request_body = PushPolicyRequest,
    responses((status = 200, body = PushPolicyResponse), (status = 400, body = ErrorResponse)),
    tag = "policy"
)]
pub async fn push_policy(
    State(state): State<AppState>,
    Json(request): Json<PushPolicyRequest>,
) -> Result<Json<PushPolicyResponse>, ApiError> {
    let mode = Mode::from_json_str(&request.mode)
        .ok_or_else(|| crate::pwrctl_err!(crate::error::ErrorCode::FileParse, "unknown mode '{}'", request.mode))?;

    let mut policy = state.global_policy.lock().await;
    policy.set_mode(mode);
    if let Some(watts) = request.budget_watts {
        policy.set_budget_watts(watts);
    }
    if let Some(mhz) = request.frequency_mhz {
        policy.set_frequency_mhz(mhz);
    }
    if let Some(percent) = request.tdp_percent {
        policy.set_tdp_percent(percent);
    }
    if let Some(count) = request.num_max_perf {
        policy.set_num_max_perf(count);
    }
    if let Some(affinity) = request.affinity.as_deref() {
        let affinity = Affinity::from_json_str(affinity).ok_or_else(|| {
            crate::pwrctl_err!(crate::error::ErrorCode::FileParse, "unknown affinity '{affinity}'")
        })?;
        policy.set_affinity(affinity);
    }
    if let Some(goal) = request.goal.as_deref() {
        let goal = match goal {
            "performance" => Goal::Performance,
            "efficiency" => Goal::Efficiency,
            "balanced" => Goal::Balanced,
            other => return Err(crate::pwrctl_err!(crate::error::ErrorCode::FileParse, "unknown goal '{other}'").into()),
        };
        policy.set_goal(goal);
    }
    policy.write()?;

    Ok(Json(PushPolicyResponse { message: "policy published".to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_policy::PolicyDescriptor;

    fn test_state() -> AppState {
        let path = std::env::temp_dir().join(format!("pwrctl-test-handlers-{}.json", std::process::id()));
        let global_policy = GlobalPolicy::new(None, Some(PolicyDescriptor::File(path)));
        AppState {
            global_policy: Arc::new(Mutex::new(global_policy)),
            status: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn push_policy_rejects_unknown_mode() {
        let state = test_state();
        let request = PushPolicyRequest {
            mode: "warp_speed".to_string(),
            budget_watts: None,
            frequency_mhz: None,
            tdp_percent: None,
            num_max_perf: None,
            affinity: None,
            goal: None,
        };
        let result = push_policy(State(state), Json(request)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn push_policy_writes_static_frequency_mode() {
        let state = test_state();
        let request = PushPolicyRequest {
            mode: "freq_uniform_static".to_string(),
            budget_watts: None,
            frequency_mhz: Some(2100),
            tdp_percent: None,
            num_max_perf: None,
            affinity: None,
            goal: None,
        };
        let result = push_policy(State(state), Json(request)).await;
        assert!(result.is_ok());
    }
}
