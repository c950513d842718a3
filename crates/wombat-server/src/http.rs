use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::error;
use wombat_contracts::{
    ActionRequest, ActionResponse, ErrorBody, ErrorResponse, LinkPartnersRequest, OutcomeKind,
    Problem, ProblemEnvelope, TextRequest, UserId, WombatReply,
};
use wombat_kernel::FailureKind;

use crate::mediator::{redacted_view, ActionOutcome, MediationError, Mediator};

/// Identity header set by the upstream auth layer.
pub const USER_HEADER: &str = "x-wombat-user";

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) mediator: Arc<Mediator>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/partners", post(link_partners))
        .route("/v1/problems", get(list_problems).post(create_problem))
        .route("/v1/problems/{id}", get(get_problem))
        .route("/v1/problems/{id}/actions", post(perform_action))
        .route("/v1/wombat/bs-meter", post(bs_meter))
        .route("/v1/wombat/emergency", post(emergency))
        .with_state(state)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn link_partners(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LinkPartnersRequest>,
) -> Result<StatusCode, ApiError> {
    let user = caller(&headers)?;
    state
        .mediator
        .link_partners(&user, &req.inviter_id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_problems(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Problem>>, ApiError> {
    let user = caller(&headers)?;
    let problems = state
        .mediator
        .list_problems(&user)
        .await
        .map_err(api_error)?;
    Ok(Json(problems))
}

async fn create_problem(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ProblemEnvelope>), ApiError> {
    let user = caller(&headers)?;
    let problem = state
        .mediator
        .create_problem(&user)
        .await
        .map_err(api_error)?;
    let envelope = state
        .mediator
        .view(&user, &problem.id)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(envelope)))
}

async fn get_problem(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProblemEnvelope>, ApiError> {
    let user = caller(&headers)?;
    let envelope = state.mediator.view(&user, &id).await.map_err(api_error)?;
    Ok(Json(envelope))
}

async fn perform_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let user = caller(&headers)?;
    let outcome = state
        .mediator
        .perform(&user, &id, req)
        .await
        .map_err(api_error)?;
    let response = match outcome {
        ActionOutcome::Applied(problem) => ActionResponse {
            outcome: OutcomeKind::Applied,
            reason: None,
            problem: redacted_view(problem, &user),
        },
        ActionOutcome::AlreadyHandled { problem, reason } => ActionResponse {
            outcome: OutcomeKind::AlreadyHandled,
            reason: Some(reason),
            problem: redacted_view(problem, &user),
        },
    };
    Ok(Json(response))
}

async fn bs_meter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TextRequest>,
) -> Result<Json<WombatReply>, ApiError> {
    caller(&headers)?;
    if req.text.trim().is_empty() {
        return Err(error_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_payload",
            "text must not be blank",
        ));
    }
    let text = state.mediator.bs_meter(&req.text).await;
    Ok(Json(WombatReply { text }))
}

async fn emergency(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WombatReply>, ApiError> {
    caller(&headers)?;
    let text = state.mediator.emergency_wombat().await;
    Ok(Json(WombatReply { text }))
}

fn caller(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            error_body(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "missing x-wombat-user header",
            )
        })
}

fn error_body(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
}

fn api_error(e: MediationError) -> ApiError {
    let message = e.to_string();
    match e {
        MediationError::NotFound(_) => error_body(StatusCode::NOT_FOUND, "not_found", &message),
        MediationError::NotParticipant { .. } => {
            error_body(StatusCode::FORBIDDEN, "not_participant", &message)
        }
        MediationError::Rejected(failure) => {
            let (status, code) = match failure.kind {
                FailureKind::Stale => (StatusCode::CONFLICT, "stale"),
                FailureKind::OutOfSequence => (StatusCode::CONFLICT, "out_of_sequence"),
                FailureKind::NotPermitted => (StatusCode::FORBIDDEN, "not_permitted"),
                FailureKind::InvalidPayload => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "invalid_payload")
                }
            };
            error_body(status, code, &failure.message)
        }
        MediationError::WriteConflict { .. } => {
            error_body(StatusCode::CONFLICT, "write_conflict", &message)
        }
        MediationError::LinkingConflict(_) => {
            error_body(StatusCode::CONFLICT, "linking_conflict", &message)
        }
        MediationError::NotPaired(_) => error_body(StatusCode::CONFLICT, "not_paired", &message),
        MediationError::Generation(_) => error_body(
            StatusCode::BAD_GATEWAY,
            "generation_failed",
            "the Wombat could not come up with an answer; try again later",
        ),
        MediationError::Store(inner) => {
            error!(error = %inner, "store failure");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_unavailable",
                "the problem store is unavailable",
            )
        }
    }
}
