use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::flags::RuleChain;
use crate::state::AppState;
use super::{
    CheckFlagRequest, CreateFlagRequest, SetDefaultRequest,
    error_response, validate_flag_name
};

/// Create a new feature flag
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateFlagRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_flag_name(&payload.name).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let record = state
        .flags
        .new_flag(payload.name.trim(), payload.default_value)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Get a single flag by ID
pub async fn get(
    State(state): State<AppState>,
    Path(flag_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let record = state.flags.get_flag(&flag_id).await.map_err(error_response)?;
    Ok(Json(record))
}

/// Delete a feature flag. Deleting a missing flag succeeds.
pub async fn delete(
    State(state): State<AppState>,
    Path(flag_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.flags.delete_flag(&flag_id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Set the value that overrides every rule
pub async fn set_default(
    State(state): State<AppState>,
    Path(flag_id): Path<String>,
    Json(payload): Json<SetDefaultRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .flags
        .set_default_flag_value(&flag_id, payload.value)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Add a targeting rule chain to a flag
pub async fn add_rule_chain(
    State(state): State<AppState>,
    Path(flag_id): Path<String>,
    Json(chain): Json<RuleChain>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .flags
        .add_rule_chain(&flag_id, chain)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Evaluate a flag for the caller's tags
pub async fn check(
    State(state): State<AppState>,
    Path(flag_id): Path<String>,
    Json(payload): Json<CheckFlagRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let evaluation = state
        .flags
        .evaluate_flag_rule(&flag_id, &payload.tags)
        .await
        .map_err(error_response)?;
    Ok(Json(evaluation))
}
