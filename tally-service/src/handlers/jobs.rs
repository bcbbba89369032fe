use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use std::collections::BTreeMap;

fn require_org(org_id: &str) -> Result<(), AppError> {
    if org_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("org_id is required")));
    }
    Ok(())
}

/// Nightly pass for one org, run inline.
pub async fn tally_org(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_org(&org_id)?;
    let report = state.runner.tally_org(&org_id).await?;
    Ok(Json(report))
}

pub async fn tally_all_orgs(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    state.runner.start_all_host_tallies()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job": "host_tally", "status": "started" })),
    ))
}

pub async fn tally_hourly(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    require_org(&org_id)?;
    let report = state.runner.tally_hourly(&org_id).await?;
    Ok(Json(report))
}

pub async fn tally_all_hourly(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    state.runner.start_all_hourly_tallies()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job": "hourly_tally", "status": "started" })),
    ))
}

pub async fn purge_expired(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let purged: BTreeMap<&'static str, u64> = state
        .runner
        .purge_expired()
        .await?
        .into_iter()
        .map(|(granularity, deleted)| (granularity.as_str(), deleted))
        .collect();
    Ok(Json(json!({ "deleted": purged })))
}
