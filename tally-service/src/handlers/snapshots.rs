use crate::models::{Granularity, SnapshotRecord};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::BTreeSet;

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub product_id: String,
    pub granularity: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(org_id): Path<String>,
    Query(params): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, AppError> {
    let granularity = Granularity::from_str(&params.granularity).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Unknown granularity: {}", params.granularity))
    })?;
    if params.start > params.end {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "start must not be after end"
        )));
    }

    let products = BTreeSet::from([params.product_id]);
    let snapshots = state
        .stores
        .snapshots
        .find_snapshots(&org_id, &products, granularity, params.start, params.end)
        .await?;
    let records: Vec<SnapshotRecord> = snapshots.iter().map(SnapshotRecord::from).collect();
    Ok(Json(records))
}
