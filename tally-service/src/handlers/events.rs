use crate::models::Event;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;

/// Store metric events for the next hourly pass. Event ids already stored are
/// ignored. `record_date` is set to the time of receipt whatever the caller sent.
pub async fn ingest_events(
    State(state): State<AppState>,
    Json(mut events): Json<Vec<Event>>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(event) = events
        .iter()
        .find(|e| e.org_id.trim().is_empty() || e.instance_id.trim().is_empty())
    {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Event {} is missing org_id or instance_id",
            event.event_id
        )));
    }

    let received = Utc::now();
    for event in &mut events {
        event.record_date = received;
    }

    let stored = state.stores.events.save_events(&events).await?;
    tracing::debug!(received = events.len(), stored, "Events ingested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "received": events.len(), "stored": stored })),
    ))
}
