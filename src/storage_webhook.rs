use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::StorageEvent;
use crate::reconcile;
use crate::storage::REPAYMENTS_PREFIX;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Storage-finalize webhook.
///
/// The blob store calls this once per uploaded object. Only objects under
/// the repayments prefix with a spreadsheet/CSV content type trigger the
/// reconciliation pipeline; everything else is acknowledged and ignored (a
/// mismatch is not an error). Valid events spawn the pipeline in the
/// background and return immediately.
///
/// Authentication: X-Webhook-Token header must match WEBHOOK_SECRET when set.
pub async fn storage_finalized(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<StorageEvent>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    validate_webhook_secret(&state, &headers)?;

    if !event.name.starts_with(REPAYMENTS_PREFIX) {
        tracing::debug!("Ignoring storage event outside repayments prefix: {}", event.name);
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
    }

    if !is_spreadsheet(&event) {
        tracing::debug!(
            "Ignoring non-spreadsheet storage event: {} ({:?})",
            event.name,
            event.content_type
        );
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
    }

    tracing::info!("Storage finalize for {}, scheduling reconciliation", event.name);
    let name = event.name.clone();
    reconcile::spawn_import_job(state, event);

    Ok((
        StatusCode::OK,
        Json(json!({ "status": "scheduled", "object": name })),
    ))
}

const SPREADSHEET_CONTENT_TYPES: [&str; 4] = [
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
    "text/csv",
    "application/csv",
];

/// Content-type filter, with an extension fallback for stores that omit the
/// MIME type on the event.
fn is_spreadsheet(event: &StorageEvent) -> bool {
    if let Some(content_type) = &event.content_type {
        return SPREADSHEET_CONTENT_TYPES
            .iter()
            .any(|accepted| content_type.starts_with(accepted));
    }

    let name = event.name.to_lowercase();
    name.ends_with(".xlsx") || name.ends_with(".xls") || name.ends_with(".csv")
}

/// Validate webhook secret from X-Webhook-Token header
fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // If no secret is configured, skip validation (warn was already logged at startup)
    let Some(ref expected_secret) = state.config.webhook_secret else {
        return Ok(());
    };

    let token = headers
        .get("X-Webhook-Token")
        .or_else(|| headers.get("x-webhook-token"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison (basic implementation)
pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
