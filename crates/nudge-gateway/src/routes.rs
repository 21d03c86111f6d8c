//! API route handlers for the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use nudge_core::NudgeError;

use super::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

const DEFAULT_PENDING_LIMIT: usize = 100;

/// Read a string field, accepting camelCase or snake_case keys.
fn field<'a>(body: &'a serde_json::Value, camel: &str, snake: &str) -> Option<&'a str> {
    body[camel]
        .as_str()
        .or_else(|| body[snake].as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn failure(err: NudgeError) -> ApiResponse {
    let status = match &err {
        NudgeError::InvalidInput(_) | NudgeError::TenantMismatch { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("❌ Follow-up request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!({"success": false, "error": err.to_string()})),
    )
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nudge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Enqueue one contact — `{contactId, companyId, sequenceId?}`.
pub async fn enqueue_contact(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let (Some(contact_id), Some(company_id)) = (
        field(&body, "contactId", "contact_id"),
        field(&body, "companyId", "company_id"),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"success": false, "error": "contactId and companyId are required"})),
        );
    };
    let sequence_id = field(&body, "sequenceId", "sequence_id");

    match state
        .enqueuer
        .enqueue_for_contact(contact_id, company_id, sequence_id)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "message": outcome.message(),
                "enqueued": outcome.enqueued,
                "reason": outcome.reason,
                "sequenceId": outcome.sequence_id,
                "scheduledAt": outcome.scheduled_at,
            })),
        ),
        Err(e) => failure(e),
    }
}

/// Bulk inactivity scan across every company.
pub async fn scan_inactive(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.enqueuer.scan_and_enqueue_inactive_contacts().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "scanned": summary.scanned,
                "enqueued": summary.enqueued,
                "skipped": summary.skipped,
                "failed": summary.failed,
            })),
        ),
        Err(e) => failure(e),
    }
}

/// Pending items of one company — `?companyId=...&limit=...`.
pub async fn list_pending(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResponse {
    let company_id = params
        .get("companyId")
        .or_else(|| params.get("company_id"))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());
    let Some(company_id) = company_id else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"success": false, "error": "companyId is required"})),
        );
    };
    let limit = params
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PENDING_LIMIT);

    match state.queue.pending_for_company(company_id, limit).await {
        Ok(items) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "count": items.len(),
                "items": items,
            })),
        ),
        Err(e) => failure(e),
    }
}
