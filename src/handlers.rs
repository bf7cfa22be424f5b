//! # REST Handlers
//!
//! The small configuration surface next to the WebSocket transport: read the
//! effective configuration and apply partial updates at runtime. Updated
//! values take effect for sessions created after the update.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Apply a partial configuration update.
///
/// Only the fields present in the body are touched; the merged result is
/// validated before it replaces the live configuration, so an invalid update
/// leaves everything as it was.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut candidate = state.get_config();
    candidate
        .update_from_json(&json_str)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    state
        .update_config(candidate.clone())
        .map_err(AppError::BadRequest)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": candidate
    })))
}
