//! # Health & Metrics Endpoints
//!
//! Operational visibility for the voice chat backend: overall liveness with
//! engine readiness flags, and a detailed per-endpoint metrics report.

use crate::generation::SharedModel;
use crate::registry::SessionRegistry;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

pub async fn health_check(
    state: web::Data<AppState>,
    model: web::Data<SharedModel>,
    registry: web::Data<Arc<SessionRegistry>>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let session_usage = metrics.active_sessions as f64
        / config.performance.max_concurrent_sessions.max(1) as f64;
    let load_status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-chat-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": metrics.active_sessions
        },
        "engines": {
            "generation": {
                "model": config.models.llm_model_path,
                "ready": model.is_ready()
            },
            "transcription": {
                "model": config.models.whisper_model,
                "toolchain_available": registry.toolchain_available()
            },
            "speech": {
                "binary": config.speech.binary
            }
        },
        "system": {
            "status": load_status,
            "session_usage_percent": (session_usage * 100.0).round(),
            "max_sessions": config.performance.max_concurrent_sessions,
            "current_sessions": metrics.active_sessions
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": metrics.active_sessions,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "performance": {
            "max_concurrent_sessions": state.get_config().performance.max_concurrent_sessions,
            "fragment_queue_capacity": state.get_config().audio.fragment_queue_capacity
        }
    }))
}
