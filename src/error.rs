use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// The scheduler's error taxonomy. Every fallible public operation on
/// `Config`, `Process`, `Group`, or `Scheduler` resolves to one of these
/// variants before it reaches an HTTP handler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    /// Distinguished from `ConfigInvalid` only so startup can map it to its
    /// own exit code (§3 invariant 4: `startPort` + largest group exceeds
    /// 65535). Still reported as part of the same single-pass validation
    /// error list.
    #[error("config invalid: {0}")]
    PortRangeExhausted(String),

    #[error("model '{requested}' is not configured")]
    ModelUnknown { requested: String },

    #[error("model '{requested}' is ambiguous; candidates: {}", candidates.join(", "))]
    ModelAmbiguous {
        requested: String,
        candidates: Vec<String>,
    },

    #[error("group '{group}' is busy (waited past deadline for '{model}')")]
    GroupBusy { group: String, model: String },

    #[error("'{model}' did not become healthy within {timeout_secs}s")]
    StartupTimeout { model: String, timeout_secs: u64 },

    #[error("'{model}' failed to start: {reason}\n--- last logs ---\n{logs}")]
    StartupFailed {
        model: String,
        reason: String,
        logs: String,
    },

    #[error("'{model}' backend exited while serving the request")]
    UpstreamGone { model: String },

    #[error("scheduler is draining, not accepting new requests")]
    Unavailable,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    fn status(&self) -> StatusCode {
        match self {
            SchedulerError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            SchedulerError::PortRangeExhausted(_) => StatusCode::BAD_REQUEST,
            SchedulerError::ModelUnknown { .. } => StatusCode::NOT_FOUND,
            SchedulerError::ModelAmbiguous { .. } => StatusCode::CONFLICT,
            SchedulerError::GroupBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::StartupTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::StartupFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::UpstreamGone { .. } => StatusCode::BAD_GATEWAY,
            SchedulerError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            SchedulerError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SchedulerError::ConfigInvalid(_) => "config_invalid",
            SchedulerError::PortRangeExhausted(_) => "port_range_exhausted",
            SchedulerError::ModelUnknown { .. } => "model_not_found",
            SchedulerError::ModelAmbiguous { .. } => "model_ambiguous",
            SchedulerError::GroupBusy { .. } => "group_busy",
            SchedulerError::StartupTimeout { .. } => "startup_timeout",
            SchedulerError::StartupFailed { .. } => "startup_failed",
            SchedulerError::UpstreamGone { .. } => "upstream_gone",
            SchedulerError::Unavailable => "unavailable",
            SchedulerError::Cancelled => "cancelled",
            SchedulerError::Other(_) => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
    code: &'static str,
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.kind(),
                code: self.kind(),
            },
        };
        (status, Json(body)).into_response()
    }
}
