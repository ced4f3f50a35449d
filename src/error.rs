//! Error types for the usage server

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;

/// Machine-readable reason attached to a refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
  Disabled,
  ConcurrentLimit,
  QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Denial {
  pub reason: DenyReason,
  pub message: String,
  pub quota_remaining: i64,
  pub session_time_remaining: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Database error: {0}")]
  Database(#[from] sea_orm::DbErr),

  #[error("Storage did not respond in time")]
  Timeout,

  #[error("{}", .0.message)]
  Denied(Denial),

  #[error("Session quota exceeded")]
  QuotaExceeded { session_id: String },

  #[error("Invalid or expired session")]
  InvalidCredential,

  #[error("Heartbeat timestamp outside tolerance window")]
  Replay,

  #[error("Bad request: {0}")]
  BadRequest(String),

  #[error("Upstream rejected credentials")]
  UpstreamAuth,

  #[error("Upstream error: {0}")]
  Upstream(String),

  #[error("Forbidden")]
  Forbidden,

  #[error("Token error: {0}")]
  Token(#[from] jsonwebtoken::errors::Error),

  #[error("Internal error: {0}")]
  Internal(String),
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      Error::Denied(denial) => {
        let body = json::json!({
          "success": false,
          "error": denial.message,
          "reason": denial.reason,
          "quotaRemaining": denial.quota_remaining,
          "sessionTimeRemaining": denial.session_time_remaining,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
      }
      Error::QuotaExceeded { session_id } => {
        let body = json::json!({
          "success": false,
          "error": "Session quota exceeded",
          "status": "session_terminated",
          "sessionId": session_id,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
      }
      Error::InvalidCredential => {
        let body = json::json!({
          "success": false,
          "error": "Invalid or expired session, request a new one",
          "status": "session_terminated",
        });
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
      }
      Error::Replay => (StatusCode::BAD_REQUEST, "Stale or future timestamp"),
      Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
      Error::UpstreamAuth => {
        (StatusCode::UNAUTHORIZED, "Upstream rejected credentials")
      }
      Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "Upstream error"),
      Error::Forbidden => (StatusCode::FORBIDDEN, "Forbidden"),
      Error::Database(_) | Error::Timeout => {
        (StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
      }
      Error::Token(_) | Error::Internal(_) => {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
      }
    };

    if status.is_server_error() {
      tracing::error!("Request failed: {self}");
    }

    let body = match &self {
      Error::BadRequest(detail) => json::json!({
        "success": false,
        "error": message,
        "detail": detail,
      }),
      _ => json::json!({
        "success": false,
        "error": message
      }),
    };

    (status, Json(body)).into_response()
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
