use std::net::SocketAddr;

use axum::{
  Extension, Json,
  extract::{ConnectInfo, Path, State},
  http::HeaderMap,
};
use serde::{Deserialize, Serialize};

use crate::{
  prelude::*,
  state::AppState,
  sv::{
    store::Limits,
    usage::{Admission, EndReason, QuotaWarning, SessionCheck, UserStatus},
  },
};

pub type Peer = Option<Extension<ConnectInfo<SocketAddr>>>;

fn required(field: Option<String>, name: &str) -> Result<String> {
  field
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
    .ok_or_else(|| Error::BadRequest(format!("`{name}` is required")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionReq {
  pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRes {
  pub api_key: String,
  pub session_id: String,
  pub session_token: String,
  pub heartbeat_token: String,
  pub quota_remaining: i64,
  pub session_time_limit: i64,
  pub warning_threshold: i64,
  pub warning: bool,
}

pub async fn create_session(
  State(app): State<Arc<AppState>>,
  peer: Peer,
  Json(req): Json<CreateSessionReq>,
) -> Result<Json<CreateSessionRes>> {
  let user_id = required(req.user_id, "userId")?;
  let ip = peer.map(|Extension(ConnectInfo(addr))| addr.ip().to_string());
  let sv = app.sv();

  // refuse before spending an upstream key
  if let Admission::Denied(denial) =
    sv.usage.validate_session_creation(&user_id).await?
  {
    warn!("Session for `{user_id}` denied: {}", denial.message);
    return Err(Error::Denied(denial));
  }

  let api_key = sv.realtime.ephemeral_key().await?;

  let Some(created) = sv.usage.create_session(&user_id, ip.as_deref()).await?
  else {
    // admission changed between the check and the locked re-check
    return match sv.usage.validate_session_creation(&user_id).await? {
      Admission::Denied(denial) => Err(Error::Denied(denial)),
      Admission::Allowed(_) => {
        Err(Error::Internal(format!("Admission of `{user_id}` flapped")))
      }
    };
  };

  Ok(Json(CreateSessionRes {
    api_key,
    session_id: created.claims.session_id,
    session_token: created.token,
    heartbeat_token: created.heartbeat_token,
    quota_remaining: created.allowance.quota_remaining,
    session_time_limit: created.allowance.session_time_limit,
    warning_threshold: app.config.warning_threshold(),
    warning: created.allowance.warning,
  }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReq {
  pub session_token: Option<String>,
  pub heartbeat_token: Option<String>,
  /// Client clock in epoch milliseconds, only used against replays
  pub timestamp: Option<i64>,
}

enum Credential {
  Session(String),
  Heartbeat(String),
}

impl HeartbeatReq {
  fn validate(self, tolerance: Duration) -> Result<Credential> {
    let timestamp = self
      .timestamp
      .ok_or_else(|| Error::BadRequest("`timestamp` is required".into()))?;

    let credential = match (self.heartbeat_token, self.session_token) {
      (Some(token), _) if !token.is_empty() => Credential::Heartbeat(token),
      (_, Some(token)) if !token.is_empty() => Credential::Session(token),
      _ => {
        return Err(Error::BadRequest(
          "`sessionToken` or `heartbeatToken` is required".into(),
        ));
      }
    };

    let skew = (utils::now_ms() - timestamp).unsigned_abs();
    if skew > tolerance.as_millis() as u64 {
      return Err(Error::Replay);
    }
    Ok(credential)
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRes {
  pub success: bool,
  pub session_id: String,
  pub timestamp: i64,
  pub session_time_remaining: i64,
  pub quota_remaining: i64,
  pub quota_used_seconds: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub warning: Option<QuotaWarning>,
  pub heartbeat_token: String,
}

pub async fn heartbeat(
  State(app): State<Arc<AppState>>,
  Json(req): Json<HeartbeatReq>,
) -> Result<Json<HeartbeatRes>> {
  let credential = req.validate(app.config.replay_tolerance)?;
  let usage = app.sv().usage;

  let check = match &credential {
    Credential::Heartbeat(token) => {
      usage.validate_heartbeat_token(token).await?
    }
    Credential::Session(token) => usage.validate_session(token).await?,
  };

  let session = match check {
    SessionCheck::Valid(session) => session,
    SessionCheck::Ended(_) | SessionCheck::Invalid => {
      return Err(Error::InvalidCredential);
    }
  };

  let Some(outcome) = usage.process_heartbeat(&session.session_id).await? else {
    return Err(Error::InvalidCredential);
  };

  app.monitor.update_session_quota(
    &outcome.session_id,
    outcome.quota_remaining,
    outcome.warning.as_slice(),
  );

  if outcome.terminated {
    return Err(Error::QuotaExceeded { session_id: outcome.session_id });
  }

  let (heartbeat_token, _) =
    app.tokens.issue_heartbeat(&session.user_id, &session.session_id)?;

  Ok(Json(HeartbeatRes {
    success: true,
    session_id: outcome.session_id,
    timestamp: utils::now_ms(),
    session_time_remaining: outcome.session_time_remaining,
    quota_remaining: outcome.quota_remaining,
    quota_used_seconds: outcome.quota_used_seconds,
    warning: outcome.warning,
    heartbeat_token,
  }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionReq {
  pub session_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRes {
  pub success: bool,
  pub session_id: String,
  pub quota_used: i64,
}

pub async fn end_session(
  State(app): State<Arc<AppState>>,
  Json(req): Json<EndSessionReq>,
) -> Result<Json<EndSessionRes>> {
  let token = required(req.session_token, "sessionToken")?;
  // an expired credential may still close its own session
  let claims = app.tokens.inspect(&token).ok_or(Error::InvalidCredential)?;

  let ended =
    app.sv().usage.end_session(&claims.session_id, EndReason::Normal).await?;

  Ok(Json(EndSessionRes {
    success: true,
    session_id: claims.session_id,
    quota_used: ended.map(|ended| ended.quota_used_seconds).unwrap_or(0),
  }))
}

pub async fn usage(
  State(app): State<Arc<AppState>>,
  Path(user_id): Path<String>,
) -> Result<Json<UserStatus>> {
  Ok(Json(app.sv().usage.user_status(&user_id).await?))
}

fn authorize(app: &AppState, headers: &HeaderMap) -> Result<()> {
  let given = headers.get("x-admin-secret").and_then(|v| v.to_str().ok());
  match (&app.config.admin_secret, given) {
    (Some(secret), Some(given)) if secret == given => Ok(()),
    _ => {
      warn!("Rejected admin request");
      Err(Error::Forbidden)
    }
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetUsageReq {
  pub seconds: Option<i64>,
}

pub async fn reset_usage(
  State(app): State<Arc<AppState>>,
  Path(user_id): Path<String>,
  headers: HeaderMap,
  req: Option<Json<ResetUsageReq>>,
) -> Result<Json<UserStatus>> {
  authorize(&app, &headers)?;
  let req = req.map(|Json(req)| req).unwrap_or_default();

  let usage = app.sv().usage;
  usage.reset_usage(&user_id, req.seconds).await?;
  Ok(Json(usage.user_status(&user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLimitsReq {
  pub enabled: Option<bool>,
  pub max_concurrent_sessions: Option<i32>,
}

pub async fn set_limits(
  State(app): State<Arc<AppState>>,
  Path(user_id): Path<String>,
  headers: HeaderMap,
  Json(req): Json<SetLimitsReq>,
) -> Result<Json<Limits>> {
  authorize(&app, &headers)?;
  let store = app.sv().store;

  let current = store.user_limits(&user_id, app.config.default_limits()).await?;
  let limits = Limits {
    enabled: req.enabled.unwrap_or(current.enabled),
    max_concurrent_sessions: req
      .max_concurrent_sessions
      .unwrap_or(current.max_concurrent_sessions),
  };
  if limits.max_concurrent_sessions < 1 {
    return Err(Error::BadRequest(
      "`maxConcurrentSessions` must be positive".into(),
    ));
  }

  store.set_user_limits(&user_id, limits).await?;
  info!("Limits of `{user_id}` set to {limits:?}");
  Ok(Json(limits))
}

pub async fn health() -> &'static str {
  "OK"
}
