mod handlers;
mod ws;

use std::net::SocketAddr;

use axum::{
  Router,
  routing::{get, post},
};
use tower::ServiceBuilder;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

use crate::{prelude::*, state::AppState};

pub fn router(app: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(handlers::health))
    .route("/session", post(handlers::create_session))
    .route("/session/end", post(handlers::end_session))
    .route("/heartbeat", post(handlers::heartbeat))
    .route("/usage/{user_id}", get(handlers::usage))
    .route("/admin/usage/{user_id}/reset", post(handlers::reset_usage))
    .route("/admin/limits/{user_id}", post(handlers::set_limits))
    .route("/ws", get(ws::connect))
    .with_state(app)
}

pub struct Plugin;

#[async_trait]
impl super::Plugin for Plugin {
  async fn start(&self, app: Arc<AppState>) -> anyhow::Result<()> {
    let governor_conf = Arc::new(
      GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(100)
        .finish()
        .context("Failed to build rate limiter config")?,
    );

    let limiter = governor_conf.limiter().clone();

    let router = router(app.clone())
      .layer(
        ServiceBuilder::new()
          .layer(TraceLayer::new_for_http())
          .layer(GovernorLayer::new(governor_conf))
          .layer(
            CorsLayer::new()
              .allow_origin(Any)
              .allow_methods(Any)
              .allow_headers(Any),
          ),
      )
      .into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], app.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
      .await
      .with_context(|| format!("Failed to bind {addr}"))?;
    info!("HTTP Server listening on {addr}");

    let limiter = async {
      loop {
        time::sleep(Duration::from_secs(60)).await;
        limiter.retain_recent();
      }
    };

    let server = async {
      axum::serve(listener, router)
        .with_graceful_shutdown(app.shutdown.clone().cancelled_owned())
        .await
        .context("Axum server error")
    };

    tokio::select! {
      result = server => {
        match &result {
          Ok(_) => info!("Server stopped gracefully"),
          Err(err) => error!("Server stopped with error: {err}"),
        }
        result
      }
      _ = limiter => {
        error!("Rate limiter cleaner stopped unexpectedly!");
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
  };
  use tokio::sync::mpsc;
  use tower::ServiceExt;

  use super::*;
  use crate::{
    monitor::{Outbound, Push},
    state::{Config, tests::test_config},
    sv::usage::EndReason,
    sv::realtime::tests::fake_upstream,
  };

  async fn app() -> Arc<AppState> {
    let mut config = Config {
      admin_secret: Some("admin".into()),
      ..test_config()
    };
    config.realtime.api_url = fake_upstream().await;
    config.realtime.api_key = "good-key".into();
    AppState::in_memory(config).await
  }

  async fn call(
    app: &Arc<AppState>,
    request: Request<Body>,
  ) -> (StatusCode, json::Value) {
    let response = router(app.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = json::from_slice(&bytes).unwrap_or(json::Value::Null);
    (status, body)
  }

  fn post_json(uri: &str, body: json::Value) -> Request<Body> {
    Request::post(uri)
      .header("content-type", "application/json")
      .body(Body::from(body.to_string()))
      .unwrap()
  }

  async fn open_session(app: &Arc<AppState>, user_id: &str) -> json::Value {
    let request = post_json("/session", json::json!({ "userId": user_id }));
    let (status, body) = call(app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
  }

  async fn backdate(app: &AppState, session_id: &str, secs: i64) {
    use crate::sv::store::SessionPatch;

    let store = app.sv().store;
    let session = store.active_session(session_id).await.unwrap().unwrap();
    let patch = SessionPatch {
      last_heartbeat: Some(session.last_heartbeat - TimeDelta::seconds(secs)),
      ..Default::default()
    };
    store.update_active_session(session_id, patch).await.unwrap();
  }

  #[tokio::test]
  async fn test_health() {
    let app = app().await;
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let response = router(app).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
  }

  #[tokio::test]
  async fn test_create_session() {
    let app = app().await;
    let body = open_session(&app, "alice").await;

    assert_eq!(body["apiKey"], "ek_123");
    assert_eq!(body["quotaRemaining"], 1800);
    assert_eq!(body["sessionTimeLimit"], 900);
    assert_eq!(body["warningThreshold"], 120);
    assert!(body["sessionId"].as_str().unwrap().starts_with("sess_"));
    assert!(body["heartbeatToken"].is_string());
  }

  #[tokio::test]
  async fn test_create_session_requires_user() {
    let app = app().await;
    let request = post_json("/session", json::json!({}));
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
  }

  #[tokio::test]
  async fn test_second_session_is_denied() {
    let app = app().await;
    open_session(&app, "alice").await;

    let (status, body) =
      call(&app, post_json("/session", json::json!({ "userId": "alice" })))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["reason"], "concurrent_limit");
    assert_eq!(body["error"], "Maximum concurrent sessions reached");
    assert_eq!(body["sessionTimeRemaining"], 1800);
  }

  #[tokio::test]
  async fn test_reclaimed_session_channel_is_terminated() {
    let app = app().await;
    let stale = open_session(&app, "alice").await;
    let stale_id = stale["sessionId"].as_str().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    app.monitor.register(stale_id, 1800, tx);
    backdate(&app, stale_id, 6 * 60).await;

    let fresh = open_session(&app, "alice").await;
    assert_ne!(fresh["sessionId"], stale["sessionId"]);
    assert_eq!(app.monitor.len(), 0);

    let mut terminated = None;
    while let Ok(message) = rx.try_recv() {
      if let Outbound::Push(Push::SessionTerminated { reason, .. }) = message {
        terminated = Some(reason);
      }
    }
    assert_eq!(terminated, Some(EndReason::Stale));
  }

  #[tokio::test]
  async fn test_upstream_rejection_is_unauthorized() {
    let app = app().await;
    let mut config = app.config.clone();
    config.realtime.api_key = "bad-key".into();
    let app = AppState::in_memory(config).await;

    let (status, _) =
      call(&app, post_json("/session", json::json!({ "userId": "alice" })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    // no session is recorded for a failed upstream call
    let store = app.sv().store;
    assert_eq!(store.count_user_active_sessions("alice").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_heartbeat_flow() {
    let app = app().await;
    let session = open_session(&app, "alice").await;
    let session_id = session["sessionId"].as_str().unwrap();
    backdate(&app, session_id, 30).await;

    let (status, body) = call(
      &app,
      post_json(
        "/heartbeat",
        json::json!({
          "sessionToken": session["sessionToken"],
          "timestamp": utils::now_ms(),
        }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["sessionTimeRemaining"], 1770);
    assert_eq!(body["quotaUsedSeconds"], 30);
    assert!(body.get("warning").is_none());

    // the rotated heartbeat credential authenticates the next beat
    backdate(&app, session_id, 10).await;
    let (status, body) = call(
      &app,
      post_json(
        "/heartbeat",
        json::json!({
          "heartbeatToken": body["heartbeatToken"],
          "timestamp": utils::now_ms(),
        }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["sessionTimeRemaining"], 1760);
  }

  #[tokio::test]
  async fn test_heartbeat_rejects_replayed_timestamp() {
    let app = app().await;
    let session = open_session(&app, "alice").await;
    let session_id = session["sessionId"].as_str().unwrap();
    backdate(&app, session_id, 30).await;

    let store = app.sv().store;
    let before = store.active_session(session_id).await.unwrap().unwrap();
    let old = utils::now_ms() - 10 * 60 * 1000;

    let (status, _) = call(
      &app,
      post_json(
        "/heartbeat",
        json::json!({
          "sessionToken": session["sessionToken"],
          "timestamp": old,
        }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // a rejected beat charges nothing and leaves the session untouched
    let after = store.active_session(session_id).await.unwrap().unwrap();
    assert_eq!(after.quota_used_seconds, 0);
    assert_eq!(after.last_heartbeat, before.last_heartbeat);

    let request = Request::get("/usage/alice").body(Body::empty()).unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionTimeRemaining"], 1800);
    assert_eq!(body["totalSecondsConsumed"], 0);

    let (status, _) = call(
      &app,
      post_json("/heartbeat", json::json!({ "timestamp": utils::now_ms() })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn test_heartbeat_with_forged_token() {
    let app = app().await;
    let (status, body) = call(
      &app,
      post_json(
        "/heartbeat",
        json::json!({ "sessionToken": "forged", "timestamp": utils::now_ms() }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "session_terminated");
  }

  #[tokio::test]
  async fn test_heartbeat_exhausts_quota() {
    let app = app().await;
    app.sv().usage.reset_usage("alice", Some(100)).await.unwrap();
    let session = open_session(&app, "alice").await;
    let session_id = session["sessionId"].as_str().unwrap();
    backdate(&app, session_id, 120).await;

    let (status, body) = call(
      &app,
      post_json(
        "/heartbeat",
        json::json!({
          "sessionToken": session["sessionToken"],
          "timestamp": utils::now_ms(),
        }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status"], "session_terminated");
    assert_eq!(body["sessionId"], session_id);

    // the ended session's credential is no longer honoured
    let (status, _) = call(
      &app,
      post_json(
        "/heartbeat",
        json::json!({
          "sessionToken": session["sessionToken"],
          "timestamp": utils::now_ms(),
        }),
      ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn test_end_session_is_idempotent() {
    let app = app().await;
    let session = open_session(&app, "alice").await;
    let session_id = session["sessionId"].as_str().unwrap();
    backdate(&app, session_id, 45).await;

    let end = json::json!({ "sessionToken": session["sessionToken"] });
    let request = post_json("/session/end", end.clone());
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quotaUsed"], 45);

    let (status, body) = call(&app, post_json("/session/end", end)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quotaUsed"], 0);

    let request = Request::get("/usage/alice").body(Body::empty()).unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalSecondsConsumed"], 45);
    assert_eq!(body["sessionTimeRemaining"], 1755);
    assert_eq!(body["activeSessions"], 0);
  }

  #[tokio::test]
  async fn test_admin_routes_require_secret() {
    let app = app().await;

    let request = post_json("/admin/usage/alice/reset", json::json!({}));
    let (status, _) = call(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::post("/admin/usage/alice/reset")
      .header("content-type", "application/json")
      .header("x-admin-secret", "admin")
      .body(Body::from(r#"{"seconds":42}"#))
      .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionTimeRemaining"], 42);

    let request = Request::post("/admin/limits/alice")
      .header("content-type", "application/json")
      .header("x-admin-secret", "admin")
      .body(Body::from(r#"{"enabled":false}"#))
      .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert_eq!(body["maxConcurrentSessions"], 1);

    let (status, body) =
      call(&app, post_json("/session", json::json!({ "userId": "alice" })))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["reason"], "disabled");
  }
}
