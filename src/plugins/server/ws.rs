//! WebSocket side of the push channel.

use axum::{
  extract::{
    Query, State,
    ws::{Message, WebSocket, WebSocketUpgrade},
  },
  http::{HeaderMap, header},
  response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
  monitor::{Envelope, Outbound, Push},
  prelude::*,
  state::AppState,
  sv::usage::{SessionCheck, SessionStatus},
};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
  pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
  Ping,
  StatusRequest,
}

pub async fn connect(
  State(app): State<Arc<AppState>>,
  Query(query): Query<ConnectQuery>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Result<Response> {
  let status = authenticate(&app, query, &headers).await?;
  Ok(ws.on_upgrade(move |socket| serve(app, socket, status)))
}

async fn authenticate(
  app: &AppState,
  query: ConnectQuery,
  headers: &HeaderMap,
) -> Result<SessionStatus> {
  let bearer = headers
    .get(header::AUTHORIZATION)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.strip_prefix("Bearer "))
    .map(|token| token.trim().to_string());

  let token = query
    .token
    .filter(|token| !token.is_empty())
    .or(bearer)
    .ok_or(Error::InvalidCredential)?;

  let usage = app.sv().usage;
  match usage.validate_session(&token).await? {
    SessionCheck::Valid(session) => usage.status(&session).await,
    SessionCheck::Ended(_) | SessionCheck::Invalid => {
      Err(Error::InvalidCredential)
    }
  }
}

async fn serve(app: Arc<AppState>, socket: WebSocket, status: SessionStatus) {
  let session_id = status.session_id;
  let (mut sink, mut stream) = socket.split();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let conn_id = app.monitor.register(&session_id, status.quota_remaining, tx);

  let mut writer = tokio::spawn(async move {
    while let Some(outbound) = rx.recv().await {
      let message = match outbound {
        Outbound::Push(push) => match json::to_string(&Envelope::new(&push)) {
          Ok(text) => Message::Text(text.into()),
          Err(err) => {
            error!("Failed to encode push message: {err}");
            continue;
          }
        },
        Outbound::Close => {
          let _ = sink.send(Message::Close(None)).await;
          break;
        }
      };
      if sink.send(message).await.is_err() {
        break;
      }
    }
  });

  loop {
    tokio::select! {
      _ = &mut writer => break,
      message = stream.next() => match message {
        Some(Ok(Message::Text(text))) => {
          on_message(&app, &session_id, text.as_str()).await;
        }
        Some(Ok(Message::Ping(_))) => {
          app.monitor.touch(&session_id);
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        Some(Ok(_)) => {}
      }
    }
  }

  app.monitor.deregister(&session_id, conn_id);
  writer.abort();
}

async fn on_message(app: &AppState, session_id: &str, text: &str) {
  let message = match json::from_str::<ClientMessage>(text) {
    Ok(message) => message,
    Err(err) => {
      debug!("Ignoring client message on `{session_id}`: {err}");
      return;
    }
  };

  app.monitor.touch(session_id);
  match message {
    ClientMessage::Ping => {
      app.monitor.send(session_id, Push::Pong);
    }
    ClientMessage::StatusRequest => match snapshot(app, session_id).await {
      Ok(Some(status)) => {
        app.monitor.send(session_id, Push::Status(status));
      }
      Ok(None) => {}
      Err(err) => error!("Status snapshot for `{session_id}` failed: {err}"),
    },
  }
}

async fn snapshot(
  app: &AppState,
  session_id: &str,
) -> Result<Option<SessionStatus>> {
  let sv = app.sv();
  match sv.store.active_session(session_id).await? {
    Some(session) => Ok(Some(sv.usage.status(&session).await?)),
    None => Ok(None),
  }
}
