//! Live push channels mirroring quota state to connected clients.
//!
//! The map below is a cache keyed by session id. It is filled on connect and
//! purged on disconnect, reap, termination and shutdown; losing it costs no
//! accounting, since a reconnecting client re-syncs from the store.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
  prelude::*,
  sv::usage::{EndReason, QuotaWarning, SessionStatus, WarningKind},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
  tag = "type",
  rename_all = "snake_case",
  rename_all_fields = "camelCase"
)]
pub enum Push {
  Connected {
    session_id: String,
    quota_remaining: i64,
  },
  QuotaUpdate {
    session_id: String,
    quota_remaining: i64,
  },
  QuotaWarning {
    remaining_seconds: i64,
    threshold_seconds: i64,
    message: String,
  },
  SessionTerminated {
    reason: EndReason,
    message: String,
  },
  Status(SessionStatus),
  ServerShutdown {
    message: String,
  },
  Pong,
}

/// Wire form of a [`Push`]: its fields plus a millisecond `timestamp`.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
  #[serde(flatten)]
  push: &'a Push,
  timestamp: i64,
}

impl<'a> Envelope<'a> {
  pub fn new(push: &'a Push) -> Self {
    Self { push, timestamp: utils::now_ms() }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
  Push(Push),
  Close,
}

pub type Sender = mpsc::UnboundedSender<Outbound>;

struct Channel {
  conn_id: Uuid,
  quota_remaining: i64,
  warnings_sent: HashSet<i64>,
  last_ping: DateTime,
  tx: Sender,
}

impl Channel {
  fn push(&self, push: Push) {
    // receiver gone means the socket task already ended
    let _ = self.tx.send(Outbound::Push(push));
  }
}

pub struct Monitor {
  channels: DashMap<String, Channel>,
  idle_timeout: Duration,
  close_grace: Duration,
}

impl Monitor {
  pub fn new(idle_timeout: Duration, close_grace: Duration) -> Self {
    Self { channels: DashMap::new(), idle_timeout, close_grace }
  }

  /// Registers a channel and sends the initial snapshot. A newer connection
  /// for the same session replaces (and closes) the older one, inheriting
  /// the warnings it was already sent.
  pub fn register(
    &self,
    session_id: &str,
    quota_remaining: i64,
    tx: Sender,
  ) -> Uuid {
    let conn_id = Uuid::new_v4();
    let mut channel = Channel {
      conn_id,
      quota_remaining,
      warnings_sent: HashSet::new(),
      last_ping: utils::now(),
      tx,
    };

    channel.push(Push::Connected {
      session_id: session_id.to_string(),
      quota_remaining,
    });

    match self.channels.entry(session_id.to_string()) {
      Entry::Occupied(mut entry) => {
        channel.warnings_sent =
          std::mem::take(&mut entry.get_mut().warnings_sent);
        let old = entry.insert(channel);
        debug!("Replacing push channel of `{session_id}`");
        let _ = old.tx.send(Outbound::Close);
      }
      Entry::Vacant(entry) => {
        entry.insert(channel);
      }
    }

    info!("Push channel opened for `{session_id}`");
    conn_id
  }

  /// Drops the channel unless a newer connection already replaced it.
  pub fn deregister(&self, session_id: &str, conn_id: Uuid) {
    if self
      .channels
      .remove_if(session_id, |_, channel| channel.conn_id == conn_id)
      .is_some()
    {
      debug!("Push channel closed for `{session_id}`");
    }
  }

  /// Client-side liveness signal.
  pub fn touch(&self, session_id: &str) -> bool {
    match self.channels.get_mut(session_id) {
      Some(mut channel) => {
        channel.last_ping = utils::now();
        true
      }
      None => false,
    }
  }

  pub fn send(&self, session_id: &str, push: Push) -> bool {
    match self.channels.get(session_id) {
      Some(channel) => {
        channel.push(push);
        true
      }
      None => false,
    }
  }

  pub fn quota_remaining(&self, session_id: &str) -> Option<i64> {
    self.channels.get(session_id).map(|channel| channel.quota_remaining)
  }

  pub fn len(&self) -> usize {
    self.channels.len()
  }

  /// Mirrors a heartbeat result. Each warning threshold is pushed at most
  /// once per session; an exhaustion warning terminates the channel.
  pub fn update_session_quota(
    &self,
    session_id: &str,
    remaining: i64,
    warnings: &[QuotaWarning],
  ) -> bool {
    let exceeded = {
      let Some(mut channel) = self.channels.get_mut(session_id) else {
        return false;
      };

      channel.quota_remaining = remaining;
      channel.push(Push::QuotaUpdate {
        session_id: session_id.to_string(),
        quota_remaining: remaining,
      });

      let mut exceeded = None;
      for warning in warnings {
        if warning.kind == WarningKind::Exceeded {
          exceeded = Some(warning.message.clone());
          continue;
        }
        // dedup happens under the entry lock, so racing updates see it
        if channel.warnings_sent.insert(warning.threshold_seconds) {
          channel.push(Push::QuotaWarning {
            remaining_seconds: warning.remaining_seconds,
            threshold_seconds: warning.threshold_seconds,
            message: warning.message.clone(),
          });
        }
      }
      exceeded
    };

    if let Some(message) = exceeded {
      self.terminate(session_id, EndReason::QuotaExceeded, &message);
    }
    true
  }

  /// Sends a termination notice and closes the channel after the grace delay
  /// so the notice is flushed first.
  pub fn terminate(
    &self,
    session_id: &str,
    reason: EndReason,
    message: &str,
  ) -> bool {
    let Some((_, channel)) = self.channels.remove(session_id) else {
      return false;
    };

    channel.push(Push::SessionTerminated { reason, message: message.into() });
    info!("Push channel of `{session_id}` terminated ({reason:?})");

    let grace = self.close_grace;
    tokio::spawn(async move {
      time::sleep(grace).await;
      let _ = channel.tx.send(Outbound::Close);
    });
    true
  }

  /// Closes channels whose client stopped pinging.
  pub fn reap_idle(&self) -> usize {
    let now = utils::now();
    let timeout = utils::delta(self.idle_timeout);
    let is_idle = |channel: &Channel| now - channel.last_ping > timeout;

    let idle: Vec<String> = self
      .channels
      .iter()
      .filter(|entry| is_idle(entry.value()))
      .map(|entry| entry.key().clone())
      .collect();

    let mut reaped = 0;
    for session_id in idle {
      if let Some((_, channel)) =
        self.channels.remove_if(&session_id, |_, channel| is_idle(channel))
      {
        warn!("Reaping idle push channel of `{session_id}`");
        let _ = channel.tx.send(Outbound::Close);
        reaped += 1;
      }
    }
    reaped
  }

  /// Notifies and closes every channel; returns how many were open.
  pub fn shutdown(&self) -> usize {
    let sessions: Vec<String> =
      self.channels.iter().map(|entry| entry.key().clone()).collect();

    let mut closed = 0;
    for session_id in sessions {
      if let Some((_, channel)) = self.channels.remove(&session_id) {
        channel.push(Push::ServerShutdown {
          message: "Server is restarting, please reconnect".into(),
        });
        let _ = channel.tx.send(Outbound::Close);
        closed += 1;
      }
    }
    closed
  }
}

#[cfg(test)]
mod tests {
  use mpsc::UnboundedReceiver;

  use super::*;

  fn monitor() -> Monitor {
    Monitor::new(Duration::from_secs(90), Duration::from_millis(10))
  }

  fn warning(threshold: i64, remaining: i64) -> QuotaWarning {
    QuotaWarning {
      kind: WarningKind::Warning,
      remaining_seconds: remaining,
      threshold_seconds: threshold,
      message: format!("{remaining}s left"),
    }
  }

  fn exceeded() -> QuotaWarning {
    QuotaWarning {
      kind: WarningKind::Exceeded,
      remaining_seconds: 0,
      threshold_seconds: 0,
      message: "done".into(),
    }
  }

  fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
      out.push(message);
    }
    out
  }

  fn warnings_in(out: &[Outbound]) -> Vec<i64> {
    out
      .iter()
      .filter_map(|message| match message {
        Outbound::Push(Push::QuotaWarning { threshold_seconds, .. }) => {
          Some(*threshold_seconds)
        }
        _ => None,
      })
      .collect()
  }

  #[tokio::test]
  async fn test_register_sends_snapshot() {
    let monitor = monitor();
    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.register("s1", 300, tx);

    assert_eq!(
      drain(&mut rx),
      vec![Outbound::Push(Push::Connected {
        session_id: "s1".into(),
        quota_remaining: 300
      })]
    );
    assert_eq!(monitor.quota_remaining("s1"), Some(300));
  }

  #[tokio::test]
  async fn test_warnings_are_deduplicated() {
    let monitor = monitor();
    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.register("s1", 300, tx);
    drain(&mut rx);

    assert!(monitor.update_session_quota("s1", 110, &[warning(120, 110)]));
    assert!(monitor.update_session_quota("s1", 100, &[warning(120, 100)]));
    assert!(monitor.update_session_quota("s1", 50, &[warning(60, 50)]));

    let out = drain(&mut rx);
    assert_eq!(warnings_in(&out), vec![120, 60]);
    assert_eq!(monitor.quota_remaining("s1"), Some(50));
  }

  #[tokio::test]
  async fn test_reconnect_keeps_sent_warnings() {
    let monitor = monitor();
    let (old_tx, mut old_rx) = mpsc::unbounded_channel();
    monitor.register("s1", 300, old_tx);
    monitor.update_session_quota("s1", 110, &[warning(120, 110)]);

    let (new_tx, mut new_rx) = mpsc::unbounded_channel();
    monitor.register("s1", 110, new_tx);
    monitor.update_session_quota("s1", 100, &[warning(120, 100)]);
    monitor.update_session_quota("s1", 55, &[warning(60, 55)]);

    assert_eq!(warnings_in(&drain(&mut old_rx)), vec![120]);
    assert_eq!(warnings_in(&drain(&mut new_rx)), vec![60]);
  }

  #[tokio::test]
  async fn test_unknown_session_is_ignored() {
    let monitor = monitor();
    assert!(!monitor.update_session_quota("ghost", 10, &[]));
    assert!(!monitor.terminate("ghost", EndReason::Normal, "bye"));
    assert!(!monitor.touch("ghost"));
  }

  #[tokio::test]
  async fn test_exhaustion_terminates_after_grace() {
    let monitor = monitor();
    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.register("s1", 30, tx);
    drain(&mut rx);

    monitor.update_session_quota("s1", 0, &[exceeded()]);
    assert_eq!(monitor.len(), 0);

    let out = drain(&mut rx);
    assert!(matches!(
      out.last(),
      Some(Outbound::Push(Push::SessionTerminated {
        reason: EndReason::QuotaExceeded,
        ..
      }))
    ));
    assert!(!out.contains(&Outbound::Close));

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain(&mut rx), vec![Outbound::Close]);
  }

  #[tokio::test]
  async fn test_reconnect_replaces_channel() {
    let monitor = monitor();
    let (old_tx, mut old_rx) = mpsc::unbounded_channel();
    let old = monitor.register("s1", 300, old_tx);
    let (new_tx, _new_rx) = mpsc::unbounded_channel();
    monitor.register("s1", 280, new_tx);

    assert_eq!(drain(&mut old_rx).last(), Some(&Outbound::Close));

    // the old socket task tearing down must not drop the new channel
    monitor.deregister("s1", old);
    assert_eq!(monitor.len(), 1);
    assert_eq!(monitor.quota_remaining("s1"), Some(280));
  }

  #[tokio::test]
  async fn test_reaper_closes_idle_channels() {
    let monitor = Monitor::new(Duration::ZERO, Duration::from_millis(10));
    let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
    monitor.register("idle", 300, idle_tx);

    time::sleep(Duration::from_millis(5)).await;
    assert_eq!(monitor.reap_idle(), 1);
    assert_eq!(monitor.len(), 0);
    assert_eq!(drain(&mut idle_rx).last(), Some(&Outbound::Close));
  }

  #[tokio::test]
  async fn test_reaper_spares_pinging_clients() {
    let monitor = monitor();
    let (tx, _rx) = mpsc::unbounded_channel();
    monitor.register("s1", 300, tx);

    assert!(monitor.touch("s1"));
    assert_eq!(monitor.reap_idle(), 0);
    assert_eq!(monitor.len(), 1);
  }

  #[tokio::test]
  async fn test_shutdown_broadcasts() {
    let monitor = monitor();
    let mut receivers = Vec::new();
    for session in ["a", "b", "c"] {
      let (tx, rx) = mpsc::unbounded_channel();
      monitor.register(session, 60, tx);
      receivers.push(rx);
    }

    assert_eq!(monitor.shutdown(), 3);
    assert_eq!(monitor.len(), 0);

    for rx in &mut receivers {
      let out = drain(rx);
      assert!(matches!(out[1], Outbound::Push(Push::ServerShutdown { .. })));
      assert_eq!(out[2], Outbound::Close);
    }
  }

  #[test]
  fn test_envelope_wire_format() {
    let push = Push::QuotaWarning {
      remaining_seconds: 50,
      threshold_seconds: 60,
      message: "50s left".into(),
    };
    let value = json::to_value(Envelope::new(&push)).unwrap();

    assert_eq!(value["type"], "quota_warning");
    assert_eq!(value["remainingSeconds"], 50);
    assert_eq!(value["thresholdSeconds"], 60);
    assert!(value["timestamp"].as_i64().unwrap() > 0);

    let value = json::to_value(Envelope::new(&Push::Pong)).unwrap();
    assert_eq!(value["type"], "pong");
  }
}
