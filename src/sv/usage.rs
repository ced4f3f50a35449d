//! Session admission, heartbeat accounting and reclamation.
//!
//! The remaining balance of a period is decremented on exactly one path: the
//! per-heartbeat charge in [`Usage::charge`], which `end_session` reuses for
//! the tail since the last beat. Ending a session only adds its usage to the
//! period total.
//!
//! Every session closed through [`Usage::end_session`] is also terminated on
//! its push channel. Quota exhaustion during a heartbeat is the exception:
//! the caller forwards the outcome to the monitor, which terminates the
//! channel after the final quota update.

use std::future::Future;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
  entity::{active_session, user_usage},
  monitor::Monitor,
  prelude::*,
  state::Config,
  sv::{Store, Tokens, store::SessionPatch, token::SessionToken},
};

/// Per-key async locks serialising work on one session (or one user's
/// admission).
pub type Locks = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
  Normal,
  QuotaExceeded,
  Expired,
  Stale,
  Admin,
}

impl EndReason {
  pub fn message(self) -> &'static str {
    match self {
      EndReason::Normal => "Session ended",
      EndReason::QuotaExceeded => {
        "Conversation time for this period is used up"
      }
      EndReason::Expired => "Session time limit reached",
      EndReason::Stale => "Session closed after missed heartbeats",
      EndReason::Admin => "Session closed by an administrator",
    }
  }

  /// An abandoned session is presumed dead since its last heartbeat.
  fn charges_tail(self) -> bool {
    !matches!(self, EndReason::Stale)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningKind {
  #[serde(rename = "QUOTA_WARNING")]
  Warning,
  #[serde(rename = "QUOTA_EXCEEDED")]
  Exceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWarning {
  #[serde(rename = "type")]
  pub kind: WarningKind,
  pub remaining_seconds: i64,
  /// Graduated threshold that was crossed, `0` once exhausted
  pub threshold_seconds: i64,
  pub message: String,
}

impl QuotaWarning {
  fn exceeded() -> Self {
    Self {
      kind: WarningKind::Exceeded,
      remaining_seconds: 0,
      threshold_seconds: 0,
      message: "Conversation time is used up, the session has ended".into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
  /// Duration granted to a new session
  pub session_time_limit: i64,
  pub quota_remaining: i64,
  pub warning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
  Allowed(Allowance),
  Denied(Denial),
}

#[derive(Debug, Clone)]
pub struct CreatedSession {
  pub token: String,
  pub heartbeat_token: String,
  pub claims: SessionToken,
  pub allowance: Allowance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedSession {
  pub session_id: String,
  pub user_id: String,
  pub reason: EndReason,
  pub quota_used_seconds: i64,
}

/// Result of authenticating a session credential.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCheck {
  Valid(active_session::Model),
  /// The credential was authentic but expired; its session was closed.
  Ended(EndedSession),
  Invalid,
}

impl SessionCheck {
  pub fn valid(self) -> Option<active_session::Model> {
    match self {
      SessionCheck::Valid(session) => Some(session),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatOutcome {
  pub session_id: String,
  pub incremental_seconds: i64,
  pub quota_used_seconds: i64,
  /// Remaining balance of the period
  pub session_time_remaining: i64,
  /// Lesser of the period balance and what is left of the session grant
  pub quota_remaining: i64,
  pub warning: Option<QuotaWarning>,
  pub terminated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
  pub session_id: String,
  pub quota_remaining: i64,
  pub session_time_remaining: i64,
  pub quota_used_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
  pub user_id: String,
  pub period: String,
  pub total_seconds_consumed: i64,
  pub session_time_remaining: i64,
  pub enabled: bool,
  pub max_concurrent_sessions: i32,
  pub active_sessions: u64,
}

/// Holds a key of [`Locks`]; the entry is dropped once nobody else waits
/// on it.
struct KeyLock<'a> {
  locks: &'a Locks,
  key: String,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
  fn drop(&mut self) {
    drop(self.guard.take());
    self.locks.remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
  }
}

struct Charge {
  incremental: i64,
  quota_used: i64,
  period_remaining: i64,
}

pub struct Usage<'a> {
  store: Store<'a>,
  tokens: &'a Tokens,
  config: &'a Config,
  locks: &'a Locks,
  monitor: &'a Monitor,
}

impl<'a> Usage<'a> {
  pub fn new(
    store: Store<'a>,
    tokens: &'a Tokens,
    config: &'a Config,
    locks: &'a Locks,
    monitor: &'a Monitor,
  ) -> Self {
    Self { store, tokens, config, locks, monitor }
  }

  pub async fn validate_session_creation(
    &self,
    user_id: &str,
  ) -> Result<Admission> {
    self.bounded(self.admit(user_id)).await
  }

  pub async fn create_session(
    &self,
    user_id: &str,
    ip_address: Option<&str>,
  ) -> Result<Option<CreatedSession>> {
    self
      .bounded(async {
        let _guard = self.lock(&format!("user:{user_id}")).await;

        let allowance = match self.admit(user_id).await? {
          Admission::Allowed(allowance) => allowance,
          Admission::Denied(denial) => {
            warn!("Session for `{user_id}` denied: {}", denial.message);
            return Ok(None);
          }
        };

        let session_id = new_session_id();
        let (token, claims) = self.tokens.issue(
          user_id,
          &session_id,
          allowance.session_time_limit,
          ip_address,
        )?;
        let (heartbeat_token, _) =
          self.tokens.issue_heartbeat(user_id, &session_id)?;

        let start = utils::from_ms(claims.issued_at_ms);
        self
          .store
          .create_active_session(active_session::Model {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            start_time: start,
            last_heartbeat: start,
            quota_used_seconds: 0,
            quota_granted_seconds: allowance.session_time_limit,
            token_expiry: utils::from_ms(claims.expires_at_ms),
            ip_address: ip_address.map(Into::into),
          })
          .await?;

        info!(
          "Session `{session_id}` created for `{user_id}` ({}s granted)",
          allowance.session_time_limit
        );

        Ok(Some(CreatedSession { token, heartbeat_token, claims, allowance }))
      })
      .await
  }

  pub async fn validate_session(&self, token: &str) -> Result<SessionCheck> {
    let Some(claims) = self.tokens.verify(token) else {
      if let Some(expired) = self.tokens.inspect(token)
        && expired.is_expired()
        && let Some(ended) =
          self.end_session(&expired.session_id, EndReason::Expired).await?
      {
        return Ok(SessionCheck::Ended(ended));
      }
      return Ok(SessionCheck::Invalid);
    };

    let session = self.store.active_session(&claims.session_id).await?;
    Ok(match session {
      Some(session) if session.user_id == claims.user_id => {
        SessionCheck::Valid(session)
      }
      _ => SessionCheck::Invalid,
    })
  }

  /// Heartbeat credentials expire long before the session does, so the
  /// session's own expiry comes from its row.
  pub async fn validate_heartbeat_token(
    &self,
    token: &str,
  ) -> Result<SessionCheck> {
    let Some(claims) = self.tokens.verify_heartbeat(token) else {
      return Ok(SessionCheck::Invalid);
    };

    let Some(session) = self.store.active_session(&claims.session_id).await?
    else {
      return Ok(SessionCheck::Invalid);
    };

    if session.user_id != claims.user_id {
      return Ok(SessionCheck::Invalid);
    }

    if session.token_expiry < utils::now() {
      return Ok(
        match self.end_session(&session.session_id, EndReason::Expired).await? {
          Some(ended) => SessionCheck::Ended(ended),
          None => SessionCheck::Invalid,
        },
      );
    }

    Ok(SessionCheck::Valid(session))
  }

  /// Charges the wall-clock time since the last accepted heartbeat.
  ///
  /// Returns `None` when the session no longer exists.
  pub async fn process_heartbeat(
    &self,
    session_id: &str,
  ) -> Result<Option<HeartbeatOutcome>> {
    let _guard = self.lock(session_id).await;

    self
      .bounded(async {
        let Some(session) = self.store.active_session(session_id).await? else {
          debug!("Heartbeat for unknown session `{session_id}`");
          return Ok(None);
        };

        let now = utils::now();
        let txn = self.store.begin().await?;
        let charge = self.charge(&Store::new(&txn), &session, now).await?;
        txn.commit().await?;

        let session_left = session.quota_granted_seconds - charge.quota_used;
        let quota_remaining = charge.period_remaining.min(session_left).max(0);
        let warning = self.assess(quota_remaining);
        let terminated =
          matches!(&warning, Some(w) if w.kind == WarningKind::Exceeded);

        debug!(
          "Heartbeat `{session_id}`: +{}s, used {}s, {}s left",
          charge.incremental, charge.quota_used, quota_remaining
        );

        if terminated {
          self.finish(session_id, EndReason::QuotaExceeded).await?;
        }

        Ok(Some(HeartbeatOutcome {
          session_id: session_id.to_string(),
          incremental_seconds: charge.incremental,
          quota_used_seconds: charge.quota_used,
          session_time_remaining: charge.period_remaining,
          quota_remaining,
          warning,
          terminated,
        }))
      })
      .await
  }

  /// Idempotent: ending an unknown session is `Ok(None)`.
  pub async fn end_session(
    &self,
    session_id: &str,
    reason: EndReason,
  ) -> Result<Option<EndedSession>> {
    let ended = {
      let _guard = self.lock(session_id).await;
      self.finish(session_id, reason).await?
    };

    if ended.is_some() {
      self.monitor.terminate(session_id, reason, reason.message());
    }
    Ok(ended)
  }

  /// Periodic reclamation of stale, expired and exhausted sessions.
  pub async fn cleanup_expired_sessions(&self) -> Result<Vec<EndedSession>> {
    let now = utils::now();
    let period = utils::period_of(now);
    let sessions = self.store.all_active_sessions().await?;
    let mut ended = Vec::new();
    let mut failed = false;

    for session in sessions {
      let reason = if self.is_stale(&session, now) {
        EndReason::Stale
      } else if session.token_expiry <= now {
        EndReason::Expired
      } else {
        match self.store.user_usage(&session.user_id, &period).await {
          Ok(Some(usage)) if usage.session_time_remaining_seconds <= 0 => {
            EndReason::QuotaExceeded
          }
          Ok(_) => continue,
          Err(err) => {
            error!(
              "Sweep could not load usage of `{}`: {err}",
              session.user_id
            );
            failed = true;
            continue;
          }
        }
      };

      match self.end_session(&session.session_id, reason).await {
        Ok(Some(session)) => ended.push(session),
        Ok(None) => {}
        Err(err) => {
          error!("Sweep failed to end `{}`: {err}", session.session_id);
          failed = true;
        }
      }
    }

    // rows that failed to end are retried next tick, not dropped unreconciled
    if failed {
      return Ok(ended);
    }

    // only rows that outlived a whole sweep interval past their expiry
    let cutoff = now - utils::delta(self.config.sweep_interval);
    let purged = self.store.cleanup_expired_sessions(cutoff).await?;
    if purged > 0 {
      warn!("Purged {purged} expired session rows without reconciliation");
    }

    Ok(ended)
  }

  pub async fn status(
    &self,
    session: &active_session::Model,
  ) -> Result<SessionStatus> {
    let usage = self.period_usage(&self.store, &session.user_id).await?;
    let remaining = usage.session_time_remaining_seconds;

    Ok(SessionStatus {
      session_id: session.session_id.clone(),
      quota_remaining: remaining.min(session.session_remaining()).max(0),
      session_time_remaining: remaining,
      quota_used_seconds: session.quota_used_seconds,
    })
  }

  pub async fn user_status(&self, user_id: &str) -> Result<UserStatus> {
    let limits =
      self.store.user_limits(user_id, self.config.default_limits()).await?;
    let usage = self.period_usage(&self.store, user_id).await?;
    let active_sessions = self.store.count_user_active_sessions(user_id).await?;

    Ok(UserStatus {
      user_id: user_id.to_string(),
      period: usage.period,
      total_seconds_consumed: usage.total_seconds_consumed,
      session_time_remaining: usage.session_time_remaining_seconds,
      enabled: limits.enabled,
      max_concurrent_sessions: limits.max_concurrent_sessions,
      active_sessions,
    })
  }

  /// Admin reset of the current period's balance, the only way it grows.
  pub async fn reset_usage(
    &self,
    user_id: &str,
    seconds: Option<i64>,
  ) -> Result<user_usage::Model> {
    let seconds =
      seconds.unwrap_or(self.config.initial_allowance_seconds).max(0);
    let usage = user_usage::Model {
      session_time_remaining_seconds: seconds,
      updated_at: utils::now(),
      ..self.period_usage(&self.store, user_id).await?
    };

    self.store.upsert_user_usage(usage.clone()).await?;
    info!("Usage of `{user_id}` reset to {seconds}s");
    Ok(usage)
  }

  async fn admit(&self, user_id: &str) -> Result<Admission> {
    let limits =
      self.store.user_limits(user_id, self.config.default_limits()).await?;

    if !limits.enabled {
      return Ok(Admission::Denied(Denial {
        reason: DenyReason::Disabled,
        message: "Voice sessions are disabled for this account".into(),
        quota_remaining: 0,
        session_time_remaining: 0,
      }));
    }

    let now = utils::now();
    let mut active = 0;
    for session in self.store.user_active_sessions(user_id).await? {
      if self.is_stale(&session, now) {
        info!("Reclaiming stale session `{}`", session.session_id);
        self.end_session(&session.session_id, EndReason::Stale).await?;
      } else {
        active += 1;
      }
    }

    let usage = self.period_usage(&self.store, user_id).await?;
    let remaining = usage.session_time_remaining_seconds;
    let quota_remaining = remaining.min(self.config.max_session_seconds);

    if active >= limits.max_concurrent_sessions {
      return Ok(Admission::Denied(Denial {
        reason: DenyReason::ConcurrentLimit,
        message: "Maximum concurrent sessions reached".into(),
        quota_remaining,
        session_time_remaining: remaining,
      }));
    }

    if remaining < self.config.min_session_seconds {
      return Ok(Admission::Denied(Denial {
        reason: DenyReason::QuotaExhausted,
        message: "Not enough conversation time left this period".into(),
        quota_remaining,
        session_time_remaining: remaining,
      }));
    }

    Ok(Admission::Allowed(Allowance {
      session_time_limit: quota_remaining,
      quota_remaining: remaining,
      warning: remaining <= self.config.warning_threshold(),
    }))
  }

  /// Must be called with the session's lock held.
  async fn finish(
    &self,
    session_id: &str,
    reason: EndReason,
  ) -> Result<Option<EndedSession>> {
    let Some(session) = self.store.active_session(session_id).await? else {
      return Ok(None);
    };

    let now = utils::now();
    // a heartbeat may have landed after the sweep took its snapshot
    if reason == EndReason::Stale && !self.is_stale(&session, now) {
      return Ok(None);
    }

    let txn = self.store.begin().await?;
    let store = Store::new(&txn);

    let mut used = session.quota_used_seconds;
    if reason.charges_tail() {
      let until = now.min(session.token_expiry);
      used = self.charge(&store, &session, until).await?.quota_used;
    }

    let usage = self.period_usage(&store, &session.user_id).await?;
    store
      .upsert_user_usage(user_usage::Model {
        total_seconds_consumed: usage.total_seconds_consumed + used,
        updated_at: now,
        ..usage
      })
      .await?;
    store.delete_active_session(session_id).await?;
    txn.commit().await?;

    info!(
      "Session `{session_id}` of `{}` ended ({reason:?}, {used}s used)",
      session.user_id
    );

    Ok(Some(EndedSession {
      session_id: session.session_id,
      user_id: session.user_id,
      reason,
      quota_used_seconds: used,
    }))
  }

  /// Moves `last_heartbeat` forward by whole seconds up to `until` and
  /// charges them to both the session and the period balance. The sub-second
  /// remainder is carried into the next charge.
  async fn charge<C: ConnectionTrait>(
    &self,
    store: &Store<'_, C>,
    session: &active_session::Model,
    until: DateTime,
  ) -> Result<Charge> {
    let incremental =
      ((until - session.last_heartbeat).num_milliseconds() / 1000).max(0);
    let mut usage = self.period_usage(store, &session.user_id).await?;

    if incremental == 0 {
      return Ok(Charge {
        incremental,
        quota_used: session.quota_used_seconds,
        period_remaining: usage.session_time_remaining_seconds,
      });
    }

    let quota_used = session.quota_used_seconds + incremental;
    store
      .update_active_session(
        &session.session_id,
        SessionPatch {
          last_heartbeat: Some(
            session.last_heartbeat + TimeDelta::seconds(incremental),
          ),
          quota_used_seconds: Some(quota_used),
          ..Default::default()
        },
      )
      .await?;

    usage.session_time_remaining_seconds =
      (usage.session_time_remaining_seconds - incremental).max(0);
    usage.updated_at = utils::now();
    let period_remaining = usage.session_time_remaining_seconds;
    store.upsert_user_usage(usage).await?;

    Ok(Charge { incremental, quota_used, period_remaining })
  }

  /// Current period's bucket, created with the initial allowance if absent.
  async fn period_usage<C: ConnectionTrait>(
    &self,
    store: &Store<'_, C>,
    user_id: &str,
  ) -> Result<user_usage::Model> {
    let now = utils::now();
    let period = utils::period_of(now);

    if let Some(usage) = store.user_usage(user_id, &period).await? {
      return Ok(usage);
    }

    store
      .insert_user_usage_if_absent(user_usage::Model {
        user_id: user_id.to_string(),
        period: period.clone(),
        total_seconds_consumed: 0,
        session_time_remaining_seconds: self.config.initial_allowance_seconds,
        updated_at: now,
      })
      .await?;

    store.user_usage(user_id, &period).await?.ok_or_else(|| {
      Error::Internal(format!("Usage bucket for `{user_id}` vanished"))
    })
  }

  fn assess(&self, remaining: i64) -> Option<QuotaWarning> {
    if remaining <= 0 {
      return Some(QuotaWarning::exceeded());
    }

    let threshold = self
      .config
      .warning_thresholds
      .iter()
      .copied()
      .filter(|&threshold| remaining <= threshold)
      .min()?;

    Some(QuotaWarning {
      kind: WarningKind::Warning,
      remaining_seconds: remaining,
      threshold_seconds: threshold,
      message: format!(
        "{} of conversation time remaining",
        utils::format_duration(remaining)
      ),
    })
  }

  fn is_stale(&self, session: &active_session::Model, now: DateTime) -> bool {
    now - session.last_heartbeat > utils::delta(self.config.stale_after)
  }

  async fn lock(&self, key: &str) -> KeyLock<'a> {
    // declared first so a cancelled wait still releases the entry
    let mut lock =
      KeyLock { locks: self.locks, key: key.to_string(), guard: None };
    let mutex = self.locks.entry(key.to_string()).or_default().clone();
    lock.guard = Some(mutex.lock_owned().await);
    lock
  }

  /// Store work on the request path fails closed when storage stalls.
  async fn bounded<T>(
    &self,
    fut: impl Future<Output = Result<T>>,
  ) -> Result<T> {
    time::timeout(self.config.store_timeout, fut)
      .await
      .map_err(|_| Error::Timeout)?
  }
}

fn new_session_id() -> String {
  let suffix = Uuid::new_v4().simple().to_string();
  format!("sess_{}_{}", utils::now_ms(), &suffix[..12])
}
