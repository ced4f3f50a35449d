use sea_orm::{
  DatabaseTransaction,
  sea_query::{Expr, OnConflict},
};
use serde::Serialize;

use crate::{
  entity::{active_session, user_limits, user_usage},
  prelude::*,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
  pub enabled: bool,
  pub max_concurrent_sessions: i32,
}

/// Partial update of an active session; `None` fields are left untouched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionPatch {
  pub last_heartbeat: Option<DateTime>,
  pub quota_used_seconds: Option<i64>,
  pub token_expiry: Option<DateTime>,
}

impl SessionPatch {
  fn is_empty(&self) -> bool {
    self.last_heartbeat.is_none()
      && self.quota_used_seconds.is_none()
      && self.token_expiry.is_none()
  }
}

/// Durable usage records. Generic over the connection so that multi-row
/// updates can run inside a transaction.
pub struct Store<'a, C = DatabaseConnection> {
  db: &'a C,
}

impl<C> Clone for Store<'_, C> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<C> Copy for Store<'_, C> {}

impl<'a> Store<'a> {
  pub async fn begin(&self) -> Result<DatabaseTransaction> {
    Ok(self.db.begin().await?)
  }
}

impl<'a, C: ConnectionTrait> Store<'a, C> {
  pub fn new(db: &'a C) -> Self {
    Self { db }
  }

  pub async fn user_limits(
    &self,
    user_id: &str,
    defaults: Limits,
  ) -> Result<Limits> {
    let limits = user_limits::Entity::find_by_id(user_id)
      .one(self.db)
      .await?
      .map(|model| Limits {
        enabled: model.enabled,
        max_concurrent_sessions: model.max_concurrent_sessions,
      })
      .unwrap_or(defaults);

    Ok(limits)
  }

  pub async fn set_user_limits(
    &self,
    user_id: &str,
    limits: Limits,
  ) -> Result<()> {
    let model = user_limits::ActiveModel {
      user_id: Set(user_id.to_string()),
      enabled: Set(limits.enabled),
      max_concurrent_sessions: Set(limits.max_concurrent_sessions),
    };

    user_limits::Entity::insert(model)
      .on_conflict(
        OnConflict::column(user_limits::Column::UserId)
          .update_columns([
            user_limits::Column::Enabled,
            user_limits::Column::MaxConcurrentSessions,
          ])
          .to_owned(),
      )
      .exec_without_returning(self.db)
      .await?;

    Ok(())
  }

  pub async fn user_usage(
    &self,
    user_id: &str,
    period: &str,
  ) -> Result<Option<user_usage::Model>> {
    let usage =
      user_usage::Entity::find_by_id((user_id.to_string(), period.to_string()))
        .one(self.db)
        .await?;
    Ok(usage)
  }

  pub async fn upsert_user_usage(
    &self,
    usage: user_usage::Model,
  ) -> Result<()> {
    user_usage::Entity::insert(usage_model(usage))
      .on_conflict(
        OnConflict::columns([
          user_usage::Column::UserId,
          user_usage::Column::Period,
        ])
        .update_columns([
          user_usage::Column::TotalSecondsConsumed,
          user_usage::Column::SessionTimeRemainingSeconds,
          user_usage::Column::UpdatedAt,
        ])
        .to_owned(),
      )
      .exec_without_returning(self.db)
      .await?;

    Ok(())
  }

  /// Inserts the bucket unless one already exists for `(user_id, period)`.
  pub async fn insert_user_usage_if_absent(
    &self,
    usage: user_usage::Model,
  ) -> Result<()> {
    user_usage::Entity::insert(usage_model(usage))
      .on_conflict(
        OnConflict::columns([
          user_usage::Column::UserId,
          user_usage::Column::Period,
        ])
        .do_nothing()
        .to_owned(),
      )
      .exec_without_returning(self.db)
      .await?;

    Ok(())
  }

  pub async fn create_active_session(
    &self,
    session: active_session::Model,
  ) -> Result<()> {
    active_session::ActiveModel {
      session_id: Set(session.session_id),
      user_id: Set(session.user_id),
      start_time: Set(session.start_time),
      last_heartbeat: Set(session.last_heartbeat),
      quota_used_seconds: Set(session.quota_used_seconds),
      quota_granted_seconds: Set(session.quota_granted_seconds),
      token_expiry: Set(session.token_expiry),
      ip_address: Set(session.ip_address),
    }
    .insert(self.db)
    .await?;

    Ok(())
  }

  pub async fn active_session(
    &self,
    session_id: &str,
  ) -> Result<Option<active_session::Model>> {
    let session =
      active_session::Entity::find_by_id(session_id).one(self.db).await?;
    Ok(session)
  }

  /// Returns whether a row was matched.
  pub async fn update_active_session(
    &self,
    session_id: &str,
    patch: SessionPatch,
  ) -> Result<bool> {
    if patch.is_empty() {
      return Ok(self.active_session(session_id).await?.is_some());
    }

    let mut update = active_session::Entity::update_many()
      .filter(active_session::Column::SessionId.eq(session_id));

    if let Some(last_heartbeat) = patch.last_heartbeat {
      update = update.col_expr(
        active_session::Column::LastHeartbeat,
        Expr::value(last_heartbeat),
      );
    }
    if let Some(used) = patch.quota_used_seconds {
      update = update
        .col_expr(active_session::Column::QuotaUsedSeconds, Expr::value(used));
    }
    if let Some(expiry) = patch.token_expiry {
      update = update
        .col_expr(active_session::Column::TokenExpiry, Expr::value(expiry));
    }

    let result = update.exec(self.db).await?;
    Ok(result.rows_affected > 0)
  }

  pub async fn delete_active_session(&self, session_id: &str) -> Result<bool> {
    let result =
      active_session::Entity::delete_by_id(session_id).exec(self.db).await?;
    Ok(result.rows_affected > 0)
  }

  pub async fn user_active_sessions(
    &self,
    user_id: &str,
  ) -> Result<Vec<active_session::Model>> {
    let sessions = active_session::Entity::find()
      .filter(active_session::Column::UserId.eq(user_id))
      .order_by_asc(active_session::Column::StartTime)
      .all(self.db)
      .await?;
    Ok(sessions)
  }

  pub async fn all_active_sessions(
    &self,
  ) -> Result<Vec<active_session::Model>> {
    let sessions = active_session::Entity::find()
      .order_by_asc(active_session::Column::LastHeartbeat)
      .all(self.db)
      .await?;
    Ok(sessions)
  }

  pub async fn count_user_active_sessions(&self, user_id: &str) -> Result<u64> {
    let count = active_session::Entity::find()
      .filter(active_session::Column::UserId.eq(user_id))
      .count(self.db)
      .await?;
    Ok(count)
  }

  /// Drops rows whose token expired before `cutoff`, without any usage
  /// reconciliation.
  pub async fn cleanup_expired_sessions(
    &self,
    cutoff: DateTime,
  ) -> Result<u64> {
    let result = active_session::Entity::delete_many()
      .filter(active_session::Column::TokenExpiry.lt(cutoff))
      .exec(self.db)
      .await?;
    Ok(result.rows_affected)
  }
}

fn usage_model(usage: user_usage::Model) -> user_usage::ActiveModel {
  user_usage::ActiveModel {
    user_id: Set(usage.user_id),
    period: Set(usage.period),
    total_seconds_consumed: Set(usage.total_seconds_consumed),
    session_time_remaining_seconds: Set(usage.session_time_remaining_seconds),
    updated_at: Set(usage.updated_at),
  }
}
