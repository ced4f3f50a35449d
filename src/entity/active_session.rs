use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "active_sessions")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub session_id: String,
  pub user_id: String,
  pub start_time: DateTime,
  pub last_heartbeat: DateTime,
  pub quota_used_seconds: i64,
  /// Duration admitted at creation, also the token lifetime
  pub quota_granted_seconds: i64,
  pub token_expiry: DateTime,
  pub ip_address: Option<String>,
}

impl Model {
  pub fn session_remaining(&self) -> i64 {
    self.quota_granted_seconds - self.quota_used_seconds
  }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
