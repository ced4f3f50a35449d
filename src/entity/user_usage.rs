//! Monthly accounting bucket, keyed by `(user_id, period)`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_usage")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub user_id: String,
  /// Calendar month in `YYYY-MM` form
  #[sea_orm(primary_key, auto_increment = false)]
  pub period: String,
  pub total_seconds_consumed: i64,
  /// Floored at zero; only an admin reset may raise it
  pub session_time_remaining_seconds: i64,
  pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
