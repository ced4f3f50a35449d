pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_user_limits;
mod m20260301_000002_create_user_usage;
mod m20260301_000003_create_active_sessions;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
  fn migrations() -> Vec<Box<dyn MigrationTrait>> {
    vec![
      Box::new(m20260301_000001_create_user_limits::Migration),
      Box::new(m20260301_000002_create_user_usage::Migration),
      Box::new(m20260301_000003_create_active_sessions::Migration),
    ]
  }
}
