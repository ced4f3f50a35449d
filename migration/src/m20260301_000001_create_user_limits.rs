use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(UserLimits::Table)
          .if_not_exists()
          .col(
            ColumnDef::new(UserLimits::UserId)
              .string()
              .not_null()
              .primary_key(),
          )
          .col(
            ColumnDef::new(UserLimits::Enabled)
              .boolean()
              .not_null()
              .default(true),
          )
          .col(
            ColumnDef::new(UserLimits::MaxConcurrentSessions)
              .integer()
              .not_null()
              .default(1),
          )
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager.drop_table(Table::drop().table(UserLimits::Table).to_owned()).await
  }
}

#[derive(DeriveIden)]
pub enum UserLimits {
  Table,
  UserId,
  Enabled,
  MaxConcurrentSessions,
}
