use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(UserUsage::Table)
          .if_not_exists()
          .col(ColumnDef::new(UserUsage::UserId).string().not_null())
          .col(ColumnDef::new(UserUsage::Period).string().not_null())
          .col(
            ColumnDef::new(UserUsage::TotalSecondsConsumed)
              .big_integer()
              .not_null()
              .default(0),
          )
          .col(
            ColumnDef::new(UserUsage::SessionTimeRemainingSeconds)
              .big_integer()
              .not_null()
              .default(0),
          )
          .col(ColumnDef::new(UserUsage::UpdatedAt).date_time().not_null())
          .primary_key(
            Index::create().col(UserUsage::UserId).col(UserUsage::Period),
          )
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager.drop_table(Table::drop().table(UserUsage::Table).to_owned()).await
  }
}

#[derive(DeriveIden)]
pub enum UserUsage {
  Table,
  UserId,
  Period,
  TotalSecondsConsumed,
  SessionTimeRemainingSeconds,
  UpdatedAt,
}
