use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(ActiveSessions::Table)
          .if_not_exists()
          .col(
            ColumnDef::new(ActiveSessions::SessionId)
              .string()
              .not_null()
              .primary_key(),
          )
          .col(ColumnDef::new(ActiveSessions::UserId).string().not_null())
          .col(ColumnDef::new(ActiveSessions::StartTime).date_time().not_null())
          .col(
            ColumnDef::new(ActiveSessions::LastHeartbeat)
              .date_time()
              .not_null(),
          )
          .col(
            ColumnDef::new(ActiveSessions::QuotaUsedSeconds)
              .big_integer()
              .not_null()
              .default(0),
          )
          .col(
            ColumnDef::new(ActiveSessions::QuotaGrantedSeconds)
              .big_integer()
              .not_null(),
          )
          .col(
            ColumnDef::new(ActiveSessions::TokenExpiry).date_time().not_null(),
          )
          .col(ColumnDef::new(ActiveSessions::IpAddress).string().null())
          .to_owned(),
      )
      .await?;

    manager
      .create_index(
        Index::create()
          .name("idx_active_sessions_user")
          .table(ActiveSessions::Table)
          .col(ActiveSessions::UserId)
          .to_owned(),
      )
      .await?;

    manager
      .create_index(
        Index::create()
          .name("idx_active_sessions_heartbeat")
          .table(ActiveSessions::Table)
          .col(ActiveSessions::LastHeartbeat)
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .drop_table(Table::drop().table(ActiveSessions::Table).to_owned())
      .await
  }
}

#[derive(DeriveIden)]
pub enum ActiveSessions {
  Table,
  SessionId,
  UserId,
  StartTime,
  LastHeartbeat,
  QuotaUsedSeconds,
  QuotaGrantedSeconds,
  TokenExpiry,
  IpAddress,
}
