use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Jobs::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Jobs::UserId).string().not_null())
                    .col(ColumnDef::new(Jobs::Title).string().not_null())
                    .col(ColumnDef::new(Jobs::CharacterTheme).string().not_null())
                    .col(ColumnDef::new(Jobs::Prompt).text().not_null())
                    .col(
                        ColumnDef::new(Jobs::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Jobs::WorkerId).string().null())
                    .col(ColumnDef::new(Jobs::AssignedAt).big_integer().null())
                    .col(ColumnDef::new(Jobs::StartedAt).big_integer().null())
                    .col(ColumnDef::new(Jobs::CompletedAt).big_integer().null())
                    .col(ColumnDef::new(Jobs::HeartbeatAt).big_integer().null())
                    .col(
                        ColumnDef::new(Jobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Jobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(Jobs::RequeuedAt).big_integer().null())
                    .col(ColumnDef::new(Jobs::ErrorMessage).text().null())
                    .col(ColumnDef::new(Jobs::Queue).string().not_null())
                    .col(ColumnDef::new(Jobs::Payload).text().not_null())
                    .col(ColumnDef::new(Jobs::EstimatedDuration).big_integer().null())
                    .col(
                        ColumnDef::new(Jobs::CreditRefunded)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Jobs::DownloadUrl).string().null())
                    .col(ColumnDef::new(Jobs::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Jobs::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_status")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_worker_id")
                    .table(Jobs::Table)
                    .col(Jobs::WorkerId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_jobs_user_id")
                    .table(Jobs::Table)
                    .col(Jobs::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum Jobs {
    Table,
    Id,
    UserId,
    Title,
    CharacterTheme,
    Prompt,
    Status,
    WorkerId,
    AssignedAt,
    StartedAt,
    CompletedAt,
    HeartbeatAt,
    RetryCount,
    MaxRetries,
    RequeuedAt,
    ErrorMessage,
    Queue,
    Payload,
    EstimatedDuration,
    CreditRefunded,
    DownloadUrl,
    CreatedAt,
    UpdatedAt,
}
