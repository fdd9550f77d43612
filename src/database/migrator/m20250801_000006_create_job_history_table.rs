use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobHistory::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobHistory::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobHistory::UserId).string().not_null())
                    .col(ColumnDef::new(JobHistory::Title).string().not_null())
                    .col(
                        ColumnDef::new(JobHistory::CharacterTheme)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(JobHistory::Prompt).text().not_null())
                    .col(ColumnDef::new(JobHistory::Status).string().not_null())
                    .col(ColumnDef::new(JobHistory::WorkerId).string().null())
                    .col(ColumnDef::new(JobHistory::AssignedAt).big_integer().null())
                    .col(ColumnDef::new(JobHistory::StartedAt).big_integer().null())
                    .col(ColumnDef::new(JobHistory::CompletedAt).big_integer().null())
                    .col(
                        ColumnDef::new(JobHistory::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobHistory::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(JobHistory::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(JobHistory::CreditRefunded)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(JobHistory::DownloadUrl).string().null())
                    .col(ColumnDef::new(JobHistory::CreatedAt).big_integer().not_null())
                    .col(
                        ColumnDef::new(JobHistory::ArchivedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_history_user_id")
                    .table(JobHistory::Table)
                    .col(JobHistory::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_history_archived_at")
                    .table(JobHistory::Table)
                    .col(JobHistory::ArchivedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobHistory::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum JobHistory {
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
    RetryCount,
    MaxRetries,
    ErrorMessage,
    CreditRefunded,
    DownloadUrl,
    CreatedAt,
    ArchivedAt,
}
