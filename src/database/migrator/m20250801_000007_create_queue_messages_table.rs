use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueueMessages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueueMessages::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(QueueMessages::Queue).string().not_null())
                    .col(ColumnDef::new(QueueMessages::Body).text().not_null())
                    .col(
                        ColumnDef::new(QueueMessages::State)
                            .string()
                            .not_null()
                            .default("ready"),
                    )
                    .col(
                        ColumnDef::new(QueueMessages::DeliveredAt)
                            .big_integer()
                            .null(),
                    )
                    .col(ColumnDef::new(QueueMessages::DeliveredTo).string().null())
                    .col(
                        ColumnDef::new(QueueMessages::EnqueuedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Consumed by the FIFO claim query
        manager
            .create_index(
                Index::create()
                    .name("idx_queue_messages_queue_state_enqueued")
                    .table(QueueMessages::Table)
                    .col((QueueMessages::Queue, IndexOrder::Asc))
                    .col((QueueMessages::State, IndexOrder::Asc))
                    .col((QueueMessages::EnqueuedAt, IndexOrder::Asc))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(QueueMessages::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum QueueMessages {
    Table,
    Id,
    Queue,
    Body,
    State,
    DeliveredAt,
    DeliveredTo,
    EnqueuedAt,
}
