use reelpipe::billing::CreditLedger;
use reelpipe::database::{credit_transactions, establish_connection};
use reelpipe::errors::ReelPipeError;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;

async fn setup() -> (Arc<sea_orm::DatabaseConnection>, CreditLedger) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let ledger = CreditLedger::new(db.clone());
    (db, ledger)
}

async fn ledger_sum(db: &sea_orm::DatabaseConnection, user_id: &str) -> i64 {
    credit_transactions::Entity::find()
        .filter(credit_transactions::Column::UserId.eq(user_id))
        .all(db)
        .await
        .unwrap()
        .iter()
        .map(|t| t.amount)
        .sum()
}

#[tokio::test]
async fn test_balance_equals_ledger_sum() {
    let (db, ledger) = setup().await;

    ledger.grant("u1", 5, "Purchased 5 credits", None).await.unwrap();
    ledger.spend("u1", "Video generation").await.unwrap();
    ledger.spend("u1", "Video generation").await.unwrap();
    ledger.refund("u1", "Refund: render failed").await.unwrap();

    let balance = ledger.get_balance("u1").await.unwrap();
    assert_eq!(balance, 4);
    assert_eq!(ledger_sum(&db, "u1").await, balance);
}

#[tokio::test]
async fn test_spend_with_zero_balance_fails() {
    let (db, ledger) = setup().await;

    let err = ledger.spend("u1", "Video generation").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::InsufficientCredits));

    // The failed spend must leave no ledger entry behind.
    assert_eq!(ledger_sum(&db, "u1").await, 0);
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_spend_cannot_overdraw() {
    let (_db, ledger) = setup().await;
    ledger.grant("u1", 1, "Purchased 1 credit", None).await.unwrap();

    ledger.spend("u1", "Video generation").await.unwrap();
    let err = ledger.spend("u1", "Video generation").await.unwrap_err();
    assert!(matches!(err, ReelPipeError::InsufficientCredits));
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_grant_then_spend_round_trips() {
    let (db, ledger) = setup().await;
    let start = ledger.get_balance("u1").await.unwrap();

    ledger.grant("u1", 3, "Purchased 3 credits", None).await.unwrap();
    for _ in 0..3 {
        ledger.spend("u1", "Video generation").await.unwrap();
    }

    assert_eq!(ledger.get_balance("u1").await.unwrap(), start);
    assert_eq!(ledger_sum(&db, "u1").await, start);
}

#[tokio::test]
async fn test_duplicate_event_credits_once() {
    let (db, ledger) = setup().await;

    let balance = ledger
        .grant("u1", 10, "Purchased 10 credits", Some("cs_session_1"))
        .await
        .unwrap();
    assert_eq!(balance, 10);

    // Replaying the same checkout event is a no-op.
    for _ in 0..5 {
        let balance = ledger
            .grant("u1", 10, "Purchased 10 credits", Some("cs_session_1"))
            .await
            .unwrap();
        assert_eq!(balance, 10);
    }
    assert_eq!(ledger_sum(&db, "u1").await, 10);

    // A different event id credits again.
    let balance = ledger
        .grant("u1", 10, "Purchased 10 credits", Some("cs_session_2"))
        .await
        .unwrap();
    assert_eq!(balance, 20);
}

#[tokio::test]
async fn test_refund_is_positive_entry() {
    let (db, ledger) = setup().await;
    ledger.grant("u1", 1, "Welcome credit", None).await.unwrap();
    ledger.spend("u1", "Video generation").await.unwrap();
    ledger
        .refund("u1", "Refund: video generation failed for job j1")
        .await
        .unwrap();

    let refunds = credit_transactions::Entity::find()
        .filter(credit_transactions::Column::UserId.eq("u1"))
        .filter(credit_transactions::Column::Amount.eq(1))
        .all(db.as_ref())
        .await
        .unwrap();
    let refund_entries: Vec<_> = refunds
        .iter()
        .filter(|t| t.description.starts_with("Refund:"))
        .collect();
    assert_eq!(refund_entries.len(), 1);
    assert_eq!(ledger.get_balance("u1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_marker_cleanup_keeps_fresh_markers() {
    let (_db, ledger) = setup().await;
    ledger
        .grant("u1", 2, "Purchased 2 credits", Some("cs_fresh"))
        .await
        .unwrap();

    // Fresh markers survive the TTL sweep.
    let removed = ledger.cleanup_expired_markers().await.unwrap();
    assert_eq!(removed, 0);

    let balance = ledger
        .grant("u1", 2, "Purchased 2 credits", Some("cs_fresh"))
        .await
        .unwrap();
    assert_eq!(balance, 2);
}
