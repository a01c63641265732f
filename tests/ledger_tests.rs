//! Ledger behaviour against a real (SQLite) database.

#[path = "test_utils/mod.rs"]
mod test_utils;

use studio_credits::ledger::{EntryRequest, Ledger, LedgerError};
use studio_credits::models::LedgerEntryKind;
use test_utils::{create_account, setup_pooled_test_db, setup_test_db};

async fn sum_of_deltas(ledger: &Ledger, account_id: i32) -> i64 {
    ledger
        .entries(account_id, 1000, 0)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.delta)
        .sum()
}

#[tokio::test]
async fn balance_tracks_sum_of_entries() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 45).await.unwrap();
    let ledger = Ledger::new(db.clone());

    ledger
        .debit(
            EntryRequest::new(account_id, 10, LedgerEntryKind::Consumption, "Training job #1")
                .with_external_ref("job:1"),
        )
        .await
        .unwrap();
    ledger
        .credit(
            EntryRequest::new(account_id, 10, LedgerEntryKind::Refund, "Refund for failed job #1")
                .with_external_ref("job:1"),
        )
        .await
        .unwrap();
    let balance = ledger
        .debit(
            EntryRequest::new(account_id, 5, LedgerEntryKind::Consumption, "Video job #2")
                .with_external_ref("job:2"),
        )
        .await
        .unwrap();

    assert_eq!(balance, 40);
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 40);
    assert_eq!(sum_of_deltas(&ledger, account_id).await, 40);

    let entries = ledger.entries(account_id, 10, 0).await.unwrap();
    assert_eq!(entries.len(), 4);
    // Newest first, each carrying the balance it produced
    assert_eq!(entries[0].delta, -5);
    assert_eq!(entries[0].balance_after, 40);
}

#[tokio::test]
async fn insufficient_credits_leaves_no_trace() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 4).await.unwrap();
    let ledger = Ledger::new(db.clone());

    let result = ledger
        .debit(EntryRequest::new(
            account_id,
            5,
            LedgerEntryKind::Consumption,
            "Video job",
        ))
        .await;

    assert!(matches!(
        result,
        Err(LedgerError::InsufficientCredits {
            balance: 4,
            requested: 5
        })
    ));
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 4);
    assert_eq!(ledger.entries(account_id, 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 0).await.unwrap();
    let ledger = Ledger::new(db);

    for amount in [0, -3] {
        let result = ledger
            .credit(EntryRequest::new(
                account_id,
                amount,
                LedgerEntryKind::AdminAdjustment,
                "Grant",
            ))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(a)) if a == amount));
    }
}

#[tokio::test]
async fn unknown_account_is_reported() {
    let db = setup_test_db().await.unwrap();
    let ledger = Ledger::new(db);

    assert!(matches!(
        ledger.balance_of(999).await,
        Err(LedgerError::AccountNotFound(999))
    ));
    assert!(matches!(
        ledger
            .credit(EntryRequest::new(
                999,
                5,
                LedgerEntryKind::AdminAdjustment,
                "Grant"
            ))
            .await,
        Err(LedgerError::AccountNotFound(999))
    ));
}

#[tokio::test]
async fn duplicate_external_reference_is_rejected_per_kind() {
    let db = setup_test_db().await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 0).await.unwrap();
    let ledger = Ledger::new(db.clone());

    let purchase = EntryRequest::new(
        account_id,
        45,
        LedgerEntryKind::Purchase,
        "Purchased Popular package (45 credits)",
    )
    .with_external_ref("cs_test_1");

    ledger.credit(purchase.clone()).await.unwrap();
    let duplicate = ledger.credit(purchase).await;

    assert!(matches!(
        duplicate,
        Err(LedgerError::DuplicateEntry {
            kind: LedgerEntryKind::Purchase,
            ..
        })
    ));
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 45);
    assert!(
        ledger
            .has_entry(LedgerEntryKind::Purchase, "cs_test_1")
            .await
            .unwrap()
    );

    // Admin adjustments are not deduplicated
    for _ in 0..2 {
        ledger
            .credit(
                EntryRequest::new(account_id, 1, LedgerEntryKind::AdminAdjustment, "Goodwill")
                    .with_external_ref("ticket-7"),
            )
            .await
            .unwrap();
    }
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 47);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let (_dir, db) = setup_pooled_test_db(4).await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 10).await.unwrap();
    let ledger = Ledger::new(db.clone());

    let mut handles = Vec::new();
    for job in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .debit(
                    EntryRequest::new(account_id, 3, LedgerEntryKind::Consumption, "Render")
                        .with_external_ref(format!("job:{job}")),
                )
                .await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientCredits { .. }) => rejected += 1,
            Err(e) => panic!("unexpected ledger error: {e}"),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(rejected, 5);
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 1);
    assert_eq!(sum_of_deltas(&ledger, account_id).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_credits_lose_no_updates() {
    let (_dir, db) = setup_pooled_test_db(4).await.unwrap();
    let account_id = create_account(&db, "owner@example.com", 0).await.unwrap();
    let ledger = Ledger::new(db.clone());

    let mut handles = Vec::new();
    for purchase in 0..12 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .credit(
                    EntryRequest::new(account_id, 5, LedgerEntryKind::Purchase, "Starter pack")
                        .with_external_ref(format!("cs_test_{purchase}")),
                )
                .await
        }));
    }

    let mut balances = Vec::new();
    for handle in handles {
        balances.push(handle.await.unwrap().unwrap());
    }

    // Each credit observed a distinct balance
    balances.sort_unstable();
    assert_eq!(balances, (1..=12).map(|n| n * 5).collect::<Vec<i64>>());
    assert_eq!(ledger.balance_of(account_id).await.unwrap(), 60);
    assert_eq!(sum_of_deltas(&ledger, account_id).await, 60);
}
