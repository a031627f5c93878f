// tests/integration_tests.rs
//
// End-to-end coverage against a real in-memory store: the five universal
// invariants, the round-trip/idempotence laws, the boundary behaviors, and
// the six worked scenarios, each as its own test function.

use credit_ledger_core::{
    governance, BillingMode, EntityType, FinalizeOptions, LedgerConfig, LedgerEntryType, LedgerSystem, LotSourceType,
    MicroUSD, MintOptions, ReleaseOptions, ReserveOptions,
};

async fn boot() -> LedgerSystem {
    LedgerSystem::new(LedgerConfig::in_memory()).await.unwrap()
}

#[derive(sqlx::FromRow)]
struct LotRow {
    original_micro: i64,
    available_micro: i64,
    reserved_micro: i64,
    consumed_micro: i64,
}

async fn lots_for(system: &LedgerSystem, account_id: &str) -> Vec<LotRow> {
    sqlx::query_as("SELECT original_micro, available_micro, reserved_micro, consumed_micro FROM lots WHERE account_id = ?1")
        .bind(account_id)
        .fetch_all(system.store().pool())
        .await
        .unwrap()
}

fn assert_lots_conserved(rows: &[LotRow]) {
    for row in rows {
        assert_eq!(
            row.available_micro + row.reserved_micro + row.consumed_micro,
            row.original_micro,
            "lot conservation violated: available={} reserved={} consumed={} original={}",
            row.available_micro,
            row.reserved_micro,
            row.consumed_micro,
            row.original_micro
        );
    }
}

// ---------------------------------------------------------------------
// Universal invariants
// ---------------------------------------------------------------------

#[tokio::test]
async fn invariant_lot_amounts_always_sum_to_original() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "inv1").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(400_000), ReserveOptions::default()).await.unwrap();
    engine.finalize(&reservation.reservation.id, MicroUSD::new(250_000), FinalizeOptions::default()).await.unwrap();

    let rows = lots_for(&system, &account.id).await;
    assert_lots_conserved(&rows);
}

#[tokio::test]
async fn invariant_entry_seq_is_contiguous_from_one() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "inv2").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(300_000), ReserveOptions::default()).await.unwrap();
    engine.finalize(&reservation.reservation.id, MicroUSD::new(100_000), FinalizeOptions::default()).await.unwrap();

    let history = engine
        .get_history(&account.id, None, credit_ledger_core::HistoryFilter::new(100))
        .await
        .unwrap();
    let seqs: Vec<u64> = history.iter().map(|e| e.entry_seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn invariant_pre_plus_amount_equals_post_for_every_entry() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "inv3").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(500_000), ReserveOptions::default()).await.unwrap();
    engine.finalize(&reservation.reservation.id, MicroUSD::new(300_000), FinalizeOptions::default()).await.unwrap();

    let history = engine
        .get_history(&account.id, None, credit_ledger_core::HistoryFilter::new(100))
        .await
        .unwrap();
    for entry in &history {
        assert_eq!(entry.pre_balance_micro + entry.amount_micro.get(), entry.post_balance_micro);
    }
}

#[tokio::test]
async fn invariant_transfer_split_sums_to_recipient_lot_original() {
    let system = boot().await;
    let engine = system.engine();
    let sender = engine.get_or_create_account(EntityType::Person, "inv4-sender").await.unwrap();
    let recipient = engine.get_or_create_account(EntityType::Person, "inv4-recipient").await.unwrap();
    engine.mint_lot(&sender.id, LotSourceType::Deposit, MicroUSD::new(300_000), MintOptions::default()).await.unwrap();
    engine.mint_lot(&sender.id, LotSourceType::Deposit, MicroUSD::new(700_000), MintOptions::default()).await.unwrap();

    system.transfer().transfer(&sender.id, &recipient.id, MicroUSD::new(500_000), "inv4-xfer").await.unwrap();

    let recipient_rows = lots_for(&system, &recipient.id).await;
    let total: i64 = recipient_rows.iter().map(|r| r.original_micro).sum();
    assert_eq!(total, 500_000);
    assert_eq!(recipient_rows.len(), 1);
    assert_eq!(recipient_rows[0].original_micro, recipient_rows[0].available_micro);
}

#[tokio::test]
async fn invariant_idempotency_key_retry_yields_identical_result() {
    let system = boot().await;
    let engine = system.engine();
    let sender = engine.get_or_create_account(EntityType::Person, "inv5-sender").await.unwrap();
    let recipient = engine.get_or_create_account(EntityType::Person, "inv5-recipient").await.unwrap();
    engine.mint_lot(&sender.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();

    let first = system.transfer().transfer(&sender.id, &recipient.id, MicroUSD::new(200_000), "inv5-key").await.unwrap();
    let second = system.transfer().transfer(&sender.id, &recipient.id, MicroUSD::new(200_000), "inv5-key").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.completed_at, second.completed_at);
    let balance = engine.get_balance(&sender.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 800_000);
}

// ---------------------------------------------------------------------
// Round-trip / idempotence laws
// ---------------------------------------------------------------------

#[tokio::test]
async fn reserve_then_release_restores_pre_reserve_balance_and_adds_two_entries() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "rt1").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(500_000), MintOptions::default()).await.unwrap();

    let before = engine.get_balance(&account.id, None).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(200_000), ReserveOptions::default()).await.unwrap();
    engine.release(&reservation.reservation.id, ReleaseOptions::default()).await.unwrap();
    let after = engine.get_balance(&account.id, None).await.unwrap();

    assert_eq!(before.available_micro, after.available_micro);
    assert_eq!(after.reserved_micro.get(), 0);

    let history = engine.get_history(&account.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    // mint + reserve + release = three entries total; reserve/release is two of them.
    assert_eq!(history.len(), 3);

    let rows = lots_for(&system, &account.id).await;
    assert_eq!(rows[0].original_micro, 500_000);
    assert_lots_conserved(&rows);
}

#[tokio::test]
async fn reserve_then_finalize_consumes_exactly_x_with_no_net_reserved_change() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "rt2").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(500_000), MintOptions::default()).await.unwrap();

    let before = engine.get_balance(&account.id, None).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(200_000), ReserveOptions::default()).await.unwrap();
    let mid = engine.get_balance(&account.id, None).await.unwrap();
    assert_eq!(mid.reserved_micro.get(), 200_000);

    engine.finalize(&reservation.reservation.id, MicroUSD::new(200_000), FinalizeOptions::default()).await.unwrap();
    let after = engine.get_balance(&account.id, None).await.unwrap();

    assert_eq!(before.available_micro.get() - after.available_micro.get(), 200_000);
    assert_eq!(after.reserved_micro.get(), 0);

    let rows = lots_for(&system, &account.id).await;
    assert_eq!(rows[0].consumed_micro, 200_000);
}

#[tokio::test]
async fn finalize_retried_with_same_idempotency_key_has_no_additional_effect() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "rt3").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(500_000), MintOptions::default()).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(200_000), ReserveOptions::default()).await.unwrap();

    let opts = FinalizeOptions { idempotency_key: Some("rt3-finalize".to_string()), description: None };
    let first = engine.finalize(&reservation.reservation.id, MicroUSD::new(150_000), opts.clone()).await.unwrap();
    let second = engine.finalize(&reservation.reservation.id, MicroUSD::new(150_000), opts).await.unwrap();

    assert_eq!(first.effective_cost_micro, second.effective_cost_micro);
    assert_eq!(first.surplus_released_micro, second.surplus_released_micro);

    let balance = engine.get_balance(&account.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 500_000 - 150_000);

    let history = engine.get_history(&account.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    // mint + reserve + finalize = three entries; the retried finalize posted none.
    assert_eq!(history.len(), 3);
}

// ---------------------------------------------------------------------
// Boundary behaviors
//
// A literal `amount = 0` on the zero-cost finalize entry would break
// invariant 3 (pre + amount = post) once the full reservation returns to
// `available` — the entry's amount is the real balance delta, i.e. the
// released surplus, not the (zero) consumed cost. See DESIGN.md.
// ---------------------------------------------------------------------

#[tokio::test]
async fn finalize_with_zero_cost_releases_the_full_reservation() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "bd1").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(500_000), MintOptions::default()).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(200_000), ReserveOptions::default()).await.unwrap();

    let outcome = engine.finalize(&reservation.reservation.id, MicroUSD::ZERO, FinalizeOptions::default()).await.unwrap();
    assert_eq!(outcome.effective_cost_micro.get(), 0);
    assert_eq!(outcome.surplus_released_micro.get(), 200_000);

    let balance = engine.get_balance(&account.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 500_000);
    assert_eq!(balance.reserved_micro.get(), 0);

    let history = engine.get_history(&account.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    let finalize_entry = history.iter().find(|e| e.entry_type == LedgerEntryType::Finalize).unwrap();
    assert_eq!(finalize_entry.amount_micro.get(), 200_000);
}

#[tokio::test]
async fn finalize_with_full_reservation_releases_no_surplus() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "bd2").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(500_000), MintOptions::default()).await.unwrap();
    let reservation = engine.reserve(&account.id, MicroUSD::new(200_000), ReserveOptions::default()).await.unwrap();

    let outcome = engine.finalize(&reservation.reservation.id, MicroUSD::new(200_000), FinalizeOptions::default()).await.unwrap();
    assert_eq!(outcome.surplus_released_micro.get(), 0);

    let rows = lots_for(&system, &account.id).await;
    assert_eq!(rows[0].consumed_micro, 200_000);
    assert_eq!(rows[0].reserved_micro, 0);
}

#[tokio::test]
async fn reserve_for_exact_available_succeeds_with_no_remainder() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "bd3").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(400_000), MintOptions::default()).await.unwrap();

    let reservation = engine.reserve(&account.id, MicroUSD::new(400_000), ReserveOptions::default()).await.unwrap();
    let balance = engine.get_balance(&account.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 0);
    assert_eq!(balance.reserved_micro.get(), 400_000);
    assert_eq!(reservation.lot_allocations.len(), 1);
}

#[tokio::test]
async fn reserve_never_selects_an_expired_lot() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "bd4").await.unwrap();

    let now = chrono::Utc::now().timestamp();
    engine
        .mint_lot(
            &account.id,
            LotSourceType::Deposit,
            MicroUSD::new(300_000),
            MintOptions { expires_at: Some(now - 10), ..Default::default() },
        )
        .await
        .unwrap();

    let err = engine.reserve(&account.id, MicroUSD::new(100_000), ReserveOptions::default()).await.unwrap_err();
    assert!(matches!(err, credit_ledger_core::LedgerError::InsufficientBalance));
}

// ---------------------------------------------------------------------
// Concrete end-to-end scenarios (spec section 8)
// ---------------------------------------------------------------------

#[tokio::test]
async fn scenario_1_basic_reserve_finalize() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "u1").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();

    let reservation = engine.reserve(&account.id, MicroUSD::new(500_000), ReserveOptions::default()).await.unwrap();
    engine.finalize(&reservation.reservation.id, MicroUSD::new(300_000), FinalizeOptions::default()).await.unwrap();

    let rows = lots_for(&system, &account.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].available_micro, 700_000);
    assert_eq!(rows[0].reserved_micro, 0);
    assert_eq!(rows[0].consumed_micro, 300_000);

    let balance = engine.get_balance(&account.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 700_000);
    assert_eq!(balance.reserved_micro.get(), 0);

    let history = engine.get_history(&account.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    let reserve_entry = history.iter().find(|e| e.entry_type == LedgerEntryType::Reserve).unwrap();
    assert_eq!(reserve_entry.pre_balance_micro, 1_000_000);
    assert_eq!(reserve_entry.post_balance_micro, 500_000);
    let finalize_entry = history.iter().find(|e| e.entry_type == LedgerEntryType::Finalize).unwrap();
    assert_eq!(finalize_entry.pre_balance_micro, 500_000);
    assert_eq!(finalize_entry.post_balance_micro, 700_000);
}

#[tokio::test]
async fn scenario_2_fifo_across_two_lots() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "u2").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(200_000), MintOptions::default()).await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(800_000), MintOptions::default()).await.unwrap();

    let reservation = engine.reserve(&account.id, MicroUSD::new(500_000), ReserveOptions::default()).await.unwrap();

    assert_eq!(reservation.lot_allocations.len(), 2);
    assert_eq!(reservation.lot_allocations[0].reserved_micro.get(), 200_000);
    assert_eq!(reservation.lot_allocations[1].reserved_micro.get(), 300_000);
}

#[tokio::test]
async fn scenario_3_live_overrun_cap() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "u3").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();

    let reservation = engine
        .reserve(&account.id, MicroUSD::new(100_000), ReserveOptions { billing_mode: BillingMode::Live, ..Default::default() })
        .await
        .unwrap();
    let outcome = engine.finalize(&reservation.reservation.id, MicroUSD::new(200_000), FinalizeOptions::default()).await.unwrap();

    assert_eq!(outcome.effective_cost_micro.get(), 100_000);
    assert_eq!(outcome.overrun_micro.get(), 0);

    let rows = lots_for(&system, &account.id).await;
    assert_eq!(rows[0].consumed_micro, 100_000);
    assert_eq!(rows[0].available_micro, 900_000);
}

#[tokio::test]
async fn scenario_4_soft_overrun_applied() {
    let system = boot().await;
    let engine = system.engine();
    let account = engine.get_or_create_account(EntityType::Person, "u4").await.unwrap();
    engine.mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(1_000_000), MintOptions::default()).await.unwrap();

    let reservation = engine
        .reserve(&account.id, MicroUSD::new(100_000), ReserveOptions { billing_mode: BillingMode::Soft, ..Default::default() })
        .await
        .unwrap();
    let outcome = engine.finalize(&reservation.reservation.id, MicroUSD::new(200_000), FinalizeOptions::default()).await.unwrap();

    assert_eq!(outcome.effective_cost_micro.get(), 200_000);
    assert_eq!(outcome.overrun_micro.get(), 100_000);

    let rows = lots_for(&system, &account.id).await;
    let total_consumed: i64 = rows.iter().map(|r| r.consumed_micro).sum();
    assert_eq!(total_consumed, 200_000);

    let balance = engine.get_balance(&account.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 800_000);
}

#[tokio::test]
async fn scenario_5_peer_transfer_conservation() {
    let system = boot().await;
    let engine = system.engine();
    let sender = engine.get_or_create_account(EntityType::Person, "u5-sender").await.unwrap();
    let recipient = engine.get_or_create_account(EntityType::Person, "u5-recipient").await.unwrap();
    engine.mint_lot(&sender.id, LotSourceType::Deposit, MicroUSD::new(300_000), MintOptions::default()).await.unwrap();
    engine.mint_lot(&sender.id, LotSourceType::Deposit, MicroUSD::new(700_000), MintOptions::default()).await.unwrap();

    let transfer = system.transfer().transfer(&sender.id, &recipient.id, MicroUSD::new(500_000), "u5-xfer").await.unwrap();
    assert_eq!(transfer.status, credit_ledger_core::TransferStatus::Completed);

    let sender_rows = lots_for(&system, &sender.id).await;
    assert_eq!(sender_rows[0].original_micro, 0);
    assert_eq!(sender_rows[0].available_micro, 0);
    assert_eq!(sender_rows[1].original_micro, 500_000);
    assert_eq!(sender_rows[1].available_micro, 500_000);

    let recipient_rows = lots_for(&system, &recipient.id).await;
    assert_eq!(recipient_rows.len(), 1);
    assert_eq!(recipient_rows[0].original_micro, 500_000);
    assert_eq!(recipient_rows[0].available_micro, 500_000);

    let original_total: i64 = sender_rows.iter().chain(recipient_rows.iter()).map(|r| r.original_micro).sum();
    assert_eq!(original_total, 1_000_000);

    let sender_history = engine.get_history(&sender.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    assert!(sender_history.iter().any(|e| e.entry_type == LedgerEntryType::TransferOut));
    let recipient_history = engine.get_history(&recipient.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    assert!(recipient_history.iter().any(|e| e.entry_type == LedgerEntryType::TransferIn));
}

#[tokio::test]
async fn scenario_6_clawback_with_receivable_and_drip_recovery() {
    let system = boot().await;
    let engine = system.engine();
    let settlement = system.settlement();
    let store = system.store();

    let referrer = engine.get_or_create_account(EntityType::Agent, "u6-referrer").await.unwrap();

    // Instant settlement so the test doesn't need to wait on `settle_after`.
    store
        .transaction(|tx| {
            Box::pin(async move {
                let cfg = governance::propose(tx, "settlement.hold_seconds", "0", Some(EntityType::Agent), "ops").await?;
                governance::submit_for_approval(tx, &cfg.id).await?;
                let approvers = vec!["ops".to_string(), "bob".to_string(), "carol".to_string()];
                governance::emergency_override(tx, &cfg.id, &approvers, "test setup: instant settlement").await?;
                Ok::<_, credit_ledger_core::LedgerError>(())
            })
        })
        .await
        .unwrap();

    // Referrer has a settled balance of 400_000.
    let first = settlement.record_earning(&referrer.id, "general", MicroUSD::new(400_000), EntityType::Agent).await.unwrap();
    assert!(first.settled_at.is_some());

    // A clawback earning of 1_000_000 arrives, already settled.
    let clawback_earning = settlement.record_earning(&referrer.id, "general", MicroUSD::new(1_000_000), EntityType::Agent).await.unwrap();

    let receivable = settlement.clawback(&clawback_earning.id, "fraud_review_failed").await.unwrap();
    let receivable = receivable.expect("a 1_000_000 clawback against a 400_000 balance must open a receivable");
    assert_eq!(receivable.original_micro.get(), 1_000_000);
    assert_eq!(receivable.balance_micro.get(), 600_000);

    let balance = engine.get_balance(&referrer.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 0);

    let history = engine.get_history(&referrer.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    let clawback_entry = history.iter().find(|e| e.entry_type == LedgerEntryType::Clawback).unwrap();
    assert_eq!(clawback_entry.amount_micro.get(), -400_000);

    // Next earning of 500_000 with agent.drip_recovery_pct default (50%)
    // withholds 250_000 toward the open receivable.
    let next_earning = settlement.record_earning(&referrer.id, "general", MicroUSD::new(500_000), EntityType::Agent).await.unwrap();
    assert!(next_earning.settled_at.is_some());

    let receivable_id = receivable.id.clone();
    let updated_receivable: (i64,) = sqlx::query_as("SELECT balance_micro FROM receivables WHERE id = ?1")
        .bind(&receivable_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(updated_receivable.0, 350_000);

    let history = engine.get_history(&referrer.id, None, credit_ledger_core::HistoryFilter::new(100)).await.unwrap();
    let drip_entry = history.iter().find(|e| e.entry_type == LedgerEntryType::DripRecovery).unwrap();
    assert_eq!(drip_entry.amount_micro.get(), -250_000);
    let expected_key = format!("drip:{}:{}", next_earning.id, receivable_id);
    assert_eq!(drip_entry.idempotency_key.as_deref(), Some(expected_key.as_str()));

    // Full 500_000 landed, then 250_000 was pulled back: net +250_000 available.
    let balance = engine.get_balance(&referrer.id, None).await.unwrap();
    assert_eq!(balance.available_micro.get(), 250_000);
}
