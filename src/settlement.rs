// src/settlement.rs
//
// Settlement & Clawback — time-gated earnings, clawback against a settled
// balance, and drip-recovery of an open receivable from future earnings.
// A settled earning becomes a spendable lot through the same `mint_lot`
// path as a deposit; a clawback consumes lots FIFO the same way `finalize`
// does, and opens a receivable for whatever it couldn't recover.

use crate::account::EntityType;
use crate::engine::{record_entry, select_fifo_lots, LedgerEngine};
use crate::entry::LedgerEntryType;
use crate::error::LedgerError;
use crate::governance;
use crate::lot::LotSourceType;
use crate::outbox;
use crate::primitives::{MicroUSD, SignedMicroUSD};
use crate::store::{StoreFacade, Tx};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Earning {
    pub id: String,
    pub account_id: String,
    pub pool_id: String,
    pub amount_micro: MicroUSD,
    pub settle_after: i64,
    pub settled_at: Option<i64>,
    pub clawback_reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Receivable {
    pub id: String,
    pub account_id: String,
    pub source_clawback_earning_id: String,
    pub original_micro: MicroUSD,
    pub balance_micro: MicroUSD,
    pub resolved_at: Option<i64>,
    pub created_at: i64,
}

pub struct SettlementService {
    store: Arc<StoreFacade>,
    engine: Arc<LedgerEngine>,
}

impl SettlementService {
    pub fn new(store: Arc<StoreFacade>, engine: Arc<LedgerEngine>) -> Self {
        Self { store, engine }
    }

    /// Records a pending earning for `account_id`, gated by the resolved
    /// `settlement.hold_seconds` for `entity_type`. A `hold_seconds` of zero
    /// settles in the same transaction and emits an instant-settlement
    /// event instead of leaving the earning in the queue.
    pub async fn record_earning(
        &self,
        account_id: &str,
        pool_id: &str,
        amount: MicroUSD,
        entity_type: EntityType,
    ) -> Result<Earning, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::Invalid("earning amount must be positive".into()));
        }
        let account_id = account_id.to_string();
        let pool_id = pool_id.to_string();

        self.store
            .transaction(|tx| {
                let account_id = account_id.clone();
                let pool_id = pool_id.clone();
                Box::pin(async move {
                    let hold_seconds: i64 = governance::resolve(tx, "settlement.hold_seconds", Some(entity_type))
                        .await?
                        .parse()
                        .map_err(|_| LedgerError::internal("settlement.hold_seconds is not a valid integer"))?;

                    let now = Utc::now().timestamp();
                    let id = uuid::Uuid::new_v4().to_string();
                    let settle_after = now + hold_seconds;
                    let settled_at = if hold_seconds == 0 { Some(now) } else { None };

                    sqlx::query(
                        r#"
                        INSERT INTO earnings (id, account_id, pool_id, amount_micro, settle_after, settled_at, clawback_reason, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)
                        "#,
                    )
                    .bind(&id)
                    .bind(&account_id)
                    .bind(&pool_id)
                    .bind(amount.get() as i64)
                    .bind(settle_after)
                    .bind(settled_at)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;

                    if hold_seconds == 0 {
                        credit_settlement_lot(tx, &account_id, &pool_id, amount, &id, now).await?;
                        outbox::emit_event(
                            tx,
                            "earning.settled_instant",
                            "earning",
                            &id,
                            None,
                            None,
                            &json!({"account_id": account_id, "amount_micro": amount.get()}),
                        )
                        .await;
                    }

                    Ok(Earning {
                        id,
                        account_id,
                        pool_id,
                        amount_micro: amount,
                        settle_after,
                        settled_at,
                        clawback_reason: None,
                        created_at: now,
                    })
                })
            })
            .await
    }

    /// Settles up to `limit` due earnings, oldest first. An account with an
    /// open receivable has its drip-recovery percentage withheld from each
    /// earning and applied to the receivable instead of credited.
    pub async fn settle_batch(&self, limit: u32) -> Result<Vec<Earning>, LedgerError> {
        self.store
            .transaction(move |tx| {
                Box::pin(async move {
                    let now = Utc::now().timestamp();
                    let due: Vec<(String,)> = sqlx::query_as(
                        "SELECT id FROM earnings WHERE settled_at IS NULL AND settle_after <= ?1 ORDER BY created_at ASC LIMIT ?2",
                    )
                    .bind(now)
                    .bind(limit as i64)
                    .fetch_all(&mut **tx)
                    .await?;

                    let mut settled = Vec::new();
                    for (earning_id,) in due {
                        settled.push(settle_one(tx, &earning_id, now).await?);
                    }
                    Ok(settled)
                })
            })
            .await
    }

    /// Claws back a settled earning. Consumes up to `amount` from the
    /// account's available lots FIFO; any shortfall becomes an open
    /// receivable recovered later by `settle_batch`'s drip withholding.
    pub async fn clawback(&self, earning_id: &str, reason: &str) -> Result<Option<Receivable>, LedgerError> {
        let earning_id = earning_id.to_string();
        let reason = reason.to_string();

        self.store
            .transaction(|tx| {
                let earning_id = earning_id.clone();
                let reason = reason.clone();
                Box::pin(async move { clawback_one(tx, &earning_id, &reason).await })
            })
            .await
    }

    pub fn engine(&self) -> &LedgerEngine {
        &self.engine
    }
}

async fn credit_settlement_lot(
    tx: &mut Tx<'_>,
    account_id: &str,
    pool_id: &str,
    amount: MicroUSD,
    earning_id: &str,
    now: i64,
) -> Result<(), LedgerError> {
    let lot_id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO lots (id, account_id, pool_id, source_type, source_id, original_micro, available_micro, reserved_micro, consumed_micro, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, 0, NULL, ?7)
        "#,
    )
    .bind(&lot_id)
    .bind(account_id)
    .bind(pool_id)
    .bind(LotSourceType::EarningSettlement.as_str())
    .bind(earning_id)
    .bind(amount.get() as i64)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    record_entry(
        tx,
        account_id,
        pool_id,
        Some(&lot_id),
        None,
        LedgerEntryType::Settlement,
        SignedMicroUSD::positive(amount),
        None,
        Some(&format!("settlement of earning {earning_id}")),
        now,
    )
    .await?;
    Ok(())
}

async fn settle_one(tx: &mut Tx<'_>, earning_id: &str, now: i64) -> Result<Earning, LedgerError> {
    let earning = fetch_earning(tx, earning_id).await?;
    if earning.settled_at.is_some() {
        return Ok(earning);
    }

    let open_receivable = fetch_open_receivable(tx, &earning.account_id).await?;

    sqlx::query("UPDATE earnings SET settled_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(earning_id)
        .execute(&mut **tx)
        .await?;

    // The full earning lands as an available lot first, then, if the
    // account owes a receivable, the recovered share is pulled back out
    // FIFO as a second, genuinely balance-decreasing entry — not netted
    // off before crediting — so both entries reflect a real delta.
    credit_settlement_lot(tx, &earning.account_id, &earning.pool_id, earning.amount_micro, earning_id, now).await?;

    if let Some(receivable) = open_receivable {
        let pct: u32 = governance::resolve(tx, "agent.drip_recovery_pct", None)
            .await?
            .parse()
            .map_err(|_| LedgerError::internal("agent.drip_recovery_pct is not a valid integer"))?;
        let bps = crate::primitives::BasisPoints::new(pct * 100)?;
        let wanted = earning.amount_micro.bps_share(bps);
        let recovered = wanted.min(receivable.balance_micro);

        if !recovered.is_zero() {
            let mut remaining = recovered.get();
            let candidates = select_fifo_lots(tx, &earning.account_id, &earning.pool_id, now).await?;
            let mut touched_lot: Option<String> = None;
            for (lot_id, available) in candidates {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(available as u64);
                if take == 0 {
                    continue;
                }
                sqlx::query("UPDATE lots SET available_micro = available_micro - ?1, consumed_micro = consumed_micro + ?1 WHERE id = ?2")
                    .bind(take as i64)
                    .bind(&lot_id)
                    .execute(&mut **tx)
                    .await?;
                remaining -= take;
                touched_lot = Some(lot_id);
            }

            let new_balance = receivable.balance_micro.checked_sub(recovered)?;
            let resolved_at = if new_balance.is_zero() { Some(now) } else { None };
            sqlx::query("UPDATE receivables SET balance_micro = ?1, resolved_at = ?2 WHERE id = ?3")
                .bind(new_balance.get() as i64)
                .bind(resolved_at)
                .bind(&receivable.id)
                .execute(&mut **tx)
                .await?;

            let idempotency_key = format!("drip:{earning_id}:{}", receivable.id);
            record_entry(
                tx,
                &earning.account_id,
                &earning.pool_id,
                touched_lot.as_deref(),
                None,
                LedgerEntryType::DripRecovery,
                SignedMicroUSD::negative(recovered),
                Some(&idempotency_key),
                Some(&format!("recovered toward receivable {}", receivable.id)),
                now,
            )
            .await?;

            outbox::emit_event(
                tx,
                "receivable.drip_recovered",
                "receivable",
                &receivable.id,
                None,
                None,
                &json!({"earning_id": earning_id, "recovered_micro": recovered.get(), "remaining_balance_micro": new_balance.get()}),
            )
            .await;
        }
    }

    fetch_earning(tx, earning_id).await
}

async fn clawback_one(tx: &mut Tx<'_>, earning_id: &str, reason: &str) -> Result<Option<Receivable>, LedgerError> {
    let earning = fetch_earning(tx, earning_id).await?;
    if earning.settled_at.is_none() {
        return Err(LedgerError::InvalidState(format!("earning {earning_id} is not settled")));
    }
    if earning.clawback_reason.is_some() {
        return Err(LedgerError::InvalidState(format!("earning {earning_id} already clawed back")));
    }

    let now = Utc::now().timestamp();
    let candidates = select_fifo_lots(tx, &earning.account_id, &earning.pool_id, now).await?;
    let mut remaining = earning.amount_micro.get();
    let mut applied = 0u64;
    let mut touched_lot: Option<String> = None;
    for (lot_id, available) in candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(available as u64);
        if take == 0 {
            continue;
        }
        sqlx::query("UPDATE lots SET available_micro = available_micro - ?1, consumed_micro = consumed_micro + ?1 WHERE id = ?2")
            .bind(take as i64)
            .bind(&lot_id)
            .execute(&mut **tx)
            .await?;
        remaining -= take;
        applied += take;
        touched_lot = Some(lot_id);
    }

    sqlx::query("UPDATE earnings SET clawback_reason = ?1 WHERE id = ?2")
        .bind(reason)
        .bind(earning_id)
        .execute(&mut **tx)
        .await?;

    if applied > 0 {
        record_entry(
            tx,
            &earning.account_id,
            &earning.pool_id,
            touched_lot.as_deref(),
            None,
            LedgerEntryType::Clawback,
            SignedMicroUSD::negative(MicroUSD::new(applied)),
            None,
            Some(reason),
            now,
        )
        .await?;
        outbox::emit_event(
            tx,
            "earning.clawback_applied",
            "earning",
            earning_id,
            None,
            None,
            &json!({"applied_micro": applied, "reason": reason}),
        )
        .await;
    }

    if remaining == 0 {
        return Ok(None);
    }

    let receivable_id = uuid::Uuid::new_v4().to_string();
    let clawback_total = earning.amount_micro.get();
    sqlx::query(
        r#"
        INSERT INTO receivables (id, account_id, source_clawback_earning_id, original_micro, balance_micro, resolved_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
        "#,
    )
    .bind(&receivable_id)
    .bind(&earning.account_id)
    .bind(earning_id)
    .bind(clawback_total as i64)
    .bind(remaining as i64)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    outbox::emit_event(
        tx,
        "earning.clawback_receivable_created",
        "receivable",
        &receivable_id,
        None,
        None,
        &json!({"earning_id": earning_id, "balance_micro": remaining}),
    )
    .await;

    Ok(Some(Receivable {
        id: receivable_id,
        account_id: earning.account_id,
        source_clawback_earning_id: earning_id.to_string(),
        original_micro: MicroUSD::new(clawback_total),
        balance_micro: MicroUSD::new(remaining),
        resolved_at: None,
        created_at: now,
    }))
}

async fn fetch_earning(tx: &mut Tx<'_>, id: &str) -> Result<Earning, LedgerError> {
    let row: Option<EarningRow> = sqlx::query_as(
        "SELECT id, account_id, pool_id, amount_micro, settle_after, settled_at, clawback_reason, created_at FROM earnings WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| LedgerError::NotFound(format!("earning {id}")))?.into_earning()
}

async fn fetch_open_receivable(tx: &mut Tx<'_>, account_id: &str) -> Result<Option<Receivable>, LedgerError> {
    let row: Option<ReceivableRow> = sqlx::query_as(
        r#"
        SELECT id, account_id, source_clawback_earning_id, original_micro, balance_micro, resolved_at, created_at
        FROM receivables WHERE account_id = ?1 AND resolved_at IS NULL ORDER BY created_at ASC LIMIT 1
        "#,
    )
    .bind(account_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| r.into_receivable()).transpose()
}

#[derive(sqlx::FromRow)]
struct EarningRow {
    id: String,
    account_id: String,
    pool_id: String,
    amount_micro: i64,
    settle_after: i64,
    settled_at: Option<i64>,
    clawback_reason: Option<String>,
    created_at: i64,
}

impl EarningRow {
    fn into_earning(self) -> Result<Earning, LedgerError> {
        Ok(Earning {
            id: self.id,
            account_id: self.account_id,
            pool_id: self.pool_id,
            amount_micro: MicroUSD::new(self.amount_micro as u64),
            settle_after: self.settle_after,
            settled_at: self.settled_at,
            clawback_reason: self.clawback_reason,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReceivableRow {
    id: String,
    account_id: String,
    source_clawback_earning_id: String,
    original_micro: i64,
    balance_micro: i64,
    resolved_at: Option<i64>,
    created_at: i64,
}

impl ReceivableRow {
    fn into_receivable(self) -> Result<Receivable, LedgerError> {
        Ok(Receivable {
            id: self.id,
            account_id: self.account_id,
            source_clawback_earning_id: self.source_clawback_earning_id,
            original_micro: MicroUSD::new(self.original_micro as u64),
            balance_micro: MicroUSD::new(self.balance_micro as u64),
            resolved_at: self.resolved_at,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::EntityType;
    use crate::config::LedgerConfig;

    async fn test_service() -> SettlementService {
        let store = Arc::new(StoreFacade::connect(&LedgerConfig::in_memory()).await.unwrap());
        store.init_schema().await.unwrap();
        let engine = Arc::new(LedgerEngine::new(store.clone(), 300, 24));
        SettlementService::new(store, engine)
    }

    #[tokio::test]
    async fn default_hold_leaves_earning_pending() {
        let service = test_service().await;
        let account = service.engine().get_or_create_account(EntityType::Agent, "agent1").await.unwrap();

        let earning = service
            .record_earning(&account.id, "general", MicroUSD::new(100_000), EntityType::Agent)
            .await
            .unwrap();
        assert!(earning.settled_at.is_none());
    }

    #[tokio::test]
    async fn instant_settlement_when_hold_override_is_zero() {
        let service = test_service().await;
        let account = service.engine().get_or_create_account(EntityType::Agent, "agent1b").await.unwrap();

        service
            .store
            .transaction(|tx| {
                Box::pin(async move {
                    let cfg = governance::propose(tx, "settlement.hold_seconds", "0", Some(EntityType::Agent), "ops").await?;
                    governance::submit_for_approval(tx, &cfg.id).await?;
                    let approvers = vec!["ops".to_string(), "bob".to_string(), "carol".to_string()];
                    governance::emergency_override(tx, &cfg.id, &approvers, "test setup: instant settlement").await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let earning = service
            .record_earning(&account.id, "general", MicroUSD::new(100_000), EntityType::Agent)
            .await
            .unwrap();
        assert!(earning.settled_at.is_some());

        let balance = service.engine().get_balance(&account.id, None).await.unwrap();
        assert_eq!(balance.available_micro.get(), 100_000);
    }

    #[tokio::test]
    async fn settle_batch_credits_a_due_earning() {
        let service = test_service().await;
        let account = service.engine().get_or_create_account(EntityType::Agent, "agent2").await.unwrap();

        service
            .store
            .transaction(|tx| {
                let account_id = account.id.clone();
                Box::pin(async move {
                    let now = Utc::now().timestamp();
                    sqlx::query(
                        "INSERT INTO earnings (id, account_id, pool_id, amount_micro, settle_after, settled_at, clawback_reason, created_at) VALUES ('e1', ?1, 'general', 100000, ?2, NULL, NULL, ?2)",
                    )
                    .bind(&account_id)
                    .bind(now - 10)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let settled = service.settle_batch(10).await.unwrap();
        assert_eq!(settled.len(), 1);
        assert!(settled[0].settled_at.is_some());

        let balance = service.engine().get_balance(&account.id, None).await.unwrap();
        assert_eq!(balance.available_micro.get(), 100_000);
    }

    #[tokio::test]
    async fn clawback_beyond_balance_opens_a_receivable() {
        let service = test_service().await;
        let account = service.engine().get_or_create_account(EntityType::Agent, "agent3").await.unwrap();

        service
            .store
            .transaction(|tx| {
                let account_id = account.id.clone();
                Box::pin(async move {
                    let now = Utc::now().timestamp();
                    sqlx::query(
                        "INSERT INTO earnings (id, account_id, pool_id, amount_micro, settle_after, settled_at, clawback_reason, created_at) VALUES ('e2', ?1, 'general', 100000, ?2, ?2, NULL, ?2)",
                    )
                    .bind(&account_id)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;
                    credit_settlement_lot(tx, &account_id, "general", MicroUSD::new(40_000), "e2", now).await
                })
            })
            .await
            .unwrap();

        let receivable = service.clawback("e2", "fraud_review_failed").await.unwrap();
        let receivable = receivable.expect("shortfall should open a receivable");
        assert_eq!(receivable.balance_micro.get(), 60_000);

        let balance = service.engine().get_balance(&account.id, None).await.unwrap();
        assert_eq!(balance.available_micro.get(), 0);
    }
}
