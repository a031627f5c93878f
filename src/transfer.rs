// src/transfer.rs
//
// Peer Transfer — moves credits between two accounts' general pools. Async
// provenance/budget checks run before the transaction opens (they may call
// out to other services and must never hold the store's write lock); a
// denial is never thrown, it's persisted as a `rejected` Transfer row, same
// as a governance cap breach. Once inside the transaction, sender lots are
// split FIFO into fresh recipient lots rather than consumed, so a transfer
// never destroys value the way a finalize does.

use crate::account::DEFAULT_POOL;
use crate::engine::record_entry;
use crate::entry::LedgerEntryType;
use crate::error::LedgerError;
use crate::external::{BalanceCache, BudgetService, ProvenanceVerifier};
use crate::governance;
use crate::lot::LotSourceType;
use crate::outbox;
use crate::primitives::{MicroUSD, SignedMicroUSD};
use crate::store::{StoreFacade, Tx};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Completed,
    Rejected,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransferStatus::Pending),
            "completed" => Some(TransferStatus::Completed),
            "rejected" => Some(TransferStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub idempotency_key: String,
    pub from_account_id: String,
    pub to_account_id: String,
    pub amount_micro: MicroUSD,
    pub status: TransferStatus,
    pub rejection_reason: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

pub struct PeerTransferService {
    store: Arc<StoreFacade>,
    provenance: Arc<dyn ProvenanceVerifier>,
    budget: Arc<dyn BudgetService>,
    balance_cache: Arc<dyn BalanceCache>,
}

impl PeerTransferService {
    pub fn new(
        store: Arc<StoreFacade>,
        provenance: Arc<dyn ProvenanceVerifier>,
        budget: Arc<dyn BudgetService>,
        balance_cache: Arc<dyn BalanceCache>,
    ) -> Self {
        Self { store, provenance, budget, balance_cache }
    }

    pub async fn transfer(
        &self,
        from_account_id: &str,
        to_account_id: &str,
        amount: MicroUSD,
        idempotency_key: &str,
    ) -> Result<Transfer, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::Invalid("transfer amount must be positive".into()));
        }
        if from_account_id == to_account_id {
            return Err(LedgerError::Invalid("cannot transfer to the same account".into()));
        }

        let idempotency_key = idempotency_key.to_string();
        let from_account_id = from_account_id.to_string();
        let to_account_id = to_account_id.to_string();

        if let Some(existing) = self
            .store
            .transaction({
                let idempotency_key = idempotency_key.clone();
                move |tx| {
                    let idempotency_key = idempotency_key.clone();
                    Box::pin(async move { fetch_transfer_by_key(tx, &idempotency_key).await })
                }
            })
            .await?
        {
            return Ok(existing);
        }

        // Pre-transaction policy checks: these may call out to other
        // services, so they run before the store's write lock is taken. A
        // denial here is not thrown — it's persisted as a `rejected`
        // Transfer row, the same durable-rejection path a governance cap
        // breach takes, so a retry with the same idempotency key is
        // answered from the stored row instead of re-invoking the service.
        let denial = match self.provenance.verify(&from_account_id, amount).await {
            Ok(true) => None,
            Ok(false) => Some(("provenance_failed", "provenance check failed".to_string())),
            Err(e) => Some(("provenance_failed", e)),
        };
        let denial = match denial {
            Some(d) => Some(d),
            None => match self.budget.check(&from_account_id, amount).await {
                Ok(true) => None,
                Ok(false) => Some(("budget_exceeded", "budget check failed".to_string())),
                Err(e) => Some(("budget_exceeded", e)),
            },
        };

        if let Some((reason, detail)) = denial {
            tracing::warn!(reason, detail = %detail, from_account_id = %from_account_id, "transfer policy check denied");
            let transfer = self
                .store
                .transaction({
                    let idempotency_key = idempotency_key.clone();
                    let from_account_id = from_account_id.clone();
                    let to_account_id = to_account_id.clone();
                    move |tx| {
                        let idempotency_key = idempotency_key.clone();
                        let from_account_id = from_account_id.clone();
                        let to_account_id = to_account_id.clone();
                        Box::pin(async move {
                            let id = uuid::Uuid::new_v4().to_string();
                            let now = Utc::now().timestamp();
                            reject(tx, &id, &from_account_id, &to_account_id, amount, &idempotency_key, reason, now).await
                        })
                    }
                })
                .await?;
            return Ok(transfer);
        }

        let transfer = self
            .store
            .transaction(|tx| {
                let idempotency_key = idempotency_key.clone();
                let from_account_id = from_account_id.clone();
                let to_account_id = to_account_id.clone();
                Box::pin(async move {
                    run_transfer(tx, &from_account_id, &to_account_id, amount, &idempotency_key).await
                })
            })
            .await?;

        self.balance_cache.invalidate(&from_account_id, DEFAULT_POOL).await;
        self.balance_cache.invalidate(&to_account_id, DEFAULT_POOL).await;
        if transfer.status == TransferStatus::Completed {
            self.budget.record(&from_account_id, amount).await;
        }

        Ok(transfer)
    }
}

async fn run_transfer(
    tx: &mut Tx<'_>,
    from_account_id: &str,
    to_account_id: &str,
    amount: MicroUSD,
    idempotency_key: &str,
) -> Result<Transfer, LedgerError> {
    if let Some(existing) = fetch_transfer_by_key(tx, idempotency_key).await? {
        return Ok(existing);
    }

    for account_id in [from_account_id, to_account_id] {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM accounts WHERE id = ?1")
            .bind(account_id)
            .fetch_optional(&mut **tx)
            .await?;
        if exists.is_none() {
            return Err(LedgerError::NotFound(format!("account {account_id}")));
        }
    }

    let now = Utc::now().timestamp();
    let id = uuid::Uuid::new_v4().to_string();

    let max_single: u64 = governance::resolve(tx, "transfer.max_single_micro", None)
        .await?
        .parse()
        .map_err(|_| LedgerError::internal("transfer.max_single_micro is not a valid integer"))?;
    let daily_limit: u64 = governance::resolve(tx, "transfer.daily_limit_micro", None)
        .await?
        .parse()
        .map_err(|_| LedgerError::internal("transfer.daily_limit_micro is not a valid integer"))?;

    if amount.get() > max_single {
        return reject(tx, &id, from_account_id, to_account_id, amount, idempotency_key, "governance_limit_exceeded:max_single", now).await;
    }

    let window_start = now - 86_400;
    let sent_today: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(amount_micro) FROM transfers WHERE from_account_id = ?1 AND status = 'completed' AND created_at >= ?2",
    )
    .bind(from_account_id)
    .bind(window_start)
    .fetch_one(&mut **tx)
    .await?;
    let sent_today = sent_today.0.unwrap_or(0) as u64;
    if sent_today + amount.get() > daily_limit {
        return reject(tx, &id, from_account_id, to_account_id, amount, idempotency_key, "governance_limit_exceeded:daily_limit", now).await;
    }

    sqlx::query(
        r#"
        INSERT INTO transfers (id, idempotency_key, from_account_id, to_account_id, amount_micro, status, rejection_reason, created_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', NULL, ?6, NULL)
        "#,
    )
    .bind(&id)
    .bind(idempotency_key)
    .bind(from_account_id)
    .bind(to_account_id)
    .bind(amount.get() as i64)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    outbox::emit_event(
        tx,
        "transfer.initiated",
        "transfer",
        &id,
        None,
        Some(idempotency_key),
        &json!({"from_account_id": from_account_id, "to_account_id": to_account_id, "amount_micro": amount.get()}),
    )
    .await;

    let candidates = select_sender_lots(tx, from_account_id, now).await?;
    let mut remaining = amount.get();
    let mut touched_sender_lot: Option<String> = None;
    for (lot_id, available, expires_at) in candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(available as u64);
        if take == 0 {
            continue;
        }
        sqlx::query("UPDATE lots SET original_micro = original_micro - ?1, available_micro = available_micro - ?1 WHERE id = ?2")
            .bind(take as i64)
            .bind(&lot_id)
            .execute(&mut **tx)
            .await?;

        let recipient_lot_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO lots (id, account_id, pool_id, source_type, source_id, original_micro, available_micro, reserved_micro, consumed_micro, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, 0, ?7, ?8)
            "#,
        )
        .bind(&recipient_lot_id)
        .bind(to_account_id)
        .bind(DEFAULT_POOL)
        .bind(LotSourceType::TransferIn.as_str())
        .bind(&id)
        .bind(take as i64)
        .bind(expires_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        remaining -= take;
        touched_sender_lot = Some(lot_id);
    }

    if remaining > 0 {
        return Err(LedgerError::InsufficientBalance);
    }

    sqlx::query("UPDATE transfers SET status = 'completed', completed_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(&id)
        .execute(&mut **tx)
        .await?;

    record_entry(
        tx,
        from_account_id,
        DEFAULT_POOL,
        touched_sender_lot.as_deref(),
        None,
        LedgerEntryType::TransferOut,
        SignedMicroUSD::negative(amount),
        Some(idempotency_key),
        Some(&format!("transfer to {to_account_id}")),
        now,
    )
    .await?;
    record_entry(
        tx,
        to_account_id,
        DEFAULT_POOL,
        None,
        None,
        LedgerEntryType::TransferIn,
        SignedMicroUSD::positive(amount),
        Some(idempotency_key),
        Some(&format!("transfer from {from_account_id}")),
        now,
    )
    .await?;

    outbox::emit_event(
        tx,
        "transfer.completed",
        "transfer",
        &id,
        None,
        Some(idempotency_key),
        &json!({"from_account_id": from_account_id, "to_account_id": to_account_id, "amount_micro": amount.get()}),
    )
    .await;

    fetch_transfer(tx, &id).await
}

#[allow(clippy::too_many_arguments)]
async fn reject(
    tx: &mut Tx<'_>,
    id: &str,
    from_account_id: &str,
    to_account_id: &str,
    amount: MicroUSD,
    idempotency_key: &str,
    reason: &str,
    now: i64,
) -> Result<Transfer, LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO transfers (id, idempotency_key, from_account_id, to_account_id, amount_micro, status, rejection_reason, created_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'rejected', ?6, ?7, NULL)
        "#,
    )
    .bind(id)
    .bind(idempotency_key)
    .bind(from_account_id)
    .bind(to_account_id)
    .bind(amount.get() as i64)
    .bind(reason)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    outbox::emit_event(
        tx,
        "transfer.rejected",
        "transfer",
        id,
        None,
        Some(idempotency_key),
        &json!({"reason": reason}),
    )
    .await;

    fetch_transfer(tx, id).await
}

async fn select_sender_lots(tx: &mut Tx<'_>, account_id: &str, now_epoch: i64) -> Result<Vec<(String, i64, Option<i64>)>, LedgerError> {
    let rows: Vec<(String, i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT id, available_micro, expires_at FROM lots
        WHERE account_id = ?1 AND pool_id = ?2 AND available_micro > 0
          AND (expires_at IS NULL OR expires_at > ?3)
        ORDER BY
          CASE WHEN expires_at IS NULL THEN 1 ELSE 0 END,
          expires_at ASC,
          created_at ASC
        "#,
    )
    .bind(account_id)
    .bind(DEFAULT_POOL)
    .bind(now_epoch)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

async fn fetch_transfer(tx: &mut Tx<'_>, id: &str) -> Result<Transfer, LedgerError> {
    let row: Option<TransferRow> = sqlx::query_as(
        r#"
        SELECT id, idempotency_key, from_account_id, to_account_id, amount_micro, status, rejection_reason, created_at, completed_at
        FROM transfers WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| LedgerError::NotFound(format!("transfer {id}")))?.into_transfer()
}

async fn fetch_transfer_by_key(tx: &mut Tx<'_>, idempotency_key: &str) -> Result<Option<Transfer>, LedgerError> {
    let row: Option<TransferRow> = sqlx::query_as(
        r#"
        SELECT id, idempotency_key, from_account_id, to_account_id, amount_micro, status, rejection_reason, created_at, completed_at
        FROM transfers WHERE idempotency_key = ?1
        "#,
    )
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| r.into_transfer()).transpose()
}

#[derive(sqlx::FromRow)]
struct TransferRow {
    id: String,
    idempotency_key: String,
    from_account_id: String,
    to_account_id: String,
    amount_micro: i64,
    status: String,
    rejection_reason: Option<String>,
    created_at: i64,
    completed_at: Option<i64>,
}

impl TransferRow {
    fn into_transfer(self) -> Result<Transfer, LedgerError> {
        Ok(Transfer {
            id: self.id,
            idempotency_key: self.idempotency_key,
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount_micro: MicroUSD::new(self.amount_micro as u64),
            status: TransferStatus::from_str(&self.status)
                .ok_or_else(|| LedgerError::internal("unknown transfer status in store"))?,
            rejection_reason: self.rejection_reason,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}
