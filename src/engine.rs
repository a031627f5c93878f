// src/engine.rs
//
// Ledger Engine — account creation, lot minting, reservation, finalize, and
// release. Every write funnels through `StoreFacade::transaction`, a single
// entry point for every balance-changing operation. FIFO lot selection and
// the finalize per-lot walk are a phased-consumption algorithm over an
// ordered lot list.

use crate::account::{effective_pool, Account, EntityType, DEFAULT_POOL};
use crate::entry::{HistoryFilter, LedgerEntry, LedgerEntryType};
use crate::error::LedgerError;
use crate::idempotency;
use crate::lot::{Lot, LotSourceType};
use crate::primitives::{MicroUSD, SignedMicroUSD};
use crate::reservation::{apportion, BillingMode, FinalizeOutcome, Reservation, ReservationLotAllocation, ReservationResult, ReservationStatus};
use crate::store::{StoreFacade, Tx};
use chrono::Utc;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Default)]
pub struct MintOptions {
    pub pool_id: Option<String>,
    pub source_id: Option<String>,
    pub expires_at: Option<i64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReserveOptions {
    pub pool_id: Option<String>,
    pub billing_mode: BillingMode,
    pub ttl_seconds: Option<i64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseOptions {
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub available_micro: MicroUSD,
    pub reserved_micro: MicroUSD,
}

/// Ledger Engine: account/lot/reservation lifecycle operations over a single
/// `StoreFacade`. Holds no mutable state of its own — every method opens its
/// own transaction and leaves nothing cached between calls.
pub struct LedgerEngine {
    store: std::sync::Arc<StoreFacade>,
    default_reservation_ttl_seconds: i64,
    idempotency_key_ttl_hours: i64,
}

impl LedgerEngine {
    /// Takes a shared `StoreFacade` so other components (peer transfer,
    /// settlement, the sweeper) can be wired against the same connection
    /// pool without the engine giving up ownership of it.
    pub fn new(store: std::sync::Arc<StoreFacade>, default_reservation_ttl_seconds: i64, idempotency_key_ttl_hours: i64) -> Self {
        Self {
            store,
            default_reservation_ttl_seconds,
            idempotency_key_ttl_hours,
        }
    }

    pub fn store(&self) -> &StoreFacade {
        &self.store
    }

    pub fn store_handle(&self) -> std::sync::Arc<StoreFacade> {
        self.store.clone()
    }

    pub async fn get_or_create_account(&self, entity_type: EntityType, entity_id: &str) -> Result<Account, LedgerError> {
        if entity_id.is_empty() {
            return Err(LedgerError::Invalid("entity_id must not be empty".into()));
        }

        self.store
            .transaction(|tx| Box::pin(async move {
                if let Some(account) = fetch_account_by_entity(tx, entity_type, entity_id).await? {
                    return Ok(account);
                }

                let now = Utc::now();
                let id = new_id();
                sqlx::query(
                    r#"
                    INSERT INTO accounts (id, entity_type, entity_id, version, created_at)
                    VALUES (?1, ?2, ?3, 1, ?4)
                    ON CONFLICT (entity_type, entity_id) DO NOTHING
                    "#,
                )
                .bind(&id)
                .bind(entity_type.as_str())
                .bind(entity_id)
                .bind(now.timestamp())
                .execute(&mut **tx)
                .await?;

                fetch_account_by_entity(tx, entity_type, entity_id)
                    .await?
                    .ok_or_else(|| LedgerError::internal("account insert did not round-trip"))
            }))
            .await
    }

    pub async fn mint_lot(
        &self,
        account_id: &str,
        source_type: LotSourceType,
        amount: MicroUSD,
        opts: MintOptions,
    ) -> Result<Lot, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::Invalid("mint amount must be positive".into()));
        }
        let ttl_hours = self.idempotency_key_ttl_hours;

        self.store
            .transaction(|tx| {
                let opts = opts.clone();
                Box::pin(async move {
                if let Some(key) = &opts.idempotency_key {
                    let now = Utc::now().timestamp();
                    if let Some((_, payload)) = idempotency::lookup(tx, "mint", key, now).await? {
                        let lot: Lot = serde_json::from_str(&payload)
                            .map_err(|e| LedgerError::internal(format!("corrupt idempotency payload: {e}")))?;
                        return Ok(lot);
                    }
                }

                ensure_account_exists(tx, account_id).await?;

                let pool_id = effective_pool(opts.pool_id.as_deref()).to_string();
                let now = Utc::now().timestamp();
                let id = new_id();

                sqlx::query(
                    r#"
                    INSERT INTO lots (id, account_id, pool_id, source_type, source_id, original_micro, available_micro, reserved_micro, consumed_micro, expires_at, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, 0, ?7, ?8)
                    "#,
                )
                .bind(&id)
                .bind(account_id)
                .bind(&pool_id)
                .bind(source_type.as_str())
                .bind(&opts.source_id)
                .bind(amount.get() as i64)
                .bind(opts.expires_at)
                .bind(now)
                .execute(&mut **tx)
                .await?;

                let entry_type = LedgerEntryType::from_str(source_type.mint_entry_type())
                    .ok_or_else(|| LedgerError::internal("unknown mint entry type"))?;
                record_entry(
                    tx,
                    account_id,
                    &pool_id,
                    Some(&id),
                    None,
                    entry_type,
                    SignedMicroUSD::positive(amount),
                    opts.idempotency_key.as_deref(),
                    None,
                    now,
                )
                .await?;

                let lot = Lot {
                    id,
                    account_id: account_id.to_string(),
                    pool_id,
                    source_type,
                    source_id: opts.source_id.clone(),
                    original_micro: amount,
                    available_micro: amount,
                    reserved_micro: MicroUSD::ZERO,
                    consumed_micro: MicroUSD::ZERO,
                    expires_at: opts.expires_at,
                    created_at: now,
                };

                if let Some(key) = &opts.idempotency_key {
                    let payload = serde_json::to_string(&lot)
                        .map_err(|e| LedgerError::internal(format!("cannot serialize lot: {e}")))?;
                    idempotency::store(tx, "mint", key, "", &payload, ttl_hours).await?;
                }

                Ok(lot)
                })
            })
            .await
    }

    pub async fn reserve(&self, account_id: &str, amount: MicroUSD, opts: ReserveOptions) -> Result<ReservationResult, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::Invalid("reserve amount must be positive".into()));
        }
        let default_ttl = self.default_reservation_ttl_seconds;

        self.store
            .transaction(|tx| {
                let opts = opts.clone();
                Box::pin(async move {
                ensure_account_exists(tx, account_id).await?;

                if let Some(key) = &opts.idempotency_key {
                    if let Some(existing) = fetch_reservation_by_idempotency_key(tx, key).await? {
                        let allocations = fetch_reservation_lots_ordered(tx, &existing.id).await?;
                        return Ok(ReservationResult {
                            reservation: existing,
                            lot_allocations: allocations
                                .into_iter()
                                .map(|(lot_id, reserved_micro)| ReservationLotAllocation {
                                    lot_id,
                                    reserved_micro: MicroUSD::new(reserved_micro),
                                })
                                .collect(),
                        });
                    }
                }

                let pool_id = effective_pool(opts.pool_id.as_deref()).to_string();
                let now = Utc::now().timestamp();
                let candidates = select_fifo_lots(tx, account_id, &pool_id, now).await?;

                let mut remaining = amount.get();
                let mut allocations = Vec::new();
                for (lot_id, available) in candidates {
                    if remaining == 0 {
                        break;
                    }
                    let take = remaining.min(available as u64);
                    if take == 0 {
                        continue;
                    }
                    sqlx::query(
                        "UPDATE lots SET available_micro = available_micro - ?1, reserved_micro = reserved_micro + ?1 WHERE id = ?2",
                    )
                    .bind(take as i64)
                    .bind(&lot_id)
                    .execute(&mut **tx)
                    .await?;
                    remaining -= take;
                    allocations.push((lot_id, take));
                }

                if remaining > 0 {
                    return Err(LedgerError::InsufficientBalance);
                }

                let reservation_id = new_id();
                let expires_at = now + opts.ttl_seconds.unwrap_or(default_ttl);
                sqlx::query(
                    r#"
                    INSERT INTO reservations (id, account_id, pool_id, total_reserved_micro, status, billing_mode, expires_at, idempotency_key, created_at)
                    VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)
                    "#,
                )
                .bind(&reservation_id)
                .bind(account_id)
                .bind(&pool_id)
                .bind(amount.get() as i64)
                .bind(opts.billing_mode.as_str())
                .bind(expires_at)
                .bind(&opts.idempotency_key)
                .bind(now)
                .execute(&mut **tx)
                .await?;

                for (lot_id, reserved_micro) in &allocations {
                    sqlx::query(
                        "INSERT INTO reservation_lots (reservation_id, lot_id, reserved_micro) VALUES (?1, ?2, ?3)",
                    )
                    .bind(&reservation_id)
                    .bind(lot_id)
                    .bind(*reserved_micro as i64)
                    .execute(&mut **tx)
                    .await?;
                }

                record_entry(
                    tx,
                    account_id,
                    &pool_id,
                    allocations.last().map(|(id, _)| id.as_str()),
                    Some(&reservation_id),
                    LedgerEntryType::Reserve,
                    SignedMicroUSD::negative(amount),
                    opts.idempotency_key.as_deref(),
                    None,
                    now,
                )
                .await?;

                let reservation = Reservation {
                    id: reservation_id,
                    account_id: account_id.to_string(),
                    pool_id,
                    total_reserved_micro: amount,
                    status: ReservationStatus::Pending,
                    billing_mode: opts.billing_mode,
                    expires_at,
                    idempotency_key: opts.idempotency_key.clone(),
                    created_at: now,
                };

                Ok(ReservationResult {
                    reservation,
                    lot_allocations: allocations
                        .into_iter()
                        .map(|(lot_id, reserved_micro)| ReservationLotAllocation {
                            lot_id,
                            reserved_micro: MicroUSD::new(reserved_micro),
                        })
                        .collect(),
                })
                })
            })
            .await
    }

    pub async fn finalize(&self, reservation_id: &str, actual_cost: MicroUSD, opts: FinalizeOptions) -> Result<FinalizeOutcome, LedgerError> {
        let ttl_hours = self.idempotency_key_ttl_hours;

        self.store
            .transaction(|tx| {
                let opts = opts.clone();
                Box::pin(async move {
                let now = Utc::now().timestamp();
                let scope = format!("finalize:{reservation_id}");
                let shape = idempotency::hash_shape(&[&actual_cost.get().to_string()]);

                if let Some(key) = &opts.idempotency_key {
                    if let Some((stored_hash, payload)) = idempotency::lookup(tx, &scope, key, now).await? {
                        if stored_hash != shape {
                            return Err(LedgerError::Conflict(
                                "finalize retried with a different actual_cost for the same idempotency key".into(),
                            ));
                        }
                        let outcome: FinalizeOutcome = serde_json::from_str(&payload)
                            .map_err(|e| LedgerError::internal(format!("corrupt idempotency payload: {e}")))?;
                        return Ok(outcome);
                    }
                }

                let reservation = fetch_reservation(tx, reservation_id).await?;
                if reservation.status != ReservationStatus::Pending {
                    return Err(LedgerError::InvalidState(format!(
                        "reservation is {}, expected pending",
                        reservation.status.as_str()
                    )));
                }

                let outcome = apportion(reservation.billing_mode, reservation.total_reserved_micro, actual_cost);

                let lots = fetch_reservation_lots_ordered(tx, reservation_id).await?;
                let mut remaining = outcome.effective_cost_micro.get();
                let mut total_released: u64 = 0;
                let mut touched_lot: Option<String> = None;

                for (lot_id, reserved) in &lots {
                    let consume = remaining.min(*reserved);
                    let release = reserved - consume;
                    remaining -= consume;
                    total_released += release;
                    touched_lot = Some(lot_id.clone());
                    sqlx::query(
                        "UPDATE lots SET available_micro = available_micro + ?1, reserved_micro = reserved_micro - ?2, consumed_micro = consumed_micro + ?3 WHERE id = ?4",
                    )
                    .bind(release as i64)
                    .bind(*reserved as i64)
                    .bind(consume as i64)
                    .bind(lot_id)
                    .execute(&mut **tx)
                    .await?;
                }

                // Soft-mode overrun beyond the reservation's own lots: draw
                // the remainder from the account's other available lots,
                // FIFO, same pool preference rules as `reserve`.
                let mut total_extra_consumed: u64 = 0;
                if remaining > 0 {
                    let extra_lots = select_fifo_lots(tx, &reservation.account_id, &reservation.pool_id, now).await?;
                    for (lot_id, available) in extra_lots {
                        if remaining == 0 {
                            break;
                        }
                        let take = remaining.min(available as u64);
                        if take == 0 {
                            continue;
                        }
                        sqlx::query(
                            "UPDATE lots SET available_micro = available_micro - ?1, consumed_micro = consumed_micro + ?1 WHERE id = ?2",
                        )
                        .bind(take as i64)
                        .bind(&lot_id)
                        .execute(&mut **tx)
                        .await?;
                        remaining -= take;
                        total_extra_consumed += take;
                        touched_lot = Some(lot_id);
                    }
                    // If the account's other lots still can't cover the
                    // overrun, the uncollected remainder is left unapplied
                    // rather than forcing a lot negative; `actual_cost` and
                    // `effective_cost_micro` on the returned outcome still
                    // reflect the full intended charge.
                }

                sqlx::query("UPDATE reservations SET status = 'finalized' WHERE id = ?1")
                    .bind(reservation_id)
                    .execute(&mut **tx)
                    .await?;

                let net_amount = total_released as i64 - total_extra_consumed as i64;
                record_entry(
                    tx,
                    &reservation.account_id,
                    &reservation.pool_id,
                    touched_lot.as_deref(),
                    Some(reservation_id),
                    LedgerEntryType::Finalize,
                    SignedMicroUSD::new(net_amount),
                    opts.idempotency_key.as_deref(),
                    opts.description.as_deref(),
                    now,
                )
                .await?;

                let final_outcome = FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: outcome.effective_cost_micro,
                    surplus_released_micro: MicroUSD::new(total_released),
                    overrun_micro: outcome.overrun_micro,
                };

                if let Some(key) = &opts.idempotency_key {
                    let payload = serde_json::to_string(&final_outcome)
                        .map_err(|e| LedgerError::internal(format!("cannot serialize outcome: {e}")))?;
                    idempotency::store(tx, &scope, key, &shape, &payload, ttl_hours).await?;
                }

                Ok(final_outcome)
                })
            })
            .await
    }

    pub async fn release(&self, reservation_id: &str, opts: ReleaseOptions) -> Result<MicroUSD, LedgerError> {
        let ttl_hours = self.idempotency_key_ttl_hours;

        self.store
            .transaction(|tx| {
                let opts = opts.clone();
                Box::pin(async move {
                let now = Utc::now().timestamp();
                let scope = format!("release:{reservation_id}");

                if let Some(key) = &opts.idempotency_key {
                    if let Some((_, payload)) = idempotency::lookup(tx, &scope, key, now).await? {
                        let released: u64 = payload
                            .parse()
                            .map_err(|_| LedgerError::internal("corrupt idempotency payload"))?;
                        return Ok(MicroUSD::new(released));
                    }
                }

                let reservation = fetch_reservation(tx, reservation_id).await?;
                if reservation.status != ReservationStatus::Pending {
                    return Err(LedgerError::InvalidState(format!(
                        "reservation is {}, expected pending",
                        reservation.status.as_str()
                    )));
                }

                let released = release_reservation_lots(tx, reservation_id).await?;

                sqlx::query("UPDATE reservations SET status = 'released' WHERE id = ?1")
                    .bind(reservation_id)
                    .execute(&mut **tx)
                    .await?;

                record_entry(
                    tx,
                    &reservation.account_id,
                    &reservation.pool_id,
                    None,
                    Some(reservation_id),
                    LedgerEntryType::Release,
                    SignedMicroUSD::positive(MicroUSD::new(released)),
                    opts.idempotency_key.as_deref(),
                    Some("released"),
                    now,
                )
                .await?;

                if let Some(key) = &opts.idempotency_key {
                    idempotency::store(tx, &scope, key, "", &released.to_string(), ttl_hours).await?;
                }

                Ok(MicroUSD::new(released))
                })
            })
            .await
    }

    pub async fn get_balance(&self, account_id: &str, pool: Option<&str>) -> Result<Balance, LedgerError> {
        let pool_id = effective_pool(pool).to_string();
        self.store
            .transaction(|tx| {
                let pool_id = pool_id.clone();
                Box::pin(async move {
                let row: (i64, i64) = sqlx::query_as(
                    "SELECT COALESCE(SUM(available_micro), 0), COALESCE(SUM(reserved_micro), 0) FROM lots WHERE account_id = ?1 AND pool_id = ?2",
                )
                .bind(account_id)
                .bind(&pool_id)
                .fetch_one(&mut **tx)
                .await?;
                Ok(Balance {
                    available_micro: MicroUSD::new(row.0 as u64),
                    reserved_micro: MicroUSD::new(row.1 as u64),
                })
                })
            })
            .await
    }

    pub async fn get_history(&self, account_id: &str, pool: Option<&str>, filter: HistoryFilter) -> Result<Vec<LedgerEntry>, LedgerError> {
        let pool_id = effective_pool(pool).to_string();
        self.store
            .transaction(|tx| {
                let pool_id = pool_id.clone();
                let filter = filter.clone();
                Box::pin(async move {
                let after_seq = filter.after_seq.unwrap_or(0) as i64;
                let rows: Vec<LedgerEntryRow> = sqlx::query_as(
                    r#"
                    SELECT id, account_id, pool_id, lot_id, reservation_id, entry_seq, entry_type,
                           amount_micro, idempotency_key, pre_balance_micro, post_balance_micro,
                           description, created_at
                    FROM ledger_entries
                    WHERE account_id = ?1 AND pool_id = ?2 AND entry_seq > ?3
                    ORDER BY entry_seq ASC
                    LIMIT ?4
                    "#,
                )
                .bind(account_id)
                .bind(&pool_id)
                .bind(after_seq)
                .bind(filter.limit as i64)
                .fetch_all(&mut **tx)
                .await?;

                rows.into_iter()
                    .map(|r| r.into_entry())
                    .filter(|entry| match (&filter.entry_type, entry) {
                        (Some(wanted), Ok(e)) => e.entry_type == *wanted,
                        (None, _) => true,
                        (_, Err(_)) => true,
                    })
                    .collect()
                })
            })
            .await
    }
}

async fn fetch_account_by_entity(tx: &mut Tx<'_>, entity_type: EntityType, entity_id: &str) -> Result<Option<Account>, LedgerError> {
    let row: Option<AccountRow> = sqlx::query_as(
        "SELECT id, entity_type, entity_id, version, created_at FROM accounts WHERE entity_type = ?1 AND entity_id = ?2",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| r.into_account()).transpose()
}

async fn ensure_account_exists(tx: &mut Tx<'_>, account_id: &str) -> Result<(), LedgerError> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM accounts WHERE id = ?1")
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;
    if exists.is_none() {
        return Err(LedgerError::NotFound(format!("account {account_id}")));
    }
    Ok(())
}

async fn fetch_reservation(tx: &mut Tx<'_>, reservation_id: &str) -> Result<Reservation, LedgerError> {
    let row: Option<ReservationRow> = sqlx::query_as(
        r#"
        SELECT id, account_id, pool_id, total_reserved_micro, status, billing_mode, expires_at, idempotency_key, created_at
        FROM reservations WHERE id = ?1
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.ok_or_else(|| LedgerError::NotFound(format!("reservation {reservation_id}")))?
        .into_reservation()
}

async fn fetch_reservation_by_idempotency_key(tx: &mut Tx<'_>, key: &str) -> Result<Option<Reservation>, LedgerError> {
    let row: Option<ReservationRow> = sqlx::query_as(
        r#"
        SELECT id, account_id, pool_id, total_reserved_micro, status, billing_mode, expires_at, idempotency_key, created_at
        FROM reservations WHERE idempotency_key = ?1
        "#,
    )
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| r.into_reservation()).transpose()
}

/// Replays the same FIFO order the allocating `reserve()` call used, by
/// insertion order (`reservation_lots` has no explicit sequence column;
/// SQLite preserves rowid order for an unordered `INSERT ... SELECT`-free
/// table, and every insert happens in selection order within one transaction).
async fn fetch_reservation_lots_ordered(tx: &mut Tx<'_>, reservation_id: &str) -> Result<Vec<(String, u64)>, LedgerError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT lot_id, reserved_micro FROM reservation_lots WHERE reservation_id = ?1 ORDER BY rowid ASC",
    )
    .bind(reservation_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(|(id, amt)| (id, amt as u64)).collect())
}

pub(crate) async fn release_reservation_lots(tx: &mut Tx<'_>, reservation_id: &str) -> Result<u64, LedgerError> {
    let lots = fetch_reservation_lots_ordered(tx, reservation_id).await?;
    let mut total = 0u64;
    for (lot_id, reserved) in lots {
        sqlx::query("UPDATE lots SET available_micro = available_micro + ?1, reserved_micro = reserved_micro - ?1 WHERE id = ?2")
            .bind(reserved as i64)
            .bind(&lot_id)
            .execute(&mut **tx)
            .await?;
        total += reserved;
    }
    Ok(total)
}

/// Selects spendable lots in FIFO order: lots in the requested pool before
/// lots in the default pool, finite-expiry lots before open-ended ones,
/// earlier `expires_at` first among those, then earlier `created_at`.
pub(crate) async fn select_fifo_lots(tx: &mut Tx<'_>, account_id: &str, pool_id: &str, now_epoch: i64) -> Result<Vec<(String, i64)>, LedgerError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT id, available_micro FROM lots
        WHERE account_id = ?1
          AND available_micro > 0
          AND (pool_id = ?2 OR pool_id = ?3)
          AND (expires_at IS NULL OR expires_at > ?4)
        ORDER BY
          CASE WHEN pool_id = ?2 THEN 0 ELSE 1 END,
          CASE WHEN expires_at IS NULL THEN 1 ELSE 0 END,
          expires_at ASC,
          created_at ASC
        "#,
    )
    .bind(account_id)
    .bind(pool_id)
    .bind(DEFAULT_POOL)
    .bind(now_epoch)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

/// Allocates the next `entry_seq` for `(account_id, pool_id)`. Bumps the
/// counter row if present; otherwise seeds it at 2 and returns 1, so the
/// first entry for any (account, pool) always gets sequence 1.
pub(crate) async fn allocate_seq(tx: &mut Tx<'_>, account_id: &str, pool_id: &str) -> Result<u64, LedgerError> {
    let updated = sqlx::query("UPDATE account_sequence_counters SET next_seq = next_seq + 1 WHERE account_id = ?1 AND pool_id = ?2")
        .bind(account_id)
        .bind(pool_id)
        .execute(&mut **tx)
        .await?;

    if updated.rows_affected() == 0 {
        sqlx::query("INSERT INTO account_sequence_counters (account_id, pool_id, next_seq) VALUES (?1, ?2, 2)")
            .bind(account_id)
            .bind(pool_id)
            .execute(&mut **tx)
            .await?;
        return Ok(1);
    }

    let row: (i64,) = sqlx::query_as("SELECT next_seq FROM account_sequence_counters WHERE account_id = ?1 AND pool_id = ?2")
        .bind(account_id)
        .bind(pool_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok((row.0 - 1) as u64)
}

/// Posts an immutable ledger entry. `post_balance` is always recomputed from
/// `lots` after the caller's mutations have been applied in the same
/// transaction; `pre_balance` is derived as `post_balance - amount` rather
/// than snapshotted beforehand, so invariant (`pre + amount = post`) holds by
/// construction instead of by two independent reads racing each other.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_entry(
    tx: &mut Tx<'_>,
    account_id: &str,
    pool_id: &str,
    lot_id: Option<&str>,
    reservation_id: Option<&str>,
    entry_type: LedgerEntryType,
    amount: SignedMicroUSD,
    idempotency_key: Option<&str>,
    description: Option<&str>,
    now_epoch: i64,
) -> Result<LedgerEntry, LedgerError> {
    let post_balance: (i64,) = sqlx::query_as("SELECT COALESCE(SUM(available_micro), 0) FROM lots WHERE account_id = ?1 AND pool_id = ?2")
        .bind(account_id)
        .bind(pool_id)
        .fetch_one(&mut **tx)
        .await?;
    let post_balance_micro = post_balance.0;
    let pre_balance_micro = post_balance_micro - amount.get();

    let seq = allocate_seq(tx, account_id, pool_id).await?;
    let id = new_id();

    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, account_id, pool_id, lot_id, reservation_id, entry_seq, entry_type, amount_micro, idempotency_key, pre_balance_micro, post_balance_micro, description, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&id)
    .bind(account_id)
    .bind(pool_id)
    .bind(lot_id)
    .bind(reservation_id)
    .bind(seq as i64)
    .bind(entry_type.as_str())
    .bind(amount.get())
    .bind(idempotency_key)
    .bind(pre_balance_micro)
    .bind(post_balance_micro)
    .bind(description)
    .bind(now_epoch)
    .execute(&mut **tx)
    .await?;

    Ok(LedgerEntry {
        id,
        account_id: account_id.to_string(),
        pool_id: pool_id.to_string(),
        lot_id: lot_id.map(str::to_string),
        reservation_id: reservation_id.map(str::to_string),
        entry_seq: seq,
        entry_type,
        amount_micro: amount,
        idempotency_key: idempotency_key.map(str::to_string),
        pre_balance_micro,
        post_balance_micro,
        description: description.map(str::to_string),
        created_at: now_epoch,
    })
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    entity_type: String,
    entity_id: String,
    version: i64,
    created_at: i64,
}

impl AccountRow {
    fn into_account(self) -> Result<Account, LedgerError> {
        Ok(Account {
            id: self.id,
            entity_type: EntityType::from_str(&self.entity_type)
                .ok_or_else(|| LedgerError::internal("unknown entity_type in store"))?,
            entity_id: self.entity_id,
            version: self.version,
            created_at: chrono::DateTime::from_timestamp(self.created_at, 0)
                .ok_or_else(|| LedgerError::internal("invalid created_at in store"))?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: String,
    account_id: String,
    pool_id: String,
    total_reserved_micro: i64,
    status: String,
    billing_mode: String,
    expires_at: i64,
    idempotency_key: Option<String>,
    created_at: i64,
}

impl ReservationRow {
    fn into_reservation(self) -> Result<Reservation, LedgerError> {
        Ok(Reservation {
            id: self.id,
            account_id: self.account_id,
            pool_id: self.pool_id,
            total_reserved_micro: MicroUSD::new(self.total_reserved_micro as u64),
            status: ReservationStatus::from_str(&self.status)
                .ok_or_else(|| LedgerError::internal("unknown reservation status in store"))?,
            billing_mode: BillingMode::from_str(&self.billing_mode)
                .ok_or_else(|| LedgerError::internal("unknown billing mode in store"))?,
            expires_at: self.expires_at,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LedgerEntryRow {
    id: String,
    account_id: String,
    pool_id: String,
    lot_id: Option<String>,
    reservation_id: Option<String>,
    entry_seq: i64,
    entry_type: String,
    amount_micro: i64,
    idempotency_key: Option<String>,
    pre_balance_micro: i64,
    post_balance_micro: i64,
    description: Option<String>,
    created_at: i64,
}

impl LedgerEntryRow {
    fn into_entry(self) -> Result<LedgerEntry, LedgerError> {
        Ok(LedgerEntry {
            id: self.id,
            account_id: self.account_id,
            pool_id: self.pool_id,
            lot_id: self.lot_id,
            reservation_id: self.reservation_id,
            entry_seq: self.entry_seq as u64,
            entry_type: LedgerEntryType::from_str(&self.entry_type)
                .ok_or_else(|| LedgerError::internal("unknown ledger entry type in store"))?,
            amount_micro: SignedMicroUSD::new(self.amount_micro),
            idempotency_key: self.idempotency_key,
            pre_balance_micro: self.pre_balance_micro,
            post_balance_micro: self.post_balance_micro,
            description: self.description,
            created_at: self.created_at,
        })
    }
}
