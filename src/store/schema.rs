// src/store/schema.rs
//
// Schema DDL, one `CREATE TABLE IF NOT EXISTS` + index block per entity,
// committed in a single transaction, using SQLite's `CHECK`/`INTEGER`-affinity
// dialect.

use crate::error::LedgerError;
use crate::store::{StoreFacade, Tx};

/// Enum value sets declared in code, cross-checked against the store's
/// `CHECK` constraints at startup by the migration guard.
pub const ENTITY_TYPES: &[&str] = &["person", "agent", "community", "platform"];
pub const LOT_SOURCE_TYPES: &[&str] = &["deposit", "grant", "transfer_in", "tba_deposit", "purchase", "earning_settlement"];
pub const RESERVATION_STATUSES: &[&str] = &["pending", "finalized", "released", "expired"];
pub const BILLING_MODES: &[&str] = &["shadow", "soft", "live"];
pub const LEDGER_ENTRY_TYPES: &[&str] = &[
    "deposit",
    "grant",
    "reserve",
    "finalize",
    "release",
    "transfer_out",
    "transfer_in",
    "settlement",
    "clawback",
    "drip_recovery",
];
pub const TRANSFER_STATUSES: &[&str] = &["pending", "completed", "rejected"];
pub const GOVERNANCE_STATUSES: &[&str] = &[
    "draft",
    "pending_approval",
    "cooling_down",
    "active",
    "superseded",
    "rejected",
];
pub const DISCOUNT_STATUSES: &[&str] = &["active", "expired"];

fn check_in(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StoreFacade {
    /// Creates every table and index this crate needs if absent. Idempotent
    /// — safe to call on every process start.
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let mut tx: Tx<'_> = self.pool().begin().await?;
        run_ddl(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

pub async fn run_ddl(tx: &mut Tx<'_>) -> Result<(), LedgerError> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL CHECK (entity_type IN ({entity_types})),
            entity_id TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            UNIQUE (entity_type, entity_id)
        )
        "#,
        entity_types = check_in(ENTITY_TYPES)
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS lots (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            pool_id TEXT NOT NULL,
            source_type TEXT NOT NULL CHECK (source_type IN ({source_types})),
            source_id TEXT,
            original_micro INTEGER NOT NULL CHECK (original_micro >= 0),
            available_micro INTEGER NOT NULL CHECK (available_micro >= 0),
            reserved_micro INTEGER NOT NULL CHECK (reserved_micro >= 0),
            consumed_micro INTEGER NOT NULL CHECK (consumed_micro >= 0),
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            CHECK (available_micro + reserved_micro + consumed_micro = original_micro)
        )
        "#,
        source_types = check_in(LOT_SOURCE_TYPES)
    ))
    .execute(&mut **tx)
    .await?;

    // Supports the FIFO selection order: pool-restricted before default,
    // finite expiry before none, earlier expiry/created_at first. SQLite
    // sorts NULL first by default in ASC order, so `expires_at ASC` already
    // puts "no expiry" rows (NULL) ahead of dated ones; the engine's query
    // flips that with `expires_at IS NULL` as the primary sort key instead.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_lots_fifo
        ON lots(account_id, pool_id, expires_at, created_at)
        WHERE available_micro > 0
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS reservations (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            pool_id TEXT NOT NULL,
            total_reserved_micro INTEGER NOT NULL CHECK (total_reserved_micro >= 0),
            status TEXT NOT NULL CHECK (status IN ({statuses})),
            billing_mode TEXT NOT NULL CHECK (billing_mode IN ({modes})),
            expires_at INTEGER NOT NULL,
            idempotency_key TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
        statuses = check_in(RESERVATION_STATUSES),
        modes = check_in(BILLING_MODES)
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_reservations_sweep
        ON reservations(status, expires_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_idempotency
        ON reservations(idempotency_key)
        WHERE idempotency_key IS NOT NULL
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reservation_lots (
            reservation_id TEXT NOT NULL REFERENCES reservations(id),
            lot_id TEXT NOT NULL REFERENCES lots(id),
            reserved_micro INTEGER NOT NULL CHECK (reserved_micro > 0),
            PRIMARY KEY (reservation_id, lot_id)
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_entries (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            pool_id TEXT NOT NULL,
            lot_id TEXT REFERENCES lots(id),
            reservation_id TEXT REFERENCES reservations(id),
            entry_seq INTEGER NOT NULL,
            entry_type TEXT NOT NULL CHECK (entry_type IN ({entry_types})),
            amount_micro INTEGER NOT NULL,
            idempotency_key TEXT,
            pre_balance_micro INTEGER NOT NULL,
            post_balance_micro INTEGER NOT NULL,
            description TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (account_id, pool_id, entry_seq)
        )
        "#,
        entry_types = check_in(LEDGER_ENTRY_TYPES)
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_ledger_entries_account_pool_seq
        ON ledger_entries(account_id, pool_id, entry_seq)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account_sequence_counters (
            account_id TEXT NOT NULL,
            pool_id TEXT NOT NULL,
            next_seq INTEGER NOT NULL,
            PRIMARY KEY (account_id, pool_id)
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS transfers (
            id TEXT PRIMARY KEY,
            idempotency_key TEXT NOT NULL UNIQUE,
            from_account_id TEXT NOT NULL REFERENCES accounts(id),
            to_account_id TEXT NOT NULL REFERENCES accounts(id),
            amount_micro INTEGER NOT NULL CHECK (amount_micro > 0),
            status TEXT NOT NULL CHECK (status IN ({statuses})),
            rejection_reason TEXT,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
        statuses = check_in(TRANSFER_STATUSES)
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_transfers_sender_daily
        ON transfers(from_account_id, status, created_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS governance_configs (
            id TEXT PRIMARY KEY,
            param_key TEXT NOT NULL,
            value TEXT NOT NULL,
            entity_type TEXT,
            version INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ({statuses})),
            required_approvals INTEGER NOT NULL,
            approval_count INTEGER NOT NULL DEFAULT 0,
            proposer TEXT NOT NULL,
            approvers TEXT NOT NULL DEFAULT '[]',
            cooldown_ends_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
        statuses = check_in(GOVERNANCE_STATUSES)
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_governance_active_lookup
        ON governance_configs(param_key, entity_type, status)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_governance_cooldowns
        ON governance_configs(status, cooldown_ends_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            scope TEXT NOT NULL,
            key TEXT NOT NULL,
            response_hash TEXT NOT NULL,
            response_payload TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (scope, key)
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expiry
        ON idempotency_keys(expires_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_outbox (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            correlation_id TEXT,
            idempotency_key TEXT,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_outbox_created
        ON event_outbox(created_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS earnings (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            pool_id TEXT NOT NULL,
            amount_micro INTEGER NOT NULL CHECK (amount_micro > 0),
            settle_after INTEGER NOT NULL,
            settled_at INTEGER,
            clawback_reason TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_earnings_settle_queue
        ON earnings(settled_at, settle_after, created_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_earnings_account_created
        ON earnings(account_id, created_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receivables (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            source_clawback_earning_id TEXT NOT NULL,
            original_micro INTEGER NOT NULL CHECK (original_micro > 0),
            balance_micro INTEGER NOT NULL CHECK (balance_micro >= 0),
            resolved_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_receivables_open
        ON receivables(account_id, resolved_at, created_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS marketing_discounts (
            id TEXT PRIMARY KEY,
            account_id TEXT,
            code TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ({statuses})),
            expires_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        statuses = check_in(DISCOUNT_STATUSES)
    ))
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_marketing_discounts_sweep
        ON marketing_discounts(status, expires_at)
        "#,
    )
    .execute(&mut **tx)
    .await?;

    Ok(())
}
