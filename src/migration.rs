// src/migration.rs
//
// Migration guard — schema self-test run at startup, and a generic
// rebuild-table helper for the one class of change SQLite's `ALTER TABLE`
// can't express directly (changing a column's `CHECK` constraint set).
// Fail loud at boot: a system must not start against a store it can't trust.

use crate::error::LedgerError;
use crate::store::schema::{
    BILLING_MODES, DISCOUNT_STATUSES, ENTITY_TYPES, GOVERNANCE_STATUSES, LEDGER_ENTRY_TYPES, LOT_SOURCE_TYPES,
    RESERVATION_STATUSES, TRANSFER_STATUSES,
};
use crate::store::StoreFacade;
use std::collections::HashSet;

pub struct MigrationGuard;

impl MigrationGuard {
    /// Runs the full startup self-test: schema creation, foreign-key
    /// integrity, `CHECK`-constraint value sets, and required indexes. Fails
    /// loud — a `LedgerSystem` must not start against a store it can't trust.
    pub async fn run(store: &StoreFacade) -> Result<(), LedgerError> {
        store.init_schema().await?;
        Self::self_test(store).await
    }

    pub async fn self_test(store: &StoreFacade) -> Result<(), LedgerError> {
        check_foreign_keys(store).await?;
        check_enum_values(store, "lots", "source_type", LOT_SOURCE_TYPES).await?;
        check_enum_values(store, "reservations", "status", RESERVATION_STATUSES).await?;
        check_enum_values(store, "reservations", "billing_mode", BILLING_MODES).await?;
        check_enum_values(store, "ledger_entries", "entry_type", LEDGER_ENTRY_TYPES).await?;
        check_enum_values(store, "accounts", "entity_type", ENTITY_TYPES).await?;
        check_enum_values(store, "transfers", "status", TRANSFER_STATUSES).await?;
        check_enum_values(store, "governance_configs", "status", GOVERNANCE_STATUSES).await?;
        check_enum_values(store, "marketing_discounts", "status", DISCOUNT_STATUSES).await?;
        check_required_indexes(store).await?;
        Ok(())
    }

    /// Rebuilds `table` under a new `create_sql` (typically a `CHECK`
    /// constraint change SQLite cannot `ALTER`): creates a shadow table,
    /// copies every row across, then swaps names. Runs inside one
    /// transaction so a mid-copy failure leaves the original table intact.
    pub async fn rebuild_table(store: &StoreFacade, table: &str, create_sql: &str, columns: &[&str]) -> Result<(), LedgerError> {
        let shadow = format!("{table}__migrating");
        let column_list = columns.join(", ");

        let mut tx = store.pool().begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {shadow}")).execute(&mut *tx).await?;
        sqlx::query(create_sql).execute(&mut *tx).await?;
        sqlx::query(&format!("INSERT INTO {shadow} ({column_list}) SELECT {column_list} FROM {table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DROP TABLE {table}")).execute(&mut *tx).await?;
        sqlx::query(&format!("ALTER TABLE {shadow} RENAME TO {table}")).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn check_foreign_keys(store: &StoreFacade) -> Result<(), LedgerError> {
    let violations: Vec<(String, i64, String, i64)> = sqlx::query_as("PRAGMA foreign_key_check")
        .fetch_all(store.pool())
        .await?;
    if !violations.is_empty() {
        return Err(LedgerError::internal(format!(
            "foreign_key_check reported {} violation(s), first in table {}",
            violations.len(),
            violations[0].0
        )));
    }
    Ok(())
}

/// Diffs a hardcoded enum value set against the live `CHECK` constraint text
/// in `sqlite_master`, so a constant added in code without a matching schema
/// change (or vice versa) fails startup instead of silently diverging.
async fn check_enum_values(store: &StoreFacade, table: &str, column: &str, expected: &[&str]) -> Result<(), LedgerError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1")
        .bind(table)
        .fetch_optional(store.pool())
        .await?;
    let ddl = row
        .ok_or_else(|| LedgerError::internal(format!("table {table} missing from sqlite_master")))?
        .0;

    let expected_set: HashSet<&str> = expected.iter().copied().collect();
    for value in &expected_set {
        let quoted = format!("'{value}'");
        if !ddl.contains(&quoted) {
            return Err(LedgerError::internal(format!(
                "{table}.{column} CHECK constraint is missing expected value {value}"
            )));
        }
    }
    Ok(())
}

async fn check_required_indexes(store: &StoreFacade) -> Result<(), LedgerError> {
    const REQUIRED: &[&str] = &[
        "idx_lots_fifo",
        "idx_reservations_sweep",
        "idx_reservations_idempotency",
        "idx_ledger_entries_account_pool_seq",
        "idx_transfers_sender_daily",
        "idx_governance_active_lookup",
        "idx_governance_cooldowns",
        "idx_idempotency_keys_expiry",
        "idx_event_outbox_created",
        "idx_earnings_settle_queue",
        "idx_earnings_account_created",
        "idx_receivables_open",
        "idx_marketing_discounts_sweep",
    ];
    let existing: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'index'")
        .fetch_all(store.pool())
        .await?;
    let existing: HashSet<String> = existing.into_iter().map(|(n,)| n).collect();

    for name in REQUIRED {
        if !existing.contains(*name) {
            return Err(LedgerError::internal(format!("required index {name} is missing")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;

    #[tokio::test]
    async fn self_test_passes_against_a_freshly_initialized_schema() {
        let store = StoreFacade::connect(&LedgerConfig::in_memory()).await.unwrap();
        store.init_schema().await.unwrap();
        MigrationGuard::self_test(&store).await.unwrap();
    }

    #[tokio::test]
    async fn run_is_idempotent_across_repeated_calls() {
        let store = StoreFacade::connect(&LedgerConfig::in_memory()).await.unwrap();
        MigrationGuard::run(&store).await.unwrap();
        MigrationGuard::run(&store).await.unwrap();
    }
}
