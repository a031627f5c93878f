// src/store/mod.rs
//
// Store Facade — scoped transactions, BUSY-retry, and pragma configuration
// on top of a single-writer embedded SQLite pool. A begin-run-commit-or-
// rollback shape built on SQLite's serialization model (`BEGIN IMMEDIATE` +
// WAL + busy timeout) instead of row-level `FOR UPDATE`.

pub mod schema;

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use futures::future::BoxFuture;
use metrics::histogram;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

pub type Tx<'a> = sqlx::Transaction<'a, Sqlite>;

/// A transaction body: borrows its `Tx` for exactly the call it's invoked
/// with. Boxed because `transaction()` may invoke it more than once (once
/// per BUSY-retry attempt) and a plain `Fn(&mut Tx<'c>) -> Fut` cannot
/// express a `Fut` whose lifetime varies per call without this indirection.
pub type TxFuture<'r, T> = BoxFuture<'r, Result<T, LedgerError>>;

pub struct StoreFacade {
    pool: SqlitePool,
    busy_retry_schedule: Vec<Duration>,
}

impl StoreFacade {
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            busy_retry_schedule: config
                .busy_retry_schedule_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `f` inside a single `BEGIN IMMEDIATE` transaction, committing on
    /// `Ok` and rolling back on `Err`. This is the only place a transaction
    /// is opened — every write operation in the engine funnels through here.
    pub async fn transaction<'c, F, T>(&'c self, f: F) -> Result<T, LedgerError>
    where
        F: for<'r> Fn(&'r mut Tx<'c>) -> TxFuture<'r, T>,
    {
        self.with_retry(|| async {
            let start = Instant::now();
            let mut tx: Tx<'c> = self
                .pool
                .begin_with("BEGIN IMMEDIATE")
                .await
                .map_err(LedgerError::from)?;

            let result = f(&mut tx).await;
            // `f` is `Fn`, not `FnOnce`: `with_retry` may invoke this whole
            // block again on a BUSY error, so `f` must be callable more than
            // once across attempts.

            let outcome = match result {
                Ok(value) => match tx.commit().await {
                    Ok(()) => Ok(value),
                    Err(e) => Err(LedgerError::from(e)),
                },
                Err(e) => {
                    // Rollback is best-effort: the connection is dropped either
                    // way, and a rollback failure must not mask the original error.
                    tx.rollback().await.ok();
                    Err(e)
                }
            };

            histogram!("ledger.transaction.duration_ms").record(start.elapsed().as_millis() as f64);
            outcome
        })
        .await
    }

    /// Retries `f` on BUSY/locked store errors with the configured delay
    /// schedule, surfacing `Conflict` once the schedule is exhausted. Other
    /// errors (including ones produced by `f`'s own logic, like
    /// `InsufficientBalance`) are never retried.
    pub async fn with_retry<F, Fut, T>(&self, mut f: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0usize;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Storage(msg)) if is_busy_message(&msg) => {
                    metrics::counter!("ledger.store.busy_retry").increment(1);
                    match self.busy_retry_schedule.get(attempt) {
                        Some(delay) => {
                            tracing::warn!(attempt, ?delay, "store busy, retrying");
                            tokio::time::sleep(*delay).await;
                            attempt += 1;
                        }
                        None => {
                            return Err(LedgerError::Conflict(
                                "store busy-retry schedule exhausted".into(),
                            ));
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn is_busy_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("busy")
}
