// src/sweeper.rs
//
// Background maintenance: expires stale reservations, promotes governance
// configs out of their cooldown window, and retires expired marketing
// discounts. Three independent `tokio::time::interval` loops sharing one
// `watch` channel for cooperative shutdown.

use crate::engine::{record_entry, release_reservation_lots};
use crate::entry::LedgerEntryType;
use crate::error::LedgerError;
use crate::governance;
use crate::primitives::{MicroUSD, SignedMicroUSD};
use crate::store::StoreFacade;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Spawns the reservation sweeper, governance activator, and discount
    /// expiry loops. Returns a handle that stops all three on `shutdown`.
    pub fn spawn(
        store: Arc<StoreFacade>,
        sweeper_batch_size: u32,
        sweeper_interval_seconds: u64,
        governance_activator_interval_seconds: u64,
        discount_expiry_interval_seconds: u64,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_loop(
            rx.clone(),
            sweeper_interval_seconds,
            {
                let store = store.clone();
                move || {
                    let store = store.clone();
                    async move {
                        match sweep_expired_reservations(&store, sweeper_batch_size).await {
                            Ok(n) if n > 0 => tracing::info!(count = n, "expired reservations swept"),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "reservation sweep failed"),
                        }
                    }
                }
            },
        )));

        tasks.push(tokio::spawn(run_loop(
            rx.clone(),
            governance_activator_interval_seconds,
            {
                let store = store.clone();
                move || {
                    let store = store.clone();
                    async move {
                        match activate_expired_governance(&store).await {
                            Ok(n) if n > 0 => tracing::info!(count = n, "governance configs activated"),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "governance activation sweep failed"),
                        }
                    }
                }
            },
        )));

        tasks.push(tokio::spawn(run_loop(rx.clone(), discount_expiry_interval_seconds, {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move {
                    match expire_discounts(&store).await {
                        Ok(n) if n > 0 => tracing::info!(count = n, "marketing discounts expired"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "discount expiry sweep failed"),
                    }
                }
            }
        })));

        Self { shutdown: tx, tasks }
    }

    /// Signals every loop to stop and waits for them to finish their current
    /// tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_loop<F, Fut>(mut shutdown: watch::Receiver<bool>, interval_seconds: u64, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Expires up to `batch_size` pending reservations whose `expires_at` has
/// passed: returns their lots to `available` and posts a `release` entry
/// with description "expired", same accounting as a caller-initiated release.
pub async fn sweep_expired_reservations(store: &StoreFacade, batch_size: u32) -> Result<u32, LedgerError> {
    store
        .transaction(move |tx| {
            Box::pin(async move {
                let now = Utc::now().timestamp();
                let due: Vec<(String, String, String)> = sqlx::query_as(
                    "SELECT id, account_id, pool_id FROM reservations WHERE status = 'pending' AND expires_at <= ?1 ORDER BY expires_at ASC LIMIT ?2",
                )
                .bind(now)
                .bind(batch_size as i64)
                .fetch_all(&mut **tx)
                .await?;

                let mut swept = 0u32;
                for (reservation_id, account_id, pool_id) in due {
                    let released = release_reservation_lots(tx, &reservation_id).await?;
                    sqlx::query("UPDATE reservations SET status = 'expired' WHERE id = ?1")
                        .bind(&reservation_id)
                        .execute(&mut **tx)
                        .await?;
                    record_entry(
                        tx,
                        &account_id,
                        &pool_id,
                        None,
                        Some(&reservation_id),
                        LedgerEntryType::Release,
                        SignedMicroUSD::positive(MicroUSD::new(released)),
                        None,
                        Some("expired"),
                        now,
                    )
                    .await?;
                    swept += 1;
                }
                Ok(swept)
            })
        })
        .await
}

pub async fn activate_expired_governance(store: &StoreFacade) -> Result<u32, LedgerError> {
    store
        .transaction(move |tx| {
            Box::pin(async move {
                let now = Utc::now().timestamp();
                governance::activate_expired_cooldowns(tx, now).await
            })
        })
        .await
}

pub async fn expire_discounts(store: &StoreFacade) -> Result<u32, LedgerError> {
    store
        .transaction(move |tx| {
            Box::pin(async move {
                let now = Utc::now().timestamp();
                let result = sqlx::query(
                    "UPDATE marketing_discounts SET status = 'expired' WHERE status = 'active' AND expires_at <= ?1",
                )
                .bind(now)
                .execute(&mut **tx)
                .await?;
                Ok(result.rows_affected() as u32)
            })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::EntityType;
    use crate::config::LedgerConfig;
    use crate::engine::{LedgerEngine, MintOptions, ReserveOptions};
    use crate::lot::LotSourceType;

    async fn test_store() -> Arc<StoreFacade> {
        let store = Arc::new(StoreFacade::connect(&LedgerConfig::in_memory()).await.unwrap());
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn sweep_expires_a_stale_reservation_and_restores_available() {
        let store = test_store().await;
        let engine = LedgerEngine::new(store.clone(), 300, 24);
        let account = engine.get_or_create_account(EntityType::Person, "sweep1").await.unwrap();
        engine
            .mint_lot(&account.id, LotSourceType::Deposit, MicroUSD::new(500_000), MintOptions::default())
            .await
            .unwrap();
        engine
            .reserve(
                &account.id,
                MicroUSD::new(200_000),
                ReserveOptions { ttl_seconds: Some(-1), ..Default::default() },
            )
            .await
            .unwrap();

        let swept = sweep_expired_reservations(&store, 10).await.unwrap();
        assert_eq!(swept, 1);

        let balance = engine.get_balance(&account.id, None).await.unwrap();
        assert_eq!(balance.available_micro.get(), 500_000);
        assert_eq!(balance.reserved_micro.get(), 0);

        let second_pass = sweep_expired_reservations(&store, 10).await.unwrap();
        assert_eq!(second_pass, 0);
    }

    #[tokio::test]
    async fn activator_promotes_a_due_cooldown() {
        let store = test_store().await;
        let cooldown_ends_at = store
            .transaction(|tx| {
                Box::pin(async move {
                    let cfg = governance::propose(tx, "transfer.max_single_micro", "250000000", None, "alice").await?;
                    governance::submit_for_approval(tx, &cfg.id).await?;
                    governance::approve(tx, &cfg.id, "bob").await?;
                    let cooling = governance::approve(tx, &cfg.id, "carol").await?;
                    Ok(cooling.cooldown_ends_at.unwrap())
                })
            })
            .await
            .unwrap();

        // Not yet due: the activator should not promote it early.
        let early = activate_expired_governance(&store).await.unwrap();
        assert_eq!(early, 0);

        // Force the clock forward by rewriting cooldown_ends_at into the past.
        store
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query("UPDATE governance_configs SET cooldown_ends_at = ?1 WHERE cooldown_ends_at = ?2")
                        .bind(cooldown_ends_at - 100_000)
                        .bind(cooldown_ends_at)
                        .execute(&mut **tx)
                        .await?;
                    Ok::<_, LedgerError>(())
                })
            })
            .await
            .unwrap();

        let activated = activate_expired_governance(&store).await.unwrap();
        assert_eq!(activated, 1);
    }

    #[tokio::test]
    async fn expire_discounts_retires_past_due_rows() {
        let store = test_store().await;
        store
            .transaction(|tx| {
                Box::pin(async move {
                    let now = Utc::now().timestamp();
                    sqlx::query(
                        "INSERT INTO marketing_discounts (id, account_id, code, status, expires_at, created_at) VALUES ('d1', NULL, 'WELCOME10', 'active', ?1, ?1)",
                    )
                    .bind(now - 10)
                    .execute(&mut **tx)
                    .await?;
                    sqlx::query(
                        "INSERT INTO marketing_discounts (id, account_id, code, status, expires_at, created_at) VALUES ('d2', NULL, 'STILLGOOD', 'active', ?1, ?1)",
                    )
                    .bind(now + 3_600)
                    .execute(&mut **tx)
                    .await?;
                    Ok::<_, LedgerError>(())
                })
            })
            .await
            .unwrap();

        let expired = expire_discounts(&store).await.unwrap();
        assert_eq!(expired, 1);
    }
}
