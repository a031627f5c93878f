// src/external.rs
//
// Capability traits for collaborators outside the store: provenance
// verification and budget checks consulted before a peer transfer commits,
// and a balance cache invalidated after one does. A `dyn Trait`
// dependency-injection boundary — callers depend on the trait object, never
// on a concrete implementation, so the engine can be wired against a test
// double or a real service without changing its code.

use crate::primitives::MicroUSD;
use async_trait::async_trait;

/// Verifies that a transfer's funds are legitimately attributable to the
/// sender before the engine spends any of its lots on it.
#[async_trait]
pub trait ProvenanceVerifier: Send + Sync {
    async fn verify(&self, from_account_id: &str, amount: MicroUSD) -> Result<bool, String>;
}

/// Checks a transfer against an external spending-budget system, separate
/// from the governance rolling-window caps enforced inside the transaction.
#[async_trait]
pub trait BudgetService: Send + Sync {
    async fn check(&self, from_account_id: &str, amount: MicroUSD) -> Result<bool, String>;
    async fn record(&self, from_account_id: &str, amount: MicroUSD);
}

/// Invalidated (not updated) after a balance-changing operation commits.
/// The cache is a read-path optimization external to this crate; the store
/// is always the source of truth.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn invalidate(&self, account_id: &str, pool_id: &str);
}

pub struct AlwaysVerifiedProvenance;

#[async_trait]
impl ProvenanceVerifier for AlwaysVerifiedProvenance {
    async fn verify(&self, _from_account_id: &str, _amount: MicroUSD) -> Result<bool, String> {
        Ok(true)
    }
}

pub struct NoopBudgetService;

#[async_trait]
impl BudgetService for NoopBudgetService {
    async fn check(&self, _from_account_id: &str, _amount: MicroUSD) -> Result<bool, String> {
        Ok(true)
    }

    async fn record(&self, _from_account_id: &str, _amount: MicroUSD) {}
}

pub struct NoopBalanceCache;

#[async_trait]
impl BalanceCache for NoopBalanceCache {
    async fn invalidate(&self, _account_id: &str, _pool_id: &str) {}
}
