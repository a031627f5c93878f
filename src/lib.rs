// src/lib.rs
//
// Credit ledger core: double-entry, lot-based accounting with reservation
// holds, peer transfers, governed parameters, and time-gated settlement.
// `LedgerSystem` is the single construction point — it owns the store, runs
// the migration guard, and wires every component against one shared pool.

pub mod account;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod external;
pub mod governance;
pub mod idempotency;
pub mod lot;
pub mod migration;
pub mod outbox;
pub mod primitives;
pub mod reservation;
pub mod settlement;
pub mod store;
pub mod sweeper;
pub mod transfer;

pub use account::{Account, EntityType};
pub use config::LedgerConfig;
pub use engine::{Balance, FinalizeOptions, LedgerEngine, MintOptions, ReleaseOptions, ReserveOptions};
pub use entry::{HistoryFilter, LedgerEntry, LedgerEntryType};
pub use error::{LedgerError, LedgerResult};
pub use external::{BalanceCache, BudgetService, ProvenanceVerifier};
pub use lot::{Lot, LotSourceType};
pub use primitives::{AccountId, BasisPoints, MicroUSD, SignedMicroUSD};
pub use reservation::{BillingMode, FinalizeOutcome, Reservation, ReservationResult, ReservationStatus};
pub use settlement::{Earning, Receivable, SettlementService};
pub use sweeper::SweeperHandle;
pub use transfer::{PeerTransferService, Transfer, TransferStatus};

use external::{AlwaysVerifiedProvenance, NoopBalanceCache, NoopBudgetService};
use migration::MigrationGuard;
use std::sync::Arc;
use store::StoreFacade;

/// Entry point for the whole credit ledger: one store, one engine, one
/// transfer service, one settlement service, backed by the same connection
/// pool. External collaborators (provenance, budget, balance cache) default
/// to no-ops and can be swapped with `with_external_services`.
pub struct LedgerSystem {
    store: Arc<StoreFacade>,
    engine: Arc<LedgerEngine>,
    transfer: Arc<PeerTransferService>,
    settlement: Arc<SettlementService>,
    config: LedgerConfig,
}

impl LedgerSystem {
    /// Connects to the store, runs `init_schema` + the migration self-test,
    /// and wires every component. Fails loud if the schema self-test fails —
    /// a `LedgerSystem` never starts against a store it can't trust.
    pub async fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        let store = Arc::new(StoreFacade::connect(&config).await?);
        MigrationGuard::run(&store).await?;

        let engine = Arc::new(LedgerEngine::new(
            store.clone(),
            config.default_reservation_ttl_seconds,
            config.idempotency_key_ttl_hours,
        ));
        let transfer = Arc::new(PeerTransferService::new(
            store.clone(),
            Arc::new(AlwaysVerifiedProvenance),
            Arc::new(NoopBudgetService),
            Arc::new(NoopBalanceCache),
        ));
        let settlement = Arc::new(SettlementService::new(store.clone(), engine.clone()));

        Ok(Self {
            store,
            engine,
            transfer,
            settlement,
            config,
        })
    }

    /// Rebuilds the transfer service against the given external
    /// collaborators, replacing the no-op defaults `new` installs.
    pub fn with_external_services(
        mut self,
        provenance: Arc<dyn ProvenanceVerifier>,
        budget: Arc<dyn BudgetService>,
        balance_cache: Arc<dyn BalanceCache>,
    ) -> Self {
        self.transfer = Arc::new(PeerTransferService::new(self.store.clone(), provenance, budget, balance_cache));
        self
    }

    pub fn engine(&self) -> &LedgerEngine {
        &self.engine
    }

    pub fn transfer(&self) -> &PeerTransferService {
        &self.transfer
    }

    pub fn settlement(&self) -> &SettlementService {
        &self.settlement
    }

    pub fn store(&self) -> Arc<StoreFacade> {
        self.store.clone()
    }

    /// Spawns the background sweeper loops (expired reservations, governance
    /// cooldown activation, discount expiry) against this system's store and
    /// configured intervals.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        SweeperHandle::spawn(
            self.store.clone(),
            self.config.sweeper_batch_size,
            self.config.sweeper_interval_seconds,
            self.config.governance_activator_interval_seconds,
            self.config.discount_expiry_interval_seconds,
        )
    }
}
