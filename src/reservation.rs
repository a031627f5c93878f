// src/reservation.rs
use crate::primitives::MicroUSD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Finalized,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Finalized => "finalized",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReservationStatus::Pending),
            "finalized" => Some(ReservationStatus::Finalized),
            "released" => Some(ReservationStatus::Released),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingMode {
    Shadow,
    Soft,
    Live,
}

impl BillingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingMode::Shadow => "shadow",
            BillingMode::Soft => "soft",
            BillingMode::Live => "live",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "shadow" => Some(BillingMode::Shadow),
            "soft" => Some(BillingMode::Soft),
            "live" => Some(BillingMode::Live),
            _ => None,
        }
    }
}

impl Default for BillingMode {
    fn default() -> Self {
        BillingMode::Live
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub account_id: String,
    pub pool_id: String,
    pub total_reserved_micro: MicroUSD,
    pub status: ReservationStatus,
    pub billing_mode: BillingMode,
    pub expires_at: i64,
    pub idempotency_key: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationLotAllocation {
    pub lot_id: String,
    pub reserved_micro: MicroUSD,
}

/// Outcome of a successful `reserve()` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationResult {
    pub reservation: Reservation,
    pub lot_allocations: Vec<ReservationLotAllocation>,
}

/// Outcome of a `finalize()` call: how a reservation's hold was resolved
/// against the metered cost that actually occurred.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    pub actual_cost_micro: MicroUSD,
    pub effective_cost_micro: MicroUSD,
    pub surplus_released_micro: MicroUSD,
    pub overrun_micro: MicroUSD,
}

/// Apportions `actual_cost` against `reserved` under the three billing
/// modes. `surplus_released = max(0, reserved - actual_cost)` uniformly
/// across modes; modes differ only in how an overrun (`actual_cost >
/// reserved`) is handled.
pub fn apportion(
    mode: BillingMode,
    reserved: MicroUSD,
    actual_cost: MicroUSD,
) -> FinalizeOutcome {
    let surplus_released = if actual_cost.get() >= reserved.get() {
        MicroUSD::ZERO
    } else {
        MicroUSD::new(reserved.get() - actual_cost.get())
    };

    match mode {
        BillingMode::Shadow => {
            if actual_cost.get() <= reserved.get() {
                FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: actual_cost,
                    surplus_released_micro: surplus_released,
                    overrun_micro: MicroUSD::ZERO,
                }
            } else {
                // Log-only: cap consumption at the reserved amount, report
                // the overrun without applying it.
                FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: reserved,
                    surplus_released_micro: MicroUSD::ZERO,
                    overrun_micro: MicroUSD::new(actual_cost.get() - reserved.get()),
                }
            }
        }
        BillingMode::Soft => {
            if actual_cost.get() <= reserved.get() {
                FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: actual_cost,
                    surplus_released_micro: surplus_released,
                    overrun_micro: MicroUSD::ZERO,
                }
            } else {
                // Honor the overrun: the extra is drawn from the account's
                // other lots by the engine's FIFO walk.
                FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: actual_cost,
                    surplus_released_micro: MicroUSD::ZERO,
                    overrun_micro: MicroUSD::new(actual_cost.get() - reserved.get()),
                }
            }
        }
        BillingMode::Live => {
            if actual_cost.get() <= reserved.get() {
                FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: actual_cost,
                    surplus_released_micro: surplus_released,
                    overrun_micro: MicroUSD::ZERO,
                }
            } else {
                // Clamp, not breach: consume exactly what was reserved.
                FinalizeOutcome {
                    actual_cost_micro: actual_cost,
                    effective_cost_micro: reserved,
                    surplus_released_micro: MicroUSD::ZERO,
                    overrun_micro: MicroUSD::ZERO,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_overrun_caps_at_reserved() {
        let outcome = apportion(BillingMode::Live, MicroUSD::new(100_000), MicroUSD::new(200_000));
        assert_eq!(outcome.effective_cost_micro.get(), 100_000);
        assert_eq!(outcome.overrun_micro.get(), 0);
        assert_eq!(outcome.surplus_released_micro.get(), 0);
    }

    #[test]
    fn soft_overrun_is_applied() {
        let outcome = apportion(BillingMode::Soft, MicroUSD::new(100_000), MicroUSD::new(200_000));
        assert_eq!(outcome.effective_cost_micro.get(), 200_000);
        assert_eq!(outcome.overrun_micro.get(), 100_000);
    }

    #[test]
    fn shadow_overrun_is_reported_not_applied() {
        let outcome = apportion(BillingMode::Shadow, MicroUSD::new(100_000), MicroUSD::new(200_000));
        assert_eq!(outcome.effective_cost_micro.get(), 100_000);
        assert_eq!(outcome.overrun_micro.get(), 100_000);
    }

    #[test]
    fn underrun_releases_surplus_in_every_mode() {
        for mode in [BillingMode::Shadow, BillingMode::Soft, BillingMode::Live] {
            let outcome = apportion(mode, MicroUSD::new(500_000), MicroUSD::new(300_000));
            assert_eq!(outcome.effective_cost_micro.get(), 300_000);
            assert_eq!(outcome.surplus_released_micro.get(), 200_000);
            assert_eq!(outcome.overrun_micro.get(), 0);
        }
    }

    #[test]
    fn zero_cost_releases_full_reservation() {
        let outcome = apportion(BillingMode::Live, MicroUSD::new(500_000), MicroUSD::ZERO);
        assert_eq!(outcome.effective_cost_micro.get(), 0);
        assert_eq!(outcome.surplus_released_micro.get(), 500_000);
    }

    #[test]
    fn exact_cost_releases_no_surplus() {
        let outcome = apportion(BillingMode::Live, MicroUSD::new(500_000), MicroUSD::new(500_000));
        assert_eq!(outcome.effective_cost_micro.get(), 500_000);
        assert_eq!(outcome.surplus_released_micro.get(), 0);
    }
}
