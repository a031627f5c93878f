// src/lot.rs
use crate::primitives::MicroUSD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LotSourceType {
    Deposit,
    Grant,
    TransferIn,
    TbaDeposit,
    Purchase,
    EarningSettlement,
}

impl LotSourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            LotSourceType::Deposit => "deposit",
            LotSourceType::Grant => "grant",
            LotSourceType::TransferIn => "transfer_in",
            LotSourceType::TbaDeposit => "tba_deposit",
            LotSourceType::Purchase => "purchase",
            LotSourceType::EarningSettlement => "earning_settlement",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(LotSourceType::Deposit),
            "grant" => Some(LotSourceType::Grant),
            "transfer_in" => Some(LotSourceType::TransferIn),
            "tba_deposit" => Some(LotSourceType::TbaDeposit),
            "purchase" => Some(LotSourceType::Purchase),
            "earning_settlement" => Some(LotSourceType::EarningSettlement),
            _ => None,
        }
    }

    /// The ledger entry type a mint of this source produces: deposits,
    /// purchases, and TBA deposits post as `deposit`; referral/campaign
    /// grants post as `grant`; settled earnings post as `settlement`.
    /// Transfers post through `transfer.rs` instead.
    pub fn mint_entry_type(self) -> &'static str {
        match self {
            LotSourceType::Grant => "grant",
            LotSourceType::EarningSettlement => "settlement",
            _ => "deposit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: String,
    pub account_id: String,
    pub pool_id: String,
    pub source_type: LotSourceType,
    pub source_id: Option<String>,
    pub original_micro: MicroUSD,
    pub available_micro: MicroUSD,
    pub reserved_micro: MicroUSD,
    pub consumed_micro: MicroUSD,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl Lot {
    /// Invariant 1: `available + reserved + consumed = original`.
    pub fn check_conserved(&self) -> bool {
        self.available_micro
            .checked_add(self.reserved_micro)
            .and_then(|sum| sum.checked_add(self.consumed_micro))
            .map(|total| total == self.original_micro)
            .unwrap_or(false)
    }

    pub fn is_expired(&self, now_epoch: i64) -> bool {
        self.expires_at.map(|exp| exp <= now_epoch).unwrap_or(false)
    }
}
