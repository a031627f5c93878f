// src/entry.rs
use crate::primitives::SignedMicroUSD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryType {
    Deposit,
    Grant,
    Reserve,
    Finalize,
    Release,
    TransferOut,
    TransferIn,
    Settlement,
    Clawback,
    DripRecovery,
}

impl LedgerEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerEntryType::Deposit => "deposit",
            LedgerEntryType::Grant => "grant",
            LedgerEntryType::Reserve => "reserve",
            LedgerEntryType::Finalize => "finalize",
            LedgerEntryType::Release => "release",
            LedgerEntryType::TransferOut => "transfer_out",
            LedgerEntryType::TransferIn => "transfer_in",
            LedgerEntryType::Settlement => "settlement",
            LedgerEntryType::Clawback => "clawback",
            LedgerEntryType::DripRecovery => "drip_recovery",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(LedgerEntryType::Deposit),
            "grant" => Some(LedgerEntryType::Grant),
            "reserve" => Some(LedgerEntryType::Reserve),
            "finalize" => Some(LedgerEntryType::Finalize),
            "release" => Some(LedgerEntryType::Release),
            "transfer_out" => Some(LedgerEntryType::TransferOut),
            "transfer_in" => Some(LedgerEntryType::TransferIn),
            "settlement" => Some(LedgerEntryType::Settlement),
            "clawback" => Some(LedgerEntryType::Clawback),
            "drip_recovery" => Some(LedgerEntryType::DripRecovery),
            _ => None,
        }
    }
}

/// An immutable double-entry record. Never updated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub pool_id: String,
    pub lot_id: Option<String>,
    pub reservation_id: Option<String>,
    pub entry_seq: u64,
    pub entry_type: LedgerEntryType,
    pub amount_micro: SignedMicroUSD,
    pub idempotency_key: Option<String>,
    pub pre_balance_micro: i64,
    pub post_balance_micro: i64,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub entry_type: Option<LedgerEntryType>,
    /// Opaque cursor: the last-seen `entry_seq`, exclusive. `None` starts
    /// from the beginning (lowest `entry_seq`).
    pub after_seq: Option<u64>,
    pub limit: u32,
}

impl HistoryFilter {
    pub fn new(limit: u32) -> Self {
        Self {
            entry_type: None,
            after_seq: None,
            limit,
        }
    }
}
