pub mod ledger;
pub mod service;
pub mod settlement;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asset::{Asset, btc_to_sats};
use crate::chain::PaymentClassification;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    Pending,
    Waiting,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl ExchangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Waiting => "waiting",
            ExchangeStatus::Processing => "processing",
            ExchangeStatus::Completed => "completed",
            ExchangeStatus::Failed => "failed",
            ExchangeStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeStatus::Completed | ExchangeStatus::Failed | ExchangeStatus::Expired
        )
    }

    fn rank(self) -> u8 {
        match self {
            ExchangeStatus::Pending => 0,
            ExchangeStatus::Waiting => 1,
            ExchangeStatus::Processing => 2,
            ExchangeStatus::Completed | ExchangeStatus::Failed | ExchangeStatus::Expired => 3,
        }
    }

    /// Forward-only along `pending -> waiting -> processing -> completed`.
    /// Re-writing the current non-terminal status is allowed; `failed` and
    /// `expired` are reachable from any non-terminal status; terminal statuses
    /// absorb.
    pub fn can_transition_to(self, next: ExchangeStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ExchangeStatus::Failed | ExchangeStatus::Expired => true,
            _ => next.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExchangeStatus::Pending),
            "waiting" => Ok(ExchangeStatus::Waiting),
            "processing" => Ok(ExchangeStatus::Processing),
            "completed" => Ok(ExchangeStatus::Completed),
            "failed" => Ok(ExchangeStatus::Failed),
            "expired" => Ok(ExchangeStatus::Expired),
            other => Err(format!("unknown exchange status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAddress {
    pub address: String,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub id: Uuid,
    pub btc_amount: Decimal,
    pub output_currency: Asset,
    pub output_addresses: Vec<OutputAddress>,
    pub payment_address: String,

    pub fee: Decimal,
    pub estimated_output: Decimal,
    pub final_output: Option<Decimal>,

    pub status: ExchangeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRequest {
    pub fn expected_sats(&self) -> Result<u64> {
        btc_to_sats(self.btc_amount).ok_or_else(|| {
            Error::Validation(format!(
                "btc_amount {} is not a whole number of satoshis",
                self.btc_amount
            ))
        })
    }
}

/// Encrypted key material behind a one-time deposit address.
#[derive(Debug, Clone)]
pub struct DepositKey {
    pub address: String,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub request_id: Option<Uuid>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub address: String,
    pub amount_sats: u64,
    pub txid: Option<String>,
    pub confirmations: u32,
    pub classification: PaymentClassification,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceSnapshot {
    pub asset: Asset,
    pub price_usd: Decimal,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementJob {
    pub request_id: Uuid,
    pub next_poll_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::ExchangeStatus::*;
    use super::*;

    #[test]
    fn forward_transitions_only() {
        assert!(Pending.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Processing));
        assert!(Waiting.can_transition_to(Waiting));
        assert!(Processing.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Pending));
    }

    #[test]
    fn failure_reachable_from_any_open_status() {
        for from in [Pending, Waiting, Processing] {
            assert!(from.can_transition_to(Failed));
            assert!(from.can_transition_to(Expired));
        }
    }

    #[test]
    fn terminal_statuses_absorb() {
        for from in [Completed, Failed, Expired] {
            for to in [Pending, Waiting, Processing, Completed, Failed, Expired] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [Pending, Waiting, Processing, Completed, Failed, Expired] {
            assert_eq!(s.as_str().parse::<ExchangeStatus>().unwrap(), s);
        }
        assert!("refunded".parse::<ExchangeStatus>().is_err());
    }
}
