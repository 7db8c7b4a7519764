pub mod esplora;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FundingStats {
    pub funded_txo_sum: u64,
    pub spent_txo_sum: u64,
}

impl FundingStats {
    pub fn balance(&self) -> u64 {
        self.funded_txo_sum.saturating_sub(self.spent_txo_sum)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressStats {
    pub chain: FundingStats,
    pub mempool: FundingStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address: Option<String>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTx {
    pub txid: String,
    /// `None` while the transaction sits in the mempool.
    pub block_height: Option<u32>,
    pub outputs: Vec<TxOutput>,
}

/// Read access to a block explorer.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn address_stats(&self, address: &str) -> Result<AddressStats>;
    async fn address_transactions(&self, address: &str) -> Result<Vec<AddressTx>>;
    async fn tip_height(&self) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentClassification {
    Pending,
    Unconfirmed,
    Confirmed,
}

impl PaymentClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentClassification::Pending => "pending",
            PaymentClassification::Unconfirmed => "unconfirmed",
            PaymentClassification::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for PaymentClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentClassification::Pending),
            "unconfirmed" => Ok(PaymentClassification::Unconfirmed),
            "confirmed" => Ok(PaymentClassification::Confirmed),
            other => Err(format!("unknown payment classification: {other}")),
        }
    }
}

/// `Confirmed` iff `confirmed >= expected`; `Unconfirmed` iff
/// `confirmed < expected <= confirmed + unconfirmed`; otherwise `Pending`.
pub fn classify(confirmed_sats: u64, unconfirmed_sats: u64, expected_sats: u64) -> PaymentClassification {
    if confirmed_sats >= expected_sats {
        PaymentClassification::Confirmed
    } else if confirmed_sats.saturating_add(unconfirmed_sats) >= expected_sats {
        PaymentClassification::Unconfirmed
    } else {
        PaymentClassification::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTotals {
    pub confirmed_sats: u64,
    pub unconfirmed_sats: u64,
    pub total_received_sats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMatch {
    pub txid: String,
    pub confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentStatus {
    pub address: String,
    pub expected_sats: u64,
    pub total_received_sats: u64,
    pub confirmed_sats: u64,
    pub unconfirmed_sats: u64,
    pub classification: PaymentClassification,
    pub confirmations: u32,
    pub txid: Option<String>,
}

#[derive(Clone)]
pub struct ChainObserver {
    source: Arc<dyn ChainSource>,
}

impl ChainObserver {
    pub fn new(source: Arc<dyn ChainSource>) -> Self {
        Self { source }
    }

    pub async fn address_totals(&self, address: &str) -> Result<AddressTotals> {
        let stats = self.source.address_stats(address).await?;
        Ok(AddressTotals {
            confirmed_sats: stats.chain.balance(),
            unconfirmed_sats: stats.mempool.balance(),
            total_received_sats: stats
                .chain
                .funded_txo_sum
                .saturating_add(stats.mempool.funded_txo_sum),
        })
    }

    /// First output paying at least `min_sats` to `address`, confirmed
    /// transactions first.
    pub async fn find_matching_transaction(
        &self,
        address: &str,
        min_sats: u64,
    ) -> Result<Option<TxMatch>> {
        let txs = self.source.address_transactions(address).await?;
        let pays = |tx: &AddressTx| {
            tx.outputs
                .iter()
                .any(|o| o.value >= min_sats && o.address.as_deref() == Some(address))
        };

        if let Some((tx, height)) = txs
            .iter()
            .filter(|tx| pays(tx))
            .find_map(|tx| tx.block_height.map(|h| (tx, h)))
        {
            let tip = self.source.tip_height().await?;
            return Ok(Some(TxMatch {
                txid: tx.txid.clone(),
                confirmations: tip.saturating_sub(height).saturating_add(1),
            }));
        }

        Ok(txs.iter().find(|tx| pays(tx)).map(|tx| TxMatch {
            txid: tx.txid.clone(),
            confirmations: 0,
        }))
    }

    pub async fn classify_payment(
        &self,
        address: &str,
        expected_sats: u64,
    ) -> Result<PaymentClassification> {
        let totals = self.address_totals(address).await?;
        Ok(classify(
            totals.confirmed_sats,
            totals.unconfirmed_sats,
            expected_sats,
        ))
    }

    /// Balances, classification and the matched transaction for a deposit.
    /// `txid` stays empty when the expected amount arrived split across
    /// several transactions.
    pub async fn check_payment(&self, address: &str, expected_sats: u64) -> Result<PaymentStatus> {
        let totals = self.address_totals(address).await?;
        let classification = classify(
            totals.confirmed_sats,
            totals.unconfirmed_sats,
            expected_sats,
        );

        let matched = if classification == PaymentClassification::Pending {
            None
        } else {
            self.find_matching_transaction(address, expected_sats).await?
        };

        Ok(PaymentStatus {
            address: address.to_string(),
            expected_sats,
            total_received_sats: totals.total_received_sats,
            confirmed_sats: totals.confirmed_sats,
            unconfirmed_sats: totals.unconfirmed_sats,
            classification,
            confirmations: matched.as_ref().map_or(0, |m| m.confirmations),
            txid: matched.map(|m| m.txid),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn classification_boundaries() {
        use PaymentClassification::*;
        assert_eq!(classify(0, 0, 1_000), Pending);
        assert_eq!(classify(999, 0, 1_000), Pending);
        assert_eq!(classify(500, 500, 1_000), Unconfirmed);
        assert_eq!(classify(0, 1_000, 1_000), Unconfirmed);
        assert_eq!(classify(1_000, 0, 1_000), Confirmed);
        assert_eq!(classify(2_000, 7, 1_000), Confirmed);
    }

    struct StaticChain {
        stats: AddressStats,
        txs: Vec<AddressTx>,
        tip: u32,
        tip_calls: Mutex<u32>,
    }

    #[async_trait]
    impl ChainSource for StaticChain {
        async fn address_stats(&self, _address: &str) -> Result<AddressStats> {
            Ok(self.stats)
        }

        async fn address_transactions(&self, _address: &str) -> Result<Vec<AddressTx>> {
            Ok(self.txs.clone())
        }

        async fn tip_height(&self) -> Result<u32> {
            *self.tip_calls.lock().unwrap() += 1;
            Ok(self.tip)
        }
    }

    fn tx(txid: &str, height: Option<u32>, address: &str, value: u64) -> AddressTx {
        AddressTx {
            txid: txid.to_string(),
            block_height: height,
            outputs: vec![TxOutput {
                address: Some(address.to_string()),
                value,
            }],
        }
    }

    #[tokio::test]
    async fn prefers_confirmed_match_and_counts_confirmations() {
        let chain = Arc::new(StaticChain {
            stats: AddressStats::default(),
            txs: vec![
                tx("mempool", None, "addr", 5_000),
                tx("small", Some(90), "addr", 10),
                tx("mined", Some(95), "addr", 5_000),
            ],
            tip: 100,
            tip_calls: Mutex::new(0),
        });
        let observer = ChainObserver::new(chain.clone());

        let m = observer
            .find_matching_transaction("addr", 5_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.txid, "mined");
        assert_eq!(m.confirmations, 6);

        assert!(
            observer
                .find_matching_transaction("other", 1)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unconfirmed_match_has_zero_confirmations() {
        let chain = Arc::new(StaticChain {
            stats: AddressStats::default(),
            txs: vec![tx("mempool", None, "addr", 5_000)],
            tip: 100,
            tip_calls: Mutex::new(0),
        });
        let observer = ChainObserver::new(chain.clone());

        let m = observer
            .find_matching_transaction("addr", 1_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.txid, "mempool");
        assert_eq!(m.confirmations, 0);
        assert_eq!(*chain.tip_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn check_payment_reports_balances() {
        let chain = Arc::new(StaticChain {
            stats: AddressStats {
                chain: FundingStats {
                    funded_txo_sum: 700,
                    spent_txo_sum: 100,
                },
                mempool: FundingStats {
                    funded_txo_sum: 500,
                    spent_txo_sum: 0,
                },
            },
            txs: vec![tx("t1", None, "addr", 500), tx("t0", Some(10), "addr", 700)],
            tip: 10,
            tip_calls: Mutex::new(0),
        });
        let observer = ChainObserver::new(chain);

        let status = observer.check_payment("addr", 1_000).await.unwrap();
        assert_eq!(status.confirmed_sats, 600);
        assert_eq!(status.unconfirmed_sats, 500);
        assert_eq!(status.total_received_sats, 1_200);
        assert_eq!(status.classification, PaymentClassification::Unconfirmed);
        assert_eq!(status.txid, None);
        assert_eq!(status.confirmations, 0);
    }
}
