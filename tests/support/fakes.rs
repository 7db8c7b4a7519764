use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btc_split_exchange::asset::Asset;
use btc_split_exchange::chain::{AddressStats, AddressTx, ChainSource, TxOutput};
use btc_split_exchange::error::{Error, Result};
use btc_split_exchange::price::PriceSource;
use rust_decimal::Decimal;

/// In-memory explorer. Payments land in the mempool and move to the chain on
/// `confirm`.
#[derive(Default)]
pub struct FakeChain {
    txs: Mutex<HashMap<String, Vec<AddressTx>>>,
    tip: AtomicU32,
    failing: AtomicBool,
    next_txid: AtomicU32,
}

impl FakeChain {
    pub fn new(tip: u32) -> Self {
        let chain = Self::default();
        chain.tip.store(tip, Ordering::SeqCst);
        chain
    }

    pub fn pay(&self, address: &str, sats: u64) -> String {
        let n = self.next_txid.fetch_add(1, Ordering::SeqCst);
        let txid = format!("{n:064x}");
        self.txs
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(AddressTx {
                txid: txid.clone(),
                block_height: None,
                outputs: vec![TxOutput {
                    address: Some(address.to_string()),
                    value: sats,
                }],
            });
        txid
    }

    /// Mines every mempool transaction for `address` at the current tip.
    pub fn confirm(&self, address: &str) {
        let tip = self.tip.load(Ordering::SeqCst);
        if let Some(txs) = self.txs.lock().unwrap().get_mut(address) {
            for tx in txs.iter_mut().filter(|tx| tx.block_height.is_none()) {
                tx.block_height = Some(tip);
            }
        }
    }

    pub fn mine(&self, blocks: u32) {
        self.tip.fetch_add(blocks, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Upstream("explorer unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn address_stats(&self, address: &str) -> Result<AddressStats> {
        self.check()?;
        let mut stats = AddressStats::default();
        for tx in self.txs.lock().unwrap().get(address).into_iter().flatten() {
            let value: u64 = tx
                .outputs
                .iter()
                .filter(|o| o.address.as_deref() == Some(address))
                .map(|o| o.value)
                .sum();
            match tx.block_height {
                Some(_) => stats.chain.funded_txo_sum += value,
                None => stats.mempool.funded_txo_sum += value,
            }
        }
        Ok(stats)
    }

    async fn address_transactions(&self, address: &str) -> Result<Vec<AddressTx>> {
        self.check()?;
        Ok(self
            .txs
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn tip_height(&self) -> Result<u32> {
        self.check()?;
        Ok(self.tip.load(Ordering::SeqCst))
    }
}

pub struct FakePrices {
    prices: Mutex<HashMap<Asset, Decimal>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl FakePrices {
    pub fn new(prices: &[(Asset, i64)]) -> Self {
        Self {
            prices: Mutex::new(
                prices
                    .iter()
                    .map(|(a, p)| (*a, Decimal::from(*p)))
                    .collect(),
            ),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn set(&self, asset: Asset, price: Decimal) {
        self.prices.lock().unwrap().insert(asset, price);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every later fetch sleeps for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

#[async_trait]
impl PriceSource for FakePrices {
    async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Upstream("price api unavailable".to_string()));
        }
        let prices = self.prices.lock().unwrap();
        Ok(assets
            .iter()
            .filter_map(|a| prices.get(a).map(|p| (*a, *p)))
            .collect())
    }
}
