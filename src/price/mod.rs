pub mod cache;
pub mod coingecko;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::asset::Asset;
use crate::error::{Error, Result};
use crate::exchange::PriceSnapshot;
use crate::exchange::store::SqliteStore;

/// Upstream USD quotes.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>>;
}

/// Short-lived price cache. Races are last-writer-wins.
pub trait PriceCache: Send + Sync {
    fn get_many(&self, assets: &[Asset]) -> HashMap<Asset, Decimal>;
    fn put_many(&self, prices: &HashMap<Asset, Decimal>);
}

#[derive(Debug, Clone)]
pub struct PriceOracleConfig {
    pub cache_ttl: Duration,
}

impl Default for PriceOracleConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Resolves USD prices from cache, then upstream, then the last persisted
/// snapshot.
#[derive(Clone)]
pub struct PriceOracle {
    source: Arc<dyn PriceSource>,
    cache: Arc<dyn PriceCache>,
    store: Arc<Mutex<SqliteStore>>,
}

impl PriceOracle {
    pub fn new(
        source: Arc<dyn PriceSource>,
        cache: Arc<dyn PriceCache>,
        store: Arc<Mutex<SqliteStore>>,
    ) -> Self {
        Self {
            source,
            cache,
            store,
        }
    }

    /// An oracle over an in-process [`cache::MemoryPriceCache`] expiring
    /// after `cfg.cache_ttl`.
    pub fn with_memory_cache(
        cfg: &PriceOracleConfig,
        source: Arc<dyn PriceSource>,
        store: Arc<Mutex<SqliteStore>>,
    ) -> Self {
        Self::new(
            source,
            Arc::new(cache::MemoryPriceCache::new(cfg.cache_ttl)),
            store,
        )
    }

    /// Whatever is resolvable for every supported asset. Fails only when
    /// nothing is.
    pub async fn get_prices(&self) -> Result<HashMap<Asset, Decimal>> {
        let prices = self.resolve(&Asset::ALL).await;
        if prices.is_empty() {
            return Err(Error::PriceUnavailable(
                "no price from cache, upstream or snapshots".to_string(),
            ));
        }
        Ok(prices)
    }

    /// Prices for exactly `required`, or `PriceUnavailable` naming the gaps.
    pub async fn prices_for(&self, required: &[Asset]) -> Result<HashMap<Asset, Decimal>> {
        let prices = self.resolve(required).await;
        let missing: Vec<&str> = required
            .iter()
            .filter(|a| !prices.contains_key(a))
            .map(|a| a.symbol())
            .collect();
        if !missing.is_empty() {
            return Err(Error::PriceUnavailable(missing.join(",")));
        }
        Ok(prices)
    }

    pub async fn get_price(&self, asset: Asset) -> Result<Decimal> {
        let prices = self.prices_for(&[asset]).await?;
        prices
            .get(&asset)
            .copied()
            .ok_or_else(|| Error::PriceUnavailable(asset.symbol().to_string()))
    }

    /// `amount * price[from] / price[to]`. Same-asset conversion is exact and
    /// needs no price.
    pub async fn convert_value(&self, from: Asset, to: Asset, amount: Decimal) -> Result<Decimal> {
        if from == to {
            return Ok(amount);
        }
        let prices = self.prices_for(&[from, to]).await?;
        let (Some(pf), Some(pt)) = (prices.get(&from), prices.get(&to)) else {
            return Err(Error::PriceUnavailable(format!("{from}/{to}")));
        };
        amount
            .checked_mul(*pf)
            .and_then(|v| v.checked_div(*pt))
            .ok_or_else(|| Error::Validation(format!("cannot convert {amount} {from} to {to}")))
    }

    async fn resolve(&self, required: &[Asset]) -> HashMap<Asset, Decimal> {
        let mut prices = self.cache.get_many(required);
        if required.iter().all(|a| prices.contains_key(a)) {
            return prices;
        }

        match self.source.fetch_prices(&Asset::ALL).await {
            Ok(fetched) => {
                let fetched: HashMap<Asset, Decimal> = fetched
                    .into_iter()
                    .filter(|(_, p)| p.is_sign_positive() && !p.is_zero())
                    .collect();
                self.cache.put_many(&fetched);
                self.persist_snapshots(&fetched);
                prices.extend(fetched);
            }
            Err(err) => {
                tracing::warn!(error = %err, "price upstream failed, falling back to snapshots");
            }
        }

        if required.iter().any(|a| !prices.contains_key(a)) {
            let snapshots = self
                .store
                .lock()
                .expect("store mutex poisoned")
                .list_price_snapshots();
            match snapshots {
                Ok(snapshots) => {
                    for s in snapshots {
                        prices.entry(s.asset).or_insert(s.price_usd);
                    }
                }
                Err(err) => tracing::warn!(error = %format!("{err:#}"), "read price snapshots"),
            }
        }

        prices
    }

    fn persist_snapshots(&self, prices: &HashMap<Asset, Decimal>) {
        let now = Utc::now();
        let mut store = self.store.lock().expect("store mutex poisoned");
        for (asset, price) in prices {
            let snapshot = PriceSnapshot {
                asset: *asset,
                price_usd: *price,
                last_updated: now,
            };
            if let Err(err) = store.upsert_price_snapshot(&snapshot) {
                tracing::warn!(asset = %asset, error = %format!("{err:#}"), "persist price snapshot");
            }
        }
    }
}
