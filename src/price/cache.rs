use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;

use super::PriceCache;
use crate::asset::Asset;

/// In-process TTL cache. Entries older than `ttl` read as missing.
#[derive(Debug)]
pub struct MemoryPriceCache {
    ttl: Duration,
    entries: Mutex<HashMap<Asset, (Decimal, Instant)>>,
}

impl MemoryPriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl PriceCache for MemoryPriceCache {
    fn get_many(&self, assets: &[Asset]) -> HashMap<Asset, Decimal> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("price cache mutex poisoned");
        assets
            .iter()
            .filter_map(|a| {
                entries
                    .get(a)
                    .filter(|(_, at)| now.duration_since(*at) < self.ttl)
                    .map(|(price, _)| (*a, *price))
            })
            .collect()
    }

    fn put_many(&self, prices: &HashMap<Asset, Decimal>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("price cache mutex poisoned");
        for (asset, price) in prices {
            entries.insert(*asset, (*price, now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemoryPriceCache::new(Duration::from_secs(300));
        cache.put_many(&HashMap::from([(Asset::Btc, Decimal::new(45_000, 0))]));

        assert_eq!(cache.get_many(&[Asset::Btc, Asset::Eth]).len(), 1);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get_many(&[Asset::Btc]).len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get_many(&[Asset::Btc]).is_empty());
    }
}
