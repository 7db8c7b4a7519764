use std::collections::HashMap;
use std::str::FromStr as _;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::PriceSource;
use crate::asset::Asset;
use crate::error::{Error, Result};

const API_KEY_HEADER: &str = "X-CG-Demo-API-Key";

#[derive(Debug, Clone)]
pub struct CoinGeckoConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinGeckoClient {
    pub fn new(cfg: CoinGeckoConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::Upstream(format!("build coingecko http client: {e}")))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.filter(|k| !k.is_empty()),
        })
    }
}

/// `{"bitcoin": {"usd": 45000.1}, ...}`
type SimplePriceResponse = HashMap<String, HashMap<String, serde_json::Number>>;

#[async_trait]
impl PriceSource for CoinGeckoClient {
    async fn fetch_prices(&self, assets: &[Asset]) -> Result<HashMap<Asset, Decimal>> {
        let ids = assets
            .iter()
            .map(|a| a.coingecko_id())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/simple/price", self.base_url);

        let mut req = self
            .http
            .get(&url)
            .query(&[("ids", ids.as_str()), ("vs_currencies", "usd")]);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("GET {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!("GET {url}: http {status}")));
        }
        let body: SimplePriceResponse = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("decode price response: {e}")))?;

        Ok(parse_prices(body))
    }
}

fn parse_prices(body: SimplePriceResponse) -> HashMap<Asset, Decimal> {
    let mut out = HashMap::new();
    for (id, quotes) in body {
        let Some(asset) = Asset::from_coingecko_id(&id) else {
            continue;
        };
        let Some(usd) = quotes.get("usd") else {
            continue;
        };
        match number_to_decimal(usd) {
            Some(price) => {
                out.insert(asset, price);
            }
            None => tracing::warn!(asset = %asset, raw = %usd, "unparseable price"),
        }
    }
    out
}

fn number_to_decimal(n: &serde_json::Number) -> Option<Decimal> {
    let s = n.to_string();
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .ok()
}
