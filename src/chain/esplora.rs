use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Network;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{AddressStats, AddressTx, ChainSource, FundingStats, TxOutput};
use crate::error::{Error, Result};

const MAINNET_URL: &str = "https://blockstream.info/api";
const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

#[derive(Debug, Clone)]
pub struct EsploraConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl EsploraConfig {
    pub fn for_network(network: Network) -> Self {
        let base_url = match network {
            Network::Bitcoin => MAINNET_URL,
            _ => TESTNET_URL,
        };
        Self {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Block explorer client speaking the Esplora REST API.
#[derive(Debug, Clone)]
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
}

impl EsploraClient {
    pub fn new(cfg: EsploraConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::Upstream(format!("build esplora http client: {e}")))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("GET {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!("GET {url}: http {status}")));
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("decode {path}: {e}")))
    }
}

#[derive(Deserialize)]
struct EsploraAddress {
    chain_stats: EsploraStats,
    mempool_stats: EsploraStats,
}

#[derive(Deserialize)]
struct EsploraStats {
    funded_txo_sum: u64,
    spent_txo_sum: u64,
}

#[derive(Deserialize)]
struct EsploraTx {
    txid: String,
    vout: Vec<EsploraVout>,
    status: EsploraTxStatus,
}

#[derive(Deserialize)]
struct EsploraVout {
    #[serde(default)]
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u32>,
}

impl From<EsploraStats> for FundingStats {
    fn from(s: EsploraStats) -> Self {
        FundingStats {
            funded_txo_sum: s.funded_txo_sum,
            spent_txo_sum: s.spent_txo_sum,
        }
    }
}

#[async_trait]
impl ChainSource for EsploraClient {
    async fn address_stats(&self, address: &str) -> Result<AddressStats> {
        let addr: EsploraAddress = self.get_json(&format!("/address/{address}")).await?;
        Ok(AddressStats {
            chain: addr.chain_stats.into(),
            mempool: addr.mempool_stats.into(),
        })
    }

    async fn address_transactions(&self, address: &str) -> Result<Vec<AddressTx>> {
        let txs: Vec<EsploraTx> = self.get_json(&format!("/address/{address}/txs")).await?;
        Ok(txs
            .into_iter()
            .map(|tx| AddressTx {
                txid: tx.txid,
                block_height: if tx.status.confirmed {
                    tx.status.block_height
                } else {
                    None
                },
                outputs: tx
                    .vout
                    .into_iter()
                    .map(|o| TxOutput {
                        address: o.scriptpubkey_address,
                        value: o.value,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn tip_height(&self) -> Result<u32> {
        let body = self
            .get("/blocks/tip/height")
            .await?
            .text()
            .await
            .map_err(|e| Error::Upstream(format!("read tip height: {e}")))?;
        body.trim()
            .parse()
            .map_err(|e| Error::Upstream(format!("invalid tip height {body:?}: {e}")))
    }
}
