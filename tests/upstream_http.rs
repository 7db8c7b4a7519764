mod support;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use btc_split_exchange::asset::Asset;
use btc_split_exchange::chain::esplora::{EsploraClient, EsploraConfig};
use btc_split_exchange::chain::{ChainObserver, ChainSource as _, PaymentClassification};
use btc_split_exchange::error::Error;
use btc_split_exchange::exchange::store::SqliteStore;
use btc_split_exchange::price::cache::MemoryPriceCache;
use btc_split_exchange::price::coingecko::{CoinGeckoClient, CoinGeckoConfig};
use btc_split_exchange::price::{PriceOracle, PriceSource as _};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use support::port::bind_loopback;

const PAID_ADDRESS: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

async fn serve(app: Router) -> Result<String> {
    let (listener, base_url) = bind_loopback().await?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(base_url)
}

async fn simple_price(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let key = headers
        .get("x-cg-demo-api-key")
        .and_then(|v| v.to_str().ok());
    if key != Some("demo-key") {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if query.get("vs_currencies").map(String::as_str) != Some("usd") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let ids = query.get("ids").cloned().unwrap_or_default();
    if !ids.split(',').any(|id| id == "polygon") {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(Json(json!({
        "bitcoin": {"usd": 45000},
        "ethereum": {"usd": 3200},
        "polygon": {"usd": 0.000045},
    })))
}

fn coingecko_app() -> Router {
    Router::new().route("/simple/price", get(simple_price))
}

async fn address(Path(address): Path<String>) -> Result<Json<Value>, StatusCode> {
    if address != PAID_ADDRESS {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(Json(json!({
        "address": address,
        "chain_stats": {"funded_txo_count": 1, "funded_txo_sum": 1_000_000, "spent_txo_count": 0, "spent_txo_sum": 0, "tx_count": 1},
        "mempool_stats": {"funded_txo_count": 1, "funded_txo_sum": 2_000, "spent_txo_count": 0, "spent_txo_sum": 0, "tx_count": 1},
    })))
}

async fn address_txs(Path(address): Path<String>) -> Json<Value> {
    Json(json!([
        {
            "txid": "11".repeat(32),
            "vout": [{"scriptpubkey_address": address, "value": 2_000}],
            "status": {"confirmed": false},
        },
        {
            "txid": "22".repeat(32),
            "vout": [
                {"scriptpubkey_address": "tb1qother", "value": 5_000_000},
                {"scriptpubkey_address": address, "value": 1_000_000},
            ],
            "status": {"confirmed": true, "block_height": 100, "block_hash": "00".repeat(32), "block_time": 1_700_000_000},
        },
    ]))
}

fn esplora_app() -> Router {
    Router::new()
        .route("/address/:address", get(address))
        .route("/address/:address/txs", get(address_txs))
        .route("/blocks/tip/height", get(|| async { "102" }))
}

fn coingecko(base_url: String) -> Result<CoinGeckoClient> {
    Ok(CoinGeckoClient::new(CoinGeckoConfig {
        base_url,
        api_key: Some("demo-key".to_string()),
        timeout: Duration::from_secs(5),
    })?)
}

#[tokio::test]
async fn coingecko_client_parses_simple_price() -> Result<()> {
    let base_url = serve(coingecko_app()).await?;
    let client = coingecko(base_url)?;

    let prices = client.fetch_prices(&Asset::ALL).await?;
    assert_eq!(prices[&Asset::Btc], Decimal::new(45_000, 0));
    assert_eq!(prices[&Asset::Matic], Decimal::new(45, 6));
    assert!(!prices.contains_key(&Asset::Ada));
    Ok(())
}

#[tokio::test]
async fn coingecko_rejection_is_an_upstream_error() -> Result<()> {
    let base_url = serve(coingecko_app()).await?;
    let client = CoinGeckoClient::new(CoinGeckoConfig {
        base_url,
        api_key: None,
        timeout: Duration::from_secs(5),
    })?;

    let err = client.fetch_prices(&Asset::ALL).await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)), "{err:?}");
    assert!(err.to_string().contains("401"), "{err}");
    Ok(())
}

#[tokio::test]
async fn oracle_over_http_persists_snapshots() -> Result<()> {
    let base_url = serve(coingecko_app()).await?;
    let dir = tempfile::tempdir().context("create tempdir")?;
    let store = SqliteStore::open(dir.path().join("prices.sqlite3"))?;
    let store = Arc::new(Mutex::new(store));

    let oracle = PriceOracle::new(
        Arc::new(coingecko(base_url)?),
        Arc::new(MemoryPriceCache::new(Duration::from_secs(300))),
        store.clone(),
    );

    let eth = oracle
        .convert_value(Asset::Btc, Asset::Eth, Decimal::new(1, 2))
        .await?;
    assert_eq!(eth, Decimal::new(140_625, 6));

    let snapshots = store.lock().unwrap().list_price_snapshots()?;
    assert_eq!(snapshots.len(), 3);

    let err = oracle.get_price(Asset::Sol).await.unwrap_err();
    assert!(matches!(err, Error::PriceUnavailable(_)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn esplora_payment_check() -> Result<()> {
    let base_url = serve(esplora_app()).await?;
    let client = EsploraClient::new(EsploraConfig {
        base_url,
        timeout: Duration::from_secs(5),
    })?;
    assert_eq!(client.tip_height().await?, 102);

    let observer = ChainObserver::new(Arc::new(client));

    let totals = observer.address_totals(PAID_ADDRESS).await?;
    assert_eq!(totals.confirmed_sats, 1_000_000);
    assert_eq!(totals.unconfirmed_sats, 2_000);
    assert_eq!(totals.total_received_sats, 1_002_000);

    let status = observer.check_payment(PAID_ADDRESS, 1_000_000).await?;
    assert_eq!(status.classification, PaymentClassification::Confirmed);
    assert_eq!(status.txid.as_deref(), Some("22".repeat(32).as_str()));
    assert_eq!(status.confirmations, 3);

    let pending = observer.check_payment(PAID_ADDRESS, 1_500_000).await?;
    assert_eq!(pending.classification, PaymentClassification::Pending);
    assert_eq!(pending.txid, None);

    let err = observer.address_totals("tb1qunknown").await.unwrap_err();
    assert!(matches!(err, Error::Upstream(_)), "{err:?}");
    Ok(())
}
