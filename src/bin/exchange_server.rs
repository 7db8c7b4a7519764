use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use btc_split_exchange::chain::ChainObserver;
use btc_split_exchange::chain::esplora::{EsploraClient, EsploraConfig};
use btc_split_exchange::exchange::ledger::{ExchangeLedger, LedgerConfig};
use btc_split_exchange::exchange::service::ExchangeServiceImpl;
use btc_split_exchange::exchange::settlement::{SettlementConfig, SettlementOrchestrator};
use btc_split_exchange::exchange::store::SqliteStore;
use btc_split_exchange::price::coingecko::{CoinGeckoClient, CoinGeckoConfig};
use btc_split_exchange::price::{PriceOracle, PriceOracleConfig};
use btc_split_exchange::proto::v1::exchange_service_server::ExchangeServiceServer;
use btc_split_exchange::vault::AddressKeyVault;
use btc_split_exchange::vault::cipher::KeyCipher;
use clap::Parser as _;
use rust_decimal::Decimal;
use tonic::transport::Server;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "BTC_EXCHANGE_LISTEN_ADDR", default_value = "127.0.0.1:50051")]
    listen_addr: String,

    #[arg(long, env = "BTC_EXCHANGE_STORE_PATH", default_value = "data/exchange.sqlite")]
    store_path: PathBuf,

    /// bitcoin, testnet, signet or regtest.
    #[arg(long, env = "BTC_EXCHANGE_NETWORK", default_value = "testnet")]
    network: String,

    #[arg(long, env = "BTC_EXCHANGE_MASTER_SECRET", hide_env_values = true)]
    master_secret: String,

    /// Defaults to the public Blockstream endpoint for the network.
    #[arg(long, env = "BTC_EXCHANGE_ESPLORA_URL")]
    esplora_url: Option<String>,

    #[arg(
        long,
        env = "BTC_EXCHANGE_COINGECKO_URL",
        default_value = "https://api.coingecko.com/api/v3"
    )]
    coingecko_url: String,

    #[arg(long, env = "BTC_EXCHANGE_COINGECKO_API_KEY", hide_env_values = true)]
    coingecko_api_key: Option<String>,

    #[arg(long, env = "BTC_EXCHANGE_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,

    #[arg(long, env = "BTC_EXCHANGE_PRICE_CACHE_TTL_SECS", default_value_t = 300)]
    price_cache_ttl_secs: u64,

    #[arg(long, env = "BTC_EXCHANGE_POLL_INTERVAL_SECS", default_value_t = 30)]
    poll_interval_secs: u64,

    #[arg(long, env = "BTC_EXCHANGE_WATCH_WINDOW_SECS", default_value_t = 1800)]
    watch_window_secs: u64,

    #[arg(long, env = "BTC_EXCHANGE_MAX_CONCURRENT_POLLS", default_value_t = 64)]
    max_concurrent_polls: usize,

    #[arg(long, env = "BTC_EXCHANGE_PERCENTAGE_TOLERANCE", default_value = "0.1")]
    percentage_tolerance: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    btc_split_exchange::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;
    let network = Network::from_str(&args.network).context("parse network")?;
    let percentage_tolerance =
        Decimal::from_str(&args.percentage_tolerance).context("parse percentage_tolerance")?;
    let http_timeout = Duration::from_secs(args.http_timeout_secs);

    let store = SqliteStore::open(args.store_path).context("open sqlite store")?;
    tracing::info!(path = %store.path().display(), "store ready");
    let store = Arc::new(Mutex::new(store));

    let cipher = KeyCipher::from_master_secret(&args.master_secret).context("init key vault")?;
    let vault = AddressKeyVault::new(network, cipher, store.clone());

    let price_cfg = PriceOracleConfig {
        cache_ttl: Duration::from_secs(args.price_cache_ttl_secs),
    };
    let coingecko = CoinGeckoClient::new(CoinGeckoConfig {
        base_url: args.coingecko_url,
        api_key: args.coingecko_api_key,
        timeout: http_timeout,
    })?;
    let prices = PriceOracle::with_memory_cache(&price_cfg, Arc::new(coingecko), store.clone());

    let mut esplora_cfg = EsploraConfig::for_network(network);
    if let Some(url) = args.esplora_url {
        esplora_cfg.base_url = url;
    }
    esplora_cfg.timeout = http_timeout;
    tracing::info!(esplora_url = %esplora_cfg.base_url, %network, "chain observer ready");
    let chain = ChainObserver::new(Arc::new(EsploraClient::new(esplora_cfg)?));

    let orchestrator = SettlementOrchestrator::new(
        SettlementConfig {
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            watch_window: Duration::from_secs(args.watch_window_secs),
            max_concurrent_polls: args.max_concurrent_polls,
            ..SettlementConfig::default()
        },
        store.clone(),
        chain.clone(),
        prices.clone(),
    );

    let ledger = ExchangeLedger::new(
        LedgerConfig {
            percentage_tolerance,
            ..LedgerConfig::default()
        },
        store,
        vault,
        prices,
        chain,
        orchestrator.handle(),
    );

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let scheduler = orchestrator.spawn(async move {
        let _ = stop_rx.changed().await;
    });

    tracing::info!(%listen_addr, "starting exchange gRPC server");

    Server::builder()
        .add_service(ExchangeServiceServer::new(ExchangeServiceImpl::new(ledger)))
        .serve_with_shutdown(listen_addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
        })
        .await
        .context("serve gRPC")?;

    stop_tx.send(true).ok();
    scheduler.await.context("join settlement scheduler")?;

    Ok(())
}
