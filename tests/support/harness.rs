use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::Network;
use btc_split_exchange::asset::Asset;
use btc_split_exchange::chain::ChainObserver;
use btc_split_exchange::exchange::OutputAddress;
use btc_split_exchange::exchange::ledger::{CreateExchangeInput, ExchangeLedger, LedgerConfig};
use btc_split_exchange::exchange::settlement::{SettlementConfig, SettlementOrchestrator};
use btc_split_exchange::exchange::store::SqliteStore;
use btc_split_exchange::price::{PriceOracle, PriceOracleConfig};
use btc_split_exchange::vault::AddressKeyVault;
use btc_split_exchange::vault::cipher::KeyCipher;
use rust_decimal::Decimal;

use super::fakes::{FakeChain, FakePrices};

pub const NETWORK: Network = Network::Testnet;
pub const ETH_ADDRESS_A: &str = "0x742d35Cc6634C0532925a3b844Bc454e4438f44e";
pub const ETH_ADDRESS_B: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

/// The full pipeline wired against fakes and a temp SQLite file.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<Mutex<SqliteStore>>,
    pub chain: Arc<FakeChain>,
    pub prices: Arc<FakePrices>,
    pub vault: AddressKeyVault,
    pub oracle: PriceOracle,
    pub observer: ChainObserver,
    pub orchestrator: SettlementOrchestrator,
    pub ledger: ExchangeLedger,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::build(SettlementConfig::default(), PriceOracleConfig::default())
    }

    pub fn with_settlement(settlement: SettlementConfig) -> Result<Self> {
        Self::build(settlement, PriceOracleConfig::default())
    }

    /// Every conversion goes upstream, then to snapshots.
    pub fn without_price_cache() -> Result<Self> {
        Self::build(
            SettlementConfig::default(),
            PriceOracleConfig {
                cache_ttl: Duration::ZERO,
            },
        )
    }

    fn build(settlement: SettlementConfig, price_cfg: PriceOracleConfig) -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let store = SqliteStore::open(dir.path().join("exchange.sqlite3"))
            .context("open sqlite store")?;
        let store = Arc::new(Mutex::new(store));

        let chain = Arc::new(FakeChain::new(100));
        let prices = Arc::new(FakePrices::new(&[
            (Asset::Btc, 45_000),
            (Asset::Eth, 3_200),
            (Asset::Usdt, 1),
            (Asset::Sol, 150),
        ]));

        let vault = AddressKeyVault::new(
            NETWORK,
            KeyCipher::from_master_secret("test master secret")?,
            store.clone(),
        );
        let oracle = PriceOracle::with_memory_cache(&price_cfg, prices.clone(), store.clone());
        let observer = ChainObserver::new(chain.clone());
        let orchestrator = SettlementOrchestrator::new(
            settlement,
            store.clone(),
            observer.clone(),
            oracle.clone(),
        );
        let ledger = ExchangeLedger::new(
            LedgerConfig::default(),
            store.clone(),
            vault.clone(),
            oracle.clone(),
            observer.clone(),
            orchestrator.handle(),
        );

        Ok(Self {
            dir,
            store,
            chain,
            prices,
            vault,
            oracle,
            observer,
            orchestrator,
            ledger,
        })
    }

    /// A second orchestrator over the same store, as after a restart.
    pub fn restarted_orchestrator(&self) -> SettlementOrchestrator {
        SettlementOrchestrator::new(
            SettlementConfig::default(),
            self.store.clone(),
            self.observer.clone(),
            self.oracle.clone(),
        )
    }

    /// Forgets every persisted last-known price.
    pub fn clear_price_snapshots(&self) -> Result<()> {
        let conn = rusqlite::Connection::open(self.dir.path().join("exchange.sqlite3"))
            .context("open sqlite side connection")?;
        conn.execute("DELETE FROM price_snapshots", [])
            .context("delete price snapshots")?;
        Ok(())
    }
}

pub fn output(address: &str, percentage: &str) -> OutputAddress {
    OutputAddress {
        address: address.to_string(),
        percentage: percentage.parse().expect("percentage literal"),
    }
}

pub fn eth_input(btc_amount: &str, outputs: Vec<OutputAddress>) -> CreateExchangeInput {
    CreateExchangeInput {
        btc_amount: btc_amount.parse::<Decimal>().expect("amount literal"),
        output_currency: "ETH".to_string(),
        output_addresses: outputs,
    }
}
