use std::sync::{Arc, Mutex};

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use super::settlement::SettlementHandle;
use super::store::SqliteStore;
use super::{ExchangeRequest, ExchangeStatus, OutputAddress};
use crate::asset::{self, Asset, AssetInfo, BTC_DECIMALS};
use crate::chain::{ChainObserver, PaymentStatus};
use crate::error::{Error, Result};
use crate::price::PriceOracle;
use crate::vault::AddressKeyVault;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Allowed distance of the percentage sum from 100.
    pub percentage_tolerance: Decimal,
    pub max_output_addresses: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            percentage_tolerance: Decimal::new(1, 1),
            max_output_addresses: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateExchangeInput {
    pub btc_amount: Decimal,
    pub output_currency: String,
    pub output_addresses: Vec<OutputAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// In BTC.
    pub fee: Decimal,
    /// In the output asset.
    pub estimated_output: Decimal,
}

#[derive(Clone)]
pub struct ExchangeLedger {
    cfg: LedgerConfig,
    store: Arc<Mutex<SqliteStore>>,
    vault: AddressKeyVault,
    prices: PriceOracle,
    chain: ChainObserver,
    settlement: SettlementHandle,
}

impl ExchangeLedger {
    pub fn new(
        cfg: LedgerConfig,
        store: Arc<Mutex<SqliteStore>>,
        vault: AddressKeyVault,
        prices: PriceOracle,
        chain: ChainObserver,
        settlement: SettlementHandle,
    ) -> Self {
        Self {
            cfg,
            store,
            vault,
            prices,
            chain,
            settlement,
        }
    }

    /// Validates, quotes, issues a deposit address and persists the request
    /// together with its settlement job. Settlement runs in the background.
    pub async fn create_request(&self, input: CreateExchangeInput) -> Result<ExchangeRequest> {
        let asset = self.validate(&input)?;
        let quote = self.quote(input.btc_amount, asset).await?;

        let payment_address = self.vault.generate_deposit_address()?;
        let now = Utc::now();
        let request = ExchangeRequest {
            id: Uuid::new_v4(),
            btc_amount: input.btc_amount,
            output_currency: asset,
            output_addresses: input.output_addresses,
            payment_address,
            fee: quote.fee,
            estimated_output: quote.estimated_output,
            final_output: None,
            status: ExchangeStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let job = self.settlement.job_for(request.id, now);

        let persisted = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .create_request(&request, &job);
        if let Err(err) = persisted {
            if let Err(revoke_err) = self.vault.deactivate_key(&request.payment_address) {
                tracing::warn!(
                    address = %request.payment_address,
                    error = %revoke_err,
                    "revoke unused deposit key"
                );
            }
            return Err(err.into());
        }

        tracing::info!(
            request_id = %request.id,
            payment_address = %request.payment_address,
            btc_amount = %request.btc_amount,
            output_currency = %request.output_currency,
            estimated_output = %request.estimated_output,
            "exchange request created"
        );
        self.settlement.notify();

        Ok(request)
    }

    /// Checks the input in a fixed order and reports the first violated rule.
    pub fn validate(&self, input: &CreateExchangeInput) -> Result<Asset> {
        let amount = input.btc_amount;
        if amount <= Decimal::ZERO {
            return Err(Error::Validation("btc_amount must be greater than 0".to_string()));
        }
        if amount.normalize().scale() > BTC_DECIMALS {
            return Err(Error::Validation(format!(
                "btc_amount must have at most {BTC_DECIMALS} decimal places"
            )));
        }
        if asset::btc_to_sats(amount).is_none() {
            return Err(Error::Validation("btc_amount is too large".to_string()));
        }

        let asset: Asset = input
            .output_currency
            .parse()
            .map_err(Error::Validation)?;

        let n = input.output_addresses.len();
        if n == 0 || n > self.cfg.max_output_addresses {
            return Err(Error::Validation(format!(
                "output_addresses must contain between 1 and {} entries, got {n}",
                self.cfg.max_output_addresses
            )));
        }

        let network = self.vault.network();
        for (i, out) in input.output_addresses.iter().enumerate() {
            if out.address.trim().is_empty() {
                return Err(Error::Validation(format!("output_addresses[{i}]: address is empty")));
            }
            asset
                .validate_address(&out.address, network)
                .map_err(|e| Error::Validation(format!("output_addresses[{i}]: invalid {asset} address: {e}")))?;
        }

        let mut total = Decimal::ZERO;
        for (i, out) in input.output_addresses.iter().enumerate() {
            if out.percentage <= Decimal::ZERO || out.percentage > Decimal::ONE_HUNDRED {
                return Err(Error::Validation(format!(
                    "output_addresses[{i}]: percentage must be in (0, 100], got {}",
                    out.percentage
                )));
            }
            total += out.percentage;
        }
        if (total - Decimal::ONE_HUNDRED).abs() > self.cfg.percentage_tolerance {
            return Err(Error::Validation(format!(
                "percentages must sum to 100 (±{}), got {total}",
                self.cfg.percentage_tolerance
            )));
        }

        Ok(asset)
    }

    /// Fee in BTC at the asset rate, and `btc * (1 - fee_rate)` converted to
    /// the output asset, truncated to 8 places.
    pub async fn quote(&self, btc_amount: Decimal, asset: Asset) -> Result<Quote> {
        let fee_rate = asset.fee_rate();
        let fee = btc_amount * fee_rate;
        let net = btc_amount * (Decimal::ONE - fee_rate);
        let estimated_output = self
            .prices
            .convert_value(Asset::Btc, asset, net)
            .await?
            .round_dp_with_strategy(BTC_DECIMALS, RoundingStrategy::ToZero);
        Ok(Quote {
            fee,
            estimated_output,
        })
    }

    pub fn get_request(&self, id: Uuid) -> Result<ExchangeRequest> {
        let request = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_request(id)?;
        request.ok_or_else(|| Error::NotFound(format!("exchange request {id}")))
    }

    /// Newest first. A zero `limit` selects the default page size.
    pub fn list_requests(&self, limit: u32, offset: u32) -> Result<Vec<ExchangeRequest>> {
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        Ok(self
            .store
            .lock()
            .expect("store mutex poisoned")
            .list_requests(limit, offset)?)
    }

    /// Live view of the request's deposit address.
    pub async fn payment_status(&self, id: Uuid) -> Result<PaymentStatus> {
        let request = self.get_request(id)?;
        let expected = request.expected_sats()?;
        self.chain
            .check_payment(&request.payment_address, expected)
            .await
    }

    pub fn supported_assets(&self) -> Vec<AssetInfo> {
        asset::supported_assets()
    }

    pub fn prices(&self) -> &PriceOracle {
        &self.prices
    }
}
