use std::fmt;
use std::str::FromStr;

use bitcoin::Network;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Usdt,
    Usdc,
    Ada,
    Sol,
    Matic,
}

impl Asset {
    pub const ALL: [Asset; 7] = [
        Asset::Btc,
        Asset::Eth,
        Asset::Usdt,
        Asset::Usdc,
        Asset::Ada,
        Asset::Sol,
        Asset::Matic,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Usdt => "USDT",
            Asset::Usdc => "USDC",
            Asset::Ada => "ADA",
            Asset::Sol => "SOL",
            Asset::Matic => "MATIC",
        }
    }

    /// Identifier used by the CoinGecko `simple/price` endpoint.
    pub fn coingecko_id(self) -> &'static str {
        match self {
            Asset::Btc => "bitcoin",
            Asset::Eth => "ethereum",
            Asset::Usdt => "tether",
            Asset::Usdc => "usd-coin",
            Asset::Ada => "cardano",
            Asset::Sol => "solana",
            Asset::Matic => "polygon",
        }
    }

    pub fn from_coingecko_id(id: &str) -> Option<Self> {
        Asset::ALL.into_iter().find(|a| a.coingecko_id() == id)
    }

    pub fn info(self) -> AssetInfo {
        let (name, min_amount, max_amount, fee_rate) = match self {
            Asset::Btc => ("Bitcoin", Decimal::new(1, 3), Decimal::new(10, 0), Decimal::new(2, 3)),
            Asset::Eth => ("Ethereum", Decimal::new(1, 2), Decimal::new(100, 0), DEFAULT_FEE_RATE),
            Asset::Usdt => ("Tether", Decimal::new(10, 0), Decimal::new(50_000, 0), DEFAULT_FEE_RATE),
            Asset::Usdc => ("USD Coin", Decimal::new(10, 0), Decimal::new(50_000, 0), DEFAULT_FEE_RATE),
            Asset::Ada => ("Cardano", Decimal::new(100, 0), Decimal::new(500_000, 0), DEFAULT_FEE_RATE),
            Asset::Sol => ("Solana", Decimal::new(1, 0), Decimal::new(10_000, 0), DEFAULT_FEE_RATE),
            Asset::Matic => ("Polygon", Decimal::new(100, 0), Decimal::new(1_000_000, 0), DEFAULT_FEE_RATE),
        };
        AssetInfo {
            asset: self,
            name,
            min_amount,
            max_amount,
            fee_rate,
        }
    }

    pub fn fee_rate(self) -> Decimal {
        self.info().fee_rate
    }

    /// Checks the shape of a destination address for this asset.
    ///
    /// BTC addresses are fully decoded and must belong to `network`. The other
    /// assets only get format heuristics: EVM `0x` + 40 hex for ETH, USDT, USDC
    /// and MATIC; base58 of a 32 byte key for SOL; Shelley `addr` or Byron
    /// `Ae`/`Dd` prefixes for ADA.
    pub fn validate_address(self, address: &str, network: Network) -> Result<(), String> {
        match self {
            Asset::Btc => validate_bitcoin_address(address, network),
            Asset::Eth | Asset::Usdt | Asset::Usdc | Asset::Matic => validate_evm_address(address),
            Asset::Ada => validate_cardano_address(address),
            Asset::Sol => validate_solana_address(address),
        }
    }
}

pub const DEFAULT_FEE_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 3);

/// BTC amounts carry at most this many fractional digits.
pub const BTC_DECIMALS: u32 = 8;
const SATS_PER_BTC: i64 = 100_000_000;

/// Converts a BTC amount to satoshis. Returns `None` for negative amounts,
/// sub-satoshi precision, or values that do not fit in `u64`.
pub fn btc_to_sats(btc: Decimal) -> Option<u64> {
    if btc.is_sign_negative() || btc.normalize().scale() > BTC_DECIMALS {
        return None;
    }
    btc.checked_mul(Decimal::from(SATS_PER_BTC))?.to_u64()
}

pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from(sats) / Decimal::from(SATS_PER_BTC)
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Asset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Asset::ALL
            .into_iter()
            .find(|a| a.symbol() == upper)
            .ok_or_else(|| format!("unsupported currency: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetInfo {
    pub asset: Asset,
    pub name: &'static str,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub fee_rate: Decimal,
}

pub fn supported_assets() -> Vec<AssetInfo> {
    Asset::ALL.into_iter().map(Asset::info).collect()
}

fn validate_bitcoin_address(address: &str, network: Network) -> Result<(), String> {
    let parsed = bitcoin::Address::from_str(address).map_err(|e| format!("not a bitcoin address: {e}"))?;
    if !parsed.is_valid_for_network(network) {
        return Err(format!("bitcoin address is not valid for {network}"));
    }
    Ok(())
}

fn validate_evm_address(address: &str) -> Result<(), String> {
    let Some(body) = address.strip_prefix("0x") else {
        return Err("expected 0x prefix".to_string());
    };
    if body.len() != 40 {
        return Err(format!("expected 40 hex characters, got {}", body.len()));
    }
    hex::decode(body).map_err(|e| format!("invalid hex: {e}"))?;
    Ok(())
}

fn validate_cardano_address(address: &str) -> Result<(), String> {
    if !(50..=120).contains(&address.len()) {
        return Err(format!("unexpected length {}", address.len()));
    }
    if address.starts_with("addr") || address.starts_with("Ae") || address.starts_with("Dd") {
        Ok(())
    } else {
        Err("expected addr, Ae or Dd prefix".to_string())
    }
}

fn validate_solana_address(address: &str) -> Result<(), String> {
    if !(32..=44).contains(&address.len()) {
        return Err(format!("unexpected length {}", address.len()));
    }
    let bytes = bitcoin::base58::decode(address).map_err(|e| format!("invalid base58: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 byte key, got {}", bytes.len()));
    }
    Ok(())
}
