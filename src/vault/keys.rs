use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey};
use rand::Rng as _;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub fn generate_secret_key() -> Result<SecretKey> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng()
        .try_fill(&mut *bytes)
        .map_err(|e| Error::KeyGeneration(format!("draw entropy: {e}")))?;
    SecretKey::from_slice(&bytes[..])
        .map_err(|e| Error::KeyGeneration(format!("invalid secret key: {e}")))
}

/// Native segwit (P2WPKH) address for the key on `network`.
pub fn deposit_address(secret_key: &SecretKey, network: Network) -> Address {
    let secp = Secp256k1::signing_only();
    let public_key = CompressedPublicKey(secret_key.public_key(&secp));
    Address::p2wpkh(&public_key, network)
}

pub fn private_key(secret_key: SecretKey, network: Network) -> PrivateKey {
    PrivateKey::new(secret_key, network)
}
