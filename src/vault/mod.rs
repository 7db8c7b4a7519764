pub mod cipher;
pub mod keys;

use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Network, PrivateKey};
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::exchange::DepositKey;
use crate::exchange::store::SqliteStore;
use cipher::KeyCipher;

/// Issues one-time deposit addresses and keeps their private keys encrypted
/// in the store.
#[derive(Clone)]
pub struct AddressKeyVault {
    network: Network,
    cipher: Arc<KeyCipher>,
    store: Arc<Mutex<SqliteStore>>,
}

impl AddressKeyVault {
    pub fn new(network: Network, cipher: KeyCipher, store: Arc<Mutex<SqliteStore>>) -> Self {
        Self {
            network,
            cipher: Arc::new(cipher),
            store,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Generates a key, persists it encrypted and only then returns its
    /// address. Nothing is returned if persistence fails.
    pub fn generate_deposit_address(&self) -> Result<String> {
        let secret_key = keys::generate_secret_key()?;
        let address = keys::deposit_address(&secret_key, self.network).to_string();

        let (nonce, ciphertext) = self
            .cipher
            .seal(&secret_key.secret_bytes(), address.as_bytes())
            .map_err(|e| Error::KeyGeneration(format!("{e:#}")))?;

        let key = DepositKey {
            address: address.clone(),
            nonce,
            ciphertext,
            request_id: None,
            active: true,
            created_at: Utc::now(),
        };
        self.store
            .lock()
            .expect("store mutex poisoned")
            .insert_deposit_key(&key)
            .context("persist deposit key")?;

        tracing::debug!(address = %address, "issued deposit address");
        Ok(address)
    }

    /// Decrypts the key behind an active deposit address.
    pub fn release_private_key(&self, address: &str) -> Result<PrivateKey> {
        let key = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_active_deposit_key(address)
            .context("load deposit key")?
            .ok_or_else(|| Error::NotFound(format!("active deposit key for {address}")))?;

        let plaintext = self
            .cipher
            .open(&key.nonce, &key.ciphertext, key.address.as_bytes())
            .context("decrypt deposit key")?;
        let secret_key = SecretKey::from_slice(&plaintext)
            .map_err(|e| Error::Persistence(anyhow::anyhow!("stored key is not a secret key: {e}")))?;

        tracing::info!(address = %address, "released deposit private key");
        Ok(keys::private_key(secret_key, self.network))
    }

    /// Soft-revokes a key. The row stays for audit.
    pub fn deactivate_key(&self, address: &str) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .deactivate_deposit_key(address)?;
        tracing::info!(address = %address, "deactivated deposit key");
        Ok(())
    }

    /// Address of the active key bound to `request_id`, if any.
    pub fn key_for_request(&self, request_id: Uuid) -> Result<Option<String>> {
        let key = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .active_deposit_key_for_request(request_id)?;
        Ok(key.map(|k| k.address))
    }

    pub fn list_active_addresses(&self) -> Result<Vec<String>> {
        let keys = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .list_active_deposit_keys()?;
        Ok(keys.into_iter().map(|k| k.address).collect())
    }
}

impl std::fmt::Debug for AddressKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressKeyVault")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}
