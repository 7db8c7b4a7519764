use anyhow::{Result, anyhow};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::Rng as _;
use sha2::Sha256;
use zeroize::Zeroizing;

const KDF_SALT: &[u8] = b"btc-split-exchange/deposit-key-vault";
const KDF_INFO: &[u8] = b"chacha20poly1305 v1";

pub const NONCE_LEN: usize = 12;

/// Authenticated encryption of deposit key material under a key derived from
/// the operator master secret. Every `seal` draws a fresh random nonce.
pub struct KeyCipher {
    key: Zeroizing<[u8; 32]>,
}

impl KeyCipher {
    pub fn from_master_secret(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(anyhow!("master secret must not be empty"));
        }

        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(KDF_INFO, &mut key[..])
            .map_err(|_| anyhow!("derive vault key"))?;

        Ok(Self { key })
    }

    /// Encrypts `plaintext`, binding `aad` (the deposit address) into the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng()
            .try_fill(&mut nonce_bytes)
            .map_err(|e| anyhow!("draw nonce: {e}"))?;

        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| anyhow!("encryption failed"))?;

        Ok((nonce_bytes, ciphertext))
    }

    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| anyhow!("decryption failed (wrong master secret or tampered row)"))?;
        Ok(Zeroizing::new(plaintext))
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.key[..]).map_err(|_| anyhow!("create cipher"))
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyCipher(..)")
    }
}
