use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Result, anyhow, bail};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Symmetric payload encryption for the wire, keyed by a hash of the shared
/// network key. Without a configured key, payloads pass through in the clear.
pub struct PayloadCipher {
    cipher: Option<Aes256Gcm>,
}

impl PayloadCipher {
    pub fn new(network_key: Option<&str>) -> Self {
        let cipher = network_key.map(|network_key| {
            let key = Sha256::digest(network_key.as_bytes());
            Aes256Gcm::new_from_slice(&key).expect("SHA-256 digest is a valid AES-256 key")
        });
        Self { cipher }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypts a payload under a fresh random nonce, prepending the nonce to
    /// the ciphertext. Identity when no network key is configured.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| anyhow!("payload encryption failed"))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Reverses `seal`. Fails on truncated input, a wrong key, or tampering.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(sealed.to_vec());
        };

        if sealed.len() < NONCE_LEN {
            bail!("sealed payload shorter than nonce");
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow!("payload decryption failed"))
    }
}
