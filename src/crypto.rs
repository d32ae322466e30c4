//! At-rest credential encryption: AES-256-GCM with a key derived from the
//! configured process secret via HKDF-SHA256.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

pub struct Cipher {
    key: Zeroizing<[u8; 32]>,
}

impl Cipher {
    pub fn from_secret(secret: &str) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(b"trade-copier-credential-encryption", key.as_mut())
            .map_err(|_| anyhow!("failed to derive encryption key"))?;
        Ok(Self { key })
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()))
    }

    /// Returns `base64(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.aead();
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = STANDARD
            .decode(encoded)
            .context("encrypted credential is not valid base64")?;
        if raw.len() < NONCE_LEN {
            return Err(anyhow!("encrypted credential is too short"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = self.aead();
        let plaintext = cipher
            .decrypt(nonce_bytes.into(), ciphertext)
            .map_err(|_| anyhow!("decryption failed: wrong key or corrupted ciphertext"))?;
        String::from_utf8(plaintext).context("decrypted credential is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let cipher = Cipher::from_secret("a sufficiently random process secret").unwrap();
        let plaintext = "PKFA1234567890SECRET";
        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn same_plaintext_encrypts_differently_each_time() {
        let cipher = Cipher::from_secret("another secret").unwrap();
        let a = cipher.encrypt("hello").unwrap();
        let b = cipher.encrypt("hello").unwrap();
        assert_ne!(a, b, "nonces must differ between calls");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher_a = Cipher::from_secret("secret-a").unwrap();
        let cipher_b = Cipher::from_secret("secret-b").unwrap();
        let encrypted = cipher_a.encrypt("top secret").unwrap();
        assert!(cipher_b.decrypt(&encrypted).is_err());
    }
}
