use crate::error::{LedgerError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use zeroize::ZeroizeOnDrop;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Result of encryption operation
#[derive(Debug, Clone)]
pub struct EncryptionResult {
    /// Ciphertext with the GCM tag appended
    pub ciphertext: Vec<u8>,
    /// Nonce used for encryption
    pub nonce: Vec<u8>,
}

/// Secure key wrapper that automatically zeros memory on drop
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecureKey {
    key: Vec<u8>,
}

impl SecureKey {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Get key bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureKey")
            .field("length", &self.key.len())
            .finish()
    }
}

/// AES-256-GCM cipher for record field encryption
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    pub fn new(key: &SecureKey) -> Result<Self> {
        Self::validate_key(key.as_bytes())?;

        let aes_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        let cipher = Aes256Gcm::new(aes_key);

        Ok(Self { cipher })
    }

    /// Encrypt data with a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptionResult> {
        let nonce_bytes = Self::generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self.cipher.encrypt(nonce, plaintext).map_err(|e| {
            LedgerError::Crypto(format!("AES-256-GCM encryption failed: {e}"))
        })?;

        Ok(EncryptionResult {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    /// Decrypt and authenticate. Wrong key and tag mismatch both land here.
    pub fn decrypt(&self, ciphertext: &[u8], nonce_bytes: &[u8]) -> Result<Vec<u8>> {
        if nonce_bytes.len() != NONCE_LENGTH {
            return Err(LedgerError::Decryption(format!(
                "AES-256-GCM requires a {NONCE_LENGTH}-byte nonce, got {}",
                nonce_bytes.len()
            )));
        }

        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher.decrypt(nonce, ciphertext).map_err(|_| {
            LedgerError::Decryption("authentication failed (wrong key or tampered data)".to_string())
        })
    }

    fn generate_nonce() -> Vec<u8> {
        use rand::RngCore;
        let mut nonce = vec![0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    pub fn validate_key(key: &[u8]) -> Result<()> {
        if key.len() != KEY_LENGTH {
            return Err(LedgerError::Crypto(format!(
                "AES-256-GCM requires a {KEY_LENGTH}-byte key, got {}",
                key.len()
            )));
        }
        Ok(())
    }

    pub const fn key_length() -> usize {
        KEY_LENGTH
    }

}
