//! Per-field encryption packages
//!
//! A package is `hex(iv) ":" base64(ciphertext || tag)`. Hex and base64
//! alphabets never contain ':', so a single split is unambiguous.

use crate::error::{LedgerError, Result};
use crate::storage::encrypted::cipher::{Aes256GcmCipher, SecureKey};
use crate::storage::encrypted::key_provider::KeyProvider;
use data_encoding::{BASE64, HEXLOWER_PERMISSIVE};

pub const PACKAGE_DELIMITER: char = ':';

/// Encrypt one text value into a self-contained package.
pub fn encrypt_text(plaintext: &str, key: &SecureKey) -> Result<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }
    let cipher = Aes256GcmCipher::new(key)?;
    seal(&cipher, plaintext)
}

/// Decrypt a package produced by [`encrypt_text`].
pub fn decrypt_text(package: &str, key: &SecureKey) -> Result<String> {
    if package.is_empty() {
        return Ok(String::new());
    }
    let cipher = Aes256GcmCipher::new(key)?;
    open(&cipher, package)
}

fn seal(cipher: &Aes256GcmCipher, plaintext: &str) -> Result<String> {
    let result = cipher.encrypt(plaintext.as_bytes())?;
    Ok(format!(
        "{}{PACKAGE_DELIMITER}{}",
        HEXLOWER_PERMISSIVE.encode(&result.nonce),
        BASE64.encode(&result.ciphertext)
    ))
}

fn open(cipher: &Aes256GcmCipher, package: &str) -> Result<String> {
    let (iv_hex, body) = package
        .split_once(PACKAGE_DELIMITER)
        .ok_or_else(|| LedgerError::Decryption("missing package delimiter".to_string()))?;

    let nonce = HEXLOWER_PERMISSIVE
        .decode(iv_hex.as_bytes())
        .map_err(|e| LedgerError::Decryption(format!("malformed IV: {e}")))?;
    let ciphertext = BASE64
        .decode(body.as_bytes())
        .map_err(|e| LedgerError::Decryption(format!("malformed ciphertext: {e}")))?;

    let plaintext = cipher.decrypt(&ciphertext, &nonce)?;
    String::from_utf8(plaintext)
        .map_err(|e| LedgerError::Decryption(format!("plaintext is not UTF-8: {e}")))
}

/// Field codec bound to one key, so a record's fields share a cipher
/// instance but are sealed independently.
pub struct FieldCodec {
    cipher: Aes256GcmCipher,
    key_id: String,
}

impl FieldCodec {
    pub fn new(key: &SecureKey, key_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            cipher: Aes256GcmCipher::new(key)?,
            key_id: key_id.into(),
        })
    }

    pub fn from_provider(provider: &dyn KeyProvider) -> Result<Self> {
        let key = provider.encryption_key()?;
        Self::new(&key, provider.key_id())
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn encrypt_field(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        seal(&self.cipher, plaintext)
    }

    pub fn decrypt_field(&self, package: &str) -> Result<String> {
        if package.is_empty() {
            return Ok(String::new());
        }
        open(&self.cipher, package)
    }
}
