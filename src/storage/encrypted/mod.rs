//! Record payload encryption
//!
//! AES-256-GCM per field, with keys sourced from a pluggable
//! [`KeyProvider`]. Decryption failures are reported as
//! `LedgerError::Decryption` and scoped to the field that failed.

pub mod cipher;
pub mod field_codec;
pub mod key_provider;

pub use cipher::{Aes256GcmCipher, EncryptionResult, SecureKey};
pub use field_codec::{decrypt_text, encrypt_text, FieldCodec, PACKAGE_DELIMITER};
pub use key_provider::{derive_key, EnvKeyProvider, KeyProvider, StaticKeyProvider};

/// Overwrite and empty a string holding ciphertext or plaintext
pub fn wipe_string(value: &mut String) {
    use zeroize::Zeroize;
    value.zeroize();
}
