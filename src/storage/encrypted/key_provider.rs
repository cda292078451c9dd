use crate::config::CryptoSettings;
use crate::error::{LedgerError, Result};
use crate::storage::encrypted::cipher::{Aes256GcmCipher, SecureKey};
use crate::utils::sha256_hex;
use data_encoding::HEXLOWER_PERMISSIVE;
use once_cell::sync::OnceCell;
use ring::pbkdf2;
use std::env;
use std::num::NonZeroU32;

/// Source of key material. Production nodes plug a KMS-backed provider in
/// here; the codec never sees a literal key.
pub trait KeyProvider: Send + Sync {
    /// Identifier of the key version, safe to log
    fn key_id(&self) -> String;

    fn encryption_key(&self) -> Result<SecureKey>;

    /// Salt for pseudonymous patient UIDs
    fn uid_salt(&self) -> Result<String>;
}

/// Stretch a passphrase-class secret into a 32-byte AES key
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<SecureKey> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| LedgerError::Config("PBKDF2 iterations must be positive".to_string()))?;
    let mut key = vec![0u8; Aes256GcmCipher::key_length()];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase,
        &mut key,
    );
    Ok(SecureKey::new(key))
}

/// Interpret a secret: 64 hex characters are a raw key, anything else is
/// a passphrase.
fn key_from_secret(secret: &str, salt: &[u8], iterations: u32) -> Result<SecureKey> {
    if secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
        let raw = HEXLOWER_PERMISSIVE
            .decode(secret.as_bytes())
            .map_err(|e| LedgerError::Config(format!("Invalid hex key: {e}")))?;
        return Ok(SecureKey::new(raw));
    }
    derive_key(secret.as_bytes(), salt, iterations)
}

/// Reads secrets from environment variables named in the crypto settings.
/// The derived key is cached after the first successful lookup.
pub struct EnvKeyProvider {
    key_env: String,
    uid_salt_env: String,
    kdf_salt: String,
    kdf_iterations: u32,
    cached: OnceCell<SecureKey>,
}

impl EnvKeyProvider {
    pub fn new(settings: &CryptoSettings) -> Self {
        Self {
            key_env: settings.key_env.clone(),
            uid_salt_env: settings.uid_salt_env.clone(),
            kdf_salt: settings.kdf_salt.clone(),
            kdf_iterations: settings.kdf_iterations,
            cached: OnceCell::new(),
        }
    }

    fn read_secret(name: &str) -> Result<String> {
        let value = env::var(name)
            .map_err(|_| LedgerError::Config(format!("Environment variable {name} is not set")))?;
        if value.is_empty() {
            return Err(LedgerError::Config(format!(
                "Environment variable {name} is empty"
            )));
        }
        Ok(value)
    }
}

impl KeyProvider for EnvKeyProvider {
    fn key_id(&self) -> String {
        format!("env:{}", self.key_env)
    }

    fn encryption_key(&self) -> Result<SecureKey> {
        let key = self.cached.get_or_try_init(|| {
            let secret = Self::read_secret(&self.key_env)?;
            key_from_secret(&secret, self.kdf_salt.as_bytes(), self.kdf_iterations)
        })?;
        Ok(key.clone())
    }

    fn uid_salt(&self) -> Result<String> {
        Self::read_secret(&self.uid_salt_env)
    }
}

/// Explicit key material, for tests and embedding applications that fetch
/// secrets themselves.
pub struct StaticKeyProvider {
    key: SecureKey,
    uid_salt: String,
    key_id: String,
}

impl StaticKeyProvider {
    pub fn new(key: SecureKey, uid_salt: impl Into<String>) -> Result<Self> {
        Aes256GcmCipher::validate_key(key.as_bytes())?;
        let key_id = format!("static:{}", &sha256_hex(key.as_bytes())[..8]);
        Ok(Self {
            key,
            uid_salt: uid_salt.into(),
            key_id,
        })
    }

    pub fn from_passphrase(
        passphrase: &str,
        kdf_salt: &str,
        iterations: u32,
        uid_salt: impl Into<String>,
    ) -> Result<Self> {
        let key = key_from_secret(passphrase, kdf_salt.as_bytes(), iterations)?;
        Self::new(key, uid_salt)
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    fn encryption_key(&self) -> Result<SecureKey> {
        Ok(self.key.clone())
    }

    fn uid_salt(&self) -> Result<String> {
        Ok(self.uid_salt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key(b"consortium secret", b"MEDCHAIN_SALT", 1_000).unwrap();
        let b = derive_key(b"consortium secret", b"MEDCHAIN_SALT", 1_000).unwrap();
        let c = derive_key(b"consortium secret", b"OTHER_SALT", 1_000).unwrap();

        assert_eq!(a.len(), 32);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(derive_key(b"x", b"y", 0).is_err());
    }

    #[test]
    fn test_hex_secret_used_as_raw_key() {
        let hex = "00".repeat(31) + "ff";
        let key = key_from_secret(&hex, b"salt", 1_000).unwrap();
        assert_eq!(key.as_bytes()[31], 0xff);
        assert_eq!(key.as_bytes()[0], 0x00);
    }

    #[test]
    fn test_env_provider_missing_variable_is_config_error() {
        let settings = CryptoSettings {
            key_env: "MEDCHAIN_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            uid_salt_env: "MEDCHAIN_TEST_SALT_THAT_IS_NEVER_SET".to_string(),
            ..CryptoSettings::default()
        };
        let provider = EnvKeyProvider::new(&settings);
        assert!(matches!(
            provider.encryption_key(),
            Err(LedgerError::Config(_))
        ));
        assert!(matches!(provider.uid_salt(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_env_provider_reads_and_caches() {
        let settings = CryptoSettings {
            key_env: "MEDCHAIN_TEST_KEY_PROVIDER_CACHE".to_string(),
            uid_salt_env: "MEDCHAIN_TEST_UID_SALT_CACHE".to_string(),
            kdf_iterations: 1_000,
            ..CryptoSettings::default()
        };
        env::set_var(&settings.key_env, "correct horse battery staple");
        env::set_var(&settings.uid_salt_env, "national-salt");

        let provider = EnvKeyProvider::new(&settings);
        let first = provider.encryption_key().unwrap();

        // Changing the variable after first use does not rotate the cached key
        env::set_var(&settings.key_env, "different");
        let second = provider.encryption_key().unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(provider.uid_salt().unwrap(), "national-salt");
        assert_eq!(provider.key_id(), "env:MEDCHAIN_TEST_KEY_PROVIDER_CACHE");
    }

    #[test]
    fn test_static_provider_validates_key_length() {
        assert!(StaticKeyProvider::new(SecureKey::new(vec![1u8; 16]), "salt").is_err());
        let provider = StaticKeyProvider::new(SecureKey::new(vec![1u8; 32]), "salt").unwrap();
        assert!(provider.key_id().starts_with("static:"));
    }
}
