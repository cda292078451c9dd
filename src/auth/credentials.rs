use crate::config::AuthSettings;
use crate::error::{LedgerError, Result};
use crate::utils::{constant_time_eq, current_timestamp, deserialize, serialize};
use argon2::{Algorithm, Argon2, Params, Version};
use log::{info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use zeroize::Zeroize;

const CREDENTIALS_TREE: &str = "hospital_credentials";
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;
pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct HospitalCredential {
    pub hospital_id: String,
    pub name: String,
    salt: Vec<u8>,
    password_hash: Vec<u8>,
    pub registered_at: i64,
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy)]
pub struct PasswordCost {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl PasswordCost {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            memory_kib: settings.password_memory_kib,
            iterations: settings.password_iterations,
        }
    }
}

impl Default for PasswordCost {
    fn default() -> Self {
        Self::from_settings(&AuthSettings::default())
    }
}

pub struct CredentialStore {
    tree: Tree,
    cost: PasswordCost,
}

impl CredentialStore {
    pub fn open(db: &Db) -> Result<CredentialStore> {
        Self::with_cost(db, PasswordCost::default())
    }

    pub fn with_cost(db: &Db, cost: PasswordCost) -> Result<CredentialStore> {
        let tree = db.open_tree(CREDENTIALS_TREE).map_err(|e| {
            LedgerError::Database(format!("Failed to open credentials tree: {e}"))
        })?;
        Ok(CredentialStore { tree, cost })
    }

    fn hash_password(&self, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
        let params = Params::new(self.cost.memory_kib, self.cost.iterations, 1, Some(HASH_LENGTH))
            .map_err(|e| LedgerError::Crypto(format!("Invalid Argon2 parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut hash = vec![0u8; HASH_LENGTH];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut hash)
            .map_err(|e| LedgerError::Crypto(format!("Password hashing failed: {e}")))?;
        Ok(hash)
    }

    pub fn register(&self, hospital_id: &str, name: &str, password: &str) -> Result<HospitalCredential> {
        if hospital_id.trim().is_empty() {
            return Err(LedgerError::Authentication(
                "hospital id must not be empty".to_string(),
            ));
        }
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(LedgerError::Authentication(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters long"
            )));
        }

        let mut salt = vec![0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        let credential = HospitalCredential {
            hospital_id: hospital_id.to_string(),
            name: name.to_string(),
            password_hash: self.hash_password(password, &salt)?,
            salt,
            registered_at: current_timestamp()?,
        };

        let inserted = self
            .tree
            .compare_and_swap(
                hospital_id.as_bytes(),
                None as Option<&[u8]>,
                Some(serialize(&credential)?),
            )
            .map_err(|e| LedgerError::Database(format!("Failed to store credential: {e}")))?;
        if inserted.is_err() {
            return Err(LedgerError::Authentication(format!(
                "hospital {hospital_id} is already registered"
            )));
        }
        self.tree.flush()?;

        info!("Registered hospital {hospital_id} ({name})");
        Ok(credential)
    }

    pub fn get(&self, hospital_id: &str) -> Result<Option<HospitalCredential>> {
        match self.tree.get(hospital_id.as_bytes())? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Unknown hospitals and wrong passwords fail with the same message
    pub fn verify(&self, hospital_id: &str, password: &str) -> Result<HospitalCredential> {
        let invalid = || LedgerError::Authentication("invalid hospital id or password".to_string());

        let Some(credential) = self.get(hospital_id)? else {
            warn!("Login attempt for unknown hospital {hospital_id}");
            return Err(invalid());
        };
        let mut candidate = self.hash_password(password, &credential.salt)?;
        let matches = constant_time_eq(&candidate, &credential.password_hash);
        candidate.zeroize();

        if !matches {
            warn!("Wrong password for hospital {hospital_id}");
            return Err(invalid());
        }
        Ok(credential)
    }

    pub fn hospitals(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for item in self.tree.iter() {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(ids)
    }
}
