use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_PATH_KEY: &str = "MEDCHAIN_CONFIG";
const DATA_DIR_KEY: &str = "MEDCHAIN_DATA_DIR";
const NODE_ID_KEY: &str = "MEDCHAIN_NODE_ID";
const ANCHOR_BACKEND_KEY: &str = "MEDCHAIN_ANCHOR_BACKEND";
const LEDGER_ENDPOINT_KEY: &str = "MEDCHAIN_LEDGER_ENDPOINT";
const PUBLIC_ENDPOINT_KEY: &str = "MEDCHAIN_PUBLIC_ENDPOINT";
const DIFFICULTY_KEY: &str = "MEDCHAIN_DIFFICULTY";

pub const DEFAULT_AUTHORITY_ADDR: &str = "127.0.0.1:7050";

/// Node settings, built once by the composition root and passed down.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node: NodeSettings,
    pub ledger: LedgerSettings,
    pub crypto: CryptoSettings,
    pub anchor: AnchorSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub data_dir: PathBuf,
    pub node_id: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            node_id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Number of leading '0' hex characters a block hash must carry
    pub difficulty: usize,
    pub max_nonce: u64,
    pub mining_timeout_ms: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            difficulty: 1,
            max_nonce: 5_000_000,
            mining_timeout_ms: 10_000,
        }
    }
}

impl LedgerSettings {
    pub fn mining_timeout(&self) -> Duration {
        Duration::from_millis(self.mining_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoSettings {
    pub encrypt_records: bool,
    pub key_env: String,
    pub kdf_salt: String,
    pub kdf_iterations: u32,
    pub uid_salt_env: String,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            encrypt_records: true,
            key_env: "MEDCHAIN_ENCRYPTION_KEY".to_string(),
            kdf_salt: "MEDCHAIN_SALT".to_string(),
            kdf_iterations: 100_000,
            uid_salt_env: "MEDCHAIN_UID_SALT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Mock,
    Live,
}

impl FromStr for BackendMode {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(BackendMode::Mock),
            "live" => Ok(BackendMode::Live),
            other => Err(LedgerError::Config(format!(
                "Invalid anchor backend: {other}. Valid options: mock, live"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSettings {
    pub backend: BackendMode,
    pub ledger_endpoint: String,
    pub public_endpoint: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            backend: BackendMode::Mock,
            ledger_endpoint: DEFAULT_AUTHORITY_ADDR.to_string(),
            public_endpoint: DEFAULT_AUTHORITY_ADDR.to_string(),
            request_timeout_ms: 5_000,
            max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl AnchorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff after `attempt` failed attempts, doubling and capped. A proof
    /// nobody has tried yet is due at once.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub token_secret_env: String,
    pub token_ttl_secs: u64,
    /// Argon2id memory cost in KiB
    pub password_memory_kib: u32,
    pub password_iterations: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_secret_env: "MEDCHAIN_TOKEN_SECRET".to_string(),
            token_ttl_secs: 86_400,
            password_memory_kib: 65_536,
            password_iterations: 3,
        }
    }
}

impl Settings {
    /// Load settings from an explicit path, `MEDCHAIN_CONFIG`, or defaults,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => env::var(CONFIG_PATH_KEY).ok().map(PathBuf::from),
        };

        let mut settings = match path {
            Some(p) => Self::from_file(&p)?,
            None => Settings::default(),
        };
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Settings> {
        toml::from_str(text).map_err(|e| LedgerError::Config(format!("Invalid TOML: {e}")))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = env::var(DATA_DIR_KEY) {
            self.node.data_dir = PathBuf::from(dir);
        }
        if let Ok(node_id) = env::var(NODE_ID_KEY) {
            self.node.node_id = node_id;
        }
        if let Ok(mode) = env::var(ANCHOR_BACKEND_KEY) {
            self.anchor.backend = mode.parse()?;
        }
        if let Ok(endpoint) = env::var(LEDGER_ENDPOINT_KEY) {
            self.anchor.ledger_endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var(PUBLIC_ENDPOINT_KEY) {
            self.anchor.public_endpoint = endpoint;
        }
        if let Ok(difficulty) = env::var(DIFFICULTY_KEY) {
            self.ledger.difficulty = difficulty.parse().map_err(|e| {
                LedgerError::Config(format!("Invalid {DIFFICULTY_KEY} value {difficulty}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.difficulty > 64 {
            return Err(LedgerError::Config(
                "Difficulty cannot exceed the 64 characters of a SHA-256 hex digest".to_string(),
            ));
        }
        if self.crypto.kdf_iterations == 0 {
            return Err(LedgerError::Config(
                "kdf_iterations must be positive".to_string(),
            ));
        }
        if self.anchor.max_attempts == 0 {
            return Err(LedgerError::Config(
                "anchor.max_attempts must be positive".to_string(),
            ));
        }
        if self.auth.password_memory_kib < 8 || self.auth.password_iterations == 0 {
            return Err(LedgerError::Config(
                "auth.password_memory_kib must be at least 8 and password_iterations positive"
                    .to_string(),
            ));
        }
        if self.node.node_id.is_empty() {
            return Err(LedgerError::Config("node_id cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Database path for this node (e.g. "data/node_rs-a")
    pub fn db_path(&self) -> PathBuf {
        self.node
            .data_dir
            .join(format!("node_{}", self.node.node_id))
    }
}
