//! Error handling for the medical record ledger
//!
//! Integrity and ownership violations get their own variants so callers can
//! surface them as distinct failures instead of folding them into a generic
//! database error.

use std::fmt;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Database-related errors
    Database(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Configuration errors
    Config(String),
    /// Cryptographic operation errors (hashing, key derivation, signing)
    Crypto(String),
    /// Network communication errors
    Network(String),
    /// A permissioned-ledger or public-anchor backend rejected a call
    Backend(String),
    /// Hash link or recomputed hash mismatch. Terminal, never auto-repaired.
    ChainCompromised { index: u64, reason: String },
    /// No active permission for this hospital on this record
    AccessDenied {
        record_id: String,
        hospital_id: String,
    },
    /// Bad key, malformed package or tampered ciphertext
    Decryption(String),
    /// Mutation attempted by a hospital that does not own the record
    NotOwner {
        record_id: String,
        hospital_id: String,
    },
    DuplicateRequest {
        record_id: String,
        requester: String,
    },
    NoSuchPendingRequest {
        record_id: String,
        requester: String,
    },
    AlreadyGranted {
        record_id: String,
        hospital_id: String,
    },
    CannotRevokeOwner {
        record_id: String,
    },
    NoActivePermission {
        record_id: String,
        hospital_id: String,
    },
    /// Public anchor retries exhausted
    AnchorFailed { ledger_tx_ref: String, attempts: u32 },
    /// The difficulty search exceeded its nonce or wall-clock bound
    MiningTimeout {
        index: u64,
        attempts: u64,
        elapsed_ms: u64,
    },
    /// Append was attempted against a block that is no longer the tip
    StaleTail { expected_index: u64, tip_index: u64 },
    NotFound(String),
    RecordDeleted { record_id: String, deleted_at: i64 },
    /// Record payload failed schema validation
    InvalidRecord(String),
    Authentication(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Database(msg) => write!(f, "Database error: {msg}"),
            LedgerError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            LedgerError::Io(msg) => write!(f, "I/O error: {msg}"),
            LedgerError::Config(msg) => write!(f, "Configuration error: {msg}"),
            LedgerError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            LedgerError::Network(msg) => write!(f, "Network error: {msg}"),
            LedgerError::Backend(msg) => write!(f, "Backend error: {msg}"),
            LedgerError::ChainCompromised { index, reason } => write!(
                f,
                "Ledger compromised at block {index}: {reason}. Manual investigation required"
            ),
            LedgerError::AccessDenied {
                record_id,
                hospital_id,
            } => write!(f, "Access denied: {hospital_id} has no permission on record {record_id}"),
            LedgerError::Decryption(msg) => write!(f, "Decryption error: {msg}"),
            LedgerError::NotOwner {
                record_id,
                hospital_id,
            } => write!(f, "Not owner: {hospital_id} does not own record {record_id}"),
            LedgerError::DuplicateRequest {
                record_id,
                requester,
            } => write!(
                f,
                "Duplicate request: {requester} already has a pending request for record {record_id}"
            ),
            LedgerError::NoSuchPendingRequest {
                record_id,
                requester,
            } => write!(
                f,
                "No pending request from {requester} for record {record_id}"
            ),
            LedgerError::AlreadyGranted {
                record_id,
                hospital_id,
            } => write!(f, "{hospital_id} already has access to record {record_id}"),
            LedgerError::CannotRevokeOwner { record_id } => {
                write!(f, "The owner of record {record_id} cannot be revoked")
            }
            LedgerError::NoActivePermission {
                record_id,
                hospital_id,
            } => write!(
                f,
                "{hospital_id} has no active permission on record {record_id}"
            ),
            LedgerError::AnchorFailed {
                ledger_tx_ref,
                attempts,
            } => write!(
                f,
                "Public anchor for {ledger_tx_ref} failed after {attempts} attempts"
            ),
            LedgerError::MiningTimeout {
                index,
                attempts,
                elapsed_ms,
            } => write!(
                f,
                "Mining timeout for block {index} after {attempts} attempts ({elapsed_ms}ms)"
            ),
            LedgerError::StaleTail {
                expected_index,
                tip_index,
            } => write!(
                f,
                "Stale tail: append expected tip {expected_index} but tip is {tip_index}"
            ),
            LedgerError::NotFound(what) => write!(f, "Not found: {what}"),
            LedgerError::RecordDeleted {
                record_id,
                deleted_at,
            } => write!(f, "Record {record_id} was deleted at {deleted_at}"),
            LedgerError::InvalidRecord(msg) => write!(f, "Invalid record: {msg}"),
            LedgerError::Authentication(msg) => write!(f, "Authentication failed: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl LedgerError {
    /// Integrity and ownership failures must reach the user unchanged.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            LedgerError::ChainCompromised { .. } | LedgerError::NotOwner { .. }
        )
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for LedgerError {
    fn from(err: bincode::error::EncodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for LedgerError {
    fn from(err: bincode::error::DecodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for LedgerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        LedgerError::Database(format!("Lock poisoned: {err}"))
    }
}
