//! Dual anchoring of record hashes
//!
//! Every content-hash change is written to two independent authorities: a
//! permissioned consortium ledger ([`LedgerBackend`]) that is authoritative
//! for day-to-day verification, and a public integrity log
//! ([`AnchorBackend`]) used for dispute resolution. The public write is best
//! effort; when it fails the proof stays `PendingPublicAnchor` and the
//! [`RetryWorker`] finishes it in the background.

pub mod live;
pub mod mock;
pub mod retry;
pub mod service;

pub use live::{LiveAnchorClient, LiveLedgerClient};
pub use mock::{MockAnchorBackend, MockLedgerBackend};
pub use retry::RetryWorker;
pub use service::{AnchorService, AuditHistory, AuditIter};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata transactions understood by the permissioned ledger
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum LedgerTxKind {
    CreateMetadata,
    UpdateMetadata,
    SoftDelete,
}

impl fmt::Display for LedgerTxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerTxKind::CreateMetadata => write!(f, "CreateMetadata"),
            LedgerTxKind::UpdateMetadata => write!(f, "UpdateMetadata"),
            LedgerTxKind::SoftDelete => write!(f, "SoftDelete"),
        }
    }
}

/// A metadata write. Carries identifiers and hashes only, never clinical text.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct LedgerTransaction {
    pub kind: LedgerTxKind,
    pub record_id: String,
    pub patient_uid: String,
    pub hospital_id: String,
    pub data_hash: String,
    pub version: u32,
    pub description: String,
}

/// Permissioned consortium ledger
pub trait LedgerBackend: Send + Sync {
    /// Submit a metadata transaction, returning the ledger's transaction ref
    fn submit(&self, tx: &LedgerTransaction) -> Result<String>;

    /// Hash the ledger currently holds for `record_id`
    fn stored_hash(&self, record_id: &str) -> Result<Option<String>>;

    fn name(&self) -> &'static str;
}

/// Public, hospital-independent integrity log
pub trait AnchorBackend: Send + Sync {
    /// Anchor `data_hash` under `ledger_tx_ref`. Re-anchoring the same pair
    /// returns the original public ref; a different hash for an anchored
    /// ref is an error.
    fn anchor_hash(&self, ledger_tx_ref: &str, data_hash: &str, hospital_id: &str)
        -> Result<String>;

    fn anchored_hash(&self, ledger_tx_ref: &str) -> Result<Option<String>>;

    fn name(&self) -> &'static str;
}

/// Immutable fact asserted once a hash reached the permissioned ledger
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AnchorProof {
    pub ledger_tx_ref: String,
    pub data_hash: String,
    pub anchored_at: i64,
    pub anchoring_party: String,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum PublicAnchorStatus {
    Anchored { public_tx_ref: String },
    PendingPublicAnchor { attempts: u32 },
    AnchorFailed { attempts: u32 },
}

impl PublicAnchorStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, PublicAnchorStatus::PendingPublicAnchor { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PublicAnchorStatus::Anchored { .. } => 0,
            PublicAnchorStatus::PendingPublicAnchor { attempts }
            | PublicAnchorStatus::AnchorFailed { attempts } => *attempts,
        }
    }
}

impl fmt::Display for PublicAnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicAnchorStatus::Anchored { public_tx_ref } => write!(f, "anchored ({public_tx_ref})"),
            PublicAnchorStatus::PendingPublicAnchor { attempts } => {
                write!(f, "pending public anchor ({attempts} attempts)")
            }
            PublicAnchorStatus::AnchorFailed { attempts } => {
                write!(f, "anchor failed after {attempts} attempts, locally verified only")
            }
        }
    }
}

/// Stored per ledger transaction: the immutable proof plus the mutable
/// public-anchor progress.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AnchorRecord {
    pub proof: AnchorProof,
    pub record_id: String,
    pub version: u32,
    /// Hash of the local ledger block that recorded this change
    pub local_tx_ref: String,
    pub public: PublicAnchorStatus,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum AuditEvent {
    Created,
    Updated,
    Deleted,
}

impl AuditEvent {
    /// Sort byte within one version; a deletion sorts after the content change
    pub(crate) fn ordinal(self) -> u8 {
        match self {
            AuditEvent::Created => 0,
            AuditEvent::Updated => 1,
            AuditEvent::Deleted => 2,
        }
    }
}

/// One row of a record's audit history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub record_id: String,
    pub version: u32,
    pub event: AuditEvent,
    pub data_hash: String,
    pub ledger_tx_ref: String,
    pub local_tx_ref: String,
    /// `None` for tombstones, which are never publicly anchored
    pub anchor: Option<AnchorRecord>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckedAgainst {
    LedgerOnly,
    LedgerAndPublicAnchor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub checked_against: CheckedAgainst,
}
