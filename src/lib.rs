//! # MedChain Ledger - tamper-evident medical records across hospitals
//!
//! Each hospital runs its own node. A node authors records, keeps them
//! encrypted at rest, and shares them with other hospitals only through an
//! explicit request/grant protocol. Every content change is written to a
//! local hash-linked ledger and anchored in two independent authorities.
//!
//! ## Layout
//! - `core/`: blocks, the bounded proof-of-work and the append-only ledger
//! - `storage/`: encrypted record store, access registry, field encryption
//! - `anchor/`: permissioned-ledger and public-anchor backends, retry worker
//! - `network/`: JSON-over-TCP protocol and the authority server
//! - `auth/`: hospital credentials, signed session tokens, session store
//! - `service/`: the record operations and the node that wires them up
//! - `config/`: settings from TOML and the environment
//! - `utils/`: hashing, timestamps, encodings
//! - `cli/`: command-line interface
//!
//! ## Things to keep in mind
//! - The proof-of-work is a rate limiter, not consensus.
//! - Reads check access before anything is decrypted.
//! - Deletion is a tombstone; the ledger and anchor history stay.
//! - A failed public anchor never blocks a record operation; the retry
//!   worker finishes it or marks it failed.

pub mod anchor;
pub mod auth;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod service;
pub mod storage;
pub mod utils;

// Re-export commonly used types for convenience
pub use anchor::{
    AnchorBackend, AnchorProof, AnchorRecord, AnchorService, AuditEntry, AuditEvent,
    AuditHistory, CheckedAgainst, IntegrityReport, LedgerBackend, PublicAnchorStatus, RetryWorker,
};
pub use auth::{Authenticator, HospitalIdentity};
pub use cli::{Command, Opt};
pub use config::{BackendMode, Settings};
pub use core::{Block, BlockData, ChainStore, Ledger, LedgerOperation, ProofOfWork};
pub use error::{LedgerError, Result};
pub use network::{AuthorityServer, Package, Response};
pub use service::{MedicalNode, RecordService};
pub use storage::{
    AccessDecision, AccessRegistry, AccessState, ClinicalFields, FieldValue, KeyProvider,
    MedicalRecord, RecordStore, RecordView,
};
pub use utils::{current_timestamp, pseudonymous_uid, sha256_hex};
