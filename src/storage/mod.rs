//! Data storage and persistence
//!
//! This module manages the node's keyed tables: encrypted record payloads,
//! the cross-hospital access registry and the field encryption they rely on.

pub mod access_registry;
pub mod encrypted;
pub mod locks;
pub mod record_store;

pub use access_registry::{
    AccessDecision, AccessPermission, AccessPolicy, AccessRegistry, AccessRequest, AccessState,
    RequestStatus,
};
pub use encrypted::{EnvKeyProvider, FieldCodec, KeyProvider, SecureKey, StaticKeyProvider};
pub use locks::KeyedLocks;
pub use record_store::{
    ClinicalFields, FieldValue, MedicalRecord, RecordStore, RecordView, RECORD_SCHEMA_VERSION,
};
