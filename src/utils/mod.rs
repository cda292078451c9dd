//! Utility functions and helpers
//!
//! Hashing, timestamps, pseudonymisation and the storage/hashing encodings
//! shared by every component.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    constant_time_eq, current_timestamp, pseudonymous_uid, sha256_digest, sha256_hex,
};

pub use serialization::{
    canonical_json, composite_key, composite_prefix, deserialize, serialize,
};
