//! Configuration management
//!
//! Settings come from an optional TOML file, then environment overrides.
//! The composition root owns the resulting value; nothing here is global.

pub mod settings;

pub use settings::{
    AnchorSettings, AuthSettings, BackendMode, CryptoSettings, LedgerSettings, NodeSettings,
    Settings, DEFAULT_AUTHORITY_ADDR,
};
