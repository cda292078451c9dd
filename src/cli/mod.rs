//! Command-line interface
//!
//! Argument parsing for the `medchain` binary. Record and access commands
//! take a session token and act as the hospital it names.

pub mod commands;

pub use commands::{Command, Opt, RecordArgs};
