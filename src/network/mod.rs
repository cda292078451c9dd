//! Network layer
//!
//! JSON request/acknowledge messages over TCP between hospital nodes and
//! the authority hosting the permissioned ledger and public anchor log.

pub mod protocol;
pub mod server;

pub use protocol::{send_request, Package, Response};
pub use server::AuthorityServer;
