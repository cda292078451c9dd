//! Core ledger functionality
//!
//! Blocks, the bounded proof-of-work, block persistence and the
//! append-only hash-linked ledger every record operation writes to.

pub mod block;
pub mod chain_store;
pub mod ledger;
pub mod proof_of_work;

pub use block::{Block, BlockData, LedgerOperation, GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP};
pub use chain_store::{ChainStore, MemoryChainStore, SledChainStore};
pub use ledger::{Ledger, LedgerIterator};
pub use proof_of_work::ProofOfWork;
