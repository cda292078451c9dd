//! Record operations and node composition
//!
//! [`RecordService`] composes the ledger, record store, access registry and
//! anchor service into the operations a hospital performs.
//! [`MedicalNode`] builds all of it from [`Settings`](crate::config::Settings).

pub mod node;
pub mod record_service;

pub use node::MedicalNode;
pub use record_service::{
    CreateOutcome, DeleteOutcome, RecordService, RequestOutcome, UpdateOutcome,
};
