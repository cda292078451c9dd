//! Shared helpers for the integration tests

#![allow(dead_code)]

use medchain_ledger::anchor::{MockAnchorBackend, MockLedgerBackend};
use medchain_ledger::auth::TokenSigner;
use medchain_ledger::config::{BackendMode, Settings};
use medchain_ledger::storage::{SecureKey, StaticKeyProvider};
use medchain_ledger::{ClinicalFields, MedicalNode};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const PASSWORD: &str = "hospital-password";

/// A node on a temporary database with a controllable public anchor
pub struct TestNode {
    pub node: MedicalNode,
    pub public: Arc<MockAnchorBackend>,
    _dir: TempDir,
}

/// Settings tuned for fast tests: cheap Argon2 and quick retries
pub fn test_settings(dir: &Path, node_id: &str) -> Settings {
    let mut settings = Settings::default();
    settings.node.data_dir = dir.to_path_buf();
    settings.node.node_id = node_id.to_string();
    settings.auth.password_memory_kib = 1024;
    settings.auth.password_iterations = 1;
    settings.anchor.retry_base_delay_ms = 20;
    settings.anchor.retry_max_delay_ms = 80;
    settings
}

pub fn test_keys() -> Arc<StaticKeyProvider> {
    Arc::new(StaticKeyProvider::new(SecureKey::new(vec![7u8; 32]), "test-uid-salt").unwrap())
}

pub fn open_test_node() -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path(), "rs-test");
    let db = sled::open(settings.db_path()).unwrap();

    let public = Arc::new(MockAnchorBackend::open(&db).unwrap());
    let node = MedicalNode::assemble(
        settings,
        db.clone(),
        test_keys(),
        TokenSigner::new(b"integration-secret").unwrap(),
        Arc::new(MockLedgerBackend::open(&db).unwrap()),
        public.clone(),
    )
    .unwrap();

    TestNode {
        node,
        public,
        _dir: dir,
    }
}

/// A node whose anchor backends are the live TCP clients
pub fn open_live_node(authority_addr: &str) -> (MedicalNode, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path(), "rs-live");
    settings.anchor.backend = BackendMode::Live;
    settings.anchor.ledger_endpoint = authority_addr.to_string();
    settings.anchor.public_endpoint = authority_addr.to_string();
    settings.anchor.request_timeout_ms = 2_000;

    let db = sled::open(settings.db_path()).unwrap();
    let node = MedicalNode::open_with(
        settings,
        db,
        test_keys(),
        TokenSigner::new(b"integration-secret").unwrap(),
    )
    .unwrap();
    (node, dir)
}

pub fn fields(diagnosis: &str) -> ClinicalFields {
    ClinicalFields {
        department: "Internal Medicine".to_string(),
        doctor_name: "dr. Rina".to_string(),
        symptoms: "fever, headache".to_string(),
        diagnosis: diagnosis.to_string(),
        treatment: "paracetamol".to_string(),
        notes: "follow up in one week".to_string(),
    }
}

/// Register and log in, returning the session token
pub fn login(node: &MedicalNode, hospital_id: &str) -> String {
    node.auth()
        .register_hospital(hospital_id, &format!("Hospital {hospital_id}"), PASSWORD)
        .unwrap();
    node.auth().login(hospital_id, PASSWORD).unwrap()
}
