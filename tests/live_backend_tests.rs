//! Live backend tests
//!
//! A node configured with the `live` backend talks to an authority server
//! bound to an ephemeral local port.

mod common;

use common::{fields, open_live_node};
use medchain_ledger::anchor::{AuditEvent, CheckedAgainst, PublicAnchorStatus};
use medchain_ledger::{AuthorityServer, LedgerError};
use std::net::TcpListener;
use std::thread;

fn start_authority() -> String {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let server = AuthorityServer::with_mock_backends("127.0.0.1:0", &db).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    thread::spawn(move || server.run());
    addr
}

#[test]
fn test_live_round_trip() {
    let addr = start_authority();
    let (node, _dir) = open_live_node(&addr);
    let service = node.service();

    let created = service
        .create_record("UID-LIVE", "RS-A", &fields("bronchitis"))
        .unwrap();
    assert!(created.ledger_tx_ref.starts_with("ledger-tx-"));
    assert!(matches!(created.anchor_status, PublicAnchorStatus::Anchored { .. }));

    let updated = service
        .update_record(&created.record_id, "RS-A", &fields("bronchitis, resolved"))
        .unwrap();
    assert_eq!(updated.version, 2);

    assert!(service
        .verify_record_integrity(&created.record_id, "RS-A", &updated.data_hash)
        .unwrap()
        .is_valid);
    assert!(!service
        .verify_record_integrity(&created.record_id, "RS-A", &created.data_hash)
        .unwrap()
        .is_valid);

    let report = service
        .cross_check_record(&created.record_id, "RS-A", &updated.data_hash)
        .unwrap();
    assert!(report.is_valid);
    assert_eq!(report.checked_against, CheckedAgainst::LedgerAndPublicAnchor);

    service.delete_record(&created.record_id, "RS-A").unwrap();
    let events: Vec<AuditEvent> = service
        .audit_history(&created.record_id, "RS-A")
        .unwrap()
        .iter()
        .map(|entry| entry.unwrap().event)
        .collect();
    assert_eq!(
        events,
        vec![AuditEvent::Created, AuditEvent::Updated, AuditEvent::Deleted]
    );
}

#[test]
fn test_unreachable_authority_fails_create() {
    // Reserve a port, then free it so nothing is listening there
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let (node, _dir) = open_live_node(&addr);

    let result = node
        .service()
        .create_record("UID-LIVE", "RS-A", &fields("otitis"));
    assert!(matches!(result, Err(LedgerError::Network(_))));
    assert!(node.service().accessible_records("RS-A").unwrap().is_empty());

    // The block mined before the ledger call stays, marked as an orphan
    let service = node.service();
    assert_eq!(service.verify_chain().unwrap(), 2);
    let orphan = service.ledger().get_block(1).unwrap().unwrap();
    assert!(!service.is_committed_block(&orphan).unwrap());
    assert!(service
        .record_blocks(&orphan.get_data().record_id)
        .unwrap()
        .is_empty());
}
