// The operations a hospital performs against its node. Every content
// change is written in this order, under the record lock:
//   local ledger block -> permissioned ledger + public anchor -> record row
// so a stored record version always has a block and a ledger entry behind it.
// A block whose change the permissioned ledger then rejected stays on the
// append-only chain as an orphan with no history row; readers of a record's
// blocks go through `record_blocks`, which leaves orphans out.

use crate::anchor::{
    AnchorRecord, AnchorService, AuditEvent, AuditHistory, CheckedAgainst, IntegrityReport,
    LedgerTransaction, LedgerTxKind, PublicAnchorStatus,
};
use crate::core::{Block, BlockData, Ledger, LedgerOperation};
use crate::error::{LedgerError, Result};
use crate::storage::{
    AccessDecision, AccessPolicy, AccessRegistry, AccessRequest, AccessState, ClinicalFields,
    MedicalRecord, RecordStore, RecordView, RequestStatus,
};
use log::{info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub record_id: String,
    pub data_hash: String,
    pub ledger_tx_ref: String,
    pub anchor_status: PublicAnchorStatus,
    pub block_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub version: u32,
    pub data_hash: String,
    pub ledger_tx_ref: String,
    pub anchor_status: PublicAnchorStatus,
    pub block_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted_at: i64,
    pub ledger_tx_ref: String,
    pub block_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub request_id: String,
    pub status: RequestStatus,
}

/// What one content change committed outside the record table
struct Committed {
    block: Block,
    ledger_tx_ref: String,
    anchor: Option<AnchorRecord>,
}

pub struct RecordService {
    ledger: Arc<Ledger>,
    records: RecordStore,
    access: AccessRegistry,
    anchors: Arc<AnchorService>,
}

impl RecordService {
    pub fn new(
        ledger: Arc<Ledger>,
        records: RecordStore,
        access: AccessRegistry,
        anchors: Arc<AnchorService>,
    ) -> RecordService {
        RecordService {
            ledger,
            records,
            access,
            anchors,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn anchors(&self) -> &Arc<AnchorService> {
        &self.anchors
    }

    pub fn access(&self) -> &AccessRegistry {
        &self.access
    }

    fn block_data(operation: LedgerOperation, record: &MedicalRecord) -> BlockData {
        BlockData {
            operation,
            record_id: record.record_id.clone(),
            patient_uid: record.patient_uid.clone(),
            hospital_id: record.hospital_id.clone(),
            data_hash: record.data_hash.clone(),
            version: record.version,
        }
    }

    fn ledger_tx(kind: LedgerTxKind, record: &MedicalRecord) -> LedgerTransaction {
        let description = match kind {
            LedgerTxKind::CreateMetadata => format!("Record created by {}", record.hospital_id),
            LedgerTxKind::UpdateMetadata => {
                format!("Record updated to version {}", record.version)
            }
            LedgerTxKind::SoftDelete => format!("Record deleted by {}", record.hospital_id),
        };
        LedgerTransaction {
            kind,
            record_id: record.record_id.clone(),
            patient_uid: record.patient_uid.clone(),
            hospital_id: record.hospital_id.clone(),
            data_hash: record.data_hash.clone(),
            version: record.version,
            description,
        }
    }

    /// Append the local block, then hand the change to both authorities
    fn commit_change(
        &self,
        operation: LedgerOperation,
        kind: LedgerTxKind,
        record: &MedicalRecord,
    ) -> Result<Committed> {
        let block = self
            .ledger
            .append_to_tip(Self::block_data(operation, record))?;
        let tx = Self::ledger_tx(kind, record);

        if kind == LedgerTxKind::SoftDelete {
            let ledger_tx_ref = self.anchors.record_deletion(block.get_hash(), &tx)?;
            return Ok(Committed {
                block,
                ledger_tx_ref,
                anchor: None,
            });
        }
        let anchor = self.anchors.anchor(block.get_hash(), &tx)?;
        Ok(Committed {
            block,
            ledger_tx_ref: anchor.proof.ledger_tx_ref.clone(),
            anchor: Some(anchor),
        })
    }

    fn anchor_status(committed: &Committed) -> Result<PublicAnchorStatus> {
        committed
            .anchor
            .as_ref()
            .map(|a| a.public.clone())
            .ok_or_else(|| LedgerError::Database("content change was not anchored".to_string()))
    }

    pub fn create_record(
        &self,
        patient_uid: &str,
        hospital_id: &str,
        fields: &ClinicalFields,
    ) -> Result<CreateOutcome> {
        let mut committed = None;
        let record = self
            .records
            .create_with(patient_uid, hospital_id, fields, |record| {
                let change = self.commit_change(
                    LedgerOperation::CreateRecord,
                    LedgerTxKind::CreateMetadata,
                    record,
                )?;
                self.access.register_owner(&record.record_id, hospital_id)?;
                committed = Some(change);
                Ok(())
            })?;
        let committed = committed
            .ok_or_else(|| LedgerError::Database("record created without a commit".to_string()))?;

        Ok(CreateOutcome {
            anchor_status: Self::anchor_status(&committed)?,
            record_id: record.record_id,
            data_hash: record.data_hash,
            ledger_tx_ref: committed.ledger_tx_ref,
            block_index: committed.block.get_index(),
        })
    }

    /// False for orphan blocks, mined for a change that was never committed
    pub fn is_committed_block(&self, block: &Block) -> Result<bool> {
        let data = block.get_data();
        let event = match data.operation {
            LedgerOperation::Genesis => return Ok(true),
            LedgerOperation::CreateRecord => AuditEvent::Created,
            LedgerOperation::UpdateRecord => AuditEvent::Updated,
            LedgerOperation::DeleteRecord => AuditEvent::Deleted,
        };
        self.anchors
            .has_history_row(&data.record_id, data.version, event, block.get_hash())
    }

    /// The committed blocks of one record, in chain order
    pub fn record_blocks(&self, record_id: &str) -> Result<Vec<Block>> {
        let mut committed = Vec::new();
        for block in self.ledger.blocks_for_record(record_id)? {
            if self.is_committed_block(&block)? {
                committed.push(block);
            } else {
                warn!(
                    "Skipping orphan block {} for {} v{}",
                    block.get_index(),
                    record_id,
                    block.get_data().version
                );
            }
        }
        Ok(committed)
    }

    pub fn read_record(&self, record_id: &str, requester: &str) -> Result<RecordView> {
        self.records.read(record_id, requester, &self.access)
    }

    pub fn update_record(
        &self,
        record_id: &str,
        requester: &str,
        fields: &ClinicalFields,
    ) -> Result<UpdateOutcome> {
        let mut committed = None;
        let record = self
            .records
            .update_with(record_id, requester, fields, |record| {
                committed = Some(self.commit_change(
                    LedgerOperation::UpdateRecord,
                    LedgerTxKind::UpdateMetadata,
                    record,
                )?);
                Ok(())
            })?;
        let committed = committed
            .ok_or_else(|| LedgerError::Database("record updated without a commit".to_string()))?;

        Ok(UpdateOutcome {
            anchor_status: Self::anchor_status(&committed)?,
            version: record.version,
            data_hash: record.data_hash,
            ledger_tx_ref: committed.ledger_tx_ref,
            block_index: committed.block.get_index(),
        })
    }

    pub fn delete_record(&self, record_id: &str, requester: &str) -> Result<DeleteOutcome> {
        let mut committed = None;
        let record = self
            .records
            .soft_delete_with(record_id, requester, |record| {
                committed = Some(self.commit_change(
                    LedgerOperation::DeleteRecord,
                    LedgerTxKind::SoftDelete,
                    record,
                )?);
                Ok(())
            })?;
        let committed = committed
            .ok_or_else(|| LedgerError::Database("record deleted without a commit".to_string()))?;

        Ok(DeleteOutcome {
            deleted_at: record.deleted_at.unwrap_or(record.updated_at),
            ledger_tx_ref: committed.ledger_tx_ref,
            block_index: committed.block.get_index(),
        })
    }

    pub fn request_access(
        &self,
        record_id: &str,
        requester: &str,
        reason: &str,
    ) -> Result<RequestOutcome> {
        let record = self.records.get(record_id)?;
        if record.is_deleted {
            return Err(LedgerError::RecordDeleted {
                record_id: record_id.to_string(),
                deleted_at: record.deleted_at.unwrap_or(record.updated_at),
            });
        }
        let request = self.access.request_access(record_id, requester, reason)?;
        Ok(RequestOutcome {
            request_id: request.request_id,
            status: request.status,
        })
    }

    pub fn respond_to_access_request(
        &self,
        record_id: &str,
        requester: &str,
        owner: &str,
        decision: AccessDecision,
    ) -> Result<AccessState> {
        self.access.respond(record_id, requester, owner, decision)
    }

    pub fn revoke_access(&self, record_id: &str, hospital_id: &str, owner: &str) -> Result<()> {
        self.access.revoke(record_id, hospital_id, owner)?;
        Ok(())
    }

    pub fn pending_requests(&self, owner: &str) -> Result<Vec<AccessRequest>> {
        self.access.pending_for_owner(owner)
    }

    pub fn access_state(&self, record_id: &str, hospital_id: &str) -> Result<AccessState> {
        self.access.access_state(record_id, hospital_id)
    }

    fn ensure_access(&self, record_id: &str, requester: &str) -> Result<()> {
        self.records.get(record_id)?;
        if !self.access.has_access(record_id, requester)? {
            warn!("{requester} denied integrity data of record {record_id}");
            return Err(LedgerError::AccessDenied {
                record_id: record_id.to_string(),
                hospital_id: requester.to_string(),
            });
        }
        Ok(())
    }

    /// Routine check: candidate hash against the permissioned ledger
    pub fn verify_record_integrity(
        &self,
        record_id: &str,
        requester: &str,
        candidate_hash: &str,
    ) -> Result<IntegrityReport> {
        self.ensure_access(record_id, requester)?;
        let is_valid = self.anchors.verify_integrity(record_id, candidate_hash)?;
        if !is_valid {
            warn!("Integrity check of record {record_id} failed against the ledger");
        }
        Ok(IntegrityReport {
            is_valid,
            checked_against: CheckedAgainst::LedgerOnly,
        })
    }

    /// Dispute resolution: ledger and public anchor must both agree
    pub fn cross_check_record(
        &self,
        record_id: &str,
        requester: &str,
        candidate_hash: &str,
    ) -> Result<IntegrityReport> {
        self.ensure_access(record_id, requester)?;
        let report = self
            .anchors
            .cross_check_public_anchor(record_id, candidate_hash)?;
        info!(
            "Cross-check of record {record_id}: valid={} against {:?}",
            report.is_valid, report.checked_against
        );
        Ok(report)
    }

    pub fn audit_history(&self, record_id: &str, requester: &str) -> Result<AuditHistory> {
        self.ensure_access(record_id, requester)?;
        Ok(self.anchors.audit_history(record_id))
    }

    /// Full chain verification. A compromised chain is an error, never repaired.
    pub fn verify_chain(&self) -> Result<u64> {
        self.ledger.verify()?;
        self.ledger.len()
    }

    /// Live records this hospital may read: its own plus active grants
    pub fn accessible_records(&self, hospital_id: &str) -> Result<Vec<MedicalRecord>> {
        let mut records = self.records.list_by_hospital(hospital_id)?;
        for record_id in self.access.accessible_records(hospital_id)? {
            match self.records.get(&record_id) {
                Ok(record) if !record.is_deleted && record.hospital_id != hospital_id => {
                    records.push(record)
                }
                Ok(_) => {}
                Err(LedgerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Records of one patient that `requester` may read
    pub fn patient_records(&self, patient_uid: &str, requester: &str) -> Result<Vec<MedicalRecord>> {
        let mut visible = Vec::new();
        for record in self.records.list_by_patient(patient_uid)? {
            if self.access.has_access(&record.record_id, requester)? {
                visible.push(record);
            }
        }
        Ok(visible)
    }

    pub fn retry_pending_anchors(&self) -> Result<Vec<(String, PublicAnchorStatus)>> {
        self.anchors.retry_pending_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{AuditEvent, LedgerBackend, MockAnchorBackend, MockLedgerBackend};
    use crate::config::{AnchorSettings, LedgerSettings};
    use crate::core::SledChainStore;
    use crate::storage::{FieldCodec, FieldValue, SecureKey};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fields(diagnosis: &str) -> ClinicalFields {
        ClinicalFields {
            department: "Cardiology".to_string(),
            doctor_name: "dr. Sari".to_string(),
            symptoms: "chest pain".to_string(),
            diagnosis: diagnosis.to_string(),
            treatment: "rest".to_string(),
            notes: String::new(),
        }
    }

    /// Permissioned ledger that can be switched to reject every submission
    struct GatedLedger {
        inner: MockLedgerBackend,
        open: AtomicBool,
    }

    impl LedgerBackend for GatedLedger {
        fn submit(&self, tx: &LedgerTransaction) -> Result<String> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(LedgerError::Network("ledger unreachable".to_string()));
            }
            self.inner.submit(tx)
        }

        fn stored_hash(&self, record_id: &str) -> Result<Option<String>> {
            self.inner.stored_hash(record_id)
        }

        fn name(&self) -> &'static str {
            "gated-ledger"
        }
    }

    fn service_with(public: Arc<MockAnchorBackend>, db: &sled::Db) -> RecordService {
        service_on(Arc::new(MockLedgerBackend::open(db).unwrap()), public, db)
    }

    fn service_on(
        backend: Arc<dyn LedgerBackend>,
        public: Arc<MockAnchorBackend>,
        db: &sled::Db,
    ) -> RecordService {
        let ledger = Ledger::open(
            Arc::new(SledChainStore::open(db).unwrap()),
            LedgerSettings::default(),
        )
        .unwrap();
        let codec = FieldCodec::new(&SecureKey::new(vec![3u8; 32]), "test").unwrap();
        let anchors =
            AnchorService::open(backend, public, db, AnchorSettings::default()).unwrap();
        RecordService::new(
            Arc::new(ledger),
            RecordStore::open(db, Some(codec)).unwrap(),
            AccessRegistry::open(db).unwrap(),
            Arc::new(anchors),
        )
    }

    fn service() -> RecordService {
        let db = sled::Config::new().temporary(true).open().unwrap();
        service_with(Arc::new(MockAnchorBackend::open(&db).unwrap()), &db)
    }

    #[test]
    fn test_create_commits_block_anchor_and_owner() {
        let service = service();
        let created = service.create_record("UID1", "RS-A", &fields("angina")).unwrap();

        assert_eq!(created.block_index, 1);
        assert!(matches!(created.anchor_status, PublicAnchorStatus::Anchored { .. }));
        assert_eq!(
            service.access_state(&created.record_id, "RS-A").unwrap(),
            AccessState::Owner
        );
        let block = service.ledger().get_block(1).unwrap().unwrap();
        assert_eq!(block.get_data().record_id, created.record_id);
        assert_eq!(block.get_data().data_hash, created.data_hash);
        assert_eq!(service.verify_chain().unwrap(), 2);
    }

    #[test]
    fn test_update_and_delete_extend_history() {
        let service = service();
        let created = service.create_record("UID1", "RS-A", &fields("v1")).unwrap();
        let id = &created.record_id;

        assert!(matches!(
            service.update_record(id, "RS-B", &fields("v2")),
            Err(LedgerError::NotOwner { .. })
        ));
        let updated = service.update_record(id, "RS-A", &fields("v2")).unwrap();
        assert_eq!(updated.version, 2);

        let deleted = service.delete_record(id, "RS-A").unwrap();
        assert_eq!(deleted.block_index, 3);
        assert!(matches!(
            service.read_record(id, "RS-A"),
            Err(LedgerError::RecordDeleted { .. })
        ));

        let history = service.audit_history(id, "RS-A").unwrap();
        let events: Vec<AuditEvent> = history.iter().map(|e| e.unwrap().event).collect();
        assert_eq!(
            events,
            vec![AuditEvent::Created, AuditEvent::Updated, AuditEvent::Deleted]
        );
        assert_eq!(service.verify_chain().unwrap(), 4);
    }

    #[test]
    fn test_integrity_requires_access() {
        let service = service();
        let created = service.create_record("UID1", "RS-A", &fields("flu")).unwrap();
        let id = &created.record_id;

        assert!(service
            .verify_record_integrity(id, "RS-A", &created.data_hash)
            .unwrap()
            .is_valid);
        assert!(matches!(
            service.verify_record_integrity(id, "RS-B", &created.data_hash),
            Err(LedgerError::AccessDenied { .. })
        ));
        assert!(matches!(
            service.audit_history(id, "RS-B"),
            Err(LedgerError::AccessDenied { .. })
        ));
        assert!(matches!(
            service.verify_record_integrity("missing", "RS-A", &created.data_hash),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_pending_public_anchor_does_not_block_create() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let public = Arc::new(MockAnchorBackend::open(&db).unwrap());
        let service = service_with(public.clone(), &db);
        public.set_available(false);

        let created = service.create_record("UID1", "RS-A", &fields("flu")).unwrap();
        assert!(created.anchor_status.is_pending());
        let view = service.read_record(&created.record_id, "RS-A").unwrap();
        assert_eq!(view.diagnosis, FieldValue::Plain("flu".to_string()));

        let report = service
            .cross_check_record(&created.record_id, "RS-A", &created.data_hash)
            .unwrap();
        assert_eq!(report.checked_against, CheckedAgainst::LedgerOnly);

        public.set_available(true);
        let outcomes = service.retry_pending_anchors().unwrap();
        assert!(matches!(outcomes[0].1, PublicAnchorStatus::Anchored { .. }));
        let report = service
            .cross_check_record(&created.record_id, "RS-A", &created.data_hash)
            .unwrap();
        assert!(report.is_valid);
        assert_eq!(report.checked_against, CheckedAgainst::LedgerAndPublicAnchor);
    }

    #[test]
    fn test_request_on_deleted_record_rejected() {
        let service = service();
        let created = service.create_record("UID1", "RS-A", &fields("flu")).unwrap();
        service.delete_record(&created.record_id, "RS-A").unwrap();
        assert!(matches!(
            service.request_access(&created.record_id, "RS-B", "referral"),
            Err(LedgerError::RecordDeleted { .. })
        ));
    }

    #[test]
    fn test_accessible_and_patient_records() {
        let service = service();
        let own = service.create_record("UID1", "RS-A", &fields("a")).unwrap();
        let other = service.create_record("UID1", "RS-B", &fields("b")).unwrap();

        service
            .request_access(&other.record_id, "RS-A", "referral")
            .unwrap();
        service
            .respond_to_access_request(&other.record_id, "RS-A", "RS-B", AccessDecision::Grant)
            .unwrap();

        let ids: Vec<String> = service
            .accessible_records("RS-A")
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        assert!(ids.contains(&own.record_id) && ids.contains(&other.record_id));

        assert_eq!(service.patient_records("UID1", "RS-C").unwrap().len(), 0);
        assert_eq!(service.patient_records("UID1", "RS-B").unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_update_leaves_orphan_block() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let gate = Arc::new(GatedLedger {
            inner: MockLedgerBackend::open(&db).unwrap(),
            open: AtomicBool::new(true),
        });
        let service = service_on(
            gate.clone(),
            Arc::new(MockAnchorBackend::open(&db).unwrap()),
            &db,
        );
        let created = service.create_record("UID1", "RS-A", &fields("v1")).unwrap();
        let id = &created.record_id;

        gate.open.store(false, Ordering::SeqCst);
        assert!(matches!(
            service.update_record(id, "RS-A", &fields("v2")),
            Err(LedgerError::Network(_))
        ));

        // The mined block stays on the chain but the record did not move
        assert_eq!(service.verify_chain().unwrap(), 3);
        let orphan = service.ledger().get_block(2).unwrap().unwrap();
        assert_eq!(orphan.get_data().version, 2);
        assert!(!service.is_committed_block(&orphan).unwrap());
        assert_eq!(service.read_record(id, "RS-A").unwrap().version, 1);

        gate.open.store(true, Ordering::SeqCst);
        let updated = service.update_record(id, "RS-A", &fields("v2")).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.block_index, 3);

        // Both v2 blocks are on the chain; only the committed one belongs to the record
        assert_eq!(service.ledger().blocks_for_record(id).unwrap().len(), 3);
        let indices: Vec<u64> = service
            .record_blocks(id)
            .unwrap()
            .iter()
            .map(|b| b.get_index())
            .collect();
        assert_eq!(indices, vec![1, 3]);
        let genesis = service.ledger().get_block(0).unwrap().unwrap();
        assert!(service.is_committed_block(&genesis).unwrap());
    }
}
