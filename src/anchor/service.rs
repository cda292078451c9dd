use crate::anchor::retry::RetryMessage;
use crate::anchor::{
    AnchorBackend, AnchorProof, AnchorRecord, AuditEntry, AuditEvent, CheckedAgainst,
    IntegrityReport, LedgerBackend, LedgerTransaction, LedgerTxKind, PublicAnchorStatus,
};
use crate::config::AnchorSettings;
use crate::error::{LedgerError, Result};
use crate::storage::KeyedLocks;
use crate::utils::{
    composite_prefix, constant_time_eq, current_timestamp, deserialize, serialize,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

const PROOFS_TREE: &str = "anchor_proofs";
const HISTORY_TREE: &str = "anchor_history";

/// Append-only history row; the anchor itself is joined in when read
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
struct HistoryRow {
    record_id: String,
    version: u32,
    event: AuditEvent,
    data_hash: String,
    ledger_tx_ref: String,
    local_tx_ref: String,
    timestamp: i64,
}

fn history_key(record_id: &str, version: u32, event: AuditEvent) -> Vec<u8> {
    let mut key = composite_prefix(record_id);
    key.extend(version.to_be_bytes());
    key.push(event.ordinal());
    key
}

fn load_anchor(proofs: &Tree, ledger_tx_ref: &str) -> Result<Option<AnchorRecord>> {
    match proofs.get(ledger_tx_ref.as_bytes())? {
        Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Writes every content-hash change to the permissioned ledger and the
/// public log, and keeps the resulting proofs and per-record history.
pub struct AnchorService {
    ledger: Arc<dyn LedgerBackend>,
    public: Arc<dyn AnchorBackend>,
    proofs: Tree,
    history: Tree,
    settings: AnchorSettings,
    retry_queue: Mutex<Option<Sender<RetryMessage>>>,
    proof_locks: KeyedLocks,
}

impl AnchorService {
    pub fn open(
        ledger: Arc<dyn LedgerBackend>,
        public: Arc<dyn AnchorBackend>,
        db: &Db,
        settings: AnchorSettings,
    ) -> Result<AnchorService> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| LedgerError::Database(format!("Failed to open {name} tree: {e}")))
        };
        info!(
            "Anchoring with {} and {}",
            ledger.name(),
            public.name()
        );
        Ok(AnchorService {
            ledger,
            public,
            proofs: open(PROOFS_TREE)?,
            history: open(HISTORY_TREE)?,
            settings,
            retry_queue: Mutex::new(None),
            proof_locks: KeyedLocks::new(),
        })
    }

    pub fn settings(&self) -> &AnchorSettings {
        &self.settings
    }

    pub(crate) fn attach_retry_queue(&self, sender: Sender<RetryMessage>) -> Result<()> {
        *self.retry_queue.lock()? = Some(sender);
        Ok(())
    }

    pub(crate) fn detach_retry_queue(&self) -> Result<()> {
        *self.retry_queue.lock()? = None;
        Ok(())
    }

    fn has_retry_queue(&self) -> Result<bool> {
        Ok(self.retry_queue.lock()?.is_some())
    }

    fn schedule_retry(&self, ledger_tx_ref: &str, attempts: u32) -> Result<()> {
        let queue = self.retry_queue.lock()?;
        match queue.as_ref() {
            Some(sender) => {
                let message = RetryMessage::Schedule {
                    ledger_tx_ref: ledger_tx_ref.to_string(),
                    attempts,
                };
                if sender.send(message).is_err() {
                    debug!("Retry worker gone; {ledger_tx_ref} stays pending");
                }
            }
            None => debug!("No retry worker; {ledger_tx_ref} stays pending"),
        }
        Ok(())
    }

    fn commit(&self, anchor: Option<&AnchorRecord>, row: &HistoryRow) -> Result<()> {
        let key = history_key(&row.record_id, row.version, row.event);
        let row_bytes = serialize(row)?;
        let anchor_bytes = anchor.map(serialize).transpose()?;
        let tx_ref = row.ledger_tx_ref.as_bytes();

        (&self.proofs, &self.history)
            .transaction(|(proofs, history)| {
                if let Some(bytes) = &anchor_bytes {
                    proofs.insert(tx_ref, bytes.as_slice())?;
                }
                history.insert(key.as_slice(), row_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                LedgerError::Database(format!("Failed to store anchor: {e:?}"))
            })?;
        self.history.flush()?;
        Ok(())
    }

    fn store_anchor(&self, anchor: &AnchorRecord) -> Result<()> {
        self.proofs
            .insert(anchor.proof.ledger_tx_ref.as_bytes(), serialize(anchor)?)?;
        self.proofs.flush()?;
        Ok(())
    }

    /// Single public-anchor attempt, used when no retry worker is running
    /// to complete the anchor in the background
    fn anchor_inline(&self, ledger_tx_ref: &str, tx: &LedgerTransaction) -> PublicAnchorStatus {
        match self
            .public
            .anchor_hash(ledger_tx_ref, &tx.data_hash, &tx.hospital_id)
        {
            Ok(public_tx_ref) => PublicAnchorStatus::Anchored { public_tx_ref },
            Err(e) if self.settings.max_attempts <= 1 => {
                error!("Public anchor for {ledger_tx_ref} failed: {e}");
                PublicAnchorStatus::AnchorFailed { attempts: 1 }
            }
            Err(e) => {
                warn!("Public anchor for {ledger_tx_ref} pending: {e}");
                PublicAnchorStatus::PendingPublicAnchor { attempts: 1 }
            }
        }
    }

    /// Record a create or update in both authorities. The permissioned
    /// write must succeed. With a retry worker attached the public write is
    /// left to it, so the caller never waits on the public log; without one
    /// a single inline attempt is made and a failure leaves the proof pending.
    pub fn anchor(&self, local_tx_ref: &str, tx: &LedgerTransaction) -> Result<AnchorRecord> {
        let event = match tx.kind {
            LedgerTxKind::CreateMetadata => AuditEvent::Created,
            LedgerTxKind::UpdateMetadata => AuditEvent::Updated,
            LedgerTxKind::SoftDelete => {
                return Err(LedgerError::InvalidRecord(
                    "deletions are recorded, not anchored".to_string(),
                ))
            }
        };

        let ledger_tx_ref = self.ledger.submit(tx)?;
        let now = current_timestamp()?;
        info!(
            "{} for {} v{} committed as {ledger_tx_ref}",
            tx.kind, tx.record_id, tx.version
        );

        let public = if self.has_retry_queue()? {
            debug!("Public anchor for {ledger_tx_ref} handed to the retry worker");
            PublicAnchorStatus::PendingPublicAnchor { attempts: 0 }
        } else {
            self.anchor_inline(&ledger_tx_ref, tx)
        };

        let anchor = AnchorRecord {
            proof: AnchorProof {
                ledger_tx_ref: ledger_tx_ref.clone(),
                data_hash: tx.data_hash.clone(),
                anchored_at: now,
                anchoring_party: tx.hospital_id.clone(),
            },
            record_id: tx.record_id.clone(),
            version: tx.version,
            local_tx_ref: local_tx_ref.to_string(),
            public,
        };
        let row = HistoryRow {
            record_id: tx.record_id.clone(),
            version: tx.version,
            event,
            data_hash: tx.data_hash.clone(),
            ledger_tx_ref: ledger_tx_ref.clone(),
            local_tx_ref: local_tx_ref.to_string(),
            timestamp: now,
        };
        self.commit(Some(&anchor), &row)?;

        if anchor.public.is_pending() {
            self.schedule_retry(&ledger_tx_ref, anchor.public.attempts())?;
        }
        Ok(anchor)
    }

    /// Write a SoftDelete to the permissioned ledger and a tombstone to the
    /// history. Returns the ledger transaction ref.
    pub fn record_deletion(&self, local_tx_ref: &str, tx: &LedgerTransaction) -> Result<String> {
        if tx.kind != LedgerTxKind::SoftDelete {
            return Err(LedgerError::InvalidRecord(format!(
                "{} is not a deletion",
                tx.kind
            )));
        }
        let ledger_tx_ref = self.ledger.submit(tx)?;
        let row = HistoryRow {
            record_id: tx.record_id.clone(),
            version: tx.version,
            event: AuditEvent::Deleted,
            data_hash: tx.data_hash.clone(),
            ledger_tx_ref: ledger_tx_ref.clone(),
            local_tx_ref: local_tx_ref.to_string(),
            timestamp: current_timestamp()?,
        };
        self.commit(None, &row)?;
        info!("Deletion of {} recorded as {ledger_tx_ref}", tx.record_id);
        Ok(ledger_tx_ref)
    }

    /// Whether the history holds the change `local_tx_ref` was mined for
    pub fn has_history_row(
        &self,
        record_id: &str,
        version: u32,
        event: AuditEvent,
        local_tx_ref: &str,
    ) -> Result<bool> {
        match self.history.get(history_key(record_id, version, event))? {
            Some(bytes) => {
                let row: HistoryRow = deserialize(&bytes)?;
                Ok(row.local_tx_ref == local_tx_ref)
            }
            None => Ok(false),
        }
    }

    pub fn get_anchor(&self, ledger_tx_ref: &str) -> Result<Option<AnchorRecord>> {
        load_anchor(&self.proofs, ledger_tx_ref)
    }

    /// One more public-anchor attempt for a pending proof. Proofs that are
    /// already anchored or failed are returned unchanged.
    pub fn retry_one(&self, ledger_tx_ref: &str) -> Result<PublicAnchorStatus> {
        self.proof_locks.with_lock(ledger_tx_ref, || {
            let mut anchor = self
                .get_anchor(ledger_tx_ref)?
                .ok_or_else(|| LedgerError::NotFound(format!("anchor {ledger_tx_ref}")))?;
            let attempts = match anchor.public {
                PublicAnchorStatus::PendingPublicAnchor { attempts } => attempts,
                ref settled => return Ok(settled.clone()),
            };

            anchor.public = match self.public.anchor_hash(
                ledger_tx_ref,
                &anchor.proof.data_hash,
                &anchor.proof.anchoring_party,
            ) {
                Ok(public_tx_ref) => {
                    info!("Public anchor for {ledger_tx_ref} completed: {public_tx_ref}");
                    PublicAnchorStatus::Anchored { public_tx_ref }
                }
                Err(e) => {
                    let attempts = attempts + 1;
                    if attempts >= self.settings.max_attempts {
                        let failure = LedgerError::AnchorFailed {
                            ledger_tx_ref: ledger_tx_ref.to_string(),
                            attempts,
                        };
                        error!("{failure} (last error: {e}); record {} is locally verified only", anchor.record_id);
                        PublicAnchorStatus::AnchorFailed { attempts }
                    } else {
                        warn!("Public anchor attempt {attempts} for {ledger_tx_ref} failed: {e}");
                        PublicAnchorStatus::PendingPublicAnchor { attempts }
                    }
                }
            };
            self.store_anchor(&anchor)?;
            Ok(anchor.public)
        })
    }

    pub fn pending_anchors(&self) -> Result<Vec<AnchorRecord>> {
        let mut pending = Vec::new();
        for item in self.proofs.iter() {
            let (_, bytes) = item?;
            let anchor: AnchorRecord = deserialize(&bytes)?;
            if anchor.public.is_pending() {
                pending.push(anchor);
            }
        }
        Ok(pending)
    }

    /// Synchronous pass over every pending proof
    pub fn retry_pending_now(&self) -> Result<Vec<(String, PublicAnchorStatus)>> {
        let mut outcomes = Vec::new();
        for anchor in self.pending_anchors()? {
            let status = self.retry_one(&anchor.proof.ledger_tx_ref)?;
            outcomes.push((anchor.proof.ledger_tx_ref, status));
        }
        Ok(outcomes)
    }

    /// Routine check against the permissioned ledger only
    pub fn verify_integrity(&self, record_id: &str, candidate_hash: &str) -> Result<bool> {
        let stored = self
            .ledger
            .stored_hash(record_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("ledger metadata for {record_id}")))?;
        Ok(constant_time_eq(stored.as_bytes(), candidate_hash.as_bytes()))
    }

    /// Most recent anchored content change for `record_id`
    pub fn latest_anchor(&self, record_id: &str) -> Result<Option<AnchorRecord>> {
        for item in self.history.scan_prefix(composite_prefix(record_id)).rev() {
            let (_, bytes) = item?;
            let row: HistoryRow = deserialize(&bytes)?;
            if row.event != AuditEvent::Deleted {
                return self.get_anchor(&row.ledger_tx_ref);
            }
        }
        Ok(None)
    }

    /// Dispute-resolution check: the permissioned ledger and the public log
    /// must both agree with `candidate_hash`. Falls back to the ledger alone
    /// when no public anchor can be consulted.
    pub fn cross_check_public_anchor(
        &self,
        record_id: &str,
        candidate_hash: &str,
    ) -> Result<IntegrityReport> {
        let ledger_ok = self.verify_integrity(record_id, candidate_hash)?;
        let ledger_only = IntegrityReport {
            is_valid: ledger_ok,
            checked_against: CheckedAgainst::LedgerOnly,
        };

        let anchor = match self.latest_anchor(record_id)? {
            Some(anchor) if matches!(anchor.public, PublicAnchorStatus::Anchored { .. }) => anchor,
            _ => {
                debug!("No public anchor for {record_id}; checked against ledger only");
                return Ok(ledger_only);
            }
        };

        match self.public.anchored_hash(&anchor.proof.ledger_tx_ref) {
            Ok(Some(public_hash)) => Ok(IntegrityReport {
                is_valid: ledger_ok
                    && constant_time_eq(public_hash.as_bytes(), candidate_hash.as_bytes()),
                checked_against: CheckedAgainst::LedgerAndPublicAnchor,
            }),
            Ok(None) => {
                warn!(
                    "Public log has no anchor for {} although it was confirmed",
                    anchor.proof.ledger_tx_ref
                );
                Ok(IntegrityReport {
                    is_valid: false,
                    checked_against: CheckedAgainst::LedgerAndPublicAnchor,
                })
            }
            Err(e) => {
                warn!("Public anchor unavailable for cross-check of {record_id}: {e}");
                Ok(ledger_only)
            }
        }
    }

    pub fn audit_history(&self, record_id: &str) -> AuditHistory {
        AuditHistory {
            history: self.history.clone(),
            proofs: self.proofs.clone(),
            prefix: composite_prefix(record_id),
        }
    }
}

/// A record's history in version order. Each call to [`AuditHistory::iter`]
/// starts a fresh pass over the stored rows.
pub struct AuditHistory {
    history: Tree,
    proofs: Tree,
    prefix: Vec<u8>,
}

impl AuditHistory {
    pub fn iter(&self) -> AuditIter {
        AuditIter {
            rows: self.history.scan_prefix(&self.prefix),
            proofs: self.proofs.clone(),
        }
    }
}

impl<'a> IntoIterator for &'a AuditHistory {
    type Item = Result<AuditEntry>;
    type IntoIter = AuditIter;

    fn into_iter(self) -> AuditIter {
        self.iter()
    }
}

pub struct AuditIter {
    rows: sled::Iter,
    proofs: Tree,
}

impl Iterator for AuditIter {
    type Item = Result<AuditEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rows.next()?;
        Some(item.map_err(LedgerError::from).and_then(|(_, bytes)| {
            let row: HistoryRow = deserialize(&bytes)?;
            let anchor = match row.event {
                AuditEvent::Deleted => None,
                _ => load_anchor(&self.proofs, &row.ledger_tx_ref)?,
            };
            Ok(AuditEntry {
                record_id: row.record_id,
                version: row.version,
                event: row.event,
                data_hash: row.data_hash,
                ledger_tx_ref: row.ledger_tx_ref,
                local_tx_ref: row.local_tx_ref,
                anchor,
                timestamp: row.timestamp,
            })
        }))
    }
}
