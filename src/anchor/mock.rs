// Deterministic stand-ins for the consortium ledger and the public log.
// Both keep their state in sled trees: a temporary database in tests, the
// node's own database when a single node runs without live authorities.
// Transaction refs are derived from a sled-generated sequence number, so the
// same sequence of calls always yields the same refs.

use crate::anchor::{AnchorBackend, LedgerBackend, LedgerTransaction, LedgerTxKind};
use crate::error::{LedgerError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_hex};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

const LEDGER_ENTRIES_TREE: &str = "mock_ledger_entries";
const PUBLIC_ANCHORS_TREE: &str = "mock_public_anchors";

/// World-state row kept by the permissioned ledger, keyed by record id
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct LedgerEntry {
    pub record_id: String,
    pub patient_uid: String,
    pub hospital_id: String,
    pub data_hash: String,
    pub version: u32,
    pub description: String,
    pub timestamp: i64,
    pub is_deleted: bool,
    pub last_tx_ref: String,
}

fn open_tree(db: &Db, name: &str) -> Result<Tree> {
    db.open_tree(name)
        .map_err(|e| LedgerError::Database(format!("Failed to open {name} tree: {e}")))
}

fn temporary_db() -> Result<Db> {
    sled::Config::new()
        .temporary(true)
        .open()
        .map_err(|e| LedgerError::Database(format!("Failed to open temporary database: {e}")))
}

pub struct MockLedgerBackend {
    db: Db,
    entries: Tree,
    write_lock: Mutex<()>,
}

impl MockLedgerBackend {
    pub fn open(db: &Db) -> Result<MockLedgerBackend> {
        Ok(MockLedgerBackend {
            db: db.clone(),
            entries: open_tree(db, LEDGER_ENTRIES_TREE)?,
            write_lock: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Result<MockLedgerBackend> {
        Self::open(&temporary_db()?)
    }

    pub fn entry(&self, record_id: &str) -> Result<Option<LedgerEntry>> {
        match self.entries.get(record_id.as_bytes())? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn live_entry(&self, record_id: &str) -> Result<LedgerEntry> {
        match self.entry(record_id)? {
            Some(entry) if !entry.is_deleted => Ok(entry),
            Some(_) => Err(LedgerError::Backend(format!(
                "record {record_id} has been deleted"
            ))),
            None => Err(LedgerError::Backend(format!(
                "the metadata {record_id} does not exist"
            ))),
        }
    }

    fn next_tx_ref(&self, tx: &LedgerTransaction) -> Result<String> {
        let sequence = self.db.generate_id()?;
        let input = format!(
            "{sequence}|{}|{}|{}|{}",
            tx.kind, tx.record_id, tx.version, tx.data_hash
        );
        Ok(format!("ledger-tx-{}", &sha256_hex(input.as_bytes())[..24]))
    }
}

impl LedgerBackend for MockLedgerBackend {
    fn submit(&self, tx: &LedgerTransaction) -> Result<String> {
        let _guard = self.write_lock.lock()?;
        let tx_ref = self.next_tx_ref(tx)?;
        let now = current_timestamp()?;

        let entry = match tx.kind {
            LedgerTxKind::CreateMetadata => {
                if self.entry(&tx.record_id)?.is_some() {
                    return Err(LedgerError::Backend(format!(
                        "the metadata {} already exists",
                        tx.record_id
                    )));
                }
                LedgerEntry {
                    record_id: tx.record_id.clone(),
                    patient_uid: tx.patient_uid.clone(),
                    hospital_id: tx.hospital_id.clone(),
                    data_hash: tx.data_hash.clone(),
                    version: tx.version,
                    description: tx.description.clone(),
                    timestamp: now,
                    is_deleted: false,
                    last_tx_ref: tx_ref.clone(),
                }
            }
            LedgerTxKind::UpdateMetadata => {
                let mut entry = self.live_entry(&tx.record_id)?;
                entry.data_hash = tx.data_hash.clone();
                entry.version = tx.version;
                entry.description = tx.description.clone();
                entry.timestamp = now;
                entry.last_tx_ref = tx_ref.clone();
                entry
            }
            LedgerTxKind::SoftDelete => {
                let mut entry = self.live_entry(&tx.record_id)?;
                entry.is_deleted = true;
                entry.timestamp = now;
                entry.last_tx_ref = tx_ref.clone();
                entry
            }
        };

        self.entries
            .insert(tx.record_id.as_bytes(), serialize(&entry)?)?;
        self.entries.flush()?;
        debug!("Mock ledger committed {} for {} as {tx_ref}", tx.kind, tx.record_id);
        Ok(tx_ref)
    }

    fn stored_hash(&self, record_id: &str) -> Result<Option<String>> {
        Ok(self.entry(record_id)?.map(|e| e.data_hash))
    }

    fn name(&self) -> &'static str {
        "mock-ledger"
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
struct PublicAnchorEntry {
    public_tx_ref: String,
    data_hash: String,
    hospital_id: String,
    anchored_at: i64,
}

/// Public log mock with failure injection: it can be switched off entirely
/// or told to fail the next `n` calls.
pub struct MockAnchorBackend {
    anchors: Tree,
    available: AtomicBool,
    failures_remaining: AtomicU32,
    write_lock: Mutex<()>,
}

impl MockAnchorBackend {
    pub fn open(db: &Db) -> Result<MockAnchorBackend> {
        Ok(MockAnchorBackend {
            anchors: open_tree(db, PUBLIC_ANCHORS_TREE)?,
            available: AtomicBool::new(true),
            failures_remaining: AtomicU32::new(0),
            write_lock: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Result<MockAnchorBackend> {
        Self::open(&temporary_db()?)
    }

    pub fn set_available(&self, available: bool) {
        info!(
            "Mock public anchor {}",
            if available { "available" } else { "unavailable" }
        );
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures_remaining.store(calls, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if !self.is_available() {
            return Err(LedgerError::Network("public anchor unavailable".to_string()));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerError::Network("public anchor timed out".to_string()));
        }
        Ok(())
    }

    fn entry(&self, ledger_tx_ref: &str) -> Result<Option<PublicAnchorEntry>> {
        match self.anchors.get(ledger_tx_ref.as_bytes())? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl AnchorBackend for MockAnchorBackend {
    fn anchor_hash(
        &self,
        ledger_tx_ref: &str,
        data_hash: &str,
        hospital_id: &str,
    ) -> Result<String> {
        self.check_reachable()?;
        let _guard = self.write_lock.lock()?;

        if let Some(existing) = self.entry(ledger_tx_ref)? {
            if existing.data_hash == data_hash {
                return Ok(existing.public_tx_ref);
            }
            return Err(LedgerError::Backend(format!(
                "{ledger_tx_ref} is already anchored with a different hash"
            )));
        }

        let input = format!("{ledger_tx_ref}|{data_hash}|{hospital_id}");
        let entry = PublicAnchorEntry {
            public_tx_ref: format!("0x{}", sha256_hex(input.as_bytes())),
            data_hash: data_hash.to_string(),
            hospital_id: hospital_id.to_string(),
            anchored_at: current_timestamp()?,
        };
        self.anchors
            .insert(ledger_tx_ref.as_bytes(), serialize(&entry)?)?;
        self.anchors.flush()?;
        debug!("Mock public log anchored {ledger_tx_ref} as {}", entry.public_tx_ref);
        Ok(entry.public_tx_ref)
    }

    fn anchored_hash(&self, ledger_tx_ref: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.entry(ledger_tx_ref)?.map(|e| e.data_hash))
    }

    fn name(&self) -> &'static str {
        "mock-public-anchor"
    }
}
