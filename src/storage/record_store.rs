//! Encrypted medical record payloads
//!
//! Records are keyed by `record_id` in the `records` tree. Clinical text is
//! sealed per field by a [`FieldCodec`]; `data_hash` is computed over the
//! canonical plaintext so integrity checks work regardless of which key
//! encrypted the stored ciphertext.
//!
//! Mutations take a `commit` callback that runs under the record lock after
//! the new state has been computed and before it is persisted. The service
//! layer uses it to append to the ledger and anchor the new hash, so a
//! failed commit leaves the stored record untouched.

use crate::error::{LedgerError, Result};
use crate::storage::access_registry::AccessPolicy;
use crate::storage::encrypted::{wipe_string, FieldCodec};
use crate::storage::locks::KeyedLocks;
use crate::utils::{canonical_json, current_timestamp, deserialize, serialize, sha256_hex};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use uuid::Uuid;

const RECORDS_TREE: &str = "records";

/// Stored layout version of [`MedicalRecord`]
pub const RECORD_SCHEMA_VERSION: u16 = 1;

/// The closed clinical schema. Unknown or missing fields are rejected when
/// the payload is parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClinicalFields {
    pub department: String,
    pub doctor_name: String,
    pub symptoms: String,
    pub diagnosis: String,
    pub treatment: String,
    pub notes: String,
}

impl ClinicalFields {
    pub fn from_json(text: &str) -> Result<ClinicalFields> {
        let fields: ClinicalFields = serde_json::from_str(text)
            .map_err(|e| LedgerError::InvalidRecord(format!("Malformed clinical fields: {e}")))?;
        fields.validate()?;
        Ok(fields)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("department", &self.department),
            ("doctor_name", &self.doctor_name),
            ("diagnosis", &self.diagnosis),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::InvalidRecord(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    /// SHA-256 of the canonical plaintext
    pub fn data_hash(&self) -> Result<String> {
        Ok(sha256_hex(&canonical_json(self)?))
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct MedicalRecord {
    pub record_id: String,
    pub patient_uid: String,
    pub hospital_id: String,
    pub department: String,
    pub doctor_name: String,
    pub symptoms: String,
    pub diagnosis: String,
    pub treatment: String,
    pub notes: String,
    pub is_encrypted: bool,
    pub key_id: Option<String>,
    pub data_hash: String,
    pub version: u32,
    pub schema_version: u16,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl MedicalRecord {
    fn wipe_sensitive_fields(&mut self) {
        wipe_string(&mut self.symptoms);
        wipe_string(&mut self.diagnosis);
        wipe_string(&mut self.treatment);
        wipe_string(&mut self.notes);
    }
}

/// A decrypted field, or the marker for one this node could not open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Plain(String),
    Inaccessible,
}

impl FieldValue {
    pub fn as_plain(&self) -> Option<&str> {
        match self {
            FieldValue::Plain(value) => Some(value.as_str()),
            FieldValue::Inaccessible => None,
        }
    }

    pub fn is_accessible(&self) -> bool {
        matches!(self, FieldValue::Plain(_))
    }
}

/// What a successful read returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordView {
    pub record_id: String,
    pub patient_uid: String,
    pub hospital_id: String,
    pub department: String,
    pub doctor_name: String,
    pub symptoms: FieldValue,
    pub diagnosis: FieldValue,
    pub treatment: FieldValue,
    pub notes: FieldValue,
    pub data_hash: String,
    pub version: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RecordView {
    pub fn is_complete(&self) -> bool {
        [&self.symptoms, &self.diagnosis, &self.treatment, &self.notes]
            .iter()
            .all(|f| f.is_accessible())
    }

    /// The plaintext fields, if every field could be decrypted
    pub fn to_fields(&self) -> Option<ClinicalFields> {
        Some(ClinicalFields {
            department: self.department.clone(),
            doctor_name: self.doctor_name.clone(),
            symptoms: self.symptoms.as_plain()?.to_string(),
            diagnosis: self.diagnosis.as_plain()?.to_string(),
            treatment: self.treatment.as_plain()?.to_string(),
            notes: self.notes.as_plain()?.to_string(),
        })
    }
}

pub struct RecordStore {
    records: Tree,
    codec: Option<FieldCodec>,
    locks: KeyedLocks,
}

impl RecordStore {
    /// `codec` is `None` when record encryption is disabled
    pub fn open(db: &Db, codec: Option<FieldCodec>) -> Result<RecordStore> {
        let records = db
            .open_tree(RECORDS_TREE)
            .map_err(|e| LedgerError::Database(format!("Failed to open records tree: {e}")))?;
        Ok(RecordStore {
            records,
            codec,
            locks: KeyedLocks::new(),
        })
    }

    fn seal(&self, plaintext: &str) -> Result<String> {
        match &self.codec {
            Some(codec) => codec.encrypt_field(plaintext),
            None => Ok(plaintext.to_string()),
        }
    }

    fn open_field(&self, record: &MedicalRecord, stored: &str, name: &str) -> FieldValue {
        if !record.is_encrypted {
            return FieldValue::Plain(stored.to_string());
        }
        let Some(codec) = &self.codec else {
            warn!("No key loaded for {name} of record {}", record.record_id);
            return FieldValue::Inaccessible;
        };
        match codec.decrypt_field(stored) {
            Ok(plaintext) => FieldValue::Plain(plaintext),
            Err(e) => {
                warn!("Field {name} of record {} is inaccessible: {e}", record.record_id);
                FieldValue::Inaccessible
            }
        }
    }

    fn apply_fields(&self, record: &mut MedicalRecord, fields: &ClinicalFields) -> Result<()> {
        record.department = fields.department.clone();
        record.doctor_name = fields.doctor_name.clone();
        record.symptoms = self.seal(&fields.symptoms)?;
        record.diagnosis = self.seal(&fields.diagnosis)?;
        record.treatment = self.seal(&fields.treatment)?;
        record.notes = self.seal(&fields.notes)?;
        record.is_encrypted = self.codec.is_some();
        record.key_id = self.codec.as_ref().map(|c| c.key_id().to_string());
        record.data_hash = fields.data_hash()?;
        Ok(())
    }

    fn persist(&self, record: &MedicalRecord) -> Result<()> {
        self.records
            .insert(record.record_id.as_bytes(), serialize(record)?)
            .map_err(|e| LedgerError::Database(format!("Failed to store record: {e}")))?;
        self.records.flush()?;
        Ok(())
    }

    pub fn create(
        &self,
        patient_uid: &str,
        hospital_id: &str,
        fields: &ClinicalFields,
    ) -> Result<MedicalRecord> {
        self.create_with(patient_uid, hospital_id, fields, |_| Ok(()))
    }

    /// Encrypt, hash and persist version 1 of a new record
    pub fn create_with<F>(
        &self,
        patient_uid: &str,
        hospital_id: &str,
        fields: &ClinicalFields,
        commit: F,
    ) -> Result<MedicalRecord>
    where
        F: FnOnce(&MedicalRecord) -> Result<()>,
    {
        fields.validate()?;
        if patient_uid.is_empty() || hospital_id.is_empty() {
            return Err(LedgerError::InvalidRecord(
                "patient_uid and hospital_id are required".to_string(),
            ));
        }

        let record_id = Uuid::new_v4().to_string();
        self.locks.with_lock(&record_id, || {
            let now = current_timestamp()?;
            let mut record = MedicalRecord {
                record_id: record_id.clone(),
                patient_uid: patient_uid.to_string(),
                hospital_id: hospital_id.to_string(),
                department: String::new(),
                doctor_name: String::new(),
                symptoms: String::new(),
                diagnosis: String::new(),
                treatment: String::new(),
                notes: String::new(),
                is_encrypted: false,
                key_id: None,
                data_hash: String::new(),
                version: 1,
                schema_version: RECORD_SCHEMA_VERSION,
                is_deleted: false,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };
            self.apply_fields(&mut record, fields)?;

            commit(&record)?;
            self.persist(&record)?;
            info!("Created record {record_id} for {hospital_id}");
            Ok(record)
        })
    }

    /// Stored (still encrypted) record
    pub fn get(&self, record_id: &str) -> Result<MedicalRecord> {
        match self.records.get(record_id.as_bytes())? {
            Some(bytes) => deserialize(&bytes),
            None => Err(LedgerError::NotFound(format!("record {record_id}"))),
        }
    }

    pub fn exists(&self, record_id: &str) -> Result<bool> {
        Ok(self.records.contains_key(record_id.as_bytes())?)
    }

    /// Authorize, then decrypt. The access check runs before any field is
    /// touched; a field that fails to decrypt comes back as
    /// [`FieldValue::Inaccessible`] without failing the read.
    pub fn read(
        &self,
        record_id: &str,
        requester: &str,
        policy: &dyn AccessPolicy,
    ) -> Result<RecordView> {
        let record = self.get(record_id)?;
        if !policy.has_access(record_id, requester)? {
            warn!("{requester} denied read of record {record_id}");
            return Err(LedgerError::AccessDenied {
                record_id: record_id.to_string(),
                hospital_id: requester.to_string(),
            });
        }
        if record.is_deleted {
            return Err(LedgerError::RecordDeleted {
                record_id: record_id.to_string(),
                deleted_at: record.deleted_at.unwrap_or(record.updated_at),
            });
        }

        Ok(RecordView {
            symptoms: self.open_field(&record, &record.symptoms, "symptoms"),
            diagnosis: self.open_field(&record, &record.diagnosis, "diagnosis"),
            treatment: self.open_field(&record, &record.treatment, "treatment"),
            notes: self.open_field(&record, &record.notes, "notes"),
            record_id: record.record_id,
            patient_uid: record.patient_uid,
            hospital_id: record.hospital_id,
            department: record.department,
            doctor_name: record.doctor_name,
            data_hash: record.data_hash,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    fn load_owned_live(&self, record_id: &str, requester: &str) -> Result<MedicalRecord> {
        let record = self.get(record_id)?;
        if record.hospital_id != requester {
            return Err(LedgerError::NotOwner {
                record_id: record_id.to_string(),
                hospital_id: requester.to_string(),
            });
        }
        if record.is_deleted {
            return Err(LedgerError::RecordDeleted {
                record_id: record_id.to_string(),
                deleted_at: record.deleted_at.unwrap_or(record.updated_at),
            });
        }
        Ok(record)
    }

    /// Owner-only: re-encrypt, re-hash and bump the version
    pub fn update_with<F>(
        &self,
        record_id: &str,
        requester: &str,
        fields: &ClinicalFields,
        commit: F,
    ) -> Result<MedicalRecord>
    where
        F: FnOnce(&MedicalRecord) -> Result<()>,
    {
        fields.validate()?;
        self.locks.with_lock(record_id, || {
            let mut record = self.load_owned_live(record_id, requester)?;
            self.apply_fields(&mut record, fields)?;
            record.version += 1;
            record.updated_at = current_timestamp()?;

            commit(&record)?;
            self.persist(&record)?;
            info!("Updated record {record_id} to version {}", record.version);
            Ok(record)
        })
    }

    /// Owner-only tombstone: the ciphertext is wiped, the id and history stay
    pub fn soft_delete_with<F>(
        &self,
        record_id: &str,
        requester: &str,
        commit: F,
    ) -> Result<MedicalRecord>
    where
        F: FnOnce(&MedicalRecord) -> Result<()>,
    {
        self.locks.with_lock(record_id, || {
            let mut record = self.load_owned_live(record_id, requester)?;
            let now = current_timestamp()?;
            record.wipe_sensitive_fields();
            record.is_deleted = true;
            record.deleted_at = Some(now);
            record.updated_at = now;

            commit(&record)?;
            self.persist(&record)?;
            info!("Soft-deleted record {record_id}");
            Ok(record)
        })
    }

    fn list_where(&self, keep: impl Fn(&MedicalRecord) -> bool) -> Result<Vec<MedicalRecord>> {
        let mut records = Vec::new();
        for item in self.records.iter() {
            let (_, bytes) = item?;
            let record: MedicalRecord = deserialize(&bytes)?;
            if !record.is_deleted && keep(&record) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub fn list_by_patient(&self, patient_uid: &str) -> Result<Vec<MedicalRecord>> {
        self.list_where(|r| r.patient_uid == patient_uid)
    }

    pub fn list_by_hospital(&self, hospital_id: &str) -> Result<Vec<MedicalRecord>> {
        self.list_where(|r| r.hospital_id == hospital_id)
    }
}
