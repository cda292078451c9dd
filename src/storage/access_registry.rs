// Cross-hospital access control. Every (record, hospital) pair moves through
// NONE -> PENDING -> {GRANTED, DENIED}, and GRANTED -> REVOKED at the owner's
// request. The owning hospital holds an implicit permission that can never be
// revoked. Transitions on one pair run under that pair's lock, and the
// request/permission rows of a grant are written in one sled transaction.

use crate::error::{LedgerError, Result};
use crate::storage::locks::KeyedLocks;
use crate::utils::{composite_key, current_timestamp, deserialize, serialize};
use log::info;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const REQUESTS_TREE: &str = "access_requests";
const PERMISSIONS_TREE: &str = "access_permissions";
const OWNERS_TREE: &str = "record_owners";

/// The single authorization predicate every read and verify path calls.
pub trait AccessPolicy: Send + Sync {
    fn has_access(&self, record_id: &str, hospital_id: &str) -> Result<bool>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum RequestStatus {
    Pending,
    Granted,
    Denied,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "PENDING"),
            RequestStatus::Granted => write!(f, "GRANTED"),
            RequestStatus::Denied => write!(f, "DENIED"),
        }
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AccessRequest {
    pub request_id: String,
    pub record_id: String,
    pub requester_hospital_id: String,
    pub owner_hospital_id: String,
    pub reason: String,
    pub status: RequestStatus,
    pub requested_at: i64,
    pub responded_at: Option<i64>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AccessPermission {
    pub record_id: String,
    pub hospital_id: String,
    pub granted_by: String,
    pub granted_at: i64,
    pub revoked_at: Option<i64>,
    pub is_active: bool,
}

/// Where a (record, hospital) pair currently sits in the access state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessState {
    Owner,
    None,
    Pending,
    Granted,
    Denied,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessDecision {
    Grant,
    Deny,
}

impl FromStr for AccessDecision {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "grant" | "approve" | "approved" => Ok(AccessDecision::Grant),
            "deny" | "reject" | "rejected" => Ok(AccessDecision::Deny),
            other => Err(LedgerError::Config(format!(
                "Unknown access decision '{other}' (expected grant or deny)"
            ))),
        }
    }
}

pub struct AccessRegistry {
    requests: Tree,
    permissions: Tree,
    owners: Tree,
    locks: KeyedLocks,
}

impl AccessRegistry {
    pub fn open(db: &Db) -> Result<AccessRegistry> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| LedgerError::Database(format!("Failed to open {name} tree: {e}")))
        };
        Ok(AccessRegistry {
            requests: open(REQUESTS_TREE)?,
            permissions: open(PERMISSIONS_TREE)?,
            owners: open(OWNERS_TREE)?,
            locks: KeyedLocks::new(),
        })
    }

    /// Record which hospital authored `record_id`. Re-registering the same
    /// owner is a no-op; a different owner is rejected.
    pub fn register_owner(&self, record_id: &str, owner_hospital_id: &str) -> Result<()> {
        let outcome = self
            .owners
            .compare_and_swap(
                record_id.as_bytes(),
                None as Option<&[u8]>,
                Some(owner_hospital_id.as_bytes()),
            )
            .map_err(|e| LedgerError::Database(format!("Failed to register owner: {e}")))?;

        if let Err(existing) = outcome {
            let current = existing
                .current
                .map(|v| String::from_utf8_lossy(&v).to_string())
                .unwrap_or_default();
            if current != owner_hospital_id {
                return Err(LedgerError::NotOwner {
                    record_id: record_id.to_string(),
                    hospital_id: owner_hospital_id.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn owner_of(&self, record_id: &str) -> Result<String> {
        match self.owners.get(record_id.as_bytes())? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).to_string()),
            None => Err(LedgerError::NotFound(format!("record {record_id}"))),
        }
    }

    fn ensure_owner(&self, record_id: &str, caller: &str) -> Result<String> {
        let owner = self.owner_of(record_id)?;
        if owner != caller {
            return Err(LedgerError::NotOwner {
                record_id: record_id.to_string(),
                hospital_id: caller.to_string(),
            });
        }
        Ok(owner)
    }

    pub fn get_request(&self, record_id: &str, requester: &str) -> Result<Option<AccessRequest>> {
        match self.requests.get(composite_key(record_id, requester))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_permission(
        &self,
        record_id: &str,
        hospital_id: &str,
    ) -> Result<Option<AccessPermission>> {
        match self.permissions.get(composite_key(record_id, hospital_id))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn has_active_permission(&self, record_id: &str, hospital_id: &str) -> Result<bool> {
        Ok(self
            .get_permission(record_id, hospital_id)?
            .map(|p| p.is_active)
            .unwrap_or(false))
    }

    /// Open a PENDING request. Rejected while one is already pending or the
    /// requester already has access; a DENIED or REVOKED pair may re-request.
    pub fn request_access(
        &self,
        record_id: &str,
        requester: &str,
        reason: &str,
    ) -> Result<AccessRequest> {
        let owner = self.owner_of(record_id)?;
        let key = composite_key(record_id, requester);

        self.locks.with_lock(&pair_lock(record_id, requester), || {
            if owner == requester || self.has_active_permission(record_id, requester)? {
                return Err(LedgerError::AlreadyGranted {
                    record_id: record_id.to_string(),
                    hospital_id: requester.to_string(),
                });
            }
            if let Some(existing) = self.get_request(record_id, requester)? {
                if existing.status == RequestStatus::Pending {
                    return Err(LedgerError::DuplicateRequest {
                        record_id: record_id.to_string(),
                        requester: requester.to_string(),
                    });
                }
            }

            let request = AccessRequest {
                request_id: Uuid::new_v4().to_string(),
                record_id: record_id.to_string(),
                requester_hospital_id: requester.to_string(),
                owner_hospital_id: owner.clone(),
                reason: reason.to_string(),
                status: RequestStatus::Pending,
                requested_at: current_timestamp()?,
                responded_at: None,
            };
            self.requests.insert(key.as_slice(), serialize(&request)?)?;
            self.requests.flush()?;
            info!("{requester} requested access to record {record_id} owned by {owner}");
            Ok(request)
        })
    }

    fn pending_request(&self, record_id: &str, requester: &str) -> Result<AccessRequest> {
        match self.get_request(record_id, requester)? {
            Some(request) if request.status == RequestStatus::Pending => Ok(request),
            _ => Err(LedgerError::NoSuchPendingRequest {
                record_id: record_id.to_string(),
                requester: requester.to_string(),
            }),
        }
    }

    /// PENDING -> GRANTED; creates or replaces the permission row
    pub fn grant(&self, record_id: &str, requester: &str, owner: &str) -> Result<AccessPermission> {
        self.ensure_owner(record_id, owner)?;
        let key = composite_key(record_id, requester);

        self.locks.with_lock(&pair_lock(record_id, requester), || {
            let mut request = self.pending_request(record_id, requester)?;
            let now = current_timestamp()?;
            request.status = RequestStatus::Granted;
            request.responded_at = Some(now);

            let permission = AccessPermission {
                record_id: record_id.to_string(),
                hospital_id: requester.to_string(),
                granted_by: owner.to_string(),
                granted_at: now,
                revoked_at: None,
                is_active: true,
            };

            let request_bytes = serialize(&request)?;
            let permission_bytes = serialize(&permission)?;
            (&self.requests, &self.permissions)
                .transaction(|(requests, permissions)| {
                    requests.insert(key.as_slice(), request_bytes.as_slice())?;
                    permissions.insert(key.as_slice(), permission_bytes.as_slice())?;
                    Ok::<(), ConflictableTransactionError<()>>(())
                })
                .map_err(|e: TransactionError<()>| {
                    LedgerError::Database(format!("Failed to commit grant: {e:?}"))
                })?;
            self.permissions.flush()?;

            info!("{owner} granted {requester} access to record {record_id}");
            Ok(permission)
        })
    }

    /// PENDING -> DENIED. The requester may ask again later.
    pub fn deny(&self, record_id: &str, requester: &str, owner: &str) -> Result<AccessRequest> {
        self.ensure_owner(record_id, owner)?;
        let key = composite_key(record_id, requester);

        self.locks.with_lock(&pair_lock(record_id, requester), || {
            let mut request = self.pending_request(record_id, requester)?;
            request.status = RequestStatus::Denied;
            request.responded_at = Some(current_timestamp()?);
            self.requests.insert(key.as_slice(), serialize(&request)?)?;
            self.requests.flush()?;

            info!("{owner} denied {requester} access to record {record_id}");
            Ok(request)
        })
    }

    pub fn respond(
        &self,
        record_id: &str,
        requester: &str,
        owner: &str,
        decision: AccessDecision,
    ) -> Result<AccessState> {
        match decision {
            AccessDecision::Grant => {
                self.grant(record_id, requester, owner)?;
                Ok(AccessState::Granted)
            }
            AccessDecision::Deny => {
                self.deny(record_id, requester, owner)?;
                Ok(AccessState::Denied)
            }
        }
    }

    /// GRANTED -> REVOKED. Access comes back only through a fresh
    /// request and grant.
    pub fn revoke(
        &self,
        record_id: &str,
        hospital_id: &str,
        owner: &str,
    ) -> Result<AccessPermission> {
        let actual_owner = self.ensure_owner(record_id, owner)?;
        if hospital_id == actual_owner {
            return Err(LedgerError::CannotRevokeOwner {
                record_id: record_id.to_string(),
            });
        }
        let key = composite_key(record_id, hospital_id);

        self.locks.with_lock(&pair_lock(record_id, hospital_id), || {
            let mut permission = match self.get_permission(record_id, hospital_id)? {
                Some(p) if p.is_active => p,
                _ => {
                    return Err(LedgerError::NoActivePermission {
                        record_id: record_id.to_string(),
                        hospital_id: hospital_id.to_string(),
                    })
                }
            };
            permission.is_active = false;
            permission.revoked_at = Some(current_timestamp()?);
            self.permissions.insert(key.as_slice(), serialize(&permission)?)?;
            self.permissions.flush()?;

            info!("{owner} revoked {hospital_id} access to record {record_id}");
            Ok(permission)
        })
    }

    pub fn access_state(&self, record_id: &str, hospital_id: &str) -> Result<AccessState> {
        if self.owner_of(record_id)? == hospital_id {
            return Ok(AccessState::Owner);
        }
        let permission = self.get_permission(record_id, hospital_id)?;
        if permission.as_ref().map(|p| p.is_active).unwrap_or(false) {
            return Ok(AccessState::Granted);
        }
        match self.get_request(record_id, hospital_id)?.map(|r| r.status) {
            Some(RequestStatus::Pending) => return Ok(AccessState::Pending),
            Some(RequestStatus::Denied) => return Ok(AccessState::Denied),
            _ => {}
        }
        if permission.and_then(|p| p.revoked_at).is_some() {
            return Ok(AccessState::Revoked);
        }
        Ok(AccessState::None)
    }

    /// Requests waiting on a decision from `owner`
    pub fn pending_for_owner(&self, owner: &str) -> Result<Vec<AccessRequest>> {
        let mut pending = Vec::new();
        for item in self.requests.iter() {
            let (_, bytes) = item?;
            let request: AccessRequest = deserialize(&bytes)?;
            if request.status == RequestStatus::Pending && request.owner_hospital_id == owner {
                pending.push(request);
            }
        }
        pending.sort_by_key(|r| r.requested_at);
        Ok(pending)
    }

    /// Records `hospital_id` owns or holds an active grant on
    pub fn accessible_records(&self, hospital_id: &str) -> Result<Vec<String>> {
        let mut records = Vec::new();
        for item in self.owners.iter() {
            let (record_id, owner) = item?;
            if &*owner == hospital_id.as_bytes() {
                records.push(String::from_utf8_lossy(&record_id).to_string());
            }
        }
        for item in self.permissions.iter() {
            let (_, bytes) = item?;
            let permission: AccessPermission = deserialize(&bytes)?;
            if permission.is_active && permission.hospital_id == hospital_id {
                records.push(permission.record_id);
            }
        }
        records.sort();
        records.dedup();
        Ok(records)
    }
}

impl AccessPolicy for AccessRegistry {
    fn has_access(&self, record_id: &str, hospital_id: &str) -> Result<bool> {
        match self.owner_of(record_id) {
            Ok(owner) if owner == hospital_id => Ok(true),
            Ok(_) => self.has_active_permission(record_id, hospital_id),
            Err(LedgerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn pair_lock(record_id: &str, hospital_id: &str) -> String {
    format!("{record_id}/{hospital_id}")
}
