use crate::error::{LedgerError, Result};
use crate::utils::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::sync::RwLock;

const SESSIONS_TREE: &str = "sessions";

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Session {
    pub session_id: String,
    pub hospital_id: String,
    pub opened_at: i64,
    pub expires_at: i64,
}

/// Where open sessions live. Owned by the node and injected into the
/// authenticator.
pub trait SessionStore: Send + Sync {
    fn open(&self, session: &Session) -> Result<()>;
    fn get(&self, session_id: &str) -> Result<Option<Session>>;
    /// Returns true when a session was actually closed
    fn close(&self, session_id: &str) -> Result<bool>;

    fn is_open(&self, session_id: &str) -> Result<bool> {
        Ok(self.get(session_id)?.is_some())
    }
}

pub struct SledSessionStore {
    tree: Tree,
}

impl SledSessionStore {
    pub fn open(db: &Db) -> Result<SledSessionStore> {
        let tree = db
            .open_tree(SESSIONS_TREE)
            .map_err(|e| LedgerError::Database(format!("Failed to open sessions tree: {e}")))?;
        Ok(SledSessionStore { tree })
    }
}

impl SessionStore for SledSessionStore {
    fn open(&self, session: &Session) -> Result<()> {
        self.tree
            .insert(session.session_id.as_bytes(), serialize(session)?)?;
        self.tree.flush()?;
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>> {
        match self.tree.get(session_id.as_bytes())? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn close(&self, session_id: &str) -> Result<bool> {
        let removed = self.tree.remove(session_id.as_bytes())?.is_some();
        self.tree.flush()?;
        Ok(removed)
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn open(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()?
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read()?.get(session_id).cloned())
    }

    fn close(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.write()?.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        Session {
            session_id: id.to_string(),
            hospital_id: "RS-A".to_string(),
            opened_at: 1,
            expires_at: 2,
        }
    }

    fn exercise(store: &dyn SessionStore) {
        assert!(!store.is_open("s-1").unwrap());
        store.open(&session("s-1")).unwrap();
        assert!(store.is_open("s-1").unwrap());
        assert_eq!(store.get("s-1").unwrap().unwrap().hospital_id, "RS-A");
        assert!(store.close("s-1").unwrap());
        assert!(!store.close("s-1").unwrap());
        assert!(!store.is_open("s-1").unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemorySessionStore::new());
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let store = SledSessionStore::open(&db).unwrap();
            exercise(&store);
            store.open(&session("s-2")).unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let store = SledSessionStore::open(&db).unwrap();
        assert!(store.is_open("s-2").unwrap());
    }
}
