use crate::anchor::{
    AnchorBackend, AnchorService, LedgerBackend, LiveAnchorClient, LiveLedgerClient,
    MockAnchorBackend, MockLedgerBackend, RetryWorker,
};
use crate::auth::{
    Authenticator, CredentialStore, HospitalIdentity, PasswordCost, SledSessionStore, TokenSigner,
};
use crate::config::{BackendMode, Settings};
use crate::core::{Ledger, SledChainStore};
use crate::error::{LedgerError, Result};
use crate::service::RecordService;
use crate::storage::{AccessRegistry, EnvKeyProvider, FieldCodec, KeyProvider, RecordStore};
use crate::utils::pseudonymous_uid;
use log::info;
use std::sync::Arc;

/// One hospital node: a sled database, the record service on top of it,
/// authentication, and (once started) the public-anchor retry worker.
pub struct MedicalNode {
    settings: Settings,
    db: sled::Db,
    keys: Arc<dyn KeyProvider>,
    service: RecordService,
    auth: Authenticator,
    retry: Option<RetryWorker>,
}

impl MedicalNode {
    /// Open the node at `settings.db_path()` with keys and the token secret
    /// taken from the environment.
    pub fn open(settings: Settings) -> Result<MedicalNode> {
        let db = sled::open(settings.db_path()).map_err(|e| {
            LedgerError::Database(format!(
                "Failed to open database at {}: {e}",
                settings.db_path().display()
            ))
        })?;
        let keys: Arc<dyn KeyProvider> = Arc::new(EnvKeyProvider::new(&settings.crypto));
        let signer = TokenSigner::from_env(&settings.auth.token_secret_env)?;
        Self::open_with(settings, db, keys, signer)
    }

    /// Open with explicit collaborators. Anchor backends follow
    /// `settings.anchor.backend`.
    pub fn open_with(
        settings: Settings,
        db: sled::Db,
        keys: Arc<dyn KeyProvider>,
        signer: TokenSigner,
    ) -> Result<MedicalNode> {
        let (ledger_backend, public_backend) = select_backends(&settings, &db)?;
        Self::assemble(settings, db, keys, signer, ledger_backend, public_backend)
    }

    pub fn assemble(
        settings: Settings,
        db: sled::Db,
        keys: Arc<dyn KeyProvider>,
        signer: TokenSigner,
        ledger_backend: Arc<dyn LedgerBackend>,
        public_backend: Arc<dyn AnchorBackend>,
    ) -> Result<MedicalNode> {
        settings.validate()?;

        let ledger = Ledger::open(
            Arc::new(SledChainStore::open(&db)?),
            settings.ledger.clone(),
        )?;
        let codec = if settings.crypto.encrypt_records {
            Some(FieldCodec::from_provider(keys.as_ref())?)
        } else {
            None
        };
        let anchors = AnchorService::open(
            ledger_backend,
            public_backend,
            &db,
            settings.anchor.clone(),
        )?;
        let service = RecordService::new(
            Arc::new(ledger),
            RecordStore::open(&db, codec)?,
            AccessRegistry::open(&db)?,
            Arc::new(anchors),
        );

        let auth = Authenticator::new(
            CredentialStore::with_cost(&db, PasswordCost::from_settings(&settings.auth))?,
            Arc::new(SledSessionStore::open(&db)?),
            signer,
            &settings.auth,
        );

        info!(
            "Node {} opened ({} anchor backend, {} blocks)",
            settings.node.node_id,
            match settings.anchor.backend {
                BackendMode::Mock => "mock",
                BackendMode::Live => "live",
            },
            service.ledger().len()?
        );
        Ok(MedicalNode {
            settings,
            db,
            keys,
            service,
            auth,
            retry: None,
        })
    }

    /// Start the background public-anchor retry worker. Pending anchors
    /// left by an earlier run are picked up immediately.
    pub fn start_retry_worker(&mut self) -> Result<()> {
        if self.retry.is_none() {
            self.retry = Some(RetryWorker::spawn(Arc::clone(self.service.anchors()))?);
        }
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn service(&self) -> &RecordService {
        &self.service
    }

    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub fn authenticate(&self, token: &str) -> Result<HospitalIdentity> {
        self.auth.authenticate(token)
    }

    /// Pseudonymous UID for a national ID under this node's salt
    pub fn patient_uid(&self, national_id: &str) -> Result<String> {
        if national_id.trim().is_empty() {
            return Err(LedgerError::InvalidRecord(
                "national id must not be empty".to_string(),
            ));
        }
        Ok(pseudonymous_uid(national_id, &self.keys.uid_salt()?))
    }

    /// Stop the retry worker and flush the database
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(worker) = self.retry.take() {
            worker.shutdown()?;
        }
        self.db.flush()?;
        info!("Node {} shut down", self.settings.node.node_id);
        Ok(())
    }
}

fn select_backends(
    settings: &Settings,
    db: &sled::Db,
) -> Result<(Arc<dyn LedgerBackend>, Arc<dyn AnchorBackend>)> {
    match settings.anchor.backend {
        BackendMode::Mock => Ok((
            Arc::new(MockLedgerBackend::open(db)?),
            Arc::new(MockAnchorBackend::open(db)?),
        )),
        BackendMode::Live => Ok((
            Arc::new(LiveLedgerClient::from_settings(&settings.anchor)),
            Arc::new(LiveAnchorClient::from_settings(&settings.anchor)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ClinicalFields, SecureKey, StaticKeyProvider};

    fn test_settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.node.data_dir = dir.to_path_buf();
        settings.node.node_id = "rs-a".to_string();
        settings.auth.password_memory_kib = 1024;
        settings.auth.password_iterations = 1;
        settings
    }

    fn open_node(dir: &std::path::Path) -> MedicalNode {
        let settings = test_settings(dir);
        let db = sled::open(settings.db_path()).unwrap();
        let keys = Arc::new(StaticKeyProvider::new(SecureKey::new(vec![9u8; 32]), "uid-salt").unwrap());
        MedicalNode::open_with(settings, db, keys, TokenSigner::new(b"node-secret").unwrap())
            .unwrap()
    }

    #[test]
    fn test_node_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let fields = ClinicalFields {
            department: "ER".to_string(),
            doctor_name: "dr. Budi".to_string(),
            symptoms: "fever".to_string(),
            diagnosis: "dengue".to_string(),
            treatment: "fluids".to_string(),
            notes: String::new(),
        };

        let record_id = {
            let mut node = open_node(dir.path());
            node.start_retry_worker().unwrap();
            node.auth()
                .register_hospital("RS-A", "RS Harapan", "password-a")
                .unwrap();
            let uid = node.patient_uid("3174012345678901").unwrap();
            let created = node.service().create_record(&uid, "RS-A", &fields).unwrap();
            node.shutdown().unwrap();
            created.record_id
        };

        let node = open_node(dir.path());
        assert_eq!(node.service().ledger().len().unwrap(), 2);
        assert_eq!(node.service().verify_chain().unwrap(), 2);
        let view = node.service().read_record(&record_id, "RS-A").unwrap();
        assert!(view.is_complete());
        assert!(node.auth().login("RS-A", "password-a").is_ok());
    }

    #[test]
    fn test_patient_uid_rejects_blank_id() {
        let dir = tempfile::tempdir().unwrap();
        let node = open_node(dir.path());
        assert!(node.patient_uid("  ").is_err());
        assert_eq!(node.patient_uid("123").unwrap().len(), 16);
    }
}
