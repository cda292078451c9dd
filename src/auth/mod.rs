//! Hospital authentication
//!
//! Hospitals register a password once, log in for a signed session token,
//! and every record or access operation is performed as the hospital the
//! token names. There is no static bypass credential.

pub mod credentials;
pub mod session;
pub mod token;

pub use credentials::{CredentialStore, HospitalCredential, PasswordCost, MIN_PASSWORD_LENGTH};
pub use session::{MemorySessionStore, Session, SessionStore, SledSessionStore};
pub use token::{TokenClaims, TokenSigner};

use crate::config::AuthSettings;
use crate::error::{LedgerError, Result};
use crate::utils::current_timestamp;
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// The hospital an authenticated request acts as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HospitalIdentity {
    pub hospital_id: String,
    pub session_id: String,
}

pub struct Authenticator {
    credentials: CredentialStore,
    sessions: Arc<dyn SessionStore>,
    signer: TokenSigner,
    ttl_ms: i64,
}

impl Authenticator {
    pub fn new(
        credentials: CredentialStore,
        sessions: Arc<dyn SessionStore>,
        signer: TokenSigner,
        settings: &AuthSettings,
    ) -> Authenticator {
        let ttl_ms = i64::try_from(settings.token_ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        Authenticator {
            credentials,
            sessions,
            signer,
            ttl_ms,
        }
    }

    pub fn register_hospital(
        &self,
        hospital_id: &str,
        name: &str,
        password: &str,
    ) -> Result<HospitalCredential> {
        self.credentials.register(hospital_id, name, password)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn login(&self, hospital_id: &str, password: &str) -> Result<String> {
        self.credentials.verify(hospital_id, password)?;

        let issued_at = current_timestamp()?;
        let claims = TokenClaims {
            hospital_id: hospital_id.to_string(),
            session_id: Uuid::new_v4().to_string(),
            issued_at,
            expires_at: issued_at.saturating_add(self.ttl_ms),
        };
        self.sessions.open(&Session {
            session_id: claims.session_id.clone(),
            hospital_id: claims.hospital_id.clone(),
            opened_at: claims.issued_at,
            expires_at: claims.expires_at,
        })?;

        info!("Hospital {hospital_id} logged in (session {})", claims.session_id);
        self.signer.sign(&claims)
    }

    pub fn authenticate(&self, token: &str) -> Result<HospitalIdentity> {
        let claims = self.signer.verify(token)?;

        if claims.is_expired(current_timestamp()?) {
            warn!("Expired token presented for {}", claims.hospital_id);
            return Err(LedgerError::Authentication("token expired".to_string()));
        }
        match self.sessions.get(&claims.session_id)? {
            Some(session) if session.hospital_id == claims.hospital_id => {}
            _ => {
                return Err(LedgerError::Authentication(
                    "session is closed".to_string(),
                ))
            }
        }

        Ok(HospitalIdentity {
            hospital_id: claims.hospital_id,
            session_id: claims.session_id,
        })
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        let identity = self.authenticate(token)?;
        self.sessions.close(&identity.session_id)?;
        info!("Hospital {} logged out", identity.hospital_id);
        Ok(())
    }
}
