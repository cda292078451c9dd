// Session tokens: base64url(json claims) "." base64url(HMAC-SHA256 over the
// encoded claims). Verification recomputes the tag with ring's constant-time
// check before the claims are parsed.

use crate::error::{LedgerError, Result};
use data_encoding::BASE64URL_NOPAD;
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub hospital_id: String,
    pub session_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl TokenClaims {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

pub struct TokenSigner {
    key: hmac::Key,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<TokenSigner> {
        if secret.is_empty() {
            return Err(LedgerError::Config(
                "Token secret must not be empty".to_string(),
            ));
        }
        Ok(TokenSigner {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        })
    }

    /// Read the secret from the named environment variable
    pub fn from_env(var: &str) -> Result<TokenSigner> {
        let secret = env::var(var).map_err(|_| {
            LedgerError::Config(format!("Token secret variable {var} is not set"))
        })?;
        Self::new(secret.as_bytes())
    }

    pub fn sign(&self, claims: &TokenClaims) -> Result<String> {
        let payload = BASE64URL_NOPAD.encode(&serde_json::to_vec(claims)?);
        let tag = hmac::sign(&self.key, payload.as_bytes());
        Ok(format!("{payload}.{}", BASE64URL_NOPAD.encode(tag.as_ref())))
    }

    /// Check the signature and decode the claims. Expiry is left to the caller.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let malformed = || LedgerError::Authentication("malformed token".to_string());

        let (payload, signature) = token.split_once('.').ok_or_else(malformed)?;
        let tag = BASE64URL_NOPAD
            .decode(signature.as_bytes())
            .map_err(|_| malformed())?;
        hmac::verify(&self.key, payload.as_bytes(), &tag)
            .map_err(|_| LedgerError::Authentication("invalid token signature".to_string()))?;

        let json = BASE64URL_NOPAD
            .decode(payload.as_bytes())
            .map_err(|_| malformed())?;
        serde_json::from_slice(&json).map_err(|_| malformed())
    }
}
