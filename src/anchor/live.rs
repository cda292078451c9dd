// Clients for authorities reached over the network. Every call is a single
// synchronous request with the configured timeout; failures surface as
// `LedgerError::Network` (unreachable) or `LedgerError::Backend` (rejected).

use crate::anchor::{AnchorBackend, LedgerBackend, LedgerTransaction};
use crate::config::AnchorSettings;
use crate::error::{LedgerError, Result};
use crate::network::{send_request, Package, Response};
use std::time::Duration;

fn expect_tx_ref(response: Response) -> Result<String> {
    match response {
        Response::TxRef(tx_ref) => Ok(tx_ref),
        Response::Error(message) => Err(LedgerError::Backend(message)),
        other => Err(LedgerError::Network(format!("Unexpected response: {other:?}"))),
    }
}

fn expect_hash(response: Response) -> Result<Option<String>> {
    match response {
        Response::Hash(hash) => Ok(hash),
        Response::Error(message) => Err(LedgerError::Backend(message)),
        other => Err(LedgerError::Network(format!("Unexpected response: {other:?}"))),
    }
}

pub struct LiveLedgerClient {
    endpoint: String,
    timeout: Duration,
}

impl LiveLedgerClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &AnchorSettings) -> Self {
        Self::new(settings.ledger_endpoint.clone(), settings.request_timeout())
    }
}

impl LedgerBackend for LiveLedgerClient {
    fn submit(&self, tx: &LedgerTransaction) -> Result<String> {
        let response = send_request(
            &self.endpoint,
            self.timeout,
            &Package::SubmitLedgerTx { tx: tx.clone() },
        )?;
        expect_tx_ref(response)
    }

    fn stored_hash(&self, record_id: &str) -> Result<Option<String>> {
        let response = send_request(
            &self.endpoint,
            self.timeout,
            &Package::QueryLedgerHash {
                record_id: record_id.to_string(),
            },
        )?;
        expect_hash(response)
    }

    fn name(&self) -> &'static str {
        "live-ledger"
    }
}

pub struct LiveAnchorClient {
    endpoint: String,
    timeout: Duration,
}

impl LiveAnchorClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &AnchorSettings) -> Self {
        Self::new(settings.public_endpoint.clone(), settings.request_timeout())
    }
}

impl AnchorBackend for LiveAnchorClient {
    fn anchor_hash(
        &self,
        ledger_tx_ref: &str,
        data_hash: &str,
        hospital_id: &str,
    ) -> Result<String> {
        let response = send_request(
            &self.endpoint,
            self.timeout,
            &Package::AnchorHash {
                ledger_tx_ref: ledger_tx_ref.to_string(),
                data_hash: data_hash.to_string(),
                hospital_id: hospital_id.to_string(),
            },
        )?;
        expect_tx_ref(response)
    }

    fn anchored_hash(&self, ledger_tx_ref: &str) -> Result<Option<String>> {
        let response = send_request(
            &self.endpoint,
            self.timeout,
            &Package::QueryAnchor {
                ledger_tx_ref: ledger_tx_ref.to_string(),
            },
        )?;
        expect_hash(response)
    }

    fn name(&self) -> &'static str {
        "live-public-anchor"
    }
}
