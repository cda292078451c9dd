use crate::anchor::LedgerTransaction;
use crate::error::{LedgerError, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Requests accepted by an authority node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Package {
    SubmitLedgerTx {
        tx: LedgerTransaction,
    },
    QueryLedgerHash {
        record_id: String,
    },
    AnchorHash {
        ledger_tx_ref: String,
        data_hash: String,
        hospital_id: String,
    },
    QueryAnchor {
        ledger_tx_ref: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    TxRef(String),
    Hash(Option<String>),
    Error(String),
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| LedgerError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| LedgerError::Network(format!("Address {addr} did not resolve")))
}

/// One request, one acknowledgement. Every socket operation is bounded by
/// `timeout`.
pub fn send_request(addr: &str, timeout: Duration, pkg: &Package) -> Result<Response> {
    let socket_addr = resolve(addr)?;
    debug!("Sending package to {socket_addr}: {pkg:?}");

    let stream = TcpStream::connect_timeout(&socket_addr, timeout)
        .map_err(|e| LedgerError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| LedgerError::Network(format!("Failed to set write timeout: {e}")))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| LedgerError::Network(format!("Failed to set read timeout: {e}")))?;

    serde_json::to_writer(&stream, pkg)
        .map_err(|e| LedgerError::Network(format!("Failed to send request: {e}")))?;
    stream
        .shutdown(Shutdown::Write)
        .map_err(|e| LedgerError::Network(format!("Failed to finish request: {e}")))?;

    let reader = BufReader::new(&stream);
    let response = Deserializer::from_reader(reader)
        .into_iter::<Response>()
        .next()
        .ok_or_else(|| LedgerError::Network(format!("{addr} closed without a response")))?
        .map_err(|e| LedgerError::Network(format!("Failed to read response: {e}")))?;
    Ok(response)
}
