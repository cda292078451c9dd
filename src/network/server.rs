use crate::anchor::{AnchorBackend, LedgerBackend, MockAnchorBackend, MockLedgerBackend};
use crate::error::{LedgerError, Result};
use crate::network::protocol::{Package, Response};
use log::{error, info, warn};
use serde_json::Deserializer;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Hosts a permissioned ledger and a public anchor log for `live` clients.
/// One thread per connection.
pub struct AuthorityServer {
    listener: TcpListener,
    ledger: Arc<dyn LedgerBackend>,
    anchors: Arc<dyn AnchorBackend>,
}

impl AuthorityServer {
    pub fn bind(
        addr: &str,
        ledger: Arc<dyn LedgerBackend>,
        anchors: Arc<dyn AnchorBackend>,
    ) -> Result<AuthorityServer> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| LedgerError::Network(format!("Failed to bind to {addr}: {e}")))?;
        Ok(AuthorityServer {
            listener,
            ledger,
            anchors,
        })
    }

    /// Authority backed by the sled mocks, persisted in `db`
    pub fn with_mock_backends(addr: &str, db: &sled::Db) -> Result<AuthorityServer> {
        Self::bind(
            addr,
            Arc::new(MockLedgerBackend::open(db)?),
            Arc::new(MockAnchorBackend::open(db)?),
        )
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| LedgerError::Network(format!("Failed to read local address: {e}")))
    }

    /// Accept connections until the listener fails
    pub fn run(&self) -> Result<()> {
        info!("Authority listening on {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let peer_addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!("Failed to get peer address: {e}");
                            continue;
                        }
                    };
                    let ledger = Arc::clone(&self.ledger);
                    let anchors = Arc::clone(&self.anchors);

                    thread::spawn(move || {
                        if let Err(e) = Self::handle_connection(&*ledger, &*anchors, stream) {
                            warn!("Error handling connection from {peer_addr}: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    fn handle_connection(
        ledger: &dyn LedgerBackend,
        anchors: &dyn AnchorBackend,
        stream: TcpStream,
    ) -> Result<()> {
        stream
            .set_read_timeout(Some(CONNECTION_TIMEOUT))
            .map_err(|e| LedgerError::Network(format!("Failed to set read timeout: {e}")))?;
        stream
            .set_write_timeout(Some(CONNECTION_TIMEOUT))
            .map_err(|e| LedgerError::Network(format!("Failed to set write timeout: {e}")))?;

        let reader = BufReader::new(&stream);
        let pkg_reader = Deserializer::from_reader(reader).into_iter::<Package>();

        for pkg in pkg_reader {
            let pkg = pkg
                .map_err(|e| LedgerError::Network(format!("Failed to deserialize package: {e}")))?;
            let response = Self::process(ledger, anchors, pkg);

            let mut writer = &stream;
            serde_json::to_writer(writer, &response)
                .map_err(|e| LedgerError::Network(format!("Failed to send response: {e}")))?;
            writer.flush()?;
        }

        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn process(ledger: &dyn LedgerBackend, anchors: &dyn AnchorBackend, pkg: Package) -> Response {
        let result = match pkg {
            Package::SubmitLedgerTx { tx } => {
                info!("Ledger transaction {} for {}", tx.kind, tx.record_id);
                ledger.submit(&tx).map(Response::TxRef)
            }
            Package::QueryLedgerHash { record_id } => {
                ledger.stored_hash(&record_id).map(Response::Hash)
            }
            Package::AnchorHash {
                ledger_tx_ref,
                data_hash,
                hospital_id,
            } => {
                info!("Public anchor for {ledger_tx_ref} from {hospital_id}");
                anchors
                    .anchor_hash(&ledger_tx_ref, &data_hash, &hospital_id)
                    .map(Response::TxRef)
            }
            Package::QueryAnchor { ledger_tx_ref } => {
                anchors.anchored_hash(&ledger_tx_ref).map(Response::Hash)
            }
        };
        result.unwrap_or_else(|e| Response::Error(e.to_string()))
    }
}
