// Background completion of pending public anchors. The worker owns a
// schedule of (due time, ledger tx ref) and sleeps on its channel until the
// next entry is due, so a shutdown message is seen without waiting out a
// backoff. It only ever touches the anchor tables, never record payloads.

use crate::anchor::{AnchorService, PublicAnchorStatus};
use crate::error::{LedgerError, Result};
use log::{error, info};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const IDLE_WAIT: Duration = Duration::from_secs(60);

pub(crate) enum RetryMessage {
    Schedule { ledger_tx_ref: String, attempts: u32 },
    Shutdown,
}

pub struct RetryWorker {
    service: Arc<AnchorService>,
    sender: mpsc::Sender<RetryMessage>,
    handle: Option<JoinHandle<()>>,
}

impl RetryWorker {
    /// Start the worker and re-enqueue every proof still pending from an
    /// earlier run.
    pub fn spawn(service: Arc<AnchorService>) -> Result<RetryWorker> {
        let (sender, receiver) = mpsc::channel();

        let pending = service.pending_anchors()?;
        for anchor in &pending {
            let _ = sender.send(RetryMessage::Schedule {
                ledger_tx_ref: anchor.proof.ledger_tx_ref.clone(),
                attempts: anchor.public.attempts(),
            });
        }
        if !pending.is_empty() {
            info!("Resuming {} pending public anchors", pending.len());
        }
        service.attach_retry_queue(sender.clone())?;

        let worker_service = Arc::clone(&service);
        let handle = thread::Builder::new()
            .name("anchor-retry".to_string())
            .spawn(move || Schedule::new(worker_service, receiver).run())
            .map_err(|e| LedgerError::Io(format!("Failed to start retry worker: {e}")))?;

        Ok(RetryWorker {
            service,
            sender,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.service.detach_retry_queue()?;
        let _ = self.sender.send(RetryMessage::Shutdown);
        handle
            .join()
            .map_err(|_| LedgerError::Io("Retry worker panicked".to_string()))?;
        info!("Retry worker stopped");
        Ok(())
    }
}

impl Drop for RetryWorker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to stop retry worker: {e}");
        }
    }
}

struct Schedule {
    service: Arc<AnchorService>,
    receiver: Receiver<RetryMessage>,
    entries: Vec<(Instant, String)>,
}

impl Schedule {
    fn new(service: Arc<AnchorService>, receiver: Receiver<RetryMessage>) -> Self {
        Self {
            service,
            receiver,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, ledger_tx_ref: String, attempts: u32) {
        if self.entries.iter().any(|(_, r)| *r == ledger_tx_ref) {
            return;
        }
        let due = Instant::now() + self.service.settings().retry_delay(attempts);
        self.entries.push((due, ledger_tx_ref));
    }

    /// Returns false once shutdown was requested
    fn accept(&mut self, message: RetryMessage) -> bool {
        match message {
            RetryMessage::Schedule {
                ledger_tx_ref,
                attempts,
            } => {
                self.push(ledger_tx_ref, attempts);
                true
            }
            RetryMessage::Shutdown => false,
        }
    }

    /// Pick up messages that arrived while a retry was running
    fn drain(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => {
                    if !self.accept(message) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn run(mut self) {
        loop {
            let now = Instant::now();
            let wait = self
                .entries
                .iter()
                .map(|(due, _)| due.saturating_duration_since(now))
                .min()
                .unwrap_or(IDLE_WAIT);

            match self.receiver.recv_timeout(wait) {
                Ok(message) => {
                    if !self.accept(message) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }

            let now = Instant::now();
            let (due, later): (Vec<_>, Vec<_>) =
                self.entries.drain(..).partition(|(at, _)| *at <= now);
            self.entries = later;

            for (_, ledger_tx_ref) in due {
                if !self.drain() {
                    return;
                }
                match self.service.retry_one(&ledger_tx_ref) {
                    Ok(PublicAnchorStatus::PendingPublicAnchor { attempts }) => {
                        self.push(ledger_tx_ref, attempts)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Retry of {ledger_tx_ref} failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{
        LedgerTransaction, LedgerTxKind, MockAnchorBackend, MockLedgerBackend,
    };
    use crate::config::AnchorSettings;

    fn service(max_attempts: u32, base_delay_ms: u64) -> (Arc<AnchorService>, Arc<MockAnchorBackend>) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let public = Arc::new(MockAnchorBackend::open(&db).unwrap());
        let settings = AnchorSettings {
            max_attempts,
            retry_base_delay_ms: base_delay_ms,
            retry_max_delay_ms: base_delay_ms * 4,
            ..AnchorSettings::default()
        };
        let service = AnchorService::open(
            Arc::new(MockLedgerBackend::open(&db).unwrap()),
            public.clone(),
            &db,
            settings,
        )
        .unwrap();
        (Arc::new(service), public)
    }

    fn create_tx(record_id: &str) -> LedgerTransaction {
        LedgerTransaction {
            kind: LedgerTxKind::CreateMetadata,
            record_id: record_id.to_string(),
            patient_uid: "UID".to_string(),
            hospital_id: "RS-A".to_string(),
            data_hash: "ab".repeat(32),
            version: 1,
            description: String::new(),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_worker_promotes_pending_anchor() {
        let (service, public) = service(10, 20);
        let worker = RetryWorker::spawn(Arc::clone(&service)).unwrap();

        public.fail_next(2);
        let anchor = service.anchor("b1", &create_tx("rec-1")).unwrap();
        assert!(anchor.public.is_pending());

        let tx_ref = anchor.proof.ledger_tx_ref.clone();
        assert!(wait_for(|| matches!(
            service.get_anchor(&tx_ref).unwrap().unwrap().public,
            PublicAnchorStatus::Anchored { .. }
        )));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_worker_marks_exhausted_anchor_failed() {
        let (service, public) = service(3, 10);
        let worker = RetryWorker::spawn(Arc::clone(&service)).unwrap();
        public.set_available(false);

        let anchor = service.anchor("b1", &create_tx("rec-1")).unwrap();
        let tx_ref = anchor.proof.ledger_tx_ref.clone();
        assert!(wait_for(|| {
            service.get_anchor(&tx_ref).unwrap().unwrap().public
                == PublicAnchorStatus::AnchorFailed { attempts: 3 }
        }));
        worker.shutdown().unwrap();
    }

    #[test]
    fn test_pending_anchors_resume_on_spawn() {
        let (service, public) = service(5, 10);
        public.set_available(false);
        let anchor = service.anchor("b1", &create_tx("rec-1")).unwrap();
        public.set_available(true);

        let worker = RetryWorker::spawn(Arc::clone(&service)).unwrap();
        let tx_ref = anchor.proof.ledger_tx_ref.clone();
        assert!(wait_for(|| service.pending_anchors().unwrap().is_empty()));
        assert!(matches!(
            service.get_anchor(&tx_ref).unwrap().unwrap().public,
            PublicAnchorStatus::Anchored { .. }
        ));
        drop(worker);
    }

    #[test]
    fn test_shutdown_is_prompt_during_backoff() {
        let (service, public) = service(5, 60_000);
        public.set_available(false);
        let worker = RetryWorker::spawn(Arc::clone(&service)).unwrap();
        service.anchor("b1", &create_tx("rec-1")).unwrap();

        let started = Instant::now();
        worker.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        // The proof is left pending for the next start
        assert_eq!(service.pending_anchors().unwrap().len(), 1);
    }
}
