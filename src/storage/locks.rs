use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Table of per-key mutexes. Holding the returned lock makes a
/// read-check-write sequence on that key atomic without serializing
/// unrelated keys. An entry lives only while some caller holds or waits
/// on it.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock()?;
        Ok(Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Drop the entry for `key` unless another caller still holds a clone.
    /// New clones are only handed out under the table lock, so the count
    /// cannot grow while it is checked here.
    fn release(&self, key: &str, lock: &Arc<Mutex<()>>) -> Result<()> {
        let mut locks = self.locks.lock()?;
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
        Ok(())
    }

    /// Run `f` while holding the lock for `key`
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.lock_for(key)?;
        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(e) => Err(e.into()),
        };
        self.release(key, &lock)?;
        result
    }

    /// Number of keys currently locked or awaited
    pub fn len(&self) -> Result<usize> {
        Ok(self.locks.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_key_shares_lock() {
        let locks = KeyedLocks::new();
        let a = locks.lock_for("rec-1").unwrap();
        let b = locks.lock_for("rec-1").unwrap();
        let c = locks.lock_for("rec-2").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_with_lock_serializes_critical_section() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    locks
                        .with_lock("rec-1", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(now, 0);
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_table_is_empty_after_with_lock() {
        let locks = KeyedLocks::new();
        for i in 0..500 {
            locks.with_lock(&format!("rec-{i}"), || Ok(())).unwrap();
        }
        assert!(locks.is_empty().unwrap());

        // An error from the critical section still releases the entry
        let failed: Result<()> =
            locks.with_lock("rec-x", || Err(crate::error::LedgerError::NotFound("x".into())));
        assert!(failed.is_err());
        assert_eq!(locks.len().unwrap(), 0);
    }

    #[test]
    fn test_entry_survives_while_contended() {
        let locks = Arc::new(KeyedLocks::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks
                    .with_lock("rec-1", || {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };
        entered_rx.recv().unwrap();
        assert_eq!(locks.len().unwrap(), 1);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(locks.is_empty().unwrap());
    }

    #[test]
    fn test_contended_key_cleans_up_after_last_holder() {
        let locks = Arc::new(KeyedLocks::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with_lock("rec-1", || Ok(())).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(locks.is_empty().unwrap());
    }
}
