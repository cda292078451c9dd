// The append-only, hash-linked ledger shared by every record operation.
// Appends are serialized by a writer mutex so the read-tail/mine/persist
// sequence is atomic; readers go straight to the store.

use crate::config::LedgerSettings;
use crate::core::{Block, BlockData, ChainStore};
use crate::error::{LedgerError, Result};
use log::{error, info, warn};
use std::sync::{Arc, Mutex};

pub struct Ledger {
    store: Arc<dyn ChainStore>,
    settings: LedgerSettings,
    writer: Mutex<()>,
}

impl Ledger {
    /// Open a ledger over `store`, writing the genesis block if it is empty
    pub fn open(store: Arc<dyn ChainStore>, settings: LedgerSettings) -> Result<Ledger> {
        if store.is_empty()? {
            let genesis = Block::genesis()?;
            store.push(&genesis)?;
            info!("Created ledger with genesis block {}", genesis.get_hash());
        }
        Ok(Ledger {
            store,
            settings,
            writer: Mutex::new(()),
        })
    }

    pub fn genesis() -> Result<Block> {
        Block::genesis()
    }

    pub fn tip(&self) -> Result<Block> {
        self.store
            .tip()?
            .ok_or_else(|| LedgerError::NotFound("ledger has no blocks".to_string()))
    }

    pub fn len(&self) -> Result<u64> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }

    pub fn get_block(&self, index: u64) -> Result<Option<Block>> {
        self.store.get(index)
    }

    /// Mine and persist the successor of `previous`. Fails with `StaleTail`
    /// if another append landed first, so concurrent callers that read the
    /// same tip produce exactly one winner.
    pub fn append(&self, previous: &Block, data: BlockData) -> Result<Block> {
        let _guard = self.writer.lock()?;
        let tip = self.tip()?;
        if tip.get_index() != previous.get_index() || tip.get_hash() != previous.get_hash() {
            warn!(
                "Rejected append on block {}: tip is {}",
                previous.get_index(),
                tip.get_index()
            );
            return Err(LedgerError::StaleTail {
                expected_index: previous.get_index(),
                tip_index: tip.get_index(),
            });
        }
        self.mine_and_store(&tip, data)
    }

    /// Append after whatever block is the tip at the time the lock is taken
    pub fn append_to_tip(&self, data: BlockData) -> Result<Block> {
        let _guard = self.writer.lock()?;
        let tip = self.tip()?;
        self.mine_and_store(&tip, data)
    }

    fn mine_and_store(&self, tip: &Block, data: BlockData) -> Result<Block> {
        let record_id = data.record_id.clone();
        let operation = data.operation;
        let block = Block::mine(tip, data, &self.settings)?;
        self.store.push(&block)?;
        info!(
            "Appended block {} hash={} nonce={} ({operation} {record_id})",
            block.get_index(),
            block.get_hash(),
            block.get_nonce()
        );
        Ok(block)
    }

    /// Lazy, index-ordered walk from genesis to tip
    pub fn blocks(&self) -> LedgerIterator {
        LedgerIterator {
            store: Arc::clone(&self.store),
            next_index: 0,
        }
    }

    pub fn load_chain(&self) -> Result<Vec<Block>> {
        self.blocks().collect()
    }

    /// Check every link and recomputed hash in `chain`.
    pub fn verify_chain(chain: &[Block]) -> bool {
        Self::find_violation(chain).is_none()
    }

    /// First block that fails verification, with the reason
    pub fn find_violation(chain: &[Block]) -> Option<(u64, String)> {
        let genesis = match Block::genesis() {
            Ok(genesis) => genesis,
            Err(e) => return Some((0, format!("cannot build genesis: {e}"))),
        };

        for (i, block) in chain.iter().enumerate() {
            let position = i as u64;
            if block.get_index() != position {
                return Some((
                    position,
                    format!("index {} stored at position {position}", block.get_index()),
                ));
            }

            match block.recompute_hash() {
                Ok(hash) if hash == block.get_hash() => {}
                Ok(_) => return Some((position, "stored hash does not match contents".to_string())),
                Err(e) => return Some((position, format!("cannot hash block: {e}"))),
            }

            if i == 0 {
                if block != &genesis {
                    return Some((0, "genesis block differs from the fixed genesis".to_string()));
                }
                continue;
            }

            let previous = &chain[i - 1];
            if block.get_previous_hash() != previous.get_hash() {
                return Some((
                    position,
                    "previous hash does not match preceding block".to_string(),
                ));
            }
        }
        None
    }

    /// Verify the persisted chain; a failure is terminal and never repaired
    pub fn verify(&self) -> Result<()> {
        let chain = self.load_chain()?;
        match Self::find_violation(&chain) {
            None => {
                info!("Ledger verified: {} blocks", chain.len());
                Ok(())
            }
            Some((index, reason)) => {
                error!("Ledger compromised at block {index}: {reason}");
                Err(LedgerError::ChainCompromised { index, reason })
            }
        }
    }

    /// Blocks that mention `record_id`, in chain order
    pub fn blocks_for_record(&self, record_id: &str) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        for block in self.blocks() {
            let block = block?;
            if block.get_data().record_id == record_id {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }
}

pub struct LedgerIterator {
    store: Arc<dyn ChainStore>,
    next_index: u64,
}

impl Iterator for LedgerIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.store.get(self.next_index) {
            Ok(Some(block)) => {
                self.next_index += 1;
                Some(Ok(block))
            }
            Ok(None) => None,
            Err(e) => {
                // Stop after reporting a storage error once
                self.next_index = u64::MAX;
                Some(Err(e))
            }
        }
    }
}
