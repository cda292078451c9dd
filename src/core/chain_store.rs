// Block persistence behind a small trait so the ledger does not care whether
// blocks live in sled or in memory. Keys are big-endian indices, which keeps
// sled's iteration order equal to chain order.

use crate::core::Block;
use crate::error::{LedgerError, Result};
use sled::Tree;
use std::sync::RwLock;

const BLOCKS_TREE: &str = "blocks";

pub trait ChainStore: Send + Sync {
    /// Number of stored blocks
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn get(&self, index: u64) -> Result<Option<Block>>;

    fn tip(&self) -> Result<Option<Block>>;

    /// Append at the tail. `block.index` must equal the current length.
    fn push(&self, block: &Block) -> Result<()>;
}

pub struct SledChainStore {
    tree: Tree,
}

impl SledChainStore {
    pub fn open(db: &sled::Db) -> Result<SledChainStore> {
        let tree = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| LedgerError::Database(format!("Failed to open blocks tree: {e}")))?;
        Ok(SledChainStore { tree })
    }
}

impl ChainStore for SledChainStore {
    fn len(&self) -> Result<u64> {
        Ok(self.tip()?.map(|b| b.get_index() + 1).unwrap_or(0))
    }

    fn get(&self, index: u64) -> Result<Option<Block>> {
        match self
            .tree
            .get(index.to_be_bytes())
            .map_err(|e| LedgerError::Database(format!("Failed to get block {index}: {e}")))?
        {
            Some(bytes) => Ok(Some(Block::deserialize(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    fn tip(&self) -> Result<Option<Block>> {
        match self
            .tree
            .last()
            .map_err(|e| LedgerError::Database(format!("Failed to read tip block: {e}")))?
        {
            Some((_, bytes)) => Ok(Some(Block::deserialize(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    fn push(&self, block: &Block) -> Result<()> {
        let expected = self.len()?;
        if block.get_index() != expected {
            return Err(LedgerError::StaleTail {
                expected_index: block.get_index().saturating_sub(1),
                tip_index: expected.saturating_sub(1),
            });
        }

        let bytes = block.serialize()?;
        // Insert only if the slot is still empty
        self.tree
            .compare_and_swap(block.get_index().to_be_bytes(), None as Option<&[u8]>, Some(bytes))
            .map_err(|e| LedgerError::Database(format!("Failed to store block: {e}")))?
            .map_err(|_| LedgerError::StaleTail {
                expected_index: block.get_index().saturating_sub(1),
                tip_index: block.get_index(),
            })?;
        self.tree
            .flush()
            .map_err(|e| LedgerError::Database(format!("Failed to flush blocks tree: {e}")))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryChainStore {
    blocks: RwLock<Vec<Block>>,
}

impl MemoryChainStore {
    pub fn new() -> MemoryChainStore {
        MemoryChainStore::default()
    }
}

impl ChainStore for MemoryChainStore {
    fn len(&self) -> Result<u64> {
        Ok(self.blocks.read()?.len() as u64)
    }

    fn get(&self, index: u64) -> Result<Option<Block>> {
        Ok(self.blocks.read()?.get(index as usize).cloned())
    }

    fn tip(&self) -> Result<Option<Block>> {
        Ok(self.blocks.read()?.last().cloned())
    }

    fn push(&self, block: &Block) -> Result<()> {
        let mut blocks = self.blocks.write()?;
        let expected = blocks.len() as u64;
        if block.get_index() != expected {
            return Err(LedgerError::StaleTail {
                expected_index: block.get_index().saturating_sub(1),
                tip_index: expected.saturating_sub(1),
            });
        }
        blocks.push(block.clone());
        Ok(())
    }
}
