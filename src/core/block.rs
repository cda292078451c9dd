use crate::config::LedgerSettings;
use crate::core::ProofOfWork;
use crate::error::Result;
use crate::utils::{canonical_json, current_timestamp, deserialize, serialize, sha256_hex};
use log::info;
use serde::{Deserialize, Serialize};

pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200_000;
const GENESIS_RECORD_ID: &str = "GENESIS";
const GENESIS_HOSPITAL_ID: &str = "SYSTEM";
const GENESIS_NOTE: &str = "Genesis Block - Ledger Started";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum LedgerOperation {
    Genesis,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

impl std::fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerOperation::Genesis => write!(f, "genesis"),
            LedgerOperation::CreateRecord => write!(f, "create"),
            LedgerOperation::UpdateRecord => write!(f, "update"),
            LedgerOperation::DeleteRecord => write!(f, "delete"),
        }
    }
}

/// What a block commits to. Only identifiers and the integrity hash of the
/// plaintext record, never clinical content.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct BlockData {
    pub operation: LedgerOperation,
    pub record_id: String,
    pub patient_uid: String,
    pub hospital_id: String,
    pub data_hash: String,
    pub version: u32,
}

impl BlockData {
    pub fn genesis() -> BlockData {
        BlockData {
            operation: LedgerOperation::Genesis,
            record_id: GENESIS_RECORD_ID.to_string(),
            patient_uid: GENESIS_RECORD_ID.to_string(),
            hospital_id: GENESIS_HOSPITAL_ID.to_string(),
            data_hash: sha256_hex(GENESIS_NOTE.as_bytes()),
            version: 0,
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self)
    }
}

/// Canonical hash input: fixed field order, big-endian integers and
/// length-prefixed strings so no two field tuples share an encoding.
pub fn block_hash_input(
    index: u64,
    previous_hash: &str,
    timestamp: i64,
    data_bytes: &[u8],
    nonce: u64,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32 + previous_hash.len() + data_bytes.len());
    bytes.extend(index.to_be_bytes());
    bytes.extend((previous_hash.len() as u32).to_be_bytes());
    bytes.extend(previous_hash.as_bytes());
    bytes.extend(timestamp.to_be_bytes());
    bytes.extend((data_bytes.len() as u32).to_be_bytes());
    bytes.extend(data_bytes);
    bytes.extend(nonce.to_be_bytes());
    bytes
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub(crate) index: u64,
    pub(crate) timestamp: i64,
    pub(crate) data: BlockData,
    pub(crate) previous_hash: String,
    pub(crate) hash: String,
    pub(crate) nonce: u64,
}

impl Block {
    /// The fixed sentinel every chain starts from. Identical on every node.
    pub fn genesis() -> Result<Block> {
        let data = BlockData::genesis();
        let hash = Self::calculate_hash(0, GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP, &data, 0)?;
        Ok(Block {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            data,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            hash,
            nonce: 0,
        })
    }

    /// Build the successor of `previous` and run the bounded difficulty search.
    pub fn mine(previous: &Block, data: BlockData, settings: &LedgerSettings) -> Result<Block> {
        let index = previous.index + 1;
        let timestamp = current_timestamp()?;
        let previous_hash = previous.hash.clone();

        let pow = ProofOfWork::new(index, &previous_hash, timestamp, &data, settings.difficulty)?;
        let (nonce, hash) = pow.run(settings.max_nonce, settings.mining_timeout())?;
        info!("Mined block {index}: {hash} (nonce {nonce})");

        Ok(Block {
            index,
            timestamp,
            data,
            previous_hash,
            hash,
            nonce,
        })
    }

    pub fn calculate_hash(
        index: u64,
        previous_hash: &str,
        timestamp: i64,
        data: &BlockData,
        nonce: u64,
    ) -> Result<String> {
        let data_bytes = data.canonical_bytes()?;
        let input = block_hash_input(index, previous_hash, timestamp, &data_bytes, nonce);
        Ok(sha256_hex(&input))
    }

    /// Hash recomputed from the stored fields, ignoring the stored hash
    pub fn recompute_hash(&self) -> Result<String> {
        Self::calculate_hash(
            self.index,
            &self.previous_hash,
            self.timestamp,
            &self.data,
            self.nonce,
        )
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_data(&self) -> &BlockData {
        &self.data
    }

    pub fn get_previous_hash(&self) -> &str {
        self.previous_hash.as_str()
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_data(version: u32) -> BlockData {
        BlockData {
            operation: LedgerOperation::CreateRecord,
            record_id: "rec-1".to_string(),
            patient_uid: "A1B2C3D4E5F60718".to_string(),
            hospital_id: "RS-A".to_string(),
            data_hash: sha256_hex(b"payload"),
            version,
        }
    }

    #[test]
    fn test_genesis_is_fixed() {
        let a = Block::genesis().unwrap();
        let b = Block::genesis().unwrap();

        assert_eq!(a, b);
        assert_eq!(a.get_index(), 0);
        assert_eq!(a.get_previous_hash(), "0");
        assert_eq!(a.get_nonce(), 0);
        assert_eq!(a.recompute_hash().unwrap(), a.get_hash());
    }

    #[test]
    fn test_mined_block_links_to_previous() {
        let genesis = Block::genesis().unwrap();
        let block = Block::mine(&genesis, record_data(1), &LedgerSettings::default()).unwrap();

        assert_eq!(block.get_index(), 1);
        assert_eq!(block.get_previous_hash(), genesis.get_hash());
        assert!(block.get_hash().starts_with('0'));
        assert_eq!(block.recompute_hash().unwrap(), block.get_hash());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let genesis = Block::genesis().unwrap();
        let base = Block::mine(&genesis, record_data(1), &LedgerSettings::default()).unwrap();

        let mut changed = base.clone();
        changed.nonce += 1;
        assert_ne!(changed.recompute_hash().unwrap(), base.get_hash());

        let mut changed = base.clone();
        changed.timestamp += 1;
        assert_ne!(changed.recompute_hash().unwrap(), base.get_hash());

        let mut changed = base.clone();
        changed.data.version = 2;
        assert_ne!(changed.recompute_hash().unwrap(), base.get_hash());

        let mut changed = base.clone();
        changed.previous_hash = "f".repeat(64);
        assert_ne!(changed.recompute_hash().unwrap(), base.get_hash());

        let mut changed = base.clone();
        changed.index = 9;
        assert_ne!(changed.recompute_hash().unwrap(), base.get_hash());
    }

    #[test]
    fn test_hash_input_is_unambiguous() {
        let a = block_hash_input(1, "ab", 0, b"c", 0);
        let b = block_hash_input(1, "a", 0, b"bc", 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_block_storage_encoding() {
        let genesis = Block::genesis().unwrap();
        let bytes = genesis.serialize().unwrap();
        assert_eq!(Block::deserialize(&bytes).unwrap(), genesis);
    }
}
