//! Chain types shared across the sync pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest identifying a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

/// Fixed-size block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: i64,
    pub time_ms: u64,
    /// Hash of the block at `height - 1`. `BlockHash::ZERO` for the first
    /// block of the chain.
    pub last_block_hash: BlockHash,
}

const HEADER_ENCODED_LEN: u64 = 8 + 8 + 32;

/// A block as exchanged with peers: header plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub data: Vec<u8>,
}

impl Block {
    pub fn height(&self) -> i64 {
        self.header.height
    }

    /// Digest over the canonical encoding: header fields in order, then the
    /// payload digest.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(self.header.height.to_be_bytes());
        hasher.update(self.header.time_ms.to_be_bytes());
        hasher.update(self.header.last_block_hash.as_bytes());
        hasher.update(Sha256::digest(&self.data));
        BlockHash(hasher.finalize().into())
    }

    /// Wire size of the block, used to sample per-peer receive rates.
    pub fn encoded_size(&self) -> u64 {
        HEADER_ENCODED_LEN + self.data.len() as u64
    }
}

/// The consensus state a sync run starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncedState {
    /// First height of the chain (usually 1).
    pub initial_height: i64,
    /// Highest block already applied locally; 0 when starting from scratch.
    pub last_block_height: i64,
}

impl SyncedState {
    /// The first height the sync run is responsible for.
    pub fn start_height(&self) -> i64 {
        let next = self.last_block_height + 1;
        if next == 1 {
            self.initial_height
        } else {
            next
        }
    }
}

/// Deterministic chain for the localnet demo, the harness, and tests.
///
/// Payload sizes vary per height so receive-rate sampling sees non-uniform
/// blocks.
pub fn devnet_chain(tip: i64, seed: u64) -> Vec<Block> {
    let mut chain = Vec::with_capacity(tip.max(0) as usize);
    let mut last_hash = BlockHash::ZERO;
    for height in 1..=tip {
        let mut filler = Sha256::new();
        filler.update(seed.to_be_bytes());
        filler.update(height.to_be_bytes());
        let digest: [u8; 32] = filler.finalize().into();
        let len = 128 + (digest[0] as usize) * 8;
        let data: Vec<u8> = digest.iter().copied().cycle().take(len).collect();

        let block = Block {
            header: BlockHeader {
                height,
                time_ms: 1_700_000_000_000 + height as u64 * 1_000,
                last_block_hash: last_hash,
            },
            data,
        };
        last_hash = block.hash();
        chain.push(block);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devnet_chain_links_hashes() {
        let chain = devnet_chain(5, 7);
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0].header.last_block_hash, BlockHash::ZERO);
        for pair in chain.windows(2) {
            assert_eq!(pair[1].header.last_block_hash, pair[0].hash());
            assert_eq!(pair[1].height(), pair[0].height() + 1);
        }
    }

    #[test]
    fn devnet_chain_is_deterministic() {
        let a = devnet_chain(8, 42);
        let b = devnet_chain(8, 42);
        let c = devnet_chain(8, 43);
        assert_eq!(a, b);
        assert_ne!(a[0].hash(), c[0].hash());
    }

    #[test]
    fn encoded_size_tracks_payload() {
        let chain = devnet_chain(2, 1);
        assert_eq!(chain[0].encoded_size(), 48 + chain[0].data.len() as u64);
    }

    #[test]
    fn start_height_prefers_initial_height_from_scratch() {
        let fresh = SyncedState {
            initial_height: 5,
            last_block_height: 0,
        };
        assert_eq!(fresh.start_height(), 5);

        let resumed = SyncedState {
            initial_height: 5,
            last_block_height: 9,
        };
        assert_eq!(resumed.start_height(), 10);
    }
}
