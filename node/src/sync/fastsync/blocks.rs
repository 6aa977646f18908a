//! Per-height block lifecycle tracking.

use crate::p2p::PeerId;
use std::collections::BTreeMap;
use std::time::Instant;

/// Lifecycle of a block under management.
///
/// `Unknown` and `Processed` are not stored: heights below the cursor are
/// processed, heights absent from the table are unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unknown,
    New,
    Pending,
    Received,
    Processed,
}

#[derive(Debug, Clone)]
enum Entry {
    New,
    Pending { peer: PeerId, since: Instant },
    Received { peer: PeerId },
}

impl Entry {
    fn state(&self) -> BlockState {
        match self {
            Entry::New => BlockState::New,
            Entry::Pending { .. } => BlockState::Pending,
            Entry::Received { .. } => BlockState::Received,
        }
    }
}

/// Heights currently being fetched, keyed in ascending order so the lowest
/// `New` height is found by a forward scan.
#[derive(Debug, Default)]
pub struct BlockTable {
    entries: BTreeMap<i64, Entry>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn state_at(&self, height: i64, cursor: i64) -> BlockState {
        if height < cursor {
            return BlockState::Processed;
        }
        self.entries
            .get(&height)
            .map(Entry::state)
            .unwrap_or(BlockState::Unknown)
    }

    /// Lowest height in `New`, if any.
    pub fn next_new(&self) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, entry)| matches!(entry, Entry::New))
            .map(|(height, _)| *height)
    }

    /// Top up the table with `New` heights from the request window
    /// `[cursor, cursor + target_pending)`, capped by `max_peer_height`.
    pub fn add_new(&mut self, cursor: i64, target_pending: usize, max_peer_height: i64) {
        if self.entries.len() >= target_pending {
            return;
        }
        for height in cursor..cursor + target_pending as i64 {
            if height > max_peer_height {
                break;
            }
            self.entries.entry(height).or_insert(Entry::New);
        }
    }

    /// Record an in-flight request. The caller has already validated the
    /// height is `New` and the peer covers it.
    pub fn mark_pending(&mut self, height: i64, peer: PeerId, since: Instant) {
        self.entries.insert(height, Entry::Pending { peer, since });
    }

    /// Move a pending height into the scheduler's hand.
    pub fn mark_received(&mut self, height: i64, peer: PeerId) {
        self.entries.insert(height, Entry::Received { peer });
    }

    /// Drop every record of `height`; the cursor advancing past it is what
    /// makes it `Processed`.
    pub fn mark_processed(&mut self, height: i64) {
        self.entries.remove(&height);
    }

    /// Provenance of the in-flight request at `height`, if one is pending.
    pub fn pending_entry(&self, height: i64) -> Option<(&PeerId, Instant)> {
        match self.entries.get(&height) {
            Some(Entry::Pending { peer, since }) => Some((peer, *since)),
            _ => None,
        }
    }

    /// Number of requests currently in flight to `peer`.
    pub fn pending_count_for(&self, peer: &PeerId) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Pending { peer: p, .. } if p == peer))
            .count()
    }

    /// Revert every `Pending`/`Received` height attributed to `peer` back to
    /// `New`. Returns the reverted heights.
    pub fn drop_peer(&mut self, peer: &PeerId) -> Vec<i64> {
        let mut reverted = Vec::new();
        for (height, entry) in self.entries.iter_mut() {
            let owned = match entry {
                Entry::Pending { peer: p, .. } | Entry::Received { peer: p } => p == peer,
                Entry::New => false,
            };
            if owned {
                *entry = Entry::New;
                reverted.push(*height);
            }
        }
        reverted
    }

    /// Delete heights no remaining peer can serve.
    pub fn truncate_above(&mut self, max_height: i64) {
        self.entries.retain(|height, _| *height <= max_height);
    }

    /// Drop all tracking, including in-flight provenance.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn heights_in(&self, state: BlockState) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state() == state)
            .map(|(height, _)| *height)
            .collect()
    }
}
