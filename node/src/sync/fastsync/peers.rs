//! Per-peer sync state.

use crate::p2p::PeerId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Lifecycle of a peer as seen by the scheduler.
///
/// `New` peers are known but have not announced a window yet. `Removed` is
/// terminal; the entry is kept so duplicate removals and late deliveries stay
/// cheap no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Ready,
    Removed,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub state: PeerState,
    /// Inclusive serving window; -1 until the first status arrives.
    pub base: i64,
    pub height: i64,
    /// Last valid interaction while `Ready`.
    pub last_touched: Option<Instant>,
    /// Bytes per second observed on the most recent delivery; 0 until then.
    pub last_rate: u64,
}

impl PeerInfo {
    fn new() -> Self {
        Self {
            state: PeerState::New,
            base: -1,
            height: -1,
            last_touched: None,
            last_rate: 0,
        }
    }

    pub fn covers(&self, height: i64) -> bool {
        self.state == PeerState::Ready && self.base <= height && height <= self.height
    }
}

/// All peers known to the scheduler, keyed by id. `BTreeMap` keeps every
/// iteration in byte order, which is what makes peer selection and prune
/// sweeps deterministic.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<PeerId, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no peer has ever been seen.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(id)
    }

    /// Return the existing entry or create a fresh `New` one. Never revives a
    /// `Removed` entry.
    pub fn ensure(&mut self, id: &PeerId) -> &mut PeerInfo {
        self.peers.entry(id.clone()).or_insert_with(PeerInfo::new)
    }

    /// Explicit re-registration on a fresh connection: a `Removed` entry is
    /// replaced by a new `New` one.
    pub fn register(&mut self, id: &PeerId) -> &mut PeerInfo {
        let entry = self.peers.entry(id.clone()).or_insert_with(PeerInfo::new);
        if entry.state == PeerState::Removed {
            *entry = PeerInfo::new();
        }
        entry
    }

    /// Refresh the liveness timestamp. Fails for unknown or non-`Ready`
    /// peers, which is how late deliveries from dead peers are absorbed.
    pub fn touch(&mut self, id: &PeerId, at: Instant) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.state == PeerState::Ready => {
                peer.last_touched = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Mark a peer `Removed`. Returns false when the peer was unknown or
    /// already removed.
    pub fn mark_removed(&mut self, id: &PeerId) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.state != PeerState::Removed => {
                peer.state = PeerState::Removed;
                true
            }
            _ => false,
        }
    }

    /// Number of peers currently `Ready`.
    pub fn ready_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.state == PeerState::Ready)
            .count()
    }

    /// `Ready` peers whose window covers `height`, in id order.
    pub fn peers_with(&self, height: i64) -> impl Iterator<Item = &PeerId> {
        self.peers
            .iter()
            .filter(move |(_, peer)| peer.covers(height))
            .map(|(id, _)| id)
    }

    /// Highest `Ready` height, or `fallback` when no peer is ready.
    pub fn max_height(&self, fallback: i64) -> i64 {
        self.peers
            .values()
            .filter(|peer| peer.state == PeerState::Ready)
            .map(|peer| peer.height)
            .max()
            .unwrap_or(fallback)
    }

    /// `Ready` peers that have gone silent past `peer_timeout` or whose last
    /// observed rate is below `min_recv_rate`, in id order.
    pub fn prunable(
        &self,
        peer_timeout: Duration,
        min_recv_rate: u64,
        now: Instant,
    ) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.state == PeerState::Ready)
            .filter(|(_, peer)| {
                let silent = match peer.last_touched {
                    Some(touched) => now.saturating_duration_since(touched) > peer_timeout,
                    None => true,
                };
                silent || peer.last_rate < min_recv_rate
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn state_of(&self, id: &PeerId) -> Option<PeerState> {
        self.peers.get(id).map(|peer| peer.state)
    }
}
