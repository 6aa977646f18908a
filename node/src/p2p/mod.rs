//! P2P boundary types.
//!
//! Transport and wire framing live outside this crate; the sync pipeline only
//! sees decoded events on channels. [`sim`] provides an in-process fleet for
//! the localnet demo, the harness, and tests.

pub mod sim;

use crate::chain::Block;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Opaque peer identifier. Ordering and equality are byte-wise.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A decoded message from a peer.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// The peer announces the inclusive window of heights it can serve.
    Status { base: i64, height: i64 },
    /// The peer delivers a requested block.
    Block { block: Block },
    /// The peer claims it has no block at the requested height.
    NoBlock { height: i64 },
    /// Unrecognised wire tag; surfaced so the scheduler can abort loudly
    /// instead of dropping it.
    Unknown { tag: u8 },
}

/// Network-to-driver events.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected {
        peer: PeerId,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    Message {
        peer: PeerId,
        message: PeerMessage,
        received_at: Instant,
    },
}

/// Driver-to-network commands.
#[derive(Debug, Clone)]
pub enum NetworkCommand {
    /// Ask `peer` for the block at `height`.
    RequestBlock { peer: PeerId, height: i64 },
    /// Report a misbehaving peer; the network layer disconnects it.
    ReportPeerError { peer: PeerId, reason: String },
    /// Report peers evicted for silence, low rate, or head-of-line blocking.
    ReportPeersPruned { peers: Vec<PeerId> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_order_bytewise() {
        let mut peers = vec![
            PeerId::from("P10"),
            PeerId::from("P2"),
            PeerId::from("P1"),
        ];
        peers.sort();
        assert_eq!(
            peers,
            vec![PeerId::from("P1"), PeerId::from("P10"), PeerId::from("P2")]
        );
    }
}
