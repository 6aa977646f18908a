//! Event taxonomy crossing the scheduler boundary.

use crate::chain::{Block, SyncedState};
use crate::p2p::PeerId;
use std::time::Instant;
use thiserror::Error;

/// Queue band for events awaiting dispatch. High drains before Normal; there
/// is no finer ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

/// Why a peer was removed. Carried on `PeerError` so the network layer can
/// record the misbehaviour.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerFault {
    #[error("peer height regressed from {from} to {to}")]
    HeightRegressed { from: i64, to: i64 },
    #[error("peer base {base} above its height {height}")]
    InvertedWindow { base: i64, height: i64 },
    #[error("received block {height} without an outstanding request")]
    UnsolicitedBlock { height: i64 },
    #[error("clock error: block {height} arrived at or before its request time")]
    ClockError { height: i64 },
    #[error("peer with window [{base}, {height}] claims no block for {requested}")]
    NoBlockClaimed {
        base: i64,
        height: i64,
        requested: i64,
    },
    #[error("peer was stopped")]
    Stopped,
}

/// Faults the scheduler cannot attribute to a single peer; the driver treats
/// them as a sync abort.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("no peer covers height {height}")]
    NoPeerForHeight { height: i64 },
    #[error("block {height} is not schedulable: {reason}")]
    NotSchedulable { height: i64, reason: String },
    #[error("unknown message tag {tag} from {peer}")]
    UnknownMessage { peer: PeerId, tag: u8 },
}

/// Terminal reason for a completed sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FinishReason {
    #[error("processed all blocks")]
    AllBlocksProcessed,
    #[error("error on last block")]
    ErrorOnLastBlock,
    #[error("removed peer")]
    PeerRemoved,
    #[error("after try prune")]
    AfterPrune,
    #[error("timeout, no advance")]
    IdleTimeout,
}

/// Inbound events. Each produces exactly one [`SchedulerResponse`].
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Restart scheduling from the given consensus state.
    ResetState { state: SyncedState },
    /// A peer announced its serving window.
    StatusResponse {
        peer: PeerId,
        base: i64,
        height: i64,
    },
    /// A peer delivered a block; `received_at` is stamped at the network
    /// boundary.
    BlockResponse {
        peer: PeerId,
        block: Block,
        size: u64,
        received_at: Instant,
    },
    /// A peer claims it has no block at `height`.
    NoBlockResponse { peer: PeerId, height: i64 },
    /// Periodic request-generation tick.
    TrySchedule { time: Instant },
    /// Periodic prune sweep tick.
    TryPrunePeer { time: Instant },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// The processor applied the block at `height`.
    BlockProcessed { height: i64 },
    /// The processor rejected a block; both provenance peers are implicated.
    BlockVerificationFailure {
        first_peer: PeerId,
        second_peer: PeerId,
    },
}

/// Outbound events, one per handled input.
#[derive(Debug, Clone)]
pub enum SchedulerResponse {
    /// Nothing to do.
    NoOp,
    /// Dispatch a block request to the network.
    BlockRequest { peer: PeerId, height: i64 },
    /// Hand a validated response to the processor.
    BlockReceived { peer: PeerId, block: Block },
    /// A peer misbehaved and was removed; the network should disconnect it
    /// and the processor should evict its in-flight blocks.
    PeerError { peer: PeerId, fault: PeerFault },
    /// Peers evicted by the prune sweep.
    PeersPruned { peers: Vec<PeerId> },
    /// Sync is done; hand off to live consensus.
    Finished { reason: FinishReason },
    /// Unrecoverable scheduling fault; the driver aborts the run.
    SchedulerFail { reason: ScheduleError },
}

impl SchedulerResponse {
    pub fn priority(&self) -> Priority {
        match self {
            SchedulerResponse::PeerError { .. }
            | SchedulerResponse::PeersPruned { .. }
            | SchedulerResponse::SchedulerFail { .. } => Priority::High,
            SchedulerResponse::NoOp
            | SchedulerResponse::BlockRequest { .. }
            | SchedulerResponse::BlockReceived { .. }
            | SchedulerResponse::Finished { .. } => Priority::Normal,
        }
    }
}
