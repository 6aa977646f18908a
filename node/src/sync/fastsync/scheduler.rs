//! The fast-sync scheduler core.
//!
//! A deterministic state machine over the peer and block tables: every
//! inbound [`SchedulerEvent`] produces exactly one [`SchedulerResponse`].
//! Handlers never read the wall clock; the driver stamps `now` at dispatch
//! and timestamped events carry their own, so runs replay byte-for-byte.

use super::blocks::{BlockState, BlockTable};
use super::events::{FinishReason, PeerFault, ScheduleError, SchedulerEvent, SchedulerResponse};
use super::peers::{PeerState, PeerTable};
use crate::chain::{Block, SyncedState};
use crate::metrics::receive_rate_bps;
use crate::p2p::PeerId;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Tuning for a sync run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Give up when the cursor has not advanced for this long.
    pub sync_timeout: Duration,
    /// Per-request deadline and per-peer silence limit.
    pub peer_timeout: Duration,
    /// Minimum per-peer delivery rate in bytes/sec; 0 disables rate pruning.
    pub min_recv_rate: u64,
    /// Soft cap on heights tracked at once (the request window).
    pub target_pending: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(15),
            min_recv_rate: 0,
            target_pending: 10,
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    /// First height this run is responsible for.
    init_height: i64,
    /// Next height to process; everything below is applied.
    height: i64,
    /// Last time the cursor moved.
    last_advance: Instant,
    peers: PeerTable,
    blocks: BlockTable,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, start: &SyncedState, now: Instant) -> Self {
        let height = start.start_height();
        Self {
            config,
            init_height: height,
            height,
            last_advance: now,
            peers: PeerTable::new(),
            blocks: BlockTable::new(),
        }
    }

    /// Next height to process.
    pub fn height(&self) -> i64 {
        self.height
    }

    /// First height this run was responsible for.
    pub fn init_height(&self) -> i64 {
        self.init_height
    }

    /// Best height any `Ready` peer can serve, or `height - 1` when none.
    pub fn max_peer_height(&self) -> i64 {
        self.peers.max_height(self.height - 1)
    }

    pub fn ready_peers(&self) -> usize {
        self.peers.ready_count()
    }

    /// Drive one event through the state machine.
    pub fn handle(&mut self, event: SchedulerEvent, now: Instant) -> SchedulerResponse {
        match event {
            SchedulerEvent::ResetState { state } => self.handle_reset_state(&state, now),
            SchedulerEvent::StatusResponse { peer, base, height } => {
                self.handle_status_response(&peer, base, height, now)
            }
            SchedulerEvent::BlockResponse {
                peer,
                block,
                size,
                received_at,
            } => self.handle_block_response(&peer, block, size, received_at),
            SchedulerEvent::NoBlockResponse { peer, height } => {
                self.handle_no_block_response(&peer, height)
            }
            SchedulerEvent::TrySchedule { time } => self.handle_try_schedule(time),
            SchedulerEvent::TryPrunePeer { time } => self.handle_try_prune_peer(time),
            SchedulerEvent::PeerConnected { peer } => self.handle_peer_connected(&peer),
            SchedulerEvent::PeerDisconnected { peer } => self.handle_peer_disconnected(&peer),
            SchedulerEvent::BlockProcessed { height } => self.handle_block_processed(height, now),
            SchedulerEvent::BlockVerificationFailure {
                first_peer,
                second_peer,
            } => self.handle_verification_failure(&first_peer, &second_peer),
        }
    }

    fn handle_reset_state(&mut self, state: &SyncedState, now: Instant) -> SchedulerResponse {
        let height = state.start_height();
        self.init_height = height;
        self.height = height;
        self.last_advance = now;
        // Stale entries from before the reset would sit below the new cursor
        // or carry dead provenance; start the window over.
        self.blocks.clear();
        self.top_up_new();
        SchedulerResponse::NoOp
    }

    fn handle_status_response(
        &mut self,
        peer: &PeerId,
        base: i64,
        height: i64,
        now: Instant,
    ) -> SchedulerResponse {
        match self.set_peer_range(peer, base, height, now) {
            Ok(()) => SchedulerResponse::NoOp,
            Err(fault) => SchedulerResponse::PeerError {
                peer: peer.clone(),
                fault,
            },
        }
    }

    fn handle_block_response(
        &mut self,
        peer: &PeerId,
        block: Block,
        size: u64,
        received_at: Instant,
    ) -> SchedulerResponse {
        // Late delivery from an unknown or already-removed peer.
        if !self.peers.touch(peer, received_at) {
            return SchedulerResponse::NoOp;
        }

        let height = block.height();
        let pending = self
            .blocks
            .pending_entry(height)
            .map(|(pending_peer, since)| (pending_peer.clone(), since));
        let pending_since = match pending {
            Some((pending_peer, since)) if &pending_peer == peer => since,
            _ => {
                self.remove_peer(peer);
                return SchedulerResponse::PeerError {
                    peer: peer.clone(),
                    fault: PeerFault::UnsolicitedBlock { height },
                };
            }
        };
        if received_at <= pending_since {
            self.remove_peer(peer);
            return SchedulerResponse::PeerError {
                peer: peer.clone(),
                fault: PeerFault::ClockError { height },
            };
        }

        let rate = receive_rate_bps(size, received_at - pending_since);
        if let Some(info) = self.peers.get_mut(peer) {
            info.last_rate = rate;
        }
        self.blocks.mark_received(height, peer.clone());
        trace!(peer = %peer, height, size, rate_bps = rate, "block received");

        SchedulerResponse::BlockReceived {
            peer: peer.clone(),
            block,
        }
    }

    fn handle_no_block_response(&mut self, peer: &PeerId, requested: i64) -> SchedulerResponse {
        let (base, height) = match self.peers.get(peer) {
            Some(info) if info.state != PeerState::Removed => (info.base, info.height),
            _ => return SchedulerResponse::NoOp,
        };

        self.remove_peer(peer);
        SchedulerResponse::PeerError {
            peer: peer.clone(),
            fault: PeerFault::NoBlockClaimed {
                base,
                height,
                requested,
            },
        }
    }

    fn handle_try_schedule(&mut self, time: Instant) -> SchedulerResponse {
        if time.saturating_duration_since(self.last_advance) > self.config.sync_timeout {
            return SchedulerResponse::Finished {
                reason: FinishReason::IdleTimeout,
            };
        }

        let Some(height) = self.blocks.next_new() else {
            return SchedulerResponse::NoOp;
        };

        let Some(peer) = self.select_peer(height) else {
            return SchedulerResponse::SchedulerFail {
                reason: ScheduleError::NoPeerForHeight { height },
            };
        };

        let covered = self.peers.get(&peer).is_some_and(|info| info.covers(height));
        if !covered || self.blocks.state_at(height, self.height) != BlockState::New {
            return SchedulerResponse::SchedulerFail {
                reason: ScheduleError::NotSchedulable {
                    height,
                    reason: format!("peer {peer} no longer eligible"),
                },
            };
        }

        self.blocks.mark_pending(height, peer.clone(), time);
        trace!(peer = %peer, height, "block requested");
        SchedulerResponse::BlockRequest { peer, height }
    }

    fn handle_try_prune_peer(&mut self, time: Instant) -> SchedulerResponse {
        let mut removed = Vec::new();

        // A peer serving high heights while withholding the cursor block
        // stalls the whole run; evict it even if otherwise lively.
        if let Some((peer, since)) = self
            .blocks
            .pending_entry(self.height)
            .map(|(peer, since)| (peer.clone(), since))
        {
            if time.saturating_duration_since(since) > self.config.peer_timeout {
                debug!(peer = %peer, height = self.height, "pruning head-of-line peer");
                self.remove_peer(&peer);
                removed.push(peer);
            }
        }

        for peer in self
            .peers
            .prunable(self.config.peer_timeout, self.config.min_recv_rate, time)
        {
            self.remove_peer(&peer);
            removed.push(peer);
        }

        if removed.is_empty() {
            return SchedulerResponse::NoOp;
        }
        if self.all_blocks_processed() {
            return SchedulerResponse::Finished {
                reason: FinishReason::AfterPrune,
            };
        }
        SchedulerResponse::PeersPruned { peers: removed }
    }

    fn handle_peer_connected(&mut self, peer: &PeerId) -> SchedulerResponse {
        // Status must arrive before the peer can serve anything.
        self.peers.register(peer);
        SchedulerResponse::NoOp
    }

    fn handle_peer_disconnected(&mut self, peer: &PeerId) -> SchedulerResponse {
        // Unknown peer, or one already removed for a fault: nothing to do.
        let live = matches!(
            self.peers.get(peer),
            Some(info) if info.state != PeerState::Removed
        );
        if !live {
            return SchedulerResponse::NoOp;
        }

        self.remove_peer(peer);

        if self.all_blocks_processed() {
            return SchedulerResponse::Finished {
                reason: FinishReason::PeerRemoved,
            };
        }

        // Tell the processor to evict any in-flight blocks from this peer.
        SchedulerResponse::PeerError {
            peer: peer.clone(),
            fault: PeerFault::Stopped,
        }
    }

    fn handle_block_processed(&mut self, height: i64, now: Instant) -> SchedulerResponse {
        // Hard contract with the processor: heights are applied in cursor
        // order, so a mismatch means the two components disagree on history.
        assert_eq!(
            height, self.height,
            "processed height {height}, but expected height {}",
            self.height
        );

        self.last_advance = now;
        self.height = height + 1;
        self.blocks.mark_processed(height);
        self.top_up_new();

        if self.all_blocks_processed() {
            return SchedulerResponse::Finished {
                reason: FinishReason::AllBlocksProcessed,
            };
        }
        SchedulerResponse::NoOp
    }

    fn handle_verification_failure(
        &mut self,
        first_peer: &PeerId,
        second_peer: &PeerId,
    ) -> SchedulerResponse {
        // Both peers delivered parts of the faulty chain.
        self.remove_peer(first_peer);
        self.remove_peer(second_peer);

        if self.all_blocks_processed() {
            return SchedulerResponse::Finished {
                reason: FinishReason::ErrorOnLastBlock,
            };
        }
        SchedulerResponse::NoOp
    }

    /// Apply a status update, enforcing window monotonicity. A violation
    /// removes the peer and surfaces the fault.
    fn set_peer_range(
        &mut self,
        peer: &PeerId,
        base: i64,
        height: i64,
        now: Instant,
    ) -> Result<(), PeerFault> {
        let (state, current_height) = {
            let info = self.peers.ensure(peer);
            (info.state, info.height)
        };

        if state == PeerState::Removed {
            return Ok(());
        }
        if height < current_height {
            self.remove_peer(peer);
            return Err(PeerFault::HeightRegressed {
                from: current_height,
                to: height,
            });
        }
        if base > height {
            self.remove_peer(peer);
            return Err(PeerFault::InvertedWindow { base, height });
        }

        let info = self.peers.ensure(peer);
        info.base = base;
        info.height = height;
        info.state = PeerState::Ready;
        info.last_touched = Some(now);

        // A taller fleet may have opened up new schedulable heights.
        self.top_up_new();
        Ok(())
    }

    /// Remove a peer and release everything attributed to it. Idempotent.
    fn remove_peer(&mut self, peer: &PeerId) {
        if !self.peers.mark_removed(peer) {
            return;
        }

        let reverted = self.blocks.drop_peer(peer);
        // Heights beyond the remaining fleet's reach are no longer schedulable.
        let max_height = self.peers.max_height(self.height - 1);
        self.blocks.truncate_above(max_height);
        debug!(
            peer = %peer,
            reverted = reverted.len(),
            max_peer_height = max_height,
            "peer removed"
        );
    }

    /// The `Ready` peer covering `height` with the fewest in-flight requests;
    /// ties go to the lowest id.
    fn select_peer(&self, height: i64) -> Option<PeerId> {
        let mut best: Option<(usize, &PeerId)> = None;
        for peer in self.peers.peers_with(height) {
            let pending = self.blocks.pending_count_for(peer);
            let better = match best {
                Some((min_pending, _)) => pending < min_pending,
                None => true,
            };
            if better {
                best = Some((pending, peer));
            }
        }
        best.map(|(_, peer)| peer.clone())
    }

    fn top_up_new(&mut self) {
        let max_peer_height = self.max_peer_height();
        self.blocks
            .add_new(self.height, self.config.target_pending, max_peer_height);
    }

    /// Done when at least one peer is known and the cursor has reached the
    /// best height the fleet can serve.
    fn all_blocks_processed(&self) -> bool {
        !self.peers.is_empty() && self.height >= self.max_peer_height()
    }
}
