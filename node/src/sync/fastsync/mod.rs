//! Fast-sync: catch a lagging node up to the chain tip by pulling blocks in
//! parallel from the peer fleet.
//!
//! The scheduler core is strictly single-writer: all state lives behind this
//! driver loop, and the network and processor only talk to it through
//! channels. Outbound faults (`PeerError`, `PeersPruned`, `SchedulerFail`)
//! ride the high band of the dispatch queue and preempt queued ticks.

mod blocks;
mod events;
mod peers;
mod queue;
mod scheduler;

pub use events::{
    FinishReason, PeerFault, Priority, ScheduleError, SchedulerEvent, SchedulerResponse,
};
pub use scheduler::{Scheduler, SchedulerConfig};

use crate::chain::SyncedState;
use crate::p2p::{NetworkCommand, NetworkEvent, PeerMessage};
use crate::processor::{ProcessorEvent, ProcessorRequest};
use eyre::{eyre, Result};
use queue::EventQueue;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Driver tuning on top of the scheduler config.
#[derive(Debug, Clone)]
pub struct SyncParams {
    pub scheduler: SchedulerConfig,
    /// Cadence of request-generation ticks.
    pub schedule_tick: Duration,
    /// Cadence of prune sweeps.
    pub prune_tick: Duration,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            schedule_tick: Duration::from_millis(10),
            prune_tick: Duration::from_secs(1),
        }
    }
}

/// Channel endpoints connecting the driver to its collaborators.
pub struct SyncIo {
    pub network_events: mpsc::Receiver<NetworkEvent>,
    pub network_commands: mpsc::Sender<NetworkCommand>,
    pub processor_requests: mpsc::Sender<ProcessorRequest>,
    pub processor_events: mpsc::Receiver<ProcessorEvent>,
}

/// Terminal state of a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The node is close enough to the tip to hand off to live consensus.
    Completed { reason: FinishReason, height: i64 },
    /// The run hit an unrecoverable fault.
    Aborted { reason: String },
}

/// Shared gauges for progress reporting.
#[derive(Debug, Default)]
pub struct SyncProgress {
    requested: AtomicU64,
    received: AtomicU64,
    height: AtomicI64,
    max_peer_height: AtomicI64,
    peers_ready: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub requested: u64,
    pub received: u64,
    pub height: i64,
    pub max_peer_height: i64,
    pub peers_ready: u64,
}

impl SyncProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            requested: self.requested.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            height: self.height.load(Ordering::Relaxed),
            max_peer_height: self.max_peer_height.load(Ordering::Relaxed),
            peers_ready: self.peers_ready.load(Ordering::Relaxed),
        }
    }

    fn observe(&self, scheduler: &Scheduler) {
        self.height.store(scheduler.height(), Ordering::Relaxed);
        self.max_peer_height
            .store(scheduler.max_peer_height(), Ordering::Relaxed);
        self.peers_ready
            .store(scheduler.ready_peers() as u64, Ordering::Relaxed);
    }
}

/// Items waiting on the two-band dispatch queue.
enum DemuxItem {
    Inbound(SchedulerEvent),
    Outbound(SchedulerResponse),
}

/// Run fast sync to completion.
///
/// Returns when the scheduler emits a terminal event, the stop signal fires,
/// or a collaborator channel closes.
pub async fn run_fast_sync(
    params: SyncParams,
    start: SyncedState,
    mut io: SyncIo,
    progress: Option<Arc<SyncProgress>>,
    mut stop_rx: Option<watch::Receiver<bool>>,
) -> Result<SyncOutcome> {
    let mut sched = Scheduler::new(params.scheduler.clone(), &start, Instant::now());
    let mut queue: EventQueue<DemuxItem> = EventQueue::new();

    let mut schedule_ticks = tokio::time::interval(params.schedule_tick);
    schedule_ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut prune_ticks = tokio::time::interval(params.prune_tick);
    prune_ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        start_height = sched.height(),
        target_pending = params.scheduler.target_pending,
        "starting fast sync"
    );

    loop {
        while let Some(item) = queue.pop() {
            match item {
                DemuxItem::Inbound(event) => {
                    let response = sched.handle(event, Instant::now());
                    if let Some(progress) = progress.as_ref() {
                        progress.observe(&sched);
                    }
                    if !matches!(response, SchedulerResponse::NoOp) {
                        queue.push(response.priority(), DemuxItem::Outbound(response));
                    }
                }
                DemuxItem::Outbound(response) => {
                    if let Some(outcome) =
                        dispatch(response, &io, progress.as_deref(), &sched).await?
                    {
                        return Ok(outcome);
                    }
                }
            }
        }

        tokio::select! {
            () = wait_for_stop(&mut stop_rx) => {
                info!(height = sched.height(), "fast sync stopped");
                return Ok(SyncOutcome::Aborted {
                    reason: "stop requested".to_string(),
                });
            }
            maybe_event = io.network_events.recv() => {
                let Some(event) = maybe_event else {
                    return Ok(SyncOutcome::Aborted {
                        reason: "network event channel closed".to_string(),
                    });
                };
                enqueue_network_event(&mut queue, event);
            }
            maybe_event = io.processor_events.recv() => {
                let Some(event) = maybe_event else {
                    return Ok(SyncOutcome::Aborted {
                        reason: "processor event channel closed".to_string(),
                    });
                };
                let event = match event {
                    ProcessorEvent::Processed { height } => {
                        SchedulerEvent::BlockProcessed { height }
                    }
                    ProcessorEvent::VerificationFailure {
                        first_peer,
                        second_peer,
                    } => SchedulerEvent::BlockVerificationFailure {
                        first_peer,
                        second_peer,
                    },
                };
                queue.push(Priority::Normal, DemuxItem::Inbound(event));
            }
            tick = schedule_ticks.tick() => {
                queue.push(
                    Priority::Normal,
                    DemuxItem::Inbound(SchedulerEvent::TrySchedule { time: tick.into_std() }),
                );
            }
            tick = prune_ticks.tick() => {
                queue.push(
                    Priority::Normal,
                    DemuxItem::Inbound(SchedulerEvent::TryPrunePeer { time: tick.into_std() }),
                );
            }
        }
    }
}

async fn wait_for_stop(stop_rx: &mut Option<watch::Receiver<bool>>) {
    match stop_rx {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

fn enqueue_network_event(queue: &mut EventQueue<DemuxItem>, event: NetworkEvent) {
    let item = match event {
        NetworkEvent::PeerConnected { peer } => {
            DemuxItem::Inbound(SchedulerEvent::PeerConnected { peer })
        }
        NetworkEvent::PeerDisconnected { peer } => {
            DemuxItem::Inbound(SchedulerEvent::PeerDisconnected { peer })
        }
        NetworkEvent::Message {
            peer,
            message,
            received_at,
        } => match message {
            PeerMessage::Status { base, height } => {
                DemuxItem::Inbound(SchedulerEvent::StatusResponse { peer, base, height })
            }
            PeerMessage::Block { block } => {
                let size = block.encoded_size();
                DemuxItem::Inbound(SchedulerEvent::BlockResponse {
                    peer,
                    block,
                    size,
                    received_at,
                })
            }
            PeerMessage::NoBlock { height } => {
                DemuxItem::Inbound(SchedulerEvent::NoBlockResponse { peer, height })
            }
            // Nothing in the taxonomy matches: abort loudly instead of
            // dropping on the floor.
            PeerMessage::Unknown { tag } => DemuxItem::Outbound(SchedulerResponse::SchedulerFail {
                reason: ScheduleError::UnknownMessage { peer, tag },
            }),
        },
    };
    let priority = match &item {
        DemuxItem::Inbound(_) => Priority::Normal,
        DemuxItem::Outbound(response) => response.priority(),
    };
    queue.push(priority, item);
}

async fn dispatch(
    response: SchedulerResponse,
    io: &SyncIo,
    progress: Option<&SyncProgress>,
    sched: &Scheduler,
) -> Result<Option<SyncOutcome>> {
    match response {
        SchedulerResponse::NoOp => {}
        SchedulerResponse::BlockRequest { peer, height } => {
            if let Some(progress) = progress {
                progress.requested.fetch_add(1, Ordering::Relaxed);
            }
            io.network_commands
                .send(NetworkCommand::RequestBlock { peer, height })
                .await
                .map_err(|_| eyre!("network command channel closed"))?;
        }
        SchedulerResponse::BlockReceived { peer, block } => {
            if let Some(progress) = progress {
                progress.received.fetch_add(1, Ordering::Relaxed);
            }
            io.processor_requests
                .send(ProcessorRequest::Deliver { peer, block })
                .await
                .map_err(|_| eyre!("processor request channel closed"))?;
        }
        SchedulerResponse::PeerError { peer, fault } => {
            warn!(peer = %peer, fault = %fault, "peer fault");
            io.network_commands
                .send(NetworkCommand::ReportPeerError {
                    peer: peer.clone(),
                    reason: fault.to_string(),
                })
                .await
                .map_err(|_| eyre!("network command channel closed"))?;
            // The processor must drop in-flight blocks from this peer.
            io.processor_requests
                .send(ProcessorRequest::Evict { peer })
                .await
                .map_err(|_| eyre!("processor request channel closed"))?;
        }
        SchedulerResponse::PeersPruned { peers } => {
            debug!(count = peers.len(), "peers pruned");
            io.network_commands
                .send(NetworkCommand::ReportPeersPruned { peers })
                .await
                .map_err(|_| eyre!("network command channel closed"))?;
        }
        SchedulerResponse::Finished { reason } => {
            let height = sched.height() - 1;
            info!(height, reason = %reason, "fast sync finished");
            return Ok(Some(SyncOutcome::Completed { reason, height }));
        }
        SchedulerResponse::SchedulerFail { reason } => {
            warn!(reason = %reason, "fast sync aborted");
            return Ok(Some(SyncOutcome::Aborted {
                reason: reason.to_string(),
            }));
        }
    }
    Ok(None)
}
