//! Reference block processor.
//!
//! Applies delivered blocks in height order, verifying that each block links
//! to the previously applied one. Real deployments replace this with the
//! consensus executor; the contract at the seam is what matters: `Processed`
//! events are emitted strictly in ascending height order, and a linkage break
//! implicates the providers of both blocks involved.

use crate::chain::{Block, BlockHash};
use crate::p2p::PeerId;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Driver-to-processor requests.
#[derive(Debug, Clone)]
pub enum ProcessorRequest {
    /// A validated block from the scheduler, attributed to its peer.
    Deliver { peer: PeerId, block: Block },
    /// Drop buffered blocks from a removed peer; replacements will arrive
    /// from elsewhere.
    Evict { peer: PeerId },
}

/// Processor-to-driver events.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    /// The block at `height` was verified and applied.
    Processed { height: i64 },
    /// Verification failed between consecutive blocks; `first_peer` provided
    /// the earlier block, `second_peer` the later one.
    VerificationFailure {
        first_peer: PeerId,
        second_peer: PeerId,
    },
}

struct Applied {
    hash: BlockHash,
    peer: PeerId,
}

/// Consume deliveries until the request channel closes.
///
/// `trusted_hash` anchors linkage verification for the first expected height;
/// `None` accepts any first block (starting from the chain's first height).
pub async fn run_processor(
    start_height: i64,
    trusted_hash: Option<BlockHash>,
    mut requests: mpsc::Receiver<ProcessorRequest>,
    events: mpsc::Sender<ProcessorEvent>,
) {
    let mut expected = start_height;
    let mut last_applied: Option<Applied> = None;
    let mut buffered: BTreeMap<i64, (PeerId, Block)> = BTreeMap::new();

    while let Some(request) = requests.recv().await {
        match request {
            ProcessorRequest::Deliver { peer, block } => {
                let height = block.height();
                if height < expected {
                    // Duplicate of an applied height; the scheduler already
                    // advanced past it.
                    continue;
                }
                buffered.insert(height, (peer, block));
            }
            ProcessorRequest::Evict { peer } => {
                let before = buffered.len();
                buffered.retain(|_, (provider, _)| *provider != peer);
                debug!(peer = %peer, evicted = before - buffered.len(), "evicted buffered blocks");
                continue;
            }
        }

        // Apply as far as the buffer is contiguous.
        while let Some((peer, block)) = buffered.remove(&expected) {
            let parent_hash = last_applied
                .as_ref()
                .map(|applied| applied.hash)
                .or(trusted_hash);
            let linked = match parent_hash {
                Some(parent) => block.header.last_block_hash == parent,
                None => true,
            };

            if !linked {
                let first_peer = last_applied
                    .as_ref()
                    .map(|applied| applied.peer.clone())
                    .unwrap_or_else(|| peer.clone());
                warn!(
                    height = expected,
                    first_peer = %first_peer,
                    second_peer = %peer,
                    "block verification failed"
                );
                // Drop everything the implicated peers delivered; the
                // scheduler re-requests from the remaining fleet.
                buffered.retain(|_, (provider, _)| *provider != peer && *provider != first_peer);
                if events
                    .send(ProcessorEvent::VerificationFailure {
                        first_peer,
                        second_peer: peer,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                break;
            }

            last_applied = Some(Applied {
                hash: block.hash(),
                peer,
            });
            if events
                .send(ProcessorEvent::Processed { height: expected })
                .await
                .is_err()
            {
                return;
            }
            expected += 1;
        }
    }
}
