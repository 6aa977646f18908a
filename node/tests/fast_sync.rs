//! End-to-end runs: simulated fleet -> driver -> processor.

use fastsync_node::chain::{devnet_chain, SyncedState};
use fastsync_node::p2p::sim::{spawn_sim_network, PeerScript, SimPeerSpec};
use fastsync_node::processor::run_processor;
use fastsync_node::sync::fastsync::{FinishReason, SchedulerConfig};
use fastsync_node::sync::{run_fast_sync, SyncIo, SyncOutcome, SyncParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_params() -> SyncParams {
    SyncParams {
        scheduler: SchedulerConfig {
            sync_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_millis(300),
            min_recv_rate: 0,
            target_pending: 10,
        },
        schedule_tick: Duration::from_millis(5),
        prune_tick: Duration::from_millis(100),
    }
}

fn peer(name: &str, tip: i64, latency_ms: u64) -> SimPeerSpec {
    let mut spec = SimPeerSpec::honest(name, 1, tip, Duration::from_millis(latency_ms));
    // Keep liveness fresh relative to the tight peer timeout above.
    spec.status_interval = Duration::from_millis(100);
    spec
}

async fn run_scenario(tip: i64, specs: Vec<SimPeerSpec>, params: SyncParams) -> SyncOutcome {
    let chain = Arc::new(devnet_chain(tip, 7));
    let start = SyncedState {
        initial_height: 1,
        last_block_height: 0,
    };

    let (network_events_tx, network_events_rx) = mpsc::channel(256);
    let (network_commands_tx, network_commands_rx) = mpsc::channel(256);
    let (processor_requests_tx, processor_requests_rx) = mpsc::channel(64);
    let (processor_events_tx, processor_events_rx) = mpsc::channel(64);

    let _fleet = spawn_sim_network(chain, specs, network_events_tx, network_commands_rx);
    tokio::spawn(run_processor(
        start.start_height(),
        None,
        processor_requests_rx,
        processor_events_tx,
    ));

    let io = SyncIo {
        network_events: network_events_rx,
        network_commands: network_commands_tx,
        processor_requests: processor_requests_tx,
        processor_events: processor_events_rx,
    };

    tokio::time::timeout(
        Duration::from_secs(60),
        run_fast_sync(params, start, io, None, None),
    )
    .await
    .expect("sync did not terminate")
    .expect("driver error")
}

#[tokio::test(flavor = "multi_thread")]
async fn syncs_full_chain_from_honest_fleet() {
    let tip = 60;
    let specs = vec![
        peer("peer-a", tip, 5),
        peer("peer-b", tip, 12),
        peer("peer-c", tip, 25),
    ];

    let outcome = run_scenario(tip, specs, fast_params()).await;
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            reason: FinishReason::AllBlocksProcessed,
            height: tip,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_peer_is_pruned_and_sync_completes() {
    let tip = 40;
    let specs = vec![
        peer("peer-a", tip, 5).with_script(PeerScript::Stalled),
        peer("peer-b", tip, 10),
        peer("peer-c", tip, 15),
    ];

    let outcome = run_scenario(tip, specs, fast_params()).await;
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            reason: FinishReason::AllBlocksProcessed,
            height: tip,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_block_provider_is_replaced() {
    let tip = 40;
    let specs = vec![
        peer("peer-a", tip, 5).with_script(PeerScript::CorruptAt { height: 17 }),
        peer("peer-b", tip, 10),
        peer("peer-c", tip, 15),
        peer("peer-d", tip, 20),
    ];

    let outcome = run_scenario(tip, specs, fast_params()).await;
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            reason: FinishReason::AllBlocksProcessed,
            height: tip,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn false_no_block_claim_gets_peer_removed() {
    let tip = 30;
    let specs = vec![
        peer("peer-a", tip, 5).with_script(PeerScript::ClaimsNoBlockAt { height: 9 }),
        peer("peer-b", tip, 10),
    ];

    let outcome = run_scenario(tip, specs, fast_params()).await;
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            reason: FinishReason::AllBlocksProcessed,
            height: tip,
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fully_stalled_fleet_times_out() {
    let tip = 20;
    let mut specs = vec![
        peer("peer-a", tip, 5).with_script(PeerScript::Stalled),
        peer("peer-b", tip, 5).with_script(PeerScript::Stalled),
    ];
    // Long peer timeout so the idle timeout fires first.
    for spec in &mut specs {
        spec.status_interval = Duration::from_millis(50);
    }
    let params = SyncParams {
        scheduler: SchedulerConfig {
            sync_timeout: Duration::from_millis(400),
            peer_timeout: Duration::from_secs(5),
            min_recv_rate: 0,
            target_pending: 10,
        },
        schedule_tick: Duration::from_millis(5),
        prune_tick: Duration::from_secs(1),
    };

    let outcome = run_scenario(tip, specs, params).await;
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            reason: FinishReason::IdleTimeout,
            height: 0,
        }
    );
}
