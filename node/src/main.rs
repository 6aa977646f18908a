use eyre::Result;
use fastsync_node::chain::{devnet_chain, SyncedState};
use fastsync_node::cli::NodeConfig;
use fastsync_node::logging::init_tracing;
use fastsync_node::metrics::{height_lag, rate_per_sec};
use fastsync_node::p2p::sim::{spawn_sim_network, SimPeerSpec};
use fastsync_node::processor::run_processor;
use fastsync_node::sync::{run_fast_sync, SyncIo, SyncOutcome, SyncProgress};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_args();
    init_tracing(config.verbosity);

    info!(
        chain_height = config.chain_height,
        peers = config.peers,
        seed = config.seed,
        "starting fast-sync localnet demo"
    );

    let chain = Arc::new(devnet_chain(config.chain_height, config.seed));
    let start = SyncedState {
        initial_height: 1,
        last_block_height: 0,
    };

    // Simulated fleet: full-window peers with seeded latencies.
    let mut rng = StdRng::seed_from_u64(config.seed);
    let specs: Vec<SimPeerSpec> = (0..config.peers.max(1))
        .map(|i| {
            let latency = Duration::from_millis(rng.gen_range(5..50));
            SimPeerSpec::honest(format!("peer-{i:02}"), 1, config.chain_height, latency)
        })
        .collect();

    let (network_events_tx, network_events_rx) = mpsc::channel(256);
    let (network_commands_tx, network_commands_rx) = mpsc::channel(256);
    let (processor_requests_tx, processor_requests_rx) = mpsc::channel(64);
    let (processor_events_tx, processor_events_rx) = mpsc::channel(64);

    let _fleet = spawn_sim_network(
        Arc::clone(&chain),
        specs,
        network_events_tx,
        network_commands_rx,
    );
    tokio::spawn(run_processor(
        start.start_height(),
        None,
        processor_requests_rx,
        processor_events_tx,
    ));

    let progress = Arc::new(SyncProgress::default());
    let bar_task = if std::io::stderr().is_terminal() {
        let bar = ProgressBar::new(config.chain_height as u64);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        let style = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} | {elapsed_precise} | {msg}",
        )
        .expect("progress style");
        bar.set_style(style);
        let progress = Arc::clone(&progress);
        let start_height = start.start_height();
        Some(tokio::spawn(async move {
            loop {
                let snapshot = progress.snapshot();
                bar.set_position((snapshot.height - start_height).max(0) as u64);
                bar.set_message(format!(
                    "peers: {} | lag: {}",
                    snapshot.peers_ready,
                    height_lag(snapshot.max_peer_height, snapshot.height)
                ));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }))
    } else {
        None
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received; stopping sync");
            let _ = stop_tx.send(true);
        }
    });

    let io = SyncIo {
        network_events: network_events_rx,
        network_commands: network_commands_tx,
        processor_requests: processor_requests_tx,
        processor_events: processor_events_rx,
    };

    let sync_started = Instant::now();
    let outcome = run_fast_sync(
        config.sync_params(),
        start,
        io,
        Some(Arc::clone(&progress)),
        Some(stop_rx),
    )
    .await?;
    let elapsed = sync_started.elapsed();

    if let Some(task) = bar_task {
        task.abort();
    }

    let snapshot = progress.snapshot();
    match outcome {
        SyncOutcome::Completed { reason, height } => {
            let blocks = snapshot.received;
            info!(
                height,
                reason = %reason,
                blocks,
                blocks_per_sec = ?rate_per_sec(blocks, elapsed),
                elapsed_ms = elapsed.as_millis() as u64,
                "sync complete"
            );
            Ok(())
        }
        SyncOutcome::Aborted { reason } => {
            warn!(
                reason = %reason,
                height = snapshot.height,
                elapsed_ms = elapsed.as_millis() as u64,
                "sync aborted"
            );
            eyre::bail!("fast sync aborted: {reason}")
        }
    }
}
