//! Scenario soak runner for the fast-sync scheduler.
//!
//! Runs each scenario against the in-process fleet, checks the terminal
//! reason, and appends one JSONL record per run to `output/`.

use eyre::Result;
use fastsync_node::chain::{devnet_chain, SyncedState};
use fastsync_node::p2p::sim::{spawn_sim_network, PeerScript, SimNetworkHandle, SimPeerSpec};
use fastsync_node::p2p::PeerId;
use fastsync_node::processor::run_processor;
use fastsync_node::sync::fastsync::{FinishReason, SchedulerConfig};
use fastsync_node::sync::{run_fast_sync, SyncIo, SyncOutcome, SyncParams, SyncProgress};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct ScenarioRecord {
    scenario: &'static str,
    outcome: &'static str,
    reason: String,
    expected_reason: String,
    passed: bool,
    height: i64,
    tip: i64,
    requested: u64,
    received: u64,
    elapsed_ms: u64,
}

struct Scenario {
    name: &'static str,
    tip: i64,
    specs: Vec<SimPeerSpec>,
    params: SyncParams,
    expect: FinishReason,
    /// Optional mid-run churn, driven against the fleet handle.
    churn: Option<Churn>,
}

struct Churn {
    after: Duration,
    drop_peers: Vec<&'static str>,
    add_peers: Vec<SimPeerSpec>,
}

fn soak_params() -> SyncParams {
    SyncParams {
        scheduler: SchedulerConfig {
            sync_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_millis(500),
            min_recv_rate: 0,
            target_pending: 20,
        },
        schedule_tick: Duration::from_millis(2),
        prune_tick: Duration::from_millis(100),
    }
}

fn peer(name: &str, tip: i64, latency_ms: u64) -> SimPeerSpec {
    let mut spec = SimPeerSpec::honest(name, 1, tip, Duration::from_millis(latency_ms));
    spec.status_interval = Duration::from_millis(100);
    spec
}

fn scenarios(tip: i64) -> Vec<Scenario> {
    vec![
        Scenario {
            name: "honest_fleet",
            tip,
            specs: (0..6u64)
                .map(|i| peer(&format!("peer-{i}"), tip, 3 + i * 4))
                .collect(),
            params: soak_params(),
            expect: FinishReason::AllBlocksProcessed,
            churn: None,
        },
        Scenario {
            name: "stalled_peer",
            tip,
            specs: vec![
                peer("peer-0", tip, 3).with_script(PeerScript::Stalled),
                peer("peer-1", tip, 6),
                peer("peer-2", tip, 9),
                peer("peer-3", tip, 12),
            ],
            params: soak_params(),
            expect: FinishReason::AllBlocksProcessed,
            churn: None,
        },
        Scenario {
            name: "corrupt_provider",
            tip,
            specs: vec![
                peer("peer-0", tip, 3).with_script(PeerScript::CorruptAt { height: tip / 2 }),
                peer("peer-1", tip, 6),
                peer("peer-2", tip, 9),
                peer("peer-3", tip, 12),
                peer("peer-4", tip, 15),
            ],
            params: soak_params(),
            expect: FinishReason::AllBlocksProcessed,
            churn: None,
        },
        Scenario {
            name: "false_no_block_claim",
            tip,
            specs: vec![
                peer("peer-0", tip, 3).with_script(PeerScript::ClaimsNoBlockAt { height: 7 }),
                peer("peer-1", tip, 6),
                peer("peer-2", tip, 9),
            ],
            params: soak_params(),
            expect: FinishReason::AllBlocksProcessed,
            churn: None,
        },
        Scenario {
            name: "peer_churn",
            tip,
            specs: vec![
                peer("peer-0", tip, 3),
                peer("peer-1", tip, 6),
                peer("peer-2", tip, 9),
            ],
            params: soak_params(),
            expect: FinishReason::AllBlocksProcessed,
            churn: Some(Churn {
                after: Duration::from_millis(150),
                drop_peers: vec!["peer-0", "peer-1"],
                add_peers: vec![peer("peer-3", tip, 5), peer("peer-4", tip, 8)],
            }),
        },
        Scenario {
            name: "empty_fleet_times_out",
            tip,
            specs: Vec::new(),
            params: SyncParams {
                scheduler: SchedulerConfig {
                    sync_timeout: Duration::from_millis(500),
                    ..soak_params().scheduler
                },
                ..soak_params()
            },
            expect: FinishReason::IdleTimeout,
            churn: None,
        },
    ]
}

async fn run_scenario(scenario: &Scenario) -> Result<ScenarioRecord> {
    let chain = Arc::new(devnet_chain(scenario.tip, 7));
    let start = SyncedState {
        initial_height: 1,
        last_block_height: 0,
    };

    let (network_events_tx, network_events_rx) = mpsc::channel(512);
    let (network_commands_tx, network_commands_rx) = mpsc::channel(512);
    let (processor_requests_tx, processor_requests_rx) = mpsc::channel(128);
    let (processor_events_tx, processor_events_rx) = mpsc::channel(128);

    let fleet: SimNetworkHandle = spawn_sim_network(
        chain,
        scenario.specs.clone(),
        network_events_tx,
        network_commands_rx,
    );
    tokio::spawn(run_processor(
        start.start_height(),
        None,
        processor_requests_rx,
        processor_events_tx,
    ));

    if let Some(churn) = &scenario.churn {
        let after = churn.after;
        let drops: Vec<PeerId> = churn.drop_peers.iter().map(|id| (*id).into()).collect();
        let adds = churn.add_peers.clone();
        let fleet = fleet.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            for peer in drops {
                fleet.disconnect(peer);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            for spec in adds {
                fleet.connect(spec);
            }
        });
    }

    let io = SyncIo {
        network_events: network_events_rx,
        network_commands: network_commands_tx,
        processor_requests: processor_requests_tx,
        processor_events: processor_events_rx,
    };
    let progress = Arc::new(SyncProgress::default());

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(120),
        run_fast_sync(
            scenario.params.clone(),
            start,
            io,
            Some(Arc::clone(&progress)),
            None,
        ),
    )
    .await
    .map_err(|_| eyre::eyre!("scenario {} did not terminate", scenario.name))??;
    let elapsed = started.elapsed();

    let snapshot = progress.snapshot();
    let record = match outcome {
        SyncOutcome::Completed { reason, height } => ScenarioRecord {
            scenario: scenario.name,
            outcome: "completed",
            reason: reason.to_string(),
            expected_reason: scenario.expect.to_string(),
            passed: reason == scenario.expect
                && (reason != FinishReason::AllBlocksProcessed || height == scenario.tip),
            height,
            tip: scenario.tip,
            requested: snapshot.requested,
            received: snapshot.received,
            elapsed_ms: elapsed.as_millis() as u64,
        },
        SyncOutcome::Aborted { reason } => ScenarioRecord {
            scenario: scenario.name,
            outcome: "aborted",
            reason,
            expected_reason: scenario.expect.to_string(),
            passed: false,
            height: snapshot.height,
            tip: scenario.tip,
            requested: snapshot.requested,
            received: snapshot.received,
            elapsed_ms: elapsed.as_millis() as u64,
        },
    };
    Ok(record)
}

fn parse_tip() -> i64 {
    std::env::var("FASTSYNC_HARNESS_TIP")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(300)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let tip = parse_tip();
    let out_dir = PathBuf::from("output");
    fs::create_dir_all(&out_dir)?;
    let run_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_secs();
    let out_path = out_dir.join(format!("soak-{run_id}.jsonl"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&out_path)?;
    let mut writer = BufWriter::new(file);

    let mut failures = 0usize;
    for scenario in scenarios(tip) {
        let name = scenario.name;
        info!(scenario = name, tip, "running scenario");
        let record = run_scenario(&scenario).await?;
        if record.passed {
            info!(
                scenario = name,
                reason = %record.reason,
                elapsed_ms = record.elapsed_ms,
                "scenario passed"
            );
        } else {
            warn!(
                scenario = name,
                outcome = record.outcome,
                reason = %record.reason,
                expected = %record.expected_reason,
                "scenario FAILED"
            );
            failures += 1;
        }
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    println!("soak results written to {}", out_path.display());
    if failures > 0 {
        eyre::bail!("{failures} scenario(s) failed");
    }
    Ok(())
}
