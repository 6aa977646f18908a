//! CLI and config handling.

use crate::sync::fastsync::SchedulerConfig;
use crate::sync::SyncParams;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MIN_RECV_RATE: u64 = 0;
pub const DEFAULT_TARGET_PENDING: usize = 10;
pub const DEFAULT_SCHEDULE_TICK_MS: u64 = 10;
pub const DEFAULT_PRUNE_TICK_MS: u64 = 1000;
pub const DEFAULT_CHAIN_HEIGHT: i64 = 200;
pub const DEFAULT_PEER_COUNT: usize = 4;
pub const DEFAULT_SEED: u64 = 42;

/// Fast-sync node configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "fastsync-node", about = "Fast-sync node v0.1")]
pub struct NodeConfig {
    /// Give up when no block is applied for this many seconds.
    #[arg(long, default_value_t = DEFAULT_SYNC_TIMEOUT_SECS)]
    pub sync_timeout_secs: u64,
    /// Per-request deadline and per-peer silence limit, in seconds.
    #[arg(long, default_value_t = DEFAULT_PEER_TIMEOUT_SECS)]
    pub peer_timeout_secs: u64,
    /// Minimum per-peer delivery rate in bytes/sec; 0 disables rate pruning.
    #[arg(long, default_value_t = DEFAULT_MIN_RECV_RATE)]
    pub min_recv_rate: u64,
    /// Soft cap on block heights tracked at once.
    #[arg(long, default_value_t = DEFAULT_TARGET_PENDING)]
    pub target_pending: usize,
    /// Request-generation tick cadence in milliseconds.
    #[arg(long, default_value_t = DEFAULT_SCHEDULE_TICK_MS)]
    pub schedule_tick_ms: u64,
    /// Prune-sweep cadence in milliseconds.
    #[arg(long, default_value_t = DEFAULT_PRUNE_TICK_MS)]
    pub prune_tick_ms: u64,
    /// Localnet demo: chain tip height to generate and sync.
    #[arg(long, default_value_t = DEFAULT_CHAIN_HEIGHT)]
    pub chain_height: i64,
    /// Localnet demo: number of simulated peers.
    #[arg(long, default_value_t = DEFAULT_PEER_COUNT)]
    pub peers: usize,
    /// Localnet demo: seed for the generated chain and fleet latencies.
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', action = ArgAction::Count)]
    #[serde(default)]
    pub verbosity: u8,
}

impl NodeConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn sync_params(&self) -> SyncParams {
        SyncParams {
            scheduler: SchedulerConfig {
                sync_timeout: Duration::from_secs(self.sync_timeout_secs),
                peer_timeout: Duration::from_secs(self.peer_timeout_secs),
                min_recv_rate: self.min_recv_rate,
                target_pending: self.target_pending.max(1),
            },
            schedule_tick: Duration::from_millis(self.schedule_tick_ms.max(1)),
            prune_tick: Duration::from_millis(self.prune_tick_ms.max(1)),
        }
    }
}
