//! Sync orchestration.

pub mod fastsync;

pub use fastsync::{run_fast_sync, SyncIo, SyncOutcome, SyncParams, SyncProgress};
