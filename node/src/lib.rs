//! Fast-sync node library.
//!
//! Catches a lagging node up to the chain tip: a deterministic scheduler
//! assigns block heights to peers, a driver loop pumps events between the
//! network, the scheduler, and the processor, and prune sweeps evict slow or
//! silent peers.

pub mod chain;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod p2p;
pub mod processor;
pub mod sync;
