//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise verbosity maps to a global/crate-local
/// directive pair.
pub fn init_tracing(verbosity: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let (global, local) = match verbosity {
                0 => ("warn", "info"),
                1 => ("warn", "debug"),
                2 => ("info", "trace"),
                _ => ("debug", "trace"),
            };
            EnvFilter::new(format!("{global},fastsync_node={local}"))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
