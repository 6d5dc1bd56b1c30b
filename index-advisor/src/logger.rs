use tracing_subscriber::EnvFilter;

use crate::opt::AdvisorOpt;

/// Installs the global logger. `RUST_LOG` wins when set; otherwise the level
/// follows the debug flag.
pub fn init(opt: &AdvisorOpt) {
    let default_level = if opt.debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
