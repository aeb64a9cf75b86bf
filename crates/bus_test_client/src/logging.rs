//! Logging system setup.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Args;

/// Initialize structured logging.
///
/// The base level comes from the `--debug` flag; `RUST_LOG` overrides it
/// when set.
pub fn setup_logging(args: &Args) -> Result<()> {
    let level = if args.debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_logging_setup_succeeds() {
        // No other test in this binary installs a global subscriber, so the
        // first installation must succeed.
        let args = Args::default();
        assert!(setup_logging(&args).is_ok());
    }
}
