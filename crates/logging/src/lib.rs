//! CircuitCraft Logging
//!
//! Tracing subscriber setup shared by the binaries and tests. `RUST_LOG`
//! overrides the default filter when set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used with `--verbose`
pub const VERBOSE_FILTER: &str = "info,circuitcraft=debug";

/// Filter used otherwise
pub const DEFAULT_FILTER: &str = "info";

/// Build the filter: `RUST_LOG` if set, else the verbosity default
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    })
}

/// Install the global subscriber. Panics if one is already installed.
pub fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(env_filter(verbose))
        .init();
}

/// Like [`init_logging`], but returns an error instead of panicking when a
/// subscriber already exists
pub fn try_init(verbose: bool) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose).with_test_writer())
        .with(env_filter(verbose))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_twice() {
        let _ = try_init(true);
        assert!(try_init(true).is_err());
        tracing::debug!("logging initialised");
    }
}
