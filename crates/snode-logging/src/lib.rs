//! Logging setup for snode binaries and tests.
//!
//! Filtering follows `RUST_LOG` when set, otherwise the directives passed
//! to [`init`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "snode=info,snode_consensus=info";

fn filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

/// Install the global subscriber.
///
/// Returns an error if a subscriber was already installed.
pub fn init(default_directives: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_directives))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}

/// Install a subscriber writing through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(filter("snode_consensus=debug"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_is_tolerated() {
        init_for_tests();
        init_for_tests();
        assert!(init(DEFAULT_DIRECTIVES).is_err());
        tracing::info!("logging ready");
    }
}
