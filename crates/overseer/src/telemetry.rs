//! Logging setup.
//!
//! `RUST_LOG` always wins. Without it, the filter follows the `debug` and `no_warn` flags.
//! Output goes to stderr so the supervised program keeps stdout to itself.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber if none is set yet.
///
/// Returns `false` when another subscriber was already installed, for example by the host
/// application.
pub fn init(debug: bool, no_warn: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug, no_warn)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

fn default_directives(debug: bool, no_warn: bool) -> &'static str {
    if debug {
        "info,overseer=debug"
    } else if no_warn {
        "error"
    } else {
        "info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_wins_over_no_warn() {
        assert_eq!(default_directives(true, true), "info,overseer=debug");
        assert_eq!(default_directives(false, true), "error");
        assert_eq!(default_directives(false, false), "info");
    }
}
