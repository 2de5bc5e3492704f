//! Logging setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `default_directive` (e.g. `"genai_session=info"`)
/// is used. Returns `false` if a subscriber was already installed.
pub fn init_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        init_logging("genai_session=debug");
        assert!(!init_logging("genai_session=debug"));
    }
}
