// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber for the process.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects between `info` and
/// `debug` for this crate. Does nothing if a global subscriber already exists.
pub fn init(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .try_init();
}

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

fn default_directive(debug: bool) -> &'static str {
    if debug { "info,tinywhip=debug" } else { "info" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("tinywhip=debug"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(true);
        init(false);
        tracing::debug!("[Logging] still alive");
    }
}
