//! Tracing/logging initialization.
//!
//! Verbosity follows the worker config (`0` error .. `3` debug). `RUST_LOG`
//! wins over the configured level when set.

use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub verbose: u8,
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            verbose: 2,
            json: false,
        }
    }
}

/// Map a verbosity number to a level; out-of-range values mean info.
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::INFO,
    }
}

fn filter(options: &LogOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(level_for_verbosity(options.verbose).as_str().to_ascii_lowercase())
    })
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(options: &LogOptions) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(options))
        .with_file(true)
        .with_line_number(true);

    if options.json {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
            .is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for_verbosity(0), Level::ERROR);
        assert_eq!(level_for_verbosity(1), Level::WARN);
        assert_eq!(level_for_verbosity(2), Level::INFO);
        assert_eq!(level_for_verbosity(3), Level::DEBUG);
        assert_eq!(level_for_verbosity(9), Level::INFO);
    }

    #[test]
    fn second_init_is_a_noop() {
        let opts = LogOptions {
            verbose: 3,
            json: true,
        };
        init(&opts);
        assert!(!init(&opts));
    }
}
