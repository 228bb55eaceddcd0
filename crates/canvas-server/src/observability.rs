//! Process-wide tracing setup.
//!
//! Logging starts at `info` before configuration is read. Once the config
//! is loaded its `logging.level` is swapped in through a reload layer, unless
//! `RUST_LOG` was set at startup, in which case that filter stays in charge.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

const BOOTSTRAP_LEVEL: &str = "info";

/// Where the active log filter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    /// `RUST_LOG`; the configured level is ignored.
    Environment,
    /// The bootstrap level, replaced by `logging.level` once loaded.
    Configured,
}

struct ReloadableFilter {
    handle: FilterHandle,
    source: FilterSource,
}

static FILTER: OnceLock<ReloadableFilter> = OnceLock::new();

fn env_filter() -> Option<EnvFilter> {
    std::env::var_os(EnvFilter::DEFAULT_ENV)?;
    EnvFilter::try_from_default_env().ok()
}

/// Install the global subscriber. Later calls return the first result.
pub fn init_tracing() -> FilterSource {
    FILTER
        .get_or_init(|| {
            let (filter, source) = match env_filter() {
                Some(filter) => (filter, FilterSource::Environment),
                None => (EnvFilter::new(BOOTSTRAP_LEVEL), FilterSource::Configured),
            };
            let (layer, handle) = reload::Layer::new(filter);
            if tracing_subscriber::registry()
                .with(layer)
                .with(fmt::layer())
                .try_init()
                .is_err()
            {
                eprintln!("Warning: a tracing subscriber was already installed");
            }
            ReloadableFilter { handle, source }
        })
        .source
}

/// Switch to the configured level. Returns false when `RUST_LOG` pins the
/// filter, tracing is not initialized, or `level` does not parse.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(filter) = FILTER.get() else {
        return false;
    };
    if filter.source == FilterSource::Environment {
        return false;
    }
    match EnvFilter::try_new(level) {
        Ok(next) => filter.handle.reload(next).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_applies_unless_env_pins_it() {
        let source = init_tracing();
        assert_eq!(init_tracing(), source);
        assert_eq!(apply_logging_level("debug"), source == FilterSource::Configured);
        assert!(!apply_logging_level("not a [filter"));
    }
}
