//! # canvas-server
//!
//! Bootstrap for the authorization cache: configuration loading, tracing,
//! the Prometheus recorder, [`AuthzRuntime`] and a small admin HTTP surface.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod runtime;
pub mod server;

pub use config::{AppConfig, ConfigError, LoggingConfig, ServerConfig};
pub use observability::{FilterSource, apply_logging_level, init_tracing};
pub use runtime::AuthzRuntime;
pub use server::{AppState, AuthzServer, build_app};
