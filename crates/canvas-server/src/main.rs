use std::sync::Arc;

use canvas_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use canvas_server::{AuthzRuntime, AuthzServer};
use canvas_store::InMemoryResourceStore;
use clap::Parser;

/// Canvas authorization cache service.
#[derive(Debug, Parser)]
#[command(name = "canvas-server", version, about)]
struct Args {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, env = "CANVAS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let filter_source = canvas_server::init_tracing();

    let args = Args::parse();

    let mut cfg = match load_config(Some(&args.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    if let Some(port) = args.port {
        cfg.server.port = port;
    }

    tracing::info!(path = %args.config, "Configuration loaded");
    if !canvas_server::apply_logging_level(&cfg.logging.level) {
        tracing::info!(
            configured = %cfg.logging.level,
            source = ?filter_source,
            "Configured log level not applied"
        );
    }
    canvas_server::metrics::init_metrics();

    // The Resource Store is owned by the host application; standalone runs
    // use the in-memory backend.
    let store = Arc::new(InMemoryResourceStore::new());
    let runtime = Arc::new(AuthzRuntime::start(&cfg, store).await);

    if let Err(err) = AuthzServer::new(&cfg, runtime).run().await {
        eprintln!("Server error: {err}");
        std::process::exit(1);
    }
}
