//! vmctl
//!
//! Listens for signed start/restart requests and carries them out with virsh.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmctl_web::config::{Cli, Settings};
use vmctl_web::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_normalized();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let settings = match Settings::resolve(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!("vmctl v{}", vmctl_common::VERSION);
    info!(
        "virsh: {} -c {} (failure detection: {})",
        settings.executor.binary,
        settings.executor.connect_uri,
        settings.executor.failure_detection
    );

    let state = AppState::from_settings(&settings);
    server::serve(settings.listen, Arc::new(state)).await
}
