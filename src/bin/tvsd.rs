//! TVS daemon: trust verification for IP phones.
//!
//! Usage: `tvsd [config-file]`, defaulting to `tvsd.toml`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use phonecert::configs::TvsConfig;
use phonecert::listener::{self, ListenerSettings};
use phonecert::logging;
use phonecert::tvs_session::{handle_connection, TvsContext};

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "tvsd.toml".to_string());
    let config = TvsConfig::from_file(Path::new(&config_path))
        .with_context(|| format!("loading {}", config_path))?;

    let _log_guard = logging::init(config.log_directory.as_deref(), "tvsd")
        .context("failed to initialize logging")?;

    listener::install_signal_handlers()?;

    let ctx = Arc::new(TvsContext::new(&config));
    info!(
        port = config.port,
        database = %config.database.display(),
        "starting TVS daemon"
    );

    let settings = ListenerSettings {
        port: config.port,
        timeout: std::time::Duration::from_secs(config.timeout_secs),
        server_certificate: config.server_certificate.clone(),
        concurrent_clients: config.concurrent_clients,
    };
    listener::serve(&settings, move |tls_stream, peer| {
        handle_connection(&ctx, tls_stream, &peer.to_string());
    })?;

    info!("TVS daemon stopped");
    Ok(())
}
