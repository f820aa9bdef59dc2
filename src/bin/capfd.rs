//! CAPF daemon: certificate enrollment for IP phones.
//!
//! Usage: `capfd [config-file]`, defaulting to `capfd.toml`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use phonecert::capf_session::{handle_connection, CapfContext};
use phonecert::configs::CapfConfig;
use phonecert::listener::{self, ListenerSettings};
use phonecert::logging;

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "capfd.toml".to_string());
    let config = CapfConfig::from_file(Path::new(&config_path))
        .with_context(|| format!("loading {}", config_path))?;

    let _log_guard = logging::init(config.log_directory.as_deref(), "capfd")
        .context("failed to initialize logging")?;

    listener::install_signal_handlers()?;

    let ctx = Arc::new(CapfContext::new(&config)?);
    info!(
        port = config.port,
        database = %config.database.display(),
        "starting CAPF daemon"
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

    info!("CAPF daemon stopped");
    Ok(())
}
