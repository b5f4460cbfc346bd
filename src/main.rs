use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use tracing::{error, info, warn};

use portal_mux::config::RelayConfig;
use portal_mux::core::envelope::{EnvelopeCodec, SharedSecret};
use portal_mux::error::{PortalError, Result};
use portal_mux::mux::directory::MemoryDirectory;
use portal_mux::mux::Multiplexer;
use portal_mux::utils::logging::init_logging;
use portal_mux::utils::metrics::global_metrics;
use portal_mux::utils::{SerialRegistry, SerialSnapshot};

/// Length of a generated secret before base64 encoding
const GENERATED_SECRET_LEN: usize = 24;

#[derive(Parser)]
#[command(name = "portal-mux", version, about = "Signed pub/sub relay for named portals")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", RelayConfig::example_config());
        return;
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "Relay failed");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    config.apply_env_overrides();
    config.validate_strict()?;
    Ok(config)
}

/// Random printable secret, used when none is configured
fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; GENERATED_SECRET_LEN];
    getrandom::fill(&mut bytes)
        .map_err(|e| PortalError::ConfigError(format!("Failed to generate secret: {e}")))?;
    Ok(STANDARD.encode(bytes))
}

fn restore_serials(registry: &SerialRegistry, path: &str) {
    if !Path::new(path).exists() {
        return;
    }
    match SerialSnapshot::load_from_file(path).and_then(|s| registry.restore(&s)) {
        Ok(()) => info!(path, active = registry.active_count(), "Serial state restored"),
        Err(e) => warn!(path, error = %e, "Ignoring unreadable serial state"),
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let secret = match &config.security.secret {
        Some(secret) => SharedSecret::from(secret.as_str()),
        None => {
            warn!("No shared secret configured; generated a random one. Other relays will reject this relay's envelopes.");
            SharedSecret::from(generate_secret()?.as_str())
        }
    };

    let registry = Arc::new(SerialRegistry::new(config.security.max_serial_lifetime));
    if let Some(path) = &config.security.serial_state_path {
        restore_serials(&registry, path);
    }
    let sweeper = registry.spawn_sweeper(config.security.sweep_interval);

    let directory = MemoryDirectory::new(tokio::runtime::Handle::current(), &config.channels);
    let mux = Arc::new(Multiplexer::new(
        directory.clone(),
        EnvelopeCodec::new(secret, Arc::clone(&registry)),
    ));
    directory.attach(&mux);

    let server = portal_mux::transport::spawn(&config.server, Arc::clone(&mux))?;
    info!(
        name = %config.server.name,
        text = %server.text_addr(),
        binary = ?server.binary_addr(),
        channels = directory.names().len(),
        "Relay started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received CTRL+C signal, shutting down");

    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .map_err(|e| PortalError::ConfigError(format!("Shutdown task failed: {e}")))??;
    sweeper.abort();

    if let Some(path) = &config.security.serial_state_path {
        registry.snapshot()?.save_to_file(path)?;
        info!(path = %path, "Serial state saved");
    }

    global_metrics().log_metrics();
    Ok(())
}
