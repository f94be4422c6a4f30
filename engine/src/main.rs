//! # coreup Update Engine Daemon
//!
//! Runs periodic update checks against the update server and, when a new
//! payload is offered, downloads it onto the inactive partition slot,
//! verifies it, and runs the post-install finalizer so the next boot tries
//! the new slot.
//!
//! ## Usage
//! ```bash
//! coreup-engine --config /etc/coreup/engine.yaml
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use coreup_engine::cli::Args;
use coreup_engine::{
    CmdlineSlotProber, EngineConfig, ManifestChecker, PostinstFinalizer, UpdateService,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/coreup/engine.yaml";
const OS_RELEASE_PATH: &str = "/usr/lib/os-release";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    coreup_common::logging::init(&args.log_level, args.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting coreup update engine"
    );

    let config = match &args.config {
        Some(config_path) => match EngineConfig::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match EngineConfig::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg
            }
            Err(_) => {
                info!("No config file found, using defaults");
                EngineConfig::default()
            }
        },
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration invalid");
        return Err(e);
    }

    info!(
        server = %config.server_url,
        group = %config.group,
        interval = %config.check_interval,
        "Update engine configured"
    );

    let prober = Arc::new(CmdlineSlotProber::new());
    let checker = Arc::new(ManifestChecker::new(
        config.server_url.clone(),
        config.group.clone(),
        running_version(),
        prober,
    ));
    let finalizer = Arc::new(PostinstFinalizer::new(
        config.postinst_path.clone(),
        config.kernel_name.clone(),
    ));
    let service = Arc::new(UpdateService::new(checker, finalizer));

    if args.once {
        service.attempt_update();
        let settled = service.wait_until_settled().await;
        info!(state = settled.state.as_str(), "Single update attempt finished");
        return Ok(());
    }

    run_check_loop(config, service).await
}

/// Version of the running OS, matched against the server's offer.
fn running_version() -> String {
    let content = std::fs::read_to_string(OS_RELEASE_PATH).unwrap_or_default();
    for line in content.lines() {
        if let Some(version) = line.strip_prefix("VERSION_ID=") {
            return version.trim_matches('"').to_string();
        }
    }
    "0.0.0".to_string()
}

/// Periodic check loop with signal-driven shutdown.
async fn run_check_loop(config: EngineConfig, service: Arc<UpdateService>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut ticker = tokio::time::interval(config.check_interval_duration());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if config.enabled {
                    service.attempt_update();
                } else {
                    info!("Updates disabled by configuration, skipping check");
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    // Let an in-flight attempt wind down cleanly before exiting.
    service.stop_current();
    service.wait_until_settled().await;

    Ok(())
}
