// src/main.rs

//! `xdisplay-probe`: exercises the registry against the real X server named by
//! `DISPLAY` and prints what it saw as JSON.
//!
//! Walks the whole lifecycle once: bootstrap, open, park, revive, forced
//! shutdown. Useful to check how a given driver stack behaves.

use anyhow::Context;
use log::{info, warn};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use xdisplay_registry::native::xlib::XlibDisplay;
use xdisplay_registry::{BootstrapSequencer, ConnectionRegistry, RegistryConfig};

/// The one registry of this process.
static REGISTRY: OnceCell<ConnectionRegistry> = OnceCell::new();

fn registry() -> anyhow::Result<&'static ConnectionRegistry> {
    REGISTRY.get_or_try_init(|| {
        let config = RegistryConfig::from_env();
        info!("Registry configuration: {:?}", config);
        ConnectionRegistry::bootstrap(
            &BootstrapSequencer::new(),
            Arc::new(XlibDisplay::new()),
            config,
            // Nothing has touched Xlib yet.
            true,
        )
        .context("Failed to bootstrap display registry")
    })
}

fn main() -> anyhow::Result<()> {
    // Initialize the logger. Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting xdisplay-probe...");
    let registry = registry()?;

    let display = registry
        .acquire_connection(None)
        .context("Failed to open the default display")?;
    if let Some(gate) = registry.call_gate(display) {
        gate.with(|| info!("Holding call gate for {} ({:?})", display, gate.mode()))
            .context("Failed to enter the display call gate")?;
    }

    // Park it, then get the same connection back by name.
    registry.mark_uncloseable(display);
    registry
        .release_connection(display)
        .context("Failed to release the default display")?;
    let revived = registry
        .acquire_connection(None)
        .context("Failed to revive the parked display")?;
    if revived != display {
        warn!("Expected parked display {} back, got {}", display, revived);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&registry.snapshot())
            .context("Failed to serialize registry snapshot")?
    );

    registry
        .release_connection(revived)
        .context("Failed to release the revived display")?;
    let unclosed = registry.shutdown(true, true);
    info!("xdisplay-probe finished ({} connection(s) left unclosed).", unclosed);
    Ok(())
}
