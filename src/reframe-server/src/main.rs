// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod events;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info};

use reframe_app::{init_logging, split_assignment, ConfigFile};
use reframe_backend::{register_builtin_drivers_on, DriverRegistry, VirtualBus};
use reframe_core::relay::controller::RelayState;
use reframe_core::{ChannelId, DynResult, Relay};
use reframe_frame_log::FrameLogger;

use config::{RuleConfig, ServerConfig};
use events::{JsonEventPrinter, LogListener};

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - CAN frame relay daemon");

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Input channel as <interface>:<channel> (e.g. socketcan:can0)
    #[arg(short = 'i', long = "input")]
    input: Option<ChannelId>,
    /// Output channel as <interface>:<channel>
    #[arg(short = 'o', long = "output")]
    output: Option<ChannelId>,
    /// Bitrate for both channels (bit/s)
    #[arg(short = 'b', long = "bitrate")]
    bitrate: Option<u32>,
    /// Rewrite rule in hex, repeatable (e.g. --rule 100=200)
    #[arg(short = 'r', long = "rule", value_name = "ORIG=NEW")]
    rules: Vec<String>,
    /// List reachable channels and exit
    #[arg(long = "list-channels")]
    list_channels: bool,
    /// Print relay events to stdout as JSON lines
    #[arg(long = "json-events")]
    json_events: bool,
}

/// Fold command-line overrides into the loaded configuration.
fn apply_cli_overrides(cli: &Cli, cfg: &mut ServerConfig) -> DynResult<()> {
    if let Some(id) = &cli.input {
        cfg.input.interface = id.interface.clone();
        cfg.input.channel = id.channel.clone();
    }
    if let Some(id) = &cli.output {
        cfg.output.interface = id.interface.clone();
        cfg.output.channel = id.channel.clone();
    }
    if let Some(bitrate) = cli.bitrate {
        cfg.input.bitrate = bitrate;
        cfg.output.bitrate = bitrate;
    }
    for rule in &cli.rules {
        let (original, rewritten) = split_assignment(rule)
            .ok_or_else(|| format!("Rule '{}' must be '<original>=<rewritten>'", rule))?;
        cfg.rules.push(RuleConfig {
            original: original.to_string(),
            rewritten: rewritten.to_string(),
        });
    }
    Ok(())
}

fn check_interfaces(cfg: &ServerConfig, registry: &DriverRegistry) -> DynResult<()> {
    for section in [&cfg.input, &cfg.output] {
        if !registry.is_driver_registered(&section.interface) {
            return Err(format!(
                "Unknown interface: {} (available: {})",
                section.interface,
                registry.registered_drivers().join(", ")
            )
            .into());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (mut cfg, config_path) = ServerConfig::resolve(cli.config.as_deref())?;
    apply_cli_overrides(&cli, &mut cfg)?;
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(cfg.general.log_level.as_deref());

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let bus = VirtualBus::new();
    let mut registry = DriverRegistry::new();
    register_builtin_drivers_on(&mut registry, &bus);

    if cli.list_channels {
        for channel in registry.list_channels() {
            println!("{}\t{}", channel.channel_id, channel.display_name);
        }
        return Ok(());
    }

    check_interfaces(&cfg, &registry)?;
    let rules = cfg.rewrite_table()?;
    let input = cfg.input.to_channel_config();
    let output = cfg.output.to_channel_config();

    info!(
        "Starting reframe-server ({} @ {} bit/s -> {} @ {} bit/s, {} rules)",
        input.channel_id,
        input.bitrate,
        output.channel_id,
        output.bitrate,
        rules.len()
    );

    let relay = Relay::new(Arc::new(registry), cfg.relay_settings());
    debug!("Relay settings: {:?}", relay.settings());
    relay.subscribe(Arc::new(LogListener));
    if cli.json_events {
        relay.subscribe(Arc::new(JsonEventPrinter));
    }
    if let Some(logger) = FrameLogger::from_config(&cfg.frame_log)? {
        if let Some(path) = logger.current_path() {
            info!("Logging frames to {}", path.display());
        }
        relay.subscribe(logger);
    }

    relay.start(input, output, rules).await?;

    let mut state_rx = relay.subscribe_state();
    let failed = tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Ctrl+C received, shutting down");
            false
        }
        _ = state_rx.wait_for(|state| *state == RelayState::Error) => true,
    };

    relay.stop().await;
    if failed {
        error!("Relay session ended with an error");
        return Err("relay session failed".into());
    }
    Ok(())
}
