// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for reframe-server.
//!
//! Reads the `[reframe-server]` section of `can-reframe.toml`, searched in:
//! 1. Path given with `--config`
//! 2. `./can-reframe.toml`
//! 3. `~/.config/can-reframe/can-reframe.toml`
//! 4. `/etc/can-reframe/can-reframe.toml`

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use reframe_app::{parse_level, ConfigFile};
use reframe_core::relay::controller::{
    ExponentialBackoff, FixedDelay, RecoveryPolicy, TxThrottle, DEFAULT_MAX_RETRIES,
};
use reframe_core::{
    ChannelConfig, ChannelId, RelaySettings, RewriteTable, RuleError, DEFAULT_BITRATE,
};
use reframe_frame_log::FrameLogConfig;

/// Top-level server configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Channel frames are read from
    pub input: ChannelSection,
    /// Channel frames are retransmitted on
    pub output: ChannelSection,
    /// Bus-off recovery
    pub recovery: RecoveryConfig,
    /// Session loop tuning
    pub relay: RelayConfig,
    /// Transmit backpressure handling
    pub throttle: ThrottleConfig,
    /// CSV frame logging
    pub frame_log: FrameLogConfig,
    /// Identifier rewrite rules, in display order
    pub rules: Vec<RuleConfig>,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

/// One bus endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Driver interface (e.g. "virtual", "socketcan")
    pub interface: String,
    /// Driver-specific channel name (e.g. "vcan0", "can0")
    pub channel: String,
    /// Bitrate in bits per second
    pub bitrate: u32,
}

impl ChannelSection {
    fn new(interface: &str, channel: &str) -> Self {
        Self {
            interface: interface.to_string(),
            channel: channel.to_string(),
            bitrate: DEFAULT_BITRATE,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId::new(self.interface.trim(), self.channel.trim())
    }

    pub fn to_channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.channel_id()).with_bitrate(self.bitrate)
    }
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self::new("virtual", "vcan0")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every attempt
    #[default]
    Fixed,
    /// Delay doubles per attempt up to `max_delay_ms`
    Exponential,
}

/// Bus-off recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reopen channels after bus-off; when false bus-off ends the session
    pub retry_on_bus_off: bool,
    /// Reopen attempts per channel before giving up
    pub max_retries: u32,
    /// Delay before a reopen attempt (ms)
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Upper bound for exponential backoff (ms)
    pub max_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_on_bus_off: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: 5_000,
            backoff: BackoffKind::Fixed,
            max_delay_ms: 60_000,
        }
    }
}

impl RecoveryConfig {
    pub fn policy(&self) -> Arc<dyn RecoveryPolicy> {
        let delay = Duration::from_millis(self.retry_delay_ms);
        match self.backoff {
            BackoffKind::Fixed => Arc::new(FixedDelay::new(self.max_retries, delay)),
            BackoffKind::Exponential => Arc::new(ExponentialBackoff::new(
                self.max_retries,
                delay,
                Duration::from_millis(self.max_delay_ms),
            )),
        }
    }
}

/// Session loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Receive timeout (ms); bounds stop latency
    pub receive_timeout_ms: u64,
    /// Pass frames from the output bus back to the input bus, unmodified
    pub return_path: bool,
    /// Receive timeout (ms) for the output bus poll
    pub return_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 100,
            return_path: true,
            return_timeout_ms: 10,
        }
    }
}

/// Transmit throttling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Send attempts per frame while the transmit buffer is full
    pub max_send_retries: u32,
    /// First backoff delay (ms), doubled per attempt
    pub send_retry_initial_delay_ms: u64,
    /// Minimum spacing between sends (ms)
    pub tx_min_gap_ms: u64,
    /// Pause after dropping a frame (ms)
    pub tx_overflow_cooldown_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_send_retries: 10,
            send_retry_initial_delay_ms: 10,
            tx_min_gap_ms: 0,
            tx_overflow_cooldown_ms: 50,
        }
    }
}

impl ThrottleConfig {
    pub fn to_throttle(&self) -> TxThrottle {
        TxThrottle::new(
            self.max_send_retries,
            Duration::from_millis(self.send_retry_initial_delay_ms),
            Duration::from_millis(self.tx_min_gap_ms),
            Duration::from_millis(self.tx_overflow_cooldown_ms),
        )
    }
}

/// A rewrite rule as hexadecimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub original: String,
    pub rewritten: String,
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        "reframe-server"
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;
        validate_channel("input", &self.input)?;
        validate_channel("output", &self.output)?;

        if self.input.channel_id().same_device(&self.output.channel_id()) {
            return Err(format!(
                "[input] and [output] must use different channels (both are {})",
                self.input.channel_id()
            ));
        }
        if self.relay.receive_timeout_ms == 0 {
            return Err("[relay].receive_timeout_ms must be > 0".to_string());
        }
        if self.relay.return_path && self.relay.return_timeout_ms == 0 {
            return Err("[relay].return_timeout_ms must be > 0".to_string());
        }
        if self.recovery.backoff == BackoffKind::Exponential
            && self.recovery.max_delay_ms < self.recovery.retry_delay_ms
        {
            return Err("[recovery].max_delay_ms must be >= retry_delay_ms".to_string());
        }
        if self.throttle.max_send_retries == 0 {
            return Err("[throttle].max_send_retries must be > 0".to_string());
        }

        self.rewrite_table()
            .map_err(|e| format!("[[rules]]: {}", e))?;
        Ok(())
    }

    /// Parse the configured rules into a lookup table.
    pub fn rewrite_table(&self) -> Result<RewriteTable, RuleError> {
        let rows: Vec<(&str, &str)> = self
            .rules
            .iter()
            .map(|rule| (rule.original.as_str(), rule.rewritten.as_str()))
            .collect();
        RewriteTable::parse_hex_rows(&rows)
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            receive_timeout: Duration::from_millis(self.relay.receive_timeout_ms),
            return_path: self.relay.return_path,
            return_timeout: Duration::from_millis(self.relay.return_timeout_ms),
            retry_on_bus_off: self.recovery.retry_on_bus_off,
            recovery: self.recovery.policy(),
            tx: self.throttle.to_throttle(),
        }
    }

    /// Generate an example configuration wrapped under the
    /// `[reframe-server]` section header, suitable for `can-reframe.toml`.
    pub fn example_combined_toml() -> String {
        #[derive(serde::Serialize)]
        struct Wrapper {
            #[serde(rename = "reframe-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
            },
            input: ChannelSection::new("socketcan", "can0"),
            output: ChannelSection::new("socketcan", "can1"),
            rules: vec![RuleConfig {
                original: "0x100".to_string(),
                rewritten: "0x200".to_string(),
            }],
            ..ServerConfig::default()
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            input: ChannelSection::new("virtual", "vcan0"),
            output: ChannelSection::new("virtual", "vcan1"),
            recovery: RecoveryConfig::default(),
            relay: RelayConfig::default(),
            throttle: ThrottleConfig::default(),
            frame_log: FrameLogConfig::default(),
            rules: Vec::new(),
        }
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    match level {
        Some(level) if parse_level(level).is_none() => Err(format!(
            "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
            level
        )),
        _ => Ok(()),
    }
}

fn validate_channel(name: &str, section: &ChannelSection) -> Result<(), String> {
    if section.interface.trim().is_empty() {
        return Err(format!("[{}].interface must not be empty", name));
    }
    if section.channel.trim().is_empty() {
        return Err(format!("[{}].channel must not be empty", name));
    }
    if section.bitrate == 0 {
        return Err(format!("[{}].bitrate must be > 0", name));
    }
    Ok(())
}
