// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Bus endpoint abstraction.
//!
//! A [`ChannelDriver`] opens [`ChannelConnection`]s from a
//! [`ChannelConfig`]. Bus-off is reported as its own error variant on both
//! receive and send so that recovery logic can branch on it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Frame;

/// Default bus bitrate in bits per second.
pub const DEFAULT_BITRATE: u32 = 250_000;

pub type OpenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn ChannelConnection>, OpenError>> + Send + 'a>>;
pub type RecvFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Frame>, RecvError>> + Send + 'a>>;
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SendError>> + Send + 'a>>;

/// Which side of the relay a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    Input,
    Output,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "Input"),
            Self::Output => write!(f, "Output"),
        }
    }
}

/// Driver interface plus driver-specific channel name, e.g. `virtual:vcan0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub interface: String,
    pub channel: String,
}

/// Normalize an interface name to lowercase alphanumeric, so `SocketCAN`,
/// `socket-can` and `socketcan` select the same driver.
pub fn normalize_interface(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

impl ChannelId {
    pub fn new(interface: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            channel: channel.into(),
        }
    }

    /// The id drivers route on: normalized interface, trimmed channel.
    pub fn normalized(&self) -> ChannelId {
        ChannelId::new(normalize_interface(&self.interface), self.channel.trim())
    }

    /// Whether both ids reach the same device.
    pub fn same_device(&self, other: &ChannelId) -> bool {
        self.normalized() == other.normalized()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interface, self.channel)
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (interface, channel) = s
            .split_once(':')
            .ok_or_else(|| format!("channel '{}' must be '<interface>:<channel>'", s))?;
        let (interface, channel) = (interface.trim(), channel.trim());
        if interface.is_empty() || channel.is_empty() {
            return Err(format!("channel '{}' must be '<interface>:<channel>'", s));
        }
        Ok(Self::new(interface, channel))
    }
}

/// A discoverable channel as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub display_name: String,
}

/// Settings for opening one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    pub bitrate: u32,
}

impl ChannelConfig {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            bitrate: DEFAULT_BITRATE,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }
}

/// Rejected channel selection; raised before anything is opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("input and output must use different channels (both are {0})")]
    SameChannel(ChannelId),
    #[error("{role} bitrate must be a positive number of bits per second")]
    InvalidBitrate { role: ChannelRole },
}

/// Check an input/output pair before a session starts.
pub fn validate_pair(input: &ChannelConfig, output: &ChannelConfig) -> Result<(), ConfigError> {
    if input.bitrate == 0 {
        return Err(ConfigError::InvalidBitrate {
            role: ChannelRole::Input,
        });
    }
    if output.bitrate == 0 {
        return Err(ConfigError::InvalidBitrate {
            role: ChannelRole::Output,
        });
    }
    if input.channel_id.same_device(&output.channel_id) {
        return Err(ConfigError::SameChannel(input.channel_id.clone()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("bitrate mismatch: requested {requested} bit/s, device runs at {actual} bit/s")]
    BitrateMismatch { requested: u32, actual: u32 },
    #[error("open failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("bus off")]
    BusOff,
    #[error("receive failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("bus off")]
    BusOff,
    #[error("transmit buffer full")]
    BufferFull,
    #[error("send failed: {0}")]
    Io(String),
}

/// An open endpoint, exclusively owned by whoever opened it.
pub trait ChannelConnection: Send {
    fn channel_id(&self) -> &ChannelId;

    /// Wait up to `timeout` for a frame. `Ok(None)` means nothing arrived.
    fn receive<'a>(&'a mut self, timeout: Duration) -> RecvFuture<'a>;

    fn send<'a>(&'a mut self, frame: &'a Frame) -> SendFuture<'a>;

    /// Release the underlying handle. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens connections for one or more interfaces.
pub trait ChannelDriver: Send + Sync {
    fn open<'a>(&'a self, config: &'a ChannelConfig) -> OpenFuture<'a>;

    /// Channels this driver can currently reach.
    fn discover(&self) -> Vec<ChannelInfo> {
        Vec::new()
    }
}
