// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! In-memory virtual bus for development and testing.
//!
//! Channels live in process memory. Frames are injected through the bus
//! handle and read by whichever connection holds the channel; frames sent
//! on a channel are recorded for inspection. Faults (bus-off, open and send
//! errors) can be injected per channel. No hardware required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use reframe_core::channel::{OpenFuture, RecvFuture, SendFuture};
use reframe_core::{
    ChannelConfig, ChannelConnection, ChannelDriver, ChannelId, ChannelInfo, Frame, OpenError,
    RecvError, SendError,
};

/// Interface name the virtual driver is registered under.
pub const VIRTUAL_INTERFACE: &str = "virtual";

struct VirtualChannel {
    /// Fixed bitrate; `None` accepts any requested bitrate.
    bitrate: Option<u32>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    /// Taken by the connection while the channel is open.
    inbound_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    sent: Vec<Frame>,
    bus_off: bool,
    open_error: Option<OpenError>,
    send_error: Option<SendError>,
    opens: usize,
}

impl VirtualChannel {
    fn new(bitrate: Option<u32>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            bitrate,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            sent: Vec::new(),
            bus_off: false,
            open_error: None,
            send_error: None,
            opens: 0,
        }
    }

    fn is_open(&self) -> bool {
        self.inbound_rx.is_none()
    }
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, VirtualChannel>,
}

/// Handle to a shared set of virtual channels. Clones share state.
#[derive(Clone, Default)]
pub struct VirtualBus {
    state: Arc<Mutex<BusState>>,
}

impl VirtualBus {
    /// Bus with the default `vcan0` and `vcan1` channels.
    pub fn new() -> Self {
        Self::with_channels(&["vcan0", "vcan1"])
    }

    pub fn with_channels(names: &[&str]) -> Self {
        let bus = Self::default();
        for name in names {
            bus.add_channel(name);
        }
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a channel that accepts any bitrate. Existing channels are kept.
    pub fn add_channel(&self, name: &str) {
        self.lock()
            .channels
            .entry(name.to_string())
            .or_insert_with(|| VirtualChannel::new(None));
    }

    /// Add a channel running at a fixed bitrate.
    pub fn add_channel_with_bitrate(&self, name: &str, bitrate: u32) {
        self.lock()
            .channels
            .insert(name.to_string(), VirtualChannel::new(Some(bitrate)));
    }

    /// Queue a frame for the connection reading `name`. Returns false for
    /// unknown channels.
    pub fn inject_frame(&self, name: &str, frame: Frame) -> bool {
        match self.lock().channels.get(name) {
            Some(channel) => channel.inbound_tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Frames successfully sent on `name`, oldest first.
    pub fn sent_frames(&self, name: &str) -> Vec<Frame> {
        self.lock()
            .channels
            .get(name)
            .map(|channel| channel.sent.clone())
            .unwrap_or_default()
    }

    /// Put `name` into bus-off. The next receive or send fails with
    /// bus-off; a successful reopen clears it.
    pub fn trigger_bus_off(&self, name: &str) {
        if let Some(channel) = self.lock().channels.get_mut(name) {
            channel.bus_off = true;
        }
    }

    /// Make every open of `name` fail with `error` until cleared with `None`.
    pub fn set_open_error(&self, name: &str, error: Option<OpenError>) {
        if let Some(channel) = self.lock().channels.get_mut(name) {
            channel.open_error = error;
        }
    }

    /// Make every send on `name` fail with `error` until cleared with `None`.
    pub fn set_send_error(&self, name: &str, error: Option<SendError>) {
        if let Some(channel) = self.lock().channels.get_mut(name) {
            channel.send_error = error;
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.lock()
            .channels
            .get(name)
            .is_some_and(VirtualChannel::is_open)
    }

    /// Number of channels currently held by a connection.
    pub fn open_count(&self) -> usize {
        self.lock()
            .channels
            .values()
            .filter(|channel| channel.is_open())
            .count()
    }

    /// Successful opens of `name` so far.
    pub fn opens_of(&self, name: &str) -> usize {
        self.lock()
            .channels
            .get(name)
            .map(|channel| channel.opens)
            .unwrap_or(0)
    }

    /// Successful opens across all channels so far.
    pub fn total_opens(&self) -> usize {
        self.lock().channels.values().map(|c| c.opens).sum()
    }

    fn open_channel(&self, config: &ChannelConfig) -> Result<VirtualConnection, OpenError> {
        let name = config.channel_id.channel.trim();
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(name)
            .ok_or_else(|| OpenError::DeviceNotFound(config.channel_id.to_string()))?;

        if let Some(err) = &channel.open_error {
            return Err(err.clone());
        }
        if let Some(actual) = channel.bitrate {
            if actual != config.bitrate {
                return Err(OpenError::BitrateMismatch {
                    requested: config.bitrate,
                    actual,
                });
            }
        }
        let inbound = channel
            .inbound_rx
            .take()
            .ok_or_else(|| OpenError::Busy(config.channel_id.to_string()))?;

        channel.bus_off = false;
        channel.opens += 1;
        debug!("Opened virtual channel {}", name);
        Ok(VirtualConnection {
            channel_id: ChannelId::new(config.channel_id.interface.clone(), name),
            bus: self.clone(),
            inbound: Some(inbound),
        })
    }
}

impl ChannelDriver for VirtualBus {
    fn open<'a>(&'a self, config: &'a ChannelConfig) -> OpenFuture<'a> {
        Box::pin(async move {
            self.open_channel(config)
                .map(|conn| Box::new(conn) as Box<dyn ChannelConnection>)
        })
    }

    fn discover(&self) -> Vec<ChannelInfo> {
        let mut names: Vec<String> = self.lock().channels.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ChannelInfo {
                display_name: format!("Virtual {}", name),
                channel_id: ChannelId::new(VIRTUAL_INTERFACE, name),
            })
            .collect()
    }
}

/// Exclusive handle to one virtual channel.
pub struct VirtualConnection {
    channel_id: ChannelId,
    bus: VirtualBus,
    inbound: Option<mpsc::UnboundedReceiver<Frame>>,
}

impl VirtualConnection {
    fn is_bus_off(&self) -> bool {
        self.bus
            .lock()
            .channels
            .get(&self.channel_id.channel)
            .is_some_and(|channel| channel.bus_off)
    }
}

impl ChannelConnection for VirtualConnection {
    fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    fn receive<'a>(&'a mut self, timeout: Duration) -> RecvFuture<'a> {
        Box::pin(async move {
            if self.is_bus_off() {
                return Err(RecvError::BusOff);
            }
            let Some(inbound) = self.inbound.as_mut() else {
                return Err(RecvError::Io(format!("{} is closed", self.channel_id)));
            };
            match tokio::time::timeout(timeout, inbound.recv()).await {
                Ok(Some(frame)) => Ok(Some(frame.restamped())),
                Ok(None) => Err(RecvError::Io(format!("{} was removed", self.channel_id))),
                Err(_) if self.is_bus_off() => Err(RecvError::BusOff),
                Err(_) => Ok(None),
            }
        })
    }

    fn send<'a>(&'a mut self, frame: &'a Frame) -> SendFuture<'a> {
        Box::pin(async move {
            if self.inbound.is_none() {
                return Err(SendError::Io(format!("{} is closed", self.channel_id)));
            }
            let mut state = self.bus.lock();
            let channel = state
                .channels
                .get_mut(&self.channel_id.channel)
                .ok_or_else(|| SendError::Io(format!("{} was removed", self.channel_id)))?;
            if channel.bus_off {
                return Err(SendError::BusOff);
            }
            if let Some(err) = &channel.send_error {
                return Err(err.clone());
            }
            channel.sent.push(frame.clone());
            Ok(())
        })
    }

    fn close(&mut self) {
        let Some(inbound) = self.inbound.take() else {
            return;
        };
        if let Some(channel) = self.bus.lock().channels.get_mut(&self.channel_id.channel) {
            channel.inbound_rx = Some(inbound);
        }
        debug!("Closed virtual channel {}", self.channel_id);
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        self.close();
    }
}
