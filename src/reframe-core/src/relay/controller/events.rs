// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Relay event notification system.
//!
//! Every state transition, relayed frame and error is published as a
//! [`RelayEvent`]. Presentation and logging components subscribe by
//! registering a [`RelayListener`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::channel::{ChannelRole, OpenError, RecvError, SendError};
use crate::frame::Frame;

use super::machine::RelayState;

/// Classification carried by [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    DeviceNotFound,
    Busy,
    PermissionDenied,
    BitrateMismatch,
    BusOff,
    RecoveryExhausted,
    IoError,
    TxOverflow,
}

impl From<&OpenError> for ErrorKind {
    fn from(err: &OpenError) -> Self {
        match err {
            OpenError::DeviceNotFound(_) => Self::DeviceNotFound,
            OpenError::Busy(_) => Self::Busy,
            OpenError::PermissionDenied(_) => Self::PermissionDenied,
            OpenError::BitrateMismatch { .. } => Self::BitrateMismatch,
            OpenError::Io(_) => Self::IoError,
        }
    }
}

impl From<&RecvError> for ErrorKind {
    fn from(err: &RecvError) -> Self {
        match err {
            RecvError::BusOff => Self::BusOff,
            RecvError::Io(_) => Self::IoError,
        }
    }
}

impl From<&SendError> for ErrorKind {
    fn from(err: &SendError) -> Self {
        match err {
            SendError::BusOff => Self::BusOff,
            SendError::BufferFull => Self::TxOverflow,
            SendError::Io(_) => Self::IoError,
        }
    }
}

/// Which way a frame travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RelayPath {
    /// Input to output, with identifier rewriting.
    Forward,
    /// Output back to input, unmodified.
    Return,
}

impl RelayPath {
    /// Channel frames on this path are read from.
    pub fn source(self) -> ChannelRole {
        match self {
            Self::Forward => ChannelRole::Input,
            Self::Return => ChannelRole::Output,
        }
    }

    /// Channel frames on this path are sent to.
    pub fn target(self) -> ChannelRole {
        match self {
            Self::Forward => ChannelRole::Output,
            Self::Return => ChannelRole::Input,
        }
    }
}

impl fmt::Display for RelayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "Forward"),
            Self::Return => write!(f, "Return"),
        }
    }
}

/// A frame seen on one channel. `direction` names the channel: a frame
/// read from it on the way in, or written to it on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameEvent {
    pub direction: ChannelRole,
    pub path: RelayPath,
    pub id: u32,
    pub extended: bool,
    pub dlc: u8,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

impl FrameEvent {
    pub fn from_frame(direction: ChannelRole, frame: &Frame) -> Self {
        Self {
            direction,
            path: RelayPath::Forward,
            id: frame.id(),
            extended: frame.is_extended(),
            dlc: frame.dlc(),
            data: frame.data().to_vec(),
            timestamp_ms: frame.timestamp_ms(),
        }
    }

    pub fn with_path(mut self, path: RelayPath) -> Self {
        self.path = path;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub channel: ChannelRole,
}

/// Everything a relay reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum RelayEvent {
    StateChanged { from: RelayState, to: RelayState },
    Frame(FrameEvent),
    Error(ErrorEvent),
}

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Trait for components that want to receive relay events.
///
/// All methods have default no-op implementations, so listeners can
/// selectively override only the events they care about. Callbacks run on
/// the relay's session task; keep them short.
pub trait RelayListener: Send + Sync {
    /// Called when the relay state machine transitions.
    fn on_state_change(&self, _from: RelayState, _to: RelayState) {}

    /// Called for each frame read from one channel and each frame sent to
    /// the other.
    fn on_frame(&self, _event: &FrameEvent) {}

    /// Called when a channel reports an error.
    fn on_error(&self, _event: &ErrorEvent) {}
}

/// Manages registered listeners and dispatches events.
pub struct RelayEventEmitter {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn RelayListener>)>>,
}

impl Default for RelayEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayEventEmitter {
    /// Create a new event emitter with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener to receive events.
    /// Returns an ID that can be used to unregister the listener.
    pub fn register(&self, listener: Arc<dyn RelayListener>) -> ListenerId {
        let id = ListenerId::new();
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((id, listener)),
            Err(_) => warn!("relay listener registry poisoned; listener dropped"),
        }
        id
    }

    /// Unregister a listener by its ID.
    pub fn unregister(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|(lid, _)| *lid != id);
        }
    }

    /// Get the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver an event to every listener, in registration order.
    pub fn emit(&self, event: &RelayEvent) {
        let Ok(listeners) = self.listeners.read() else {
            return;
        };
        for (_, listener) in listeners.iter() {
            match event {
                RelayEvent::StateChanged { from, to } => listener.on_state_change(*from, *to),
                RelayEvent::Frame(frame) => listener.on_frame(frame),
                RelayEvent::Error(error) => listener.on_error(error),
            }
        }
    }

    pub fn notify_state_change(&self, from: RelayState, to: RelayState) {
        self.emit(&RelayEvent::StateChanged { from, to });
    }

    pub fn notify_frame(&self, event: FrameEvent) {
        self.emit(&RelayEvent::Frame(event));
    }

    pub fn notify_error(&self, kind: ErrorKind, channel: ChannelRole, message: impl Into<String>) {
        self.emit(&RelayEvent::Error(ErrorEvent {
            kind,
            message: message.into(),
            channel,
        }));
    }
}

/// Forwards relay events into a broadcast channel for async consumers.
pub struct BroadcastListener {
    tx: broadcast::Sender<RelayEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    fn forward(&self, event: RelayEvent) {
        // No receivers is fine; lagging receivers see RecvError::Lagged.
        let _ = self.tx.send(event);
    }
}

impl RelayListener for BroadcastListener {
    fn on_state_change(&self, from: RelayState, to: RelayState) {
        self.forward(RelayEvent::StateChanged { from, to });
    }

    fn on_frame(&self, event: &FrameEvent) {
        self.forward(RelayEvent::Frame(event.clone()));
    }

    fn on_error(&self, event: &ErrorEvent) {
        self.forward(RelayEvent::Error(event.clone()));
    }
}
