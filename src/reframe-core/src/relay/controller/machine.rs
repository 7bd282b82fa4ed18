// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Relay state machine for session lifecycle management.
//!
//! Transitions are driven by [`RelayTrigger`]s. Triggers that make no sense
//! in the current state are ignored and leave the state untouched.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a relay session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayState {
    /// No session; both channels closed
    #[default]
    Stopped,
    /// Channels open, waiting for traffic
    Listening,
    /// Frames are flowing
    Receiving,
    /// A channel went bus-off and is being reopened
    Reconnecting,
    /// Session ended on a fatal error; `start()` tries again
    Error,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Listening => write!(f, "Listening"),
            Self::Receiving => write!(f, "Receiving"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl RelayState {
    /// Check if a session loop owns open channels in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Listening | Self::Receiving | Self::Reconnecting)
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTrigger {
    /// Both channels opened
    Started,
    /// Opening a channel at start failed
    OpenFailed,
    /// A frame arrived on the input channel
    FrameReceived,
    /// A receive timed out without a frame
    Idle,
    /// A channel reported bus-off
    BusOff,
    /// Every bus-off channel was reopened
    Reconnected,
    /// A channel used up its reopen attempts
    RecoveryExhausted,
    /// Non-recoverable channel failure
    Fault,
    /// Stop requested
    Stop,
}

/// The relay state machine that manages state transitions.
#[derive(Debug, Clone)]
pub struct RelayStateMachine {
    state: RelayState,
    transition_count: u64,
    last_transition: Option<Instant>,
}

impl Default for RelayStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStateMachine {
    /// Create a new state machine in the Stopped state.
    pub fn new() -> Self {
        Self {
            state: RelayState::Stopped,
            transition_count: 0,
            last_transition: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Get the number of state transitions that have occurred.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Get the time since the last transition.
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Process a trigger. Returns `(from, to)` when the state changed.
    pub fn process_event(&mut self, trigger: RelayTrigger) -> Option<(RelayState, RelayState)> {
        let next = Self::next_state(self.state, trigger)?;
        if next == self.state {
            return None;
        }
        let from = self.state;
        self.state = next;
        self.transition_count += 1;
        self.last_transition = Some(Instant::now());
        Some((from, next))
    }

    fn next_state(state: RelayState, trigger: RelayTrigger) -> Option<RelayState> {
        use RelayState::*;
        use RelayTrigger as T;

        match (state, trigger) {
            (Stopped | Error, T::Started) => Some(Listening),
            (Stopped | Error, T::OpenFailed) => Some(Error),

            (Listening | Receiving, T::FrameReceived) => Some(Receiving),
            (Receiving, T::Idle) => Some(Listening),

            (Listening | Receiving, T::BusOff) => Some(Reconnecting),
            (Reconnecting, T::Reconnected) => Some(Listening),
            (Reconnecting, T::RecoveryExhausted) => Some(Error),

            (Listening | Receiving | Reconnecting, T::Fault) => Some(Error),

            (Listening | Receiving | Reconnecting | Error, T::Stop) => Some(Stopped),

            // Invalid transition - stay in current state
            _ => None,
        }
    }
}
