// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Relay controller components.
//!
//! This module contains the session state machine, the event stream and
//! the recovery and transmit policies used by the relay worker.

pub mod events;
pub mod machine;
pub mod policies;

pub use events::{
    BroadcastListener, ErrorEvent, ErrorKind, FrameEvent, ListenerId, RelayEvent,
    RelayEventEmitter, RelayListener, RelayPath,
};
pub use machine::{RelayState, RelayStateMachine, RelayTrigger};
pub use policies::{
    decide, ExponentialBackoff, FixedDelay, RecoveryDecision, RecoveryPolicy, TxThrottle,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY,
};
