// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Relay listeners used by the daemon.

use std::io::Write;

use tracing::{debug, info, warn};

use reframe_core::relay::controller::{
    ErrorEvent, FrameEvent, RelayEvent, RelayListener, RelayState,
};

/// Mirrors relay events into the tracing log.
pub struct LogListener;

impl RelayListener for LogListener {
    fn on_state_change(&self, from: RelayState, to: RelayState) {
        info!("State {} -> {}", from, to);
    }

    fn on_frame(&self, event: &FrameEvent) {
        debug!(
            "{} ({}) id=0x{:X} dlc={} data={:02X?}",
            event.direction, event.path, event.id, event.dlc, event.data
        );
    }

    fn on_error(&self, event: &ErrorEvent) {
        warn!("{} {:?}: {}", event.channel, event.kind, event.message);
    }
}

/// Render one event as a single JSON line.
pub fn event_json(event: &RelayEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

/// Prints every event to stdout as JSON lines.
pub struct JsonEventPrinter;

impl JsonEventPrinter {
    fn print(&self, event: RelayEvent) {
        let Some(line) = event_json(&event) else {
            warn!("Failed to serialize relay event");
            return;
        };
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
    }
}

impl RelayListener for JsonEventPrinter {
    fn on_state_change(&self, from: RelayState, to: RelayState) {
        self.print(RelayEvent::StateChanged { from, to });
    }

    fn on_frame(&self, event: &FrameEvent) {
        self.print(RelayEvent::Frame(event.clone()));
    }

    fn on_error(&self, event: &ErrorEvent) {
        self.print(RelayEvent::Error(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reframe_core::{ChannelRole, Frame};

    #[test]
    fn test_frame_event_json() {
        let frame = Frame::new(0x200, &[1, 2, 3, 4]).unwrap();
        let event = RelayEvent::Frame(FrameEvent::from_frame(ChannelRole::Output, &frame));
        let line = event_json(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "Frame");
        assert_eq!(value["direction"], "Output");
        assert_eq!(value["path"], "Forward");
        assert_eq!(value["id"], 0x200);
        assert_eq!(value["dlc"], 4);
        assert_eq!(value["data"], serde_json::json!([1, 2, 3, 4]));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_state_event_json() {
        let event = RelayEvent::StateChanged {
            from: RelayState::Listening,
            to: RelayState::Reconnecting,
        };
        let line = event_json(&event).unwrap();
        assert_eq!(
            line,
            r#"{"event":"StateChanged","from":"Listening","to":"Reconnecting"}"#
        );
    }
}
