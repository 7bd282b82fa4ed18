// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! End-to-end relay sessions against the virtual bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reframe_backend::{register_builtin_drivers_on, DriverRegistry, VirtualBus};
use reframe_core::relay::controller::{
    ErrorEvent, ErrorKind, FixedDelay, FrameEvent, RelayEvent, RelayListener, RelayPath,
    RelayState, TxThrottle,
};
use reframe_core::{
    ChannelConfig, ChannelId, ChannelRole, ConfigError, Frame, OpenError, Relay, RelaySettings,
    RewriteRule, RewriteTable, SendError, StartError,
};

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<RelayEvent>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().unwrap().clone()
    }

    fn frames(&self) -> Vec<FrameEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RelayEvent::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<ErrorEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RelayEvent::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    fn saw_transition(&self, from: RelayState, to: RelayState) -> bool {
        self.events()
            .contains(&RelayEvent::StateChanged { from, to })
    }
}

impl RelayListener for RecordingListener {
    fn on_state_change(&self, from: RelayState, to: RelayState) {
        self.events
            .lock()
            .unwrap()
            .push(RelayEvent::StateChanged { from, to });
    }

    fn on_frame(&self, event: &FrameEvent) {
        self.events
            .lock()
            .unwrap()
            .push(RelayEvent::Frame(event.clone()));
    }

    fn on_error(&self, event: &ErrorEvent) {
        self.events
            .lock()
            .unwrap()
            .push(RelayEvent::Error(event.clone()));
    }
}

struct Harness {
    bus: VirtualBus,
    relay: Relay,
    listener: Arc<RecordingListener>,
}

fn settings(max_retries: u32) -> RelaySettings {
    RelaySettings {
        receive_timeout: Duration::from_millis(10),
        return_timeout: Duration::from_millis(5),
        recovery: Arc::new(FixedDelay::new(max_retries, Duration::from_millis(10))),
        ..RelaySettings::default()
    }
}

fn harness(settings: RelaySettings) -> Harness {
    let bus = VirtualBus::new();
    let mut registry = DriverRegistry::new();
    register_builtin_drivers_on(&mut registry, &bus);
    let relay = Relay::new(Arc::new(registry), settings);
    let listener = Arc::new(RecordingListener::default());
    relay.subscribe(listener.clone());
    Harness {
        bus,
        relay,
        listener,
    }
}

fn config(channel: &str) -> ChannelConfig {
    ChannelConfig::new(ChannelId::new("virtual", channel))
}

async fn start(h: &Harness, rules: RewriteTable) {
    h.relay
        .start(config("vcan0"), config("vcan1"), rules)
        .await
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn frame(id: u32, data: &[u8]) -> Frame {
    Frame::new(id, data).unwrap()
}

#[tokio::test]
async fn test_passthrough_without_rules() {
    let h = harness(settings(3));
    start(&h, RewriteTable::new()).await;
    assert_eq!(h.relay.current_state(), RelayState::Listening);

    h.bus.inject_frame("vcan0", frame(0x123, &[0xAA, 0xBB]));
    assert!(wait_until(|| h.bus.sent_frames("vcan1").len() == 1).await);

    let sent = h.bus.sent_frames("vcan1");
    assert_eq!(sent[0].id(), 0x123);
    assert_eq!(sent[0].data(), &[0xAA, 0xBB]);

    assert!(wait_until(|| h.listener.frames().len() == 2).await);
    let frames = h.listener.frames();
    assert_eq!(frames[0].direction, ChannelRole::Input);
    assert_eq!(frames[1].direction, ChannelRole::Output);
    assert!(frames.iter().all(|f| f.path == RelayPath::Forward));
    assert_eq!(frames[1].id, 0x123);
    assert!(h
        .listener
        .saw_transition(RelayState::Listening, RelayState::Receiving));

    h.relay.stop().await;
}

#[tokio::test]
async fn test_rewrite_scenario() {
    let h = harness(settings(3));
    let mut rules = RewriteTable::new();
    rules.add(RewriteRule::new(0x100, 0x200).unwrap()).unwrap();
    start(&h, rules).await;

    h.bus.inject_frame("vcan0", frame(0x100, &[1, 2, 3, 4]));
    h.bus.inject_frame("vcan0", frame(0x101, &[5]));
    assert!(wait_until(|| h.listener.frames().len() == 4).await);

    let frames = h.listener.frames();
    let (input, output) = (&frames[0], &frames[1]);
    assert_eq!(input.direction, ChannelRole::Input);
    assert_eq!(input.id, 0x100);
    assert_eq!(output.direction, ChannelRole::Output);
    assert_eq!(output.id, 0x200);
    assert_eq!(input.dlc, 4);
    assert_eq!(output.dlc, 4);
    assert_eq!(input.data, vec![1, 2, 3, 4]);
    assert_eq!(output.data, vec![1, 2, 3, 4]);
    assert!(output.timestamp_ms >= input.timestamp_ms);

    // Unmatched identifiers pass through, in order.
    assert_eq!(frames[2].id, 0x101);
    assert_eq!(frames[3].id, 0x101);
    let sent: Vec<u32> = h.bus.sent_frames("vcan1").iter().map(Frame::id).collect();
    assert_eq!(sent, vec![0x200, 0x101]);

    h.relay.stop().await;
}

#[tokio::test]
async fn test_same_channel_rejected_before_open() {
    let h = harness(settings(3));
    let result = h
        .relay
        .start(config("vcan0"), config("vcan0"), RewriteTable::new())
        .await;

    assert!(matches!(
        result,
        Err(StartError::Config(ConfigError::SameChannel(_)))
    ));
    assert_eq!(h.bus.total_opens(), 0);
    assert_eq!(h.relay.current_state(), RelayState::Stopped);
    assert!(h.listener.events().is_empty());
}

#[tokio::test]
async fn test_same_device_spelled_differently_rejected_before_open() {
    let h = harness(settings(3));
    let input = ChannelConfig::new(ChannelId::new("Virtual", "vcan0"));
    let result = h
        .relay
        .start(input, config("vcan0"), RewriteTable::new())
        .await;

    assert!(matches!(
        result,
        Err(StartError::Config(ConfigError::SameChannel(_)))
    ));
    assert_eq!(h.bus.total_opens(), 0);
    assert_eq!(h.relay.current_state(), RelayState::Stopped);
}

#[tokio::test]
async fn test_input_bus_off_exhausts_retries() {
    let h = harness(settings(2));
    start(&h, RewriteTable::new()).await;

    h.bus
        .set_open_error("vcan0", Some(OpenError::Busy("held elsewhere".into())));
    h.bus.trigger_bus_off("vcan0");

    assert!(wait_until(|| h.relay.current_state() == RelayState::Error).await);

    let errors = h.listener.errors();
    let kinds: Vec<ErrorKind> = errors.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ErrorKind::BusOff,
            ErrorKind::BusOff,
            ErrorKind::RecoveryExhausted
        ]
    );
    assert!(errors.iter().all(|e| e.channel == ChannelRole::Input));
    assert!(errors[1].message.contains("held elsewhere"));
    assert!(h
        .listener
        .saw_transition(RelayState::Reconnecting, RelayState::Error));
    assert_eq!(h.bus.open_count(), 0);

    // Stop from Error is allowed.
    h.relay.stop().await;
    assert_eq!(h.relay.current_state(), RelayState::Stopped);
}

#[tokio::test]
async fn test_input_bus_off_recovers() {
    let h = harness(settings(3));
    start(&h, RewriteTable::new()).await;

    h.bus.trigger_bus_off("vcan0");
    assert!(
        wait_until(|| h
            .listener
            .saw_transition(RelayState::Reconnecting, RelayState::Listening))
        .await
    );
    assert_eq!(h.bus.opens_of("vcan0"), 2);
    assert_eq!(h.bus.opens_of("vcan1"), 1);

    h.bus.inject_frame("vcan0", frame(0x42, &[1]));
    assert!(wait_until(|| h.bus.sent_frames("vcan1").len() == 1).await);

    let errors = h.listener.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::BusOff);

    h.relay.stop().await;
    assert_eq!(h.bus.open_count(), 0);
}

#[tokio::test]
async fn test_output_bus_off_recovers_independently() {
    let h = harness(settings(3));
    start(&h, RewriteTable::new()).await;

    h.bus.trigger_bus_off("vcan1");
    assert!(
        wait_until(|| h
            .listener
            .saw_transition(RelayState::Reconnecting, RelayState::Listening))
        .await
    );

    let errors = h.listener.errors();
    assert_eq!(errors[0].kind, ErrorKind::BusOff);
    assert_eq!(errors[0].channel, ChannelRole::Output);
    // Input was never reopened.
    assert_eq!(h.bus.opens_of("vcan0"), 1);
    assert_eq!(h.bus.opens_of("vcan1"), 2);

    h.bus.inject_frame("vcan0", frame(0x11, &[2]));
    assert!(wait_until(|| h.bus.sent_frames("vcan1").len() == 1).await);
    assert_eq!(h.bus.sent_frames("vcan1")[0].id(), 0x11);

    h.relay.stop().await;
}

#[tokio::test]
async fn test_output_bus_off_on_send_recovers() {
    let mut settings = settings(3);
    settings.return_path = false;
    let h = harness(settings);
    start(&h, RewriteTable::new()).await;

    h.bus.trigger_bus_off("vcan1");
    h.bus.inject_frame("vcan0", frame(0x10, &[1]));
    assert!(
        wait_until(|| h
            .listener
            .saw_transition(RelayState::Reconnecting, RelayState::Listening))
        .await
    );

    let errors = h.listener.errors();
    assert_eq!(errors[0].kind, ErrorKind::BusOff);
    assert_eq!(errors[0].channel, ChannelRole::Output);
    assert_eq!(h.bus.opens_of("vcan0"), 1);
    // The frame that hit bus-off is dropped.
    assert!(h.bus.sent_frames("vcan1").is_empty());

    h.relay.stop().await;
}

#[tokio::test]
async fn test_return_path_passes_frames_back_unmodified() {
    let h = harness(settings(3));
    let mut rules = RewriteTable::new();
    rules.add(RewriteRule::new(0x100, 0x200).unwrap()).unwrap();
    start(&h, rules).await;

    h.bus.inject_frame("vcan1", frame(0x100, &[7, 8]));
    assert!(wait_until(|| h.bus.sent_frames("vcan0").len() == 1).await);

    let sent = h.bus.sent_frames("vcan0");
    assert_eq!(sent[0].id(), 0x100);
    assert_eq!(sent[0].data(), &[7, 8]);
    assert!(h.bus.sent_frames("vcan1").is_empty());

    assert!(wait_until(|| h.listener.frames().len() == 2).await);
    let frames = h.listener.frames();
    assert_eq!(frames[0].direction, ChannelRole::Output);
    assert_eq!(frames[0].path, RelayPath::Return);
    assert_eq!(frames[1].direction, ChannelRole::Input);
    assert_eq!(frames[1].path, RelayPath::Return);
    assert_eq!(frames[1].id, 0x100);
    assert!(frames[1].timestamp_ms >= frames[0].timestamp_ms);

    // Both directions flow in the same session.
    h.bus.inject_frame("vcan0", frame(0x100, &[1]));
    assert!(wait_until(|| h.bus.sent_frames("vcan1").len() == 1).await);
    assert_eq!(h.bus.sent_frames("vcan1")[0].id(), 0x200);

    h.relay.stop().await;
}

#[tokio::test]
async fn test_return_path_disabled_ignores_output_traffic() {
    let mut settings = settings(3);
    settings.return_path = false;
    let h = harness(settings);
    start(&h, RewriteTable::new()).await;

    h.bus.inject_frame("vcan1", frame(0x55, &[1]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.bus.sent_frames("vcan0").is_empty());
    assert!(h.listener.frames().is_empty());

    h.relay.stop().await;
}

#[tokio::test]
async fn test_input_bus_off_on_return_send_recovers() {
    let h = harness(settings(3));
    start(&h, RewriteTable::new()).await;

    h.bus.set_send_error("vcan0", Some(SendError::BusOff));
    h.bus.inject_frame("vcan1", frame(0x33, &[3]));
    assert!(wait_until(|| !h.listener.errors().is_empty()).await);
    h.bus.set_send_error("vcan0", None);

    assert!(
        wait_until(|| h
            .listener
            .saw_transition(RelayState::Reconnecting, RelayState::Listening))
        .await
    );
    let errors = h.listener.errors();
    assert_eq!(errors[0].kind, ErrorKind::BusOff);
    assert_eq!(errors[0].channel, ChannelRole::Input);
    assert_eq!(h.bus.opens_of("vcan0"), 2);
    assert_eq!(h.bus.opens_of("vcan1"), 1);

    h.relay.stop().await;
}

#[tokio::test]
async fn test_bus_off_without_recovery_is_fatal() {
    let mut settings = settings(3);
    settings.retry_on_bus_off = false;
    let h = harness(settings);
    start(&h, RewriteTable::new()).await;

    h.bus.trigger_bus_off("vcan0");
    assert!(wait_until(|| h.relay.current_state() == RelayState::Error).await);

    let errors = h.listener.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::BusOff);
    assert_eq!(h.bus.opens_of("vcan0"), 1);
    assert_eq!(h.bus.open_count(), 0);
}

#[tokio::test]
async fn test_stop_while_receiving() {
    let h = harness(settings(3));
    start(&h, RewriteTable::new()).await;

    let feeder_bus = h.bus.clone();
    let feeder = tokio::spawn(async move {
        let mut id = 0u32;
        loop {
            feeder_bus.inject_frame("vcan0", Frame::new(id & 0x7FF, &[1, 2]).unwrap());
            id += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    assert!(wait_until(|| h.relay.current_state() == RelayState::Receiving).await);
    h.relay.stop().await;
    feeder.abort();

    assert_eq!(h.relay.current_state(), RelayState::Stopped);
    assert_eq!(h.bus.open_count(), 0);

    let frames_at_stop = h.listener.frames().len();
    h.bus.inject_frame("vcan0", frame(0x7FF, &[]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.listener.frames().len(), frames_at_stop);
}

#[tokio::test]
async fn test_stop_while_reconnecting_cancels_retry() {
    let mut settings = settings(3);
    settings.recovery = Arc::new(FixedDelay::new(3, Duration::from_millis(300)));
    let h = harness(settings);
    start(&h, RewriteTable::new()).await;

    h.bus.trigger_bus_off("vcan0");
    assert!(wait_until(|| h.relay.current_state() == RelayState::Reconnecting).await);

    h.relay.stop().await;
    assert_eq!(h.relay.current_state(), RelayState::Stopped);
    assert_eq!(h.bus.open_count(), 0);

    // Past the point where the reopen would have fired.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(h.relay.current_state(), RelayState::Stopped);
    assert_eq!(h.bus.open_count(), 0);
    assert_eq!(h.bus.opens_of("vcan0"), 1);
    assert!(!h
        .listener
        .saw_transition(RelayState::Reconnecting, RelayState::Listening));
}

#[tokio::test]
async fn test_stop_interrupts_tx_min_gap() {
    let mut settings = settings(3);
    settings.tx = TxThrottle::new(
        10,
        Duration::from_millis(1),
        Duration::from_secs(30),
        Duration::from_millis(1),
    );
    let h = harness(settings);
    start(&h, RewriteTable::new()).await;

    h.bus.inject_frame("vcan0", frame(0x1, &[1]));
    h.bus.inject_frame("vcan0", frame(0x2, &[2]));
    // Input event of the second frame: its send is now waiting out the gap.
    assert!(wait_until(|| h.listener.frames().len() == 3).await);

    let stopped = tokio::time::timeout(Duration::from_secs(2), h.relay.stop()).await;
    assert!(stopped.is_ok());
    assert_eq!(h.relay.current_state(), RelayState::Stopped);
    assert_eq!(h.bus.open_count(), 0);
    assert_eq!(h.bus.sent_frames("vcan1").len(), 1);
}

#[tokio::test]
async fn test_repeated_start_stop_does_not_leak() {
    let h = harness(settings(3));
    for _ in 0..10 {
        start(&h, RewriteTable::new()).await;
        assert_eq!(h.bus.open_count(), 2);
        h.relay.stop().await;
        assert_eq!(h.bus.open_count(), 0);
        assert_eq!(h.relay.current_state(), RelayState::Stopped);
    }
    assert_eq!(h.bus.total_opens(), 20);
}

#[tokio::test]
async fn test_open_failures_are_fatal_and_restartable() {
    let h = harness(settings(3));

    let result = h
        .relay
        .start(config("missing"), config("vcan1"), RewriteTable::new())
        .await;
    match result {
        Err(StartError::Open { role, source, .. }) => {
            assert_eq!(role, ChannelRole::Input);
            assert!(matches!(source, OpenError::DeviceNotFound(_)));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(h.relay.current_state(), RelayState::Error);
    assert_eq!(h.listener.errors()[0].kind, ErrorKind::DeviceNotFound);
    assert_eq!(h.bus.open_count(), 0);

    // Output held by someone else.
    let _holder = {
        use reframe_core::ChannelDriver;
        h.bus.open(&config("vcan1")).await.unwrap()
    };
    let result = h
        .relay
        .start(config("vcan0"), config("vcan1"), RewriteTable::new())
        .await;
    assert!(matches!(
        result,
        Err(StartError::Open {
            role: ChannelRole::Output,
            source: OpenError::Busy(_),
            ..
        })
    ));
    assert_eq!(h.bus.open_count(), 1);
    drop(_holder);

    // A fresh start from Error succeeds.
    start(&h, RewriteTable::new()).await;
    assert!(h
        .listener
        .saw_transition(RelayState::Error, RelayState::Listening));
    h.relay.stop().await;
}

#[tokio::test]
async fn test_tx_overflow_drops_frame_and_continues() {
    let mut settings = settings(3);
    settings.tx = TxThrottle::new(
        2,
        Duration::from_millis(1),
        Duration::ZERO,
        Duration::from_millis(1),
    );
    let h = harness(settings);
    start(&h, RewriteTable::new()).await;

    h.bus.set_send_error("vcan1", Some(SendError::BufferFull));
    h.bus.inject_frame("vcan0", frame(0x1, &[1]));
    assert!(wait_until(|| !h.listener.errors().is_empty()).await);

    let errors = h.listener.errors();
    assert_eq!(errors[0].kind, ErrorKind::TxOverflow);
    assert_eq!(errors[0].channel, ChannelRole::Output);
    assert!(h.relay.current_state().is_active());

    h.bus.set_send_error("vcan1", None);
    h.bus.inject_frame("vcan0", frame(0x2, &[2]));
    assert!(wait_until(|| h.bus.sent_frames("vcan1").len() == 1).await);
    assert_eq!(h.bus.sent_frames("vcan1")[0].id(), 0x2);

    h.relay.stop().await;
}
