// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Retransmission worker.
//!
//! [`Relay`] owns one session at a time. A session opens the input and
//! output channels, then runs a single-threaded loop on its own tokio task:
//! receive from input (bounded by `receive_timeout`), rewrite, send on
//! output, report. With the return path enabled each iteration also polls
//! the output channel and passes its frames back to input unmodified.
//! Bus-off on either channel moves the session into recovery, where each
//! channel is reopened under the recovery policy with its own attempt
//! counter.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::{
    validate_pair, ChannelConfig, ChannelConnection, ChannelDriver, ChannelId, ChannelRole,
    ConfigError, OpenError, RecvError, SendError,
};
use crate::frame::Frame;
use crate::rewrite::RewriteTable;

use super::controller::{
    ErrorKind, FixedDelay, FrameEvent, ListenerId, RecoveryDecision, RecoveryPolicy,
    RelayEventEmitter, RelayListener, RelayPath, RelayState, RelayStateMachine, RelayTrigger,
    TxThrottle,
};

/// Upper bound on a single receive; also bounds how long `stop()` waits.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll timeout on the output channel for the return path.
pub const DEFAULT_RETURN_TIMEOUT: Duration = Duration::from_millis(10);

/// Tunables for a relay session.
#[derive(Clone)]
pub struct RelaySettings {
    pub receive_timeout: Duration,
    /// Pass frames from the output channel back to input.
    pub return_path: bool,
    pub return_timeout: Duration,
    /// When false a bus-off ends the session immediately.
    pub retry_on_bus_off: bool,
    pub recovery: Arc<dyn RecoveryPolicy>,
    pub tx: TxThrottle,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            return_path: true,
            return_timeout: DEFAULT_RETURN_TIMEOUT,
            retry_on_bus_off: true,
            recovery: Arc::new(FixedDelay::default()),
            tx: TxThrottle::default(),
        }
    }
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("receive_timeout", &self.receive_timeout)
            .field("return_path", &self.return_path)
            .field("return_timeout", &self.return_timeout)
            .field("retry_on_bus_off", &self.retry_on_bus_off)
            .field("max_retries", &self.recovery.max_retries())
            .field("tx", &self.tx)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("relay is already running")]
    AlreadyRunning,
    #[error("failed to open {role} channel {channel}: {source}")]
    Open {
        role: ChannelRole,
        channel: ChannelId,
        #[source]
        source: OpenError,
    },
}

struct Shared {
    machine: Mutex<RelayStateMachine>,
    emitter: RelayEventEmitter,
    state_tx: watch::Sender<RelayState>,
}

impl Shared {
    fn state(&self) -> RelayState {
        self.machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    /// Apply a trigger and publish the transition, if any.
    fn transition(&self, trigger: RelayTrigger) {
        let change = {
            let mut machine = self.machine.lock().unwrap_or_else(PoisonError::into_inner);
            let held = machine.time_in_state();
            machine
                .process_event(trigger)
                .map(|(from, to)| (from, to, held, machine.transition_count()))
        };
        let Some((from, to, held, count)) = change else {
            return;
        };
        match held {
            Some(held) => info!(
                "Relay state #{}: {} -> {} after {:?} in {}",
                count, from, to, held, from
            ),
            None => info!("Relay state #{}: {} -> {}", count, from, to),
        }
        self.state_tx.send_replace(to);
        self.emitter.notify_state_change(from, to);
    }
}

struct Session {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The retransmission worker.
///
/// `start()` and `stop()` may be called from any task; the session loop
/// itself runs on a task spawned by `start()`.
pub struct Relay {
    driver: Arc<dyn ChannelDriver>,
    settings: RelaySettings,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Relay {
    pub fn new(driver: Arc<dyn ChannelDriver>, settings: RelaySettings) -> Self {
        let (state_tx, _) = watch::channel(RelayState::Stopped);
        Self {
            driver,
            settings,
            shared: Arc::new(Shared {
                machine: Mutex::new(RelayStateMachine::new()),
                emitter: RelayEventEmitter::new(),
                state_tx,
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Register an event listener.
    pub fn subscribe(&self, listener: Arc<dyn RelayListener>) -> ListenerId {
        let id = self.shared.emitter.register(listener);
        debug!(
            "Relay listener registered ({} total)",
            self.shared.emitter.listener_count()
        );
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.shared.emitter.unregister(id);
    }

    /// Watch the latest state.
    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.shared.state_tx.subscribe()
    }

    pub fn current_state(&self) -> RelayState {
        self.shared.state()
    }

    /// Open both channels and start relaying.
    ///
    /// The rewrite table is taken by value; later edits to the caller's
    /// copy apply at the next start. Starting from `Error` begins a fresh
    /// session with all attempt counters at zero.
    pub async fn start(
        &self,
        input: ChannelConfig,
        output: ChannelConfig,
        rules: RewriteTable,
    ) -> Result<(), StartError> {
        validate_pair(&input, &output)?;

        let mut session = self.session.lock().await;
        if self.shared.state().is_active() {
            return Err(StartError::AlreadyRunning);
        }
        if let Some(previous) = session.take() {
            // A session that ended in Error may still be unwinding.
            if let Err(e) = previous.task.await {
                warn!("Previous relay session ended abnormally: {}", e);
            }
        }

        let mut input = ChannelSlot::new(ChannelRole::Input, input);
        let mut output = ChannelSlot::new(ChannelRole::Output, output);

        if let Err(e) = input.open(self.driver.as_ref()).await {
            return Err(self.open_failed(&input, e));
        }
        if let Err(e) = output.open(self.driver.as_ref()).await {
            input.close();
            return Err(self.open_failed(&output, e));
        }

        info!(
            "Relay started: {} -> {} ({} rewrite rules)",
            input.config.channel_id,
            output.config.channel_id,
            rules.len()
        );
        self.shared.transition(RelayTrigger::Started);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            driver: Arc::clone(&self.driver),
            settings: self.settings.clone(),
            shared: Arc::clone(&self.shared),
            rules,
            input,
            output,
            shutdown_rx,
        };
        let task = tokio::spawn(worker.run());
        *session = Some(Session { shutdown_tx, task });
        Ok(())
    }

    /// End the session, closing both channels. Safe to call in any state.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(active) = session.take() {
            let _ = active.shutdown_tx.send(true);
            if let Err(e) = active.task.await {
                warn!("Relay session ended abnormally: {}", e);
            }
        }
        self.shared.transition(RelayTrigger::Stop);
    }

    fn open_failed(&self, slot: &ChannelSlot, source: OpenError) -> StartError {
        error!(
            "Failed to open {} channel {}: {}",
            slot.role, slot.config.channel_id, source
        );
        self.shared.emitter.notify_error(
            ErrorKind::from(&source),
            slot.role,
            format!("{}: {}", slot.config.channel_id, source),
        );
        self.shared.transition(RelayTrigger::OpenFailed);
        StartError::Open {
            role: slot.role,
            channel: slot.config.channel_id.clone(),
            source,
        }
    }
}

/// One side of a session plus its recovery bookkeeping.
struct ChannelSlot {
    role: ChannelRole,
    config: ChannelConfig,
    conn: Option<Box<dyn ChannelConnection>>,
    attempts: u32,
    retry_at: Option<Instant>,
    last_failure: Option<String>,
    last_send: Option<Instant>,
}

impl ChannelSlot {
    fn new(role: ChannelRole, config: ChannelConfig) -> Self {
        Self {
            role,
            config,
            conn: None,
            attempts: 0,
            retry_at: None,
            last_failure: None,
            last_send: None,
        }
    }

    async fn open(&mut self, driver: &dyn ChannelDriver) -> Result<(), OpenError> {
        let conn = driver.open(&self.config).await?;
        self.conn = Some(conn);
        self.attempts = 0;
        self.retry_at = None;
        self.last_failure = None;
        Ok(())
    }

    fn is_down(&self) -> bool {
        self.conn.is_none()
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }
}

enum Step {
    Continue,
    Exit,
}

/// Outcome of polling one channel.
enum Poll {
    Relayed,
    Idle,
    /// The channel is down; recovery runs next.
    Interrupted,
    Shutdown,
    Exit,
}

enum Recovery {
    Restored,
    Cancelled,
    Exhausted(ChannelRole),
}

enum Transmit {
    Sent(Frame),
    Overflow,
    Cancelled,
    Failed(SendError),
}

fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the owning Relay is gone.
    *rx.borrow() || rx.has_changed().is_err()
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Worker {
    driver: Arc<dyn ChannelDriver>,
    settings: RelaySettings,
    shared: Arc<Shared>,
    rules: RewriteTable,
    input: ChannelSlot,
    output: ChannelSlot,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        'session: loop {
            if shutdown_requested(&self.shutdown_rx) {
                break;
            }

            if self.input.is_down() || self.output.is_down() {
                match self.recover().await {
                    Recovery::Restored => {
                        self.shared.transition(RelayTrigger::Reconnected);
                        continue;
                    }
                    Recovery::Cancelled => break,
                    Recovery::Exhausted(role) => {
                        let message = format!(
                            "{} channel {} did not recover after {} attempts",
                            role,
                            self.slot(role).config.channel_id,
                            self.slot(role).attempts
                        );
                        self.fail(
                            ErrorKind::RecoveryExhausted,
                            role,
                            message,
                            RelayTrigger::RecoveryExhausted,
                        );
                        return;
                    }
                }
            }

            let legs = [
                Some((RelayPath::Forward, self.settings.receive_timeout)),
                self.settings
                    .return_path
                    .then_some((RelayPath::Return, self.settings.return_timeout)),
            ];
            let mut relayed = false;
            for (path, timeout) in legs.into_iter().flatten() {
                match self.poll(path, timeout).await {
                    Poll::Relayed => relayed = true,
                    Poll::Idle => {}
                    Poll::Interrupted => continue 'session,
                    Poll::Shutdown => break 'session,
                    Poll::Exit => return,
                }
            }
            if !relayed {
                self.shared.transition(RelayTrigger::Idle);
            }
        }

        self.close_all();
        debug!("Relay session loop stopped");
    }

    fn slot(&self, role: ChannelRole) -> &ChannelSlot {
        match role {
            ChannelRole::Input => &self.input,
            ChannelRole::Output => &self.output,
        }
    }

    fn slot_mut(&mut self, role: ChannelRole) -> &mut ChannelSlot {
        match role {
            ChannelRole::Input => &mut self.input,
            ChannelRole::Output => &mut self.output,
        }
    }

    fn close_all(&mut self) {
        self.input.close();
        self.output.close();
    }

    /// Close everything, report the error and leave the active states.
    fn fail(&mut self, kind: ErrorKind, role: ChannelRole, message: String, trigger: RelayTrigger) {
        error!("Relay session failed: {}", message);
        self.close_all();
        self.shared.emitter.notify_error(kind, role, message);
        self.shared.transition(trigger);
    }

    fn on_bus_off(&mut self, role: ChannelRole) -> Step {
        let slot = self.slot_mut(role);
        slot.close();
        warn!("{} channel {} is bus-off", role, slot.config.channel_id);

        if !self.settings.retry_on_bus_off {
            let message = format!(
                "{} channel {} is bus-off and recovery is disabled",
                role,
                self.slot(role).config.channel_id
            );
            self.fail(ErrorKind::BusOff, role, message, RelayTrigger::Fault);
            return Step::Exit;
        }
        self.shared.transition(RelayTrigger::BusOff);
        Step::Continue
    }

    /// Wait up to `timeout` for a frame on the source channel of `path` and
    /// relay it.
    async fn poll(&mut self, path: RelayPath, timeout: Duration) -> Poll {
        let source = path.source();
        let Some(conn) = self.slot_mut(source).conn.as_mut() else {
            return Poll::Interrupted;
        };
        let received = conn.receive(timeout).await;
        match received {
            Ok(Some(frame)) => {
                if shutdown_requested(&self.shutdown_rx) {
                    return Poll::Shutdown;
                }
                self.shared.transition(RelayTrigger::FrameReceived);
                match self.relay(path, frame).await {
                    Step::Continue => Poll::Relayed,
                    Step::Exit => Poll::Exit,
                }
            }
            Ok(None) => Poll::Idle,
            Err(RecvError::BusOff) => match self.on_bus_off(source) {
                Step::Continue => Poll::Interrupted,
                Step::Exit => Poll::Exit,
            },
            Err(e @ RecvError::Io(_)) => {
                self.fail(ErrorKind::from(&e), source, e.to_string(), RelayTrigger::Fault);
                Poll::Exit
            }
        }
    }

    /// Send `frame` on to the target channel of `path`. Only the forward
    /// path rewrites identifiers.
    async fn relay(&mut self, path: RelayPath, frame: Frame) -> Step {
        let (source, target) = (path.source(), path.target());
        let id = match path {
            RelayPath::Forward => self.rules.lookup(frame.id()).unwrap_or(frame.id()),
            RelayPath::Return => frame.id(),
        };
        self.shared
            .emitter
            .notify_frame(FrameEvent::from_frame(source, &frame).with_path(path));

        let outgoing = match frame.with_id(id) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                warn!("Cannot rewrite {}: {}", frame, e);
                return Step::Continue;
            }
        };
        debug!("Relaying {} as {} ({})", frame, outgoing, path);

        match self.transmit(target, outgoing).await {
            Transmit::Sent(sent) => {
                self.shared
                    .emitter
                    .notify_frame(FrameEvent::from_frame(target, &sent).with_path(path));
                Step::Continue
            }
            Transmit::Overflow => {
                let message = format!(
                    "transmit buffer full after {} attempts; dropped frame 0x{:X}",
                    self.settings.tx.max_send_retries, id
                );
                warn!("{}", message);
                self.shared
                    .emitter
                    .notify_error(ErrorKind::TxOverflow, target, message);
                let cooldown = self.settings.tx.overflow_cooldown;
                tokio::select! {
                    _ = time::sleep(cooldown) => {}
                    _ = wait_for_shutdown(&mut self.shutdown_rx) => {}
                }
                Step::Continue
            }
            Transmit::Cancelled => Step::Continue,
            Transmit::Failed(SendError::BusOff) => self.on_bus_off(target),
            Transmit::Failed(e) => {
                self.fail(ErrorKind::from(&e), target, e.to_string(), RelayTrigger::Fault);
                Step::Exit
            }
        }
    }

    /// Send one frame on `role`, backing off while the transmit buffer is
    /// full.
    async fn transmit(&mut self, role: ChannelRole, frame: Frame) -> Transmit {
        let throttle = &self.settings.tx;
        let slot = match role {
            ChannelRole::Input => &mut self.input,
            ChannelRole::Output => &mut self.output,
        };
        if let Some(last) = slot.last_send {
            if !throttle.min_gap.is_zero() {
                tokio::select! {
                    _ = time::sleep_until(last + throttle.min_gap) => {}
                    _ = wait_for_shutdown(&mut self.shutdown_rx) => return Transmit::Cancelled,
                }
            }
        }

        let Some(conn) = slot.conn.as_mut() else {
            return Transmit::Failed(SendError::BusOff);
        };
        for attempt in 0..throttle.max_send_retries {
            match conn.send(&frame).await {
                Ok(()) => {
                    slot.last_send = Some(Instant::now());
                    return Transmit::Sent(frame.restamped());
                }
                Err(SendError::BufferFull) => {
                    if attempt + 1 == throttle.max_send_retries {
                        break;
                    }
                    if shutdown_requested(&self.shutdown_rx) {
                        return Transmit::Cancelled;
                    }
                    let delay = throttle.backoff.delay(attempt);
                    debug!("Transmit buffer full on {}, retrying in {:?}", role, delay);
                    time::sleep(delay).await;
                }
                Err(e) => return Transmit::Failed(e),
            }
        }
        Transmit::Overflow
    }

    /// Reopen every bus-off channel, each on its own attempt counter.
    async fn recover(&mut self) -> Recovery {
        let policy = Arc::clone(&self.settings.recovery);
        loop {
            for slot in [&mut self.input, &mut self.output] {
                if !slot.is_down() || slot.retry_at.is_some() {
                    continue;
                }
                match policy.decide(slot.attempts) {
                    RecoveryDecision::RetryAfter(delay) => {
                        let mut message = format!(
                            "{} channel {} bus-off, reconnect attempt {}/{} in {} ms",
                            slot.role,
                            slot.config.channel_id,
                            slot.attempts + 1,
                            policy.max_retries(),
                            delay.as_millis()
                        );
                        if let Some(reason) = &slot.last_failure {
                            message.push_str(&format!(" (last attempt: {})", reason));
                        }
                        info!("{}", message);
                        self.shared
                            .emitter
                            .notify_error(ErrorKind::BusOff, slot.role, message);
                        slot.retry_at = Some(Instant::now() + delay);
                    }
                    RecoveryDecision::GiveUp => return Recovery::Exhausted(slot.role),
                }
            }

            let due = [&self.input, &self.output]
                .into_iter()
                .filter_map(|slot| slot.retry_at)
                .min();
            let Some(due) = due else {
                return Recovery::Restored;
            };

            tokio::select! {
                _ = time::sleep_until(due) => {}
                _ = wait_for_shutdown(&mut self.shutdown_rx) => return Recovery::Cancelled,
            }

            let now = Instant::now();
            for slot in [&mut self.input, &mut self.output] {
                match slot.retry_at {
                    Some(at) if at <= now => slot.retry_at = None,
                    _ => continue,
                }
                match slot.open(self.driver.as_ref()).await {
                    Ok(()) => info!("{} channel {} reopened", slot.role, slot.config.channel_id),
                    Err(e) => {
                        warn!(
                            "Reopening {} channel {} failed: {}",
                            slot.role, slot.config.channel_id, e
                        );
                        slot.attempts += 1;
                        slot.last_failure = Some(e.to_string());
                    }
                }
            }

            if !self.input.is_down() && !self.output.is_down() {
                return Recovery::Restored;
            }
        }
    }
}
