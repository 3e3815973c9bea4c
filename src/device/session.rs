use std::sync::Arc;
use std::time::Duration;
use indexmap::IndexSet;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::device::transport::Transport;
use crate::device::types::{ConnectionEvent, DeviceEvent, DeviceId, FailureReason, RadioState, SessionId, SessionState, TransitionReason, TransportEvent};
use crate::error::{DeviceError, SessionError};
use crate::heading::HeadingStream;

/// One logical connection attempt and, if it succeeds, the lifetime of that connection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    pub id: SessionId,
    pub state: SessionState,
    /// Empty unless discovery found more than one headset and a selection is pending.
    pub candidate_devices: IndexSet<DeviceId>,
    pub last_activity: Instant,
    /// Set if and only if `state` is Connecting, Connected or Lingering.
    pub selected_device: Option<DeviceId>,
}

impl DeviceSession {
    fn new(id: SessionId, now: Instant) -> Self {
        DeviceSession {
            id,
            state: SessionState::None,
            candidate_devices: IndexSet::new(),
            last_activity: now,
            selected_device: None,
        }
    }

    pub fn is_awaiting_selection(&self) -> bool {
        self.state == SessionState::Discovering && !self.candidate_devices.is_empty()
    }
}

/**
 * Owns the current DeviceSession and applies user requests and transport facts to it.
 *
 * Every transition is published on the event bus as a DeviceEvent::StateChange, failures included.
 * Nothing is ever retried automatically: after ConnectionFailed, Disconnected or BluetoothOff it is
 * up to the caller to connect() again, which starts a new session.
 *
 * All methods are synchronous and must be called from one execution context at a time (see
 * spawn_session_controller).
 */
pub struct SessionMachine<T: Transport> {
    transport: T,
    session: DeviceSession,
    radio: RadioState,
    linger_timeout: Duration,
    bus: Arc<EventBus>,
    headings: Arc<HeadingStream>,
    torn_down: bool,
}

impl<T: Transport> SessionMachine<T> {
    pub fn new(transport: T, bus: Arc<EventBus>, headings: Arc<HeadingStream>, linger_timeout: Duration, now: Instant) -> Self {
        let radio = transport.radio_state();

        SessionMachine {
            transport,
            session: DeviceSession::new(SessionId(1), now),
            radio,
            linger_timeout,
            bus,
            headings,
            torn_down: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    fn transition(&mut self, state: SessionState, reason: TransitionReason) {
        let previous = self.session.state;
        let device = self.session.selected_device.clone();

        debug_assert!(
            !state.has_selected_device() || device.is_some(),
            "entering {:?} without a selected device", state,
        );

        self.session.state = state;
        if !state.has_selected_device() {
            self.session.selected_device = None;
        }
        if state != SessionState::Discovering {
            self.session.candidate_devices.clear();
        }

        info!("Session {}: {} -> {} ({:?})", self.session.id, previous, state, reason);

        self.bus.dispatch(&DeviceEvent::StateChange(ConnectionEvent {
            session: self.session.id,
            previous,
            state,
            reason,
            device,
        }));
    }

    fn new_session(&mut self, now: Instant) {
        let id = self.session.id.next();
        let previous = self.session.state;
        self.session = DeviceSession::new(id, now);

        info!("Session {}: created, previous session ended as {}", id, previous);

        self.bus.dispatch(&DeviceEvent::StateChange(ConnectionEvent {
            session: id,
            previous,
            state: SessionState::None,
            reason: TransitionReason::SessionReset,
            device: None,
        }));
    }

    fn begin_connecting(&mut self, device: DeviceId, reason: TransitionReason) {
        self.session.selected_device = Some(device.clone());
        self.transport.connect(self.session.id, &device);
        self.transition(SessionState::Connecting, reason);
    }

    /// Starts a new connect attempt. Only accepted while no attempt is in progress or established;
    /// completion is reported on the event bus.
    pub fn connect(&mut self, now: Instant) -> Result<(), SessionError> {
        let state = self.session.state;

        if state.is_active() {
            return Err(SessionError::SessionActive(state));
        }

        if !self.radio.is_powered_on() {
            if self.radio.is_unusable() && state == SessionState::None {
                self.transition(SessionState::BluetoothOff, TransitionReason::RadioUnavailable(self.radio));
            }
            return Err(SessionError::TransportUnavailable(self.radio));
        }

        if state != SessionState::None {
            self.new_session(now);
        }

        match self.transport.start_scan(self.session.id) {
            Ok(()) => {
                self.session.last_activity = now;
                self.transition(SessionState::Discovering, TransitionReason::ConnectRequested);
                Ok(())
            },
            Err(DeviceError::TransportUnavailable(radio)) => {
                warn!("Transport refused to scan, radio {}", radio);
                Err(SessionError::TransportUnavailable(radio))
            },
            Err(err) => {
                warn!("Transport refused to scan: {:?}", err);
                Err(SessionError::TransportUnavailable(self.radio))
            },
        }
    }

    /// Resolves an ambiguous discovery by picking one of the candidates.
    pub fn select_device(&mut self, device: DeviceId) -> Result<(), SessionError> {
        if !self.session.is_awaiting_selection() {
            return Err(SessionError::NotAwaitingSelection);
        }

        if !self.session.candidate_devices.contains(&device) {
            return Err(SessionError::UnknownCandidate(device));
        }

        self.begin_connecting(device, TransitionReason::DeviceSelected);
        Ok(())
    }

    /**
     * Ends the current session. Does nothing if it has already ended as Disconnected, so that
     * repeated calls publish a single Disconnected event.
     *
     * Calling this while connecting ends the session right away; a Connected that the transport
     * reports afterwards is not published and the link is dropped again.
     */
    pub fn disconnect(&mut self) {
        if self.session.state == SessionState::Disconnected {
            debug!("Session {}: already disconnected", self.session.id);
            return;
        }

        self.transport.disconnect();
        self.transition(SessionState::Disconnected, TransitionReason::DisconnectRequested);
    }

    fn is_current(&self, session: SessionId, what: &str) -> bool {
        if session != self.session.id {
            debug!("Ignoring {} for session {} (current session is {})", what, session, self.session.id);
            return false;
        }
        true
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::RadioStateChanged(radio) => self.on_radio_state(radio),
            TransportEvent::Discovered { session, candidates } => {
                if self.is_current(session, "discovery") {
                    self.on_discovered(candidates);
                }
            },
            TransportEvent::Connected { session, device } => {
                if self.is_current(session, "connect") {
                    self.on_connected(device, now);
                }
            },
            TransportEvent::ConnectionFailed { session, reason } => {
                if self.is_current(session, "connection failure") {
                    self.on_connection_failed(reason);
                }
            },
            TransportEvent::Disconnected { session } => {
                if self.is_current(session, "disconnect") {
                    self.on_disconnected();
                }
            },
            TransportEvent::Heading { session, sample } => {
                if session != self.session.id {
                    return;
                }

                match self.session.state {
                    SessionState::Connected => {},
                    SessionState::Lingering => {
                        self.transition(SessionState::Connected, TransitionReason::ActivityResumed);
                    },
                    _ => return,
                }

                self.session.last_activity = now;
                self.headings.publish(sample);
            },
        }
    }

    fn on_radio_state(&mut self, radio: RadioState) {
        if self.radio != radio {
            info!("Radio is {}", radio);
        }
        self.radio = radio;
        self.bus.dispatch(&DeviceEvent::RadioState(radio));

        let state = self.session.state;
        if radio.is_unusable() && !state.is_terminal() && state != SessionState::BluetoothOff {
            if state.is_active() {
                self.transport.disconnect();
            }
            self.transition(SessionState::BluetoothOff, TransitionReason::RadioUnavailable(radio));
        }
    }

    fn on_discovered(&mut self, mut candidates: IndexSet<DeviceId>) {
        if self.session.state != SessionState::Discovering {
            debug!("Ignoring discovery result in state {}", self.session.state);
            return;
        }

        if self.session.is_awaiting_selection() {
            debug!("Ignoring discovery result, a selection is already pending");
            return;
        }

        match candidates.len() {
            0 => {
                self.transition(SessionState::ConnectionFailed, TransitionReason::Failed(FailureReason::NoDevicesFound));
            },
            1 => if let Some(device) = candidates.pop() {
                info!("Found headset {}", device);
                self.begin_connecting(device, TransitionReason::DeviceFound);
            },
            count => {
                info!("Found {} headsets, waiting for a selection", count);
                let list: Vec<DeviceId> = candidates.iter().cloned().collect();
                self.session.candidate_devices = candidates;
                self.bus.dispatch(&DeviceEvent::AmbiguousDevices(list));
            },
        }
    }

    fn on_connected(&mut self, device: DeviceId, now: Instant) {
        let state = self.session.state;

        if state == SessionState::Connecting && self.session.selected_device.as_ref() == Some(&device) {
            self.session.last_activity = now;
            self.transition(SessionState::Connected, TransitionReason::LinkEstablished);
            return;
        }

        if state == SessionState::Connecting {
            warn!("Transport connected {} instead of the selected device", device);
            self.transport.disconnect();
            let reason = FailureReason::LinkFailed(format!("connected to unexpected device {}", device));
            self.transition(SessionState::ConnectionFailed, TransitionReason::Failed(reason));
        } else if state.has_selected_device() {
            debug!("Ignoring connect of {} in state {}", device, state);
        } else {
            info!("Dropping link to {}, the session no longer wants it ({})", device, state);
            self.transport.disconnect();
        }
    }

    fn on_connection_failed(&mut self, reason: FailureReason) {
        match self.session.state {
            SessionState::Discovering | SessionState::Connecting => {
                warn!("Connecting failed: {}", reason);
                self.transition(SessionState::ConnectionFailed, TransitionReason::Failed(reason));
            },
            SessionState::Connected | SessionState::Lingering => {
                warn!("Link failed: {}", reason);
                self.transition(SessionState::Disconnected, TransitionReason::Failed(reason));
            },
            state => debug!("Ignoring failure in state {}: {}", state, reason),
        }
    }

    fn on_disconnected(&mut self) {
        match self.session.state {
            SessionState::Connecting => {
                let reason = FailureReason::LinkFailed(String::from("link dropped while connecting"));
                self.transition(SessionState::ConnectionFailed, TransitionReason::Failed(reason));
            },
            SessionState::Connected | SessionState::Lingering => {
                warn!("Connection lost");
                self.transition(SessionState::Disconnected, TransitionReason::LinkLost);
            },
            state => debug!("Ignoring disconnect in state {}", state),
        }
    }

    /// Detects a connected headset that went quiet. Lingering is only a warning, the session stays
    /// up and returns to Connected on the next heading.
    pub fn tick(&mut self, now: Instant) {
        if self.session.state != SessionState::Connected {
            return;
        }

        if now.saturating_duration_since(self.session.last_activity) >= self.linger_timeout {
            self.transition(SessionState::Lingering, TransitionReason::Quiet);
        }
    }

    /// Forces the transport down and releases every subscriber, whatever the current state.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.transport.disconnect();
        if self.session.state.is_active() {
            self.transition(SessionState::Disconnected, TransitionReason::DisconnectRequested);
        }
        self.bus.clear();
        info!("Session {}: torn down", self.session.id);
    }
}

impl<T: Transport> Drop for SessionMachine<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
