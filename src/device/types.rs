use std::fmt;
use indexmap::IndexSet;
use tokio::time::Instant;

/// Opaque identifier of a discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/**
 * Identifies one DeviceSession. Every new connect request allocates the next id, transport facts
 * carry the id of the session they belong to.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next(self) -> SessionId {
        SessionId(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Power/authorization state of the platform radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        *self == RadioState::PoweredOn
    }

    /// Resetting and Unknown are transient and say nothing about availability.
    pub fn is_unusable(&self) -> bool {
        matches!(self, RadioState::PoweredOff | RadioState::Unauthorized | RadioState::Unsupported)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            RadioState::Unknown => "unknown",
            RadioState::Resetting => "resetting",
            RadioState::Unsupported => "unsupported",
            RadioState::Unauthorized => "unauthorized",
            RadioState::PoweredOff => "powered off",
            RadioState::PoweredOn => "powered on",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    BluetoothOff,
    Discovering,
    Connecting,
    Connected,
    Lingering,
    Disconnected,
    ConnectionFailed,
}

/// What a consumer should offer the user in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Connect,
    Disconnect,
}

impl fmt::Display for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserAction::Connect => write!(f, "Connect"),
            UserAction::Disconnect => write!(f, "Disconnect"),
        }
    }
}

impl SessionState {
    pub fn status(&self) -> &'static str {
        match self {
            SessionState::None => "None",
            SessionState::BluetoothOff => "Bluetooth is Off",
            SessionState::Discovering => "Discovering",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Lingering => "Lingering",
            SessionState::Disconnected => "Disconnected",
            SessionState::ConnectionFailed => "Failed",
        }
    }

    /// States in which a device has been chosen and a link exists or is being set up.
    pub fn has_selected_device(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected | SessionState::Lingering)
    }

    /// States in which a connect attempt is in progress or established.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Discovering) || self.has_selected_device()
    }

    /// A session that reached a terminal state can not be revived, only replaced.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::ConnectionFailed)
    }

    pub fn action(&self) -> UserAction {
        if self.is_active() { UserAction::Disconnect } else { UserAction::Connect }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeadingSample {
    /// Fused heading in degrees, [0, 360)
    pub angle_degrees: f32,
    pub timestamp: Instant,
}

impl HeadingSample {
    pub fn new(angle_degrees: f32, timestamp: Instant) -> Self {
        HeadingSample { angle_degrees, timestamp }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoDevicesFound,
    ScanFailed(String),
    LinkFailed(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoDevicesFound => write!(f, "no headset found"),
            FailureReason::ScanFailed(message) => write!(f, "scan failed: {}", message),
            FailureReason::LinkFailed(message) => write!(f, "link failed: {}", message),
        }
    }
}

/// Why the state machine moved from one state to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    SessionReset,
    ConnectRequested,
    DeviceFound,
    DeviceSelected,
    LinkEstablished,
    Quiet,
    ActivityResumed,
    DisconnectRequested,
    LinkLost,
    Failed(FailureReason),
    RadioUnavailable(RadioState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub session: SessionId,
    pub previous: SessionState,
    pub state: SessionState,
    pub reason: TransitionReason,
    pub device: Option<DeviceId>,
}

impl ConnectionEvent {
    /// Human readable status line, suitable for display as-is.
    pub fn status(&self) -> String {
        match (&self.reason, &self.device) {
            (TransitionReason::Failed(reason), _) => format!("{} ({})", self.state.status(), reason),
            (TransitionReason::RadioUnavailable(radio), _) => format!("{} (radio {})", self.state.status(), radio),
            (TransitionReason::LinkLost, _) => format!("{} (link lost)", self.state.status()),
            (_, Some(device)) if self.state.has_selected_device() => format!("{} ({})", self.state.status(), device),
            _ => self.state.status().to_string(),
        }
    }
}

/// Everything published on the event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChange(ConnectionEvent),
    AmbiguousDevices(Vec<DeviceId>),
    RadioState(RadioState),
    Heading(HeadingSample),
}

/// Facts reported by a transport to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    RadioStateChanged(RadioState),
    Discovered { session: SessionId, candidates: IndexSet<DeviceId> },
    Connected { session: SessionId, device: DeviceId },
    ConnectionFailed { session: SessionId, reason: FailureReason },
    Disconnected { session: SessionId },
    Heading { session: SessionId, sample: HeadingSample },
}
