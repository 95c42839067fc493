use std::fmt;
use std::time::{Duration, SystemTime};

// all participant ids share one numeric type to allow casting/interop with the wire format
pub type ParticipantId = u64;

/// Simulation time since the start of the synchronized run (nanosecond resolution).
pub type SimTime = Duration;

pub const REGISTRY_PARTICIPANT_NAME: &str = "SilKitRegistry";
pub const REGISTRY_PARTICIPANT_ID: ParticipantId = 0;

/// Port used for tcp/silkit URIs that do not name one.
pub const DEFAULT_REGISTRY_PORT: u16 = 8500;

/// Derive the stable participant id from its name.
///
/// First 8 bytes of the blake3 digest, little-endian. Id 0 is reserved for the registry,
/// a name hashing to 0 is mapped to 1.
pub fn participant_id(name: &str) -> ParticipantId {
    if name == REGISTRY_PARTICIPANT_NAME {
        return REGISTRY_PARTICIPANT_ID;
    }
    let digest = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    match u64::from_le_bytes(bytes) {
        REGISTRY_PARTICIPANT_ID => 1,
        id => id,
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Peer may be reached through `ProxyMessage` relaying by the registry.
pub const CAPABILITY_PROXY_MESSAGE: &str = "proxy-message";
/// Peer honours relayed `RemoteParticipantConnectRequest`s.
pub const CAPABILITY_REQUEST_PARTICIPANT_CONNECTION: &str = "request-participant-connection";

/// Render a capability list in the flow-sequence form carried by `PeerInfo`.
pub fn format_capabilities(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("\"{}\"", n)).collect();
    format!("[{}]", quoted.join(", "))
}

/// Parse the flow-sequence capability string. Malformed input yields no capabilities.
pub fn parse_capabilities(capabilities: &str) -> Vec<String> {
    if capabilities.trim().is_empty() {
        return Vec::new();
    }
    match serde_yaml::from_str::<Vec<String>>(capabilities) {
        Ok(names) => names,
        Err(e) => {
            log::debug!("ignoring malformed capabilities '{}': {}", capabilities, e);
            Vec::new()
        }
    }
}

// ============================================================================
// Peer Info
// ============================================================================

/// Connection metadata announced by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerInfo {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    /// Ordered connection candidates, e.g. `local:///tmp/p1.sock`, `tcp://10.0.0.2:41234`
    pub acceptor_uris: Vec<String>,
    pub capabilities: String,
}

impl PeerInfo {
    pub fn new(name: &str, acceptor_uris: Vec<String>, capabilities: String) -> Self {
        Self {
            participant_name: name.to_string(),
            participant_id: participant_id(name),
            acceptor_uris,
            capabilities,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        parse_capabilities(&self.capabilities)
            .iter()
            .any(|c| c == capability)
    }

    pub fn is_registry(&self) -> bool {
        self.participant_id == REGISTRY_PARTICIPANT_ID
    }
}

// ============================================================================
// Participant / System State
// ============================================================================

/// Lifecycle state of one participant. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u16)]
pub enum ParticipantState {
    #[default]
    Invalid = 0,
    ServicesCreated = 10,
    CommunicationInitializing = 20,
    CommunicationInitialized = 30,
    ReadyToRun = 40,
    Running = 50,
    Paused = 60,
    Stopping = 70,
    Stopped = 80,
    Error = 90,
    ShuttingDown = 100,
    Shutdown = 110,
    Reinitializing = 120,
    Aborting = 130,
}

impl ParticipantState {
    pub fn from_u16(value: u16) -> Option<Self> {
        use ParticipantState::*;
        Some(match value {
            0 => Invalid,
            10 => ServicesCreated,
            20 => CommunicationInitializing,
            30 => CommunicationInitialized,
            40 => ReadyToRun,
            50 => Running,
            60 => Paused,
            70 => Stopping,
            80 => Stopped,
            90 => Error,
            100 => ShuttingDown,
            110 => Shutdown,
            120 => Reinitializing,
            130 => Aborting,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// No further transitions happen by themselves from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, ParticipantState::Shutdown)
    }
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Aggregate state of the required participants; same value set as `ParticipantState`.
pub type SystemState = ParticipantState;

/// Last announced lifecycle status of a participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantStatus {
    pub participant_name: String,
    pub state: ParticipantState,
    pub enter_reason: String,
    pub enter_time: SystemTime,
    pub refresh_time: SystemTime,
}

impl ParticipantStatus {
    pub fn new(participant_name: &str, state: ParticipantState, reason: &str) -> Self {
        let now = SystemTime::now();
        Self {
            participant_name: participant_name.to_string(),
            state,
            enter_reason: reason.to_string(),
            enter_time: now,
            refresh_time: now,
        }
    }
}

// ============================================================================
// Orchestration Payloads
// ============================================================================

/// Commands issued by the system controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemCommandKind {
    Run = 1,
    Stop = 2,
    Shutdown = 3,
    Restart = 4,
    AbortSimulation = 5,
}

impl SystemCommandKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use SystemCommandKind::*;
        Some(match value {
            1 => Run,
            2 => Stop,
            3 => Shutdown,
            4 => Restart,
            5 => AbortSimulation,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCommand {
    pub kind: SystemCommandKind,
    /// Participant addressed by the command; empty addresses everyone.
    pub target: String,
}

impl SystemCommand {
    pub fn broadcast(kind: SystemCommandKind) -> Self {
        Self {
            kind,
            target: String::new(),
        }
    }

    pub fn applies_to(&self, participant_name: &str) -> bool {
        self.target.is_empty() || self.target == participant_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkflowConfiguration {
    pub required_participant_names: Vec<String>,
}

/// The next step a synchronized participant intends to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextSimTask {
    pub time_point: SimTime,
    pub duration: Duration,
}

/// Pub/sub payload as delivered to subscriber handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessageEvent {
    pub timestamp: SimTime,
    pub topic: String,
    pub source_participant: String,
    pub sequence_number: u64,
    pub data: Vec<u8>,
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by a participant for analysis of simulation runs
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Handshake with a peer completed
    PeerConnected { peer: String, via_proxy: bool },
    /// Peer link torn down
    PeerDisconnected { peer: String },
    /// Lifecycle transition
    StateChanged {
        from: ParticipantState,
        to: ParticipantState,
        reason: String,
    },
    /// Step handler invoked
    StepExecuted { now: SimTime, duration: Duration },
    /// Known-participants handshake failed
    ConnectFailed { description: String },
}

/// Trait for consuming events from a participant
pub trait EventSink {
    fn log(&mut self, participant: &str, event: Event);
}

/// No-op event sink for production use (zero overhead)
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _participant: &str, _event: Event) {}
}
