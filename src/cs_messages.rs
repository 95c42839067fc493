// Message catalogue and length-prefixed framing
//
// Frame layout: u32 total length (including the length field) | u8 kind | payload

use std::time::Duration;

use crate::cs_error::{CsError, Result};
use crate::cs_interface::{
    NextSimTask, ParticipantState, ParticipantStatus, PeerInfo, SystemCommand, SystemCommandKind,
    WorkflowConfiguration,
};
use crate::cs_serdes::{Deserializer, Serializer, WireType};

/// Frames larger than this are treated as corrupt.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    ParticipantAnnouncement = 1,
    ParticipantAnnouncementReply = 2,
    KnownParticipants = 3,
    RemoteParticipantConnectRequest = 4,
    ProxyMessage = 5,
    ParticipantStatus = 20,
    WorkflowConfiguration = 21,
    SystemCommand = 22,
    NextSimTask = 23,
    DataMessage = 30,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MessageKind::*;
        Some(match value {
            1 => ParticipantAnnouncement,
            2 => ParticipantAnnouncementReply,
            3 => KnownParticipants,
            4 => RemoteParticipantConnectRequest,
            5 => ProxyMessage,
            20 => ParticipantStatus,
            21 => WorkflowConfiguration,
            22 => SystemCommand,
            23 => NextSimTask,
            30 => DataMessage,
            _ => return None,
        })
    }
}

// ============================================================================
// Registry / Handshake Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantAnnouncement {
    pub peer_info: PeerInfo,
    pub time_sync_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Failed = 0,
    Success = 1,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantAnnouncementReply {
    pub status: ReplyStatus,
    /// Reason for a failed reply, empty on success
    pub diagnostic: String,
    pub time_sync_active: bool,
}

impl ParticipantAnnouncementReply {
    pub fn success(time_sync_active: bool) -> Self {
        Self {
            status: ReplyStatus::Success,
            diagnostic: String::new(),
            time_sync_active,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Failed,
            diagnostic: diagnostic.into(),
            time_sync_active: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownParticipants {
    pub peer_infos: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteConnectStatus {
    /// Requester -> registry -> target: please connect to me
    Request = 1,
    /// Target -> registry -> requester: connect attempt started
    Connecting = 2,
    /// Target -> registry -> requester: connect attempt failed
    FailedToConnect = 3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParticipantConnectRequest {
    pub peer_unable_to_connect: PeerInfo,
    pub connect_target_peer: PeerInfo,
    pub status: RemoteConnectStatus,
}

/// A complete frame travelling through the registry on behalf of two participants.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyMessage {
    pub source: String,
    pub destination: String,
    pub payload: Vec<u8>,
}

// ============================================================================
// Service Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub topic: String,
    pub media_type: String,
    pub sequence_number: u64,
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// Every message that can travel between two participants.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ParticipantAnnouncement(ParticipantAnnouncement),
    ParticipantAnnouncementReply(ParticipantAnnouncementReply),
    KnownParticipants(KnownParticipants),
    RemoteParticipantConnectRequest(RemoteParticipantConnectRequest),
    ProxyMessage(ProxyMessage),
    ParticipantStatus(ParticipantStatus),
    WorkflowConfiguration(WorkflowConfiguration),
    SystemCommand(SystemCommand),
    NextSimTask(NextSimTask),
    DataMessage(DataMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ParticipantAnnouncement(_) => MessageKind::ParticipantAnnouncement,
            Message::ParticipantAnnouncementReply(_) => MessageKind::ParticipantAnnouncementReply,
            Message::KnownParticipants(_) => MessageKind::KnownParticipants,
            Message::RemoteParticipantConnectRequest(_) => {
                MessageKind::RemoteParticipantConnectRequest
            }
            Message::ProxyMessage(_) => MessageKind::ProxyMessage,
            Message::ParticipantStatus(_) => MessageKind::ParticipantStatus,
            Message::WorkflowConfiguration(_) => MessageKind::WorkflowConfiguration,
            Message::SystemCommand(_) => MessageKind::SystemCommand,
            Message::NextSimTask(_) => MessageKind::NextSimTask,
            Message::DataMessage(_) => MessageKind::DataMessage,
        }
    }

    /// Messages consumed by participant services rather than the connection layer.
    pub fn is_service_message(&self) -> bool {
        matches!(
            self,
            Message::ParticipantStatus(_)
                | Message::WorkflowConfiguration(_)
                | Message::SystemCommand(_)
                | Message::NextSimTask(_)
                | Message::DataMessage(_)
        )
    }

    /// Encode into a complete frame, length prefix included.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut s = Serializer::with_capacity(64);
        s.put_slice(&[0u8; FRAME_HEADER_SIZE]);
        (self.kind() as u8).encode(&mut s);
        match self {
            Message::ParticipantAnnouncement(m) => m.encode(&mut s),
            Message::ParticipantAnnouncementReply(m) => m.encode(&mut s),
            Message::KnownParticipants(m) => m.encode(&mut s),
            Message::RemoteParticipantConnectRequest(m) => m.encode(&mut s),
            Message::ProxyMessage(m) => m.encode(&mut s),
            Message::ParticipantStatus(m) => m.encode(&mut s),
            Message::WorkflowConfiguration(m) => m.encode(&mut s),
            Message::SystemCommand(m) => m.encode(&mut s),
            Message::NextSimTask(m) => m.encode(&mut s),
            Message::DataMessage(m) => m.encode(&mut s),
        }
        let mut frame = s.finish();
        let len = (frame.len() as u32).to_le_bytes();
        frame[..FRAME_HEADER_SIZE].copy_from_slice(&len);
        frame
    }

    /// Decode a complete frame, length prefix included.
    pub fn from_frame(frame: &[u8]) -> Result<Message> {
        if frame.len() < FRAME_HEADER_SIZE + 1 {
            return Err(CsError::protocol(format!("frame of {} bytes is too short", frame.len())));
        }
        let mut d = Deserializer::new(frame);
        let declared = u32::decode(&mut d)? as usize;
        if declared != frame.len() {
            return Err(CsError::protocol(format!(
                "frame length prefix {} does not match frame size {}",
                declared,
                frame.len()
            )));
        }
        let tag = u8::decode(&mut d)?;
        let kind = MessageKind::from_u8(tag)
            .ok_or_else(|| CsError::protocol(format!("unknown message kind {}", tag)))?;
        let message = match kind {
            MessageKind::ParticipantAnnouncement => {
                Message::ParticipantAnnouncement(d.read()?)
            }
            MessageKind::ParticipantAnnouncementReply => {
                Message::ParticipantAnnouncementReply(d.read()?)
            }
            MessageKind::KnownParticipants => Message::KnownParticipants(d.read()?),
            MessageKind::RemoteParticipantConnectRequest => {
                Message::RemoteParticipantConnectRequest(d.read()?)
            }
            MessageKind::ProxyMessage => Message::ProxyMessage(d.read()?),
            MessageKind::ParticipantStatus => Message::ParticipantStatus(d.read()?),
            MessageKind::WorkflowConfiguration => Message::WorkflowConfiguration(d.read()?),
            MessageKind::SystemCommand => Message::SystemCommand(d.read()?),
            MessageKind::NextSimTask => Message::NextSimTask(d.read()?),
            MessageKind::DataMessage => Message::DataMessage(d.read()?),
        };
        d.finish()?;
        Ok(message)
    }
}

// ============================================================================
// Frame Reassembly
// ============================================================================

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete frame, if buffered. A corrupt length prefix is a protocol error.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
        len_bytes.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len <= FRAME_HEADER_SIZE || len > MAX_FRAME_SIZE {
            return Err(CsError::protocol(format!("invalid frame length {}", len)));
        }
        if self.buffer.len() < len {
            return Ok(None);
        }
        let rest = self.buffer.split_off(len);
        Ok(Some(std::mem::replace(&mut self.buffer, rest)))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

// ============================================================================
// Wire Encodings
// ============================================================================

impl WireType for PeerInfo {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.participant_name)
            .write(&self.participant_id)
            .write(&self.acceptor_uris)
            .write(&self.capabilities);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(PeerInfo {
            participant_name: d.read()?,
            participant_id: d.read()?,
            acceptor_uris: d.read()?,
            capabilities: d.read()?,
        })
    }
}

impl WireType for ParticipantState {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.as_u16());
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let raw: u16 = d.read()?;
        ParticipantState::from_u16(raw)
            .ok_or_else(|| CsError::protocol(format!("unknown participant state {}", raw)))
    }
}

impl WireType for ParticipantStatus {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.participant_name)
            .write(&self.state)
            .write(&self.enter_reason)
            .write(&self.enter_time)
            .write(&self.refresh_time);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(ParticipantStatus {
            participant_name: d.read()?,
            state: d.read()?,
            enter_reason: d.read()?,
            enter_time: d.read()?,
            refresh_time: d.read()?,
        })
    }
}

impl WireType for SystemCommandKind {
    fn encode(&self, s: &mut Serializer) {
        s.write(&(*self as u8));
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        let raw: u8 = d.read()?;
        SystemCommandKind::from_u8(raw)
            .ok_or_else(|| CsError::protocol(format!("unknown system command {}", raw)))
    }
}

impl WireType for SystemCommand {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.kind).write(&self.target);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(SystemCommand {
            kind: d.read()?,
            target: d.read()?,
        })
    }
}

impl WireType for WorkflowConfiguration {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.required_participant_names);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(WorkflowConfiguration {
            required_participant_names: d.read()?,
        })
    }
}

impl WireType for NextSimTask {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.time_point).write(&self.duration);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(NextSimTask {
            time_point: d.read()?,
            duration: d.read()?,
        })
    }
}

impl WireType for ParticipantAnnouncement {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.peer_info).write(&self.time_sync_active);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(ParticipantAnnouncement {
            peer_info: d.read()?,
            time_sync_active: d.read()?,
        })
    }
}

impl WireType for ReplyStatus {
    fn encode(&self, s: &mut Serializer) {
        s.write(&(*self as u8));
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        match d.read::<u8>()? {
            0 => Ok(ReplyStatus::Failed),
            1 => Ok(ReplyStatus::Success),
            v => Err(CsError::protocol(format!("unknown reply status {}", v))),
        }
    }
}

impl WireType for ParticipantAnnouncementReply {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.status)
            .write(&self.diagnostic)
            .write(&self.time_sync_active);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(ParticipantAnnouncementReply {
            status: d.read()?,
            diagnostic: d.read()?,
            time_sync_active: d.read()?,
        })
    }
}

impl WireType for KnownParticipants {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.peer_infos);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(KnownParticipants {
            peer_infos: d.read()?,
        })
    }
}

impl WireType for RemoteConnectStatus {
    fn encode(&self, s: &mut Serializer) {
        s.write(&(*self as u8));
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        match d.read::<u8>()? {
            1 => Ok(RemoteConnectStatus::Request),
            2 => Ok(RemoteConnectStatus::Connecting),
            3 => Ok(RemoteConnectStatus::FailedToConnect),
            v => Err(CsError::protocol(format!("unknown remote connect status {}", v))),
        }
    }
}

impl WireType for RemoteParticipantConnectRequest {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.peer_unable_to_connect)
            .write(&self.connect_target_peer)
            .write(&self.status);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(RemoteParticipantConnectRequest {
            peer_unable_to_connect: d.read()?,
            connect_target_peer: d.read()?,
            status: d.read()?,
        })
    }
}

impl WireType for ProxyMessage {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.source)
            .write(&self.destination)
            .write(&self.payload);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(ProxyMessage {
            source: d.read()?,
            destination: d.read()?,
            payload: d.read()?,
        })
    }
}

impl WireType for DataMessage {
    fn encode(&self, s: &mut Serializer) {
        s.write(&self.topic)
            .write(&self.media_type)
            .write(&self.sequence_number)
            .write(&self.timestamp)
            .write(&self.data);
    }

    fn decode(d: &mut Deserializer<'_>) -> Result<Self> {
        Ok(DataMessage {
            topic: d.read()?,
            media_type: d.read()?,
            sequence_number: d.read()?,
            timestamp: d.read()?,
            data: d.read()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs_interface::format_capabilities;
    use std::time::UNIX_EPOCH;

    fn sample_peer_info() -> PeerInfo {
        PeerInfo::new(
            "P1",
            vec![
                "local:///tmp/p1.sock".to_string(),
                "tcp://127.0.0.1:40001".to_string(),
            ],
            format_capabilities(&["proxy-message"]),
        )
    }

    #[test]
    fn test_frame_layout() {
        let frame = Message::NextSimTask(NextSimTask {
            time_point: Duration::from_millis(1),
            duration: Duration::from_millis(1),
        })
        .to_frame();

        // 4 length + 1 kind + 2 * 8 durations
        assert_eq!(frame.len(), 21);
        assert_eq!(&frame[..4], &21u32.to_le_bytes());
        assert_eq!(frame[4], MessageKind::NextSimTask as u8);
    }

    #[test]
    fn test_handshake_messages_survive_framing() {
        let messages = vec![
            Message::ParticipantAnnouncement(ParticipantAnnouncement {
                peer_info: sample_peer_info(),
                time_sync_active: true,
            }),
            Message::ParticipantAnnouncementReply(ParticipantAnnouncementReply::failed(
                "participant with name 'P1' already exists",
            )),
            Message::KnownParticipants(KnownParticipants {
                peer_infos: vec![sample_peer_info(), PeerInfo::new("P2", vec![], String::new())],
            }),
            Message::RemoteParticipantConnectRequest(RemoteParticipantConnectRequest {
                peer_unable_to_connect: sample_peer_info(),
                connect_target_peer: PeerInfo::new("P2", vec![], String::new()),
                status: RemoteConnectStatus::Connecting,
            }),
            Message::ProxyMessage(ProxyMessage {
                source: "P1".to_string(),
                destination: "P2".to_string(),
                payload: vec![1, 2, 3],
            }),
        ];

        for message in messages {
            let decoded = Message::from_frame(&message.to_frame()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_service_messages_survive_framing() {
        let t = UNIX_EPOCH + Duration::from_micros(1_700_000_000_000_001);
        let status = ParticipantStatus {
            participant_name: "P1".to_string(),
            state: ParticipantState::Running,
            enter_reason: "Run command".to_string(),
            enter_time: t,
            refresh_time: t,
        };
        let messages = vec![
            Message::ParticipantStatus(status),
            Message::WorkflowConfiguration(WorkflowConfiguration {
                required_participant_names: vec!["P1".to_string(), "P2".to_string()],
            }),
            Message::SystemCommand(SystemCommand::broadcast(SystemCommandKind::AbortSimulation)),
            Message::DataMessage(DataMessage {
                topic: "Topic1".to_string(),
                media_type: "application/octet-stream".to_string(),
                sequence_number: 0,
                timestamp: Duration::from_millis(3),
                data: b"Topic1_from_Pub1 LocalMsgId=0".to_vec(),
            }),
        ];

        for message in messages {
            assert!(message.is_service_message());
            let decoded = Message::from_frame(&message.to_frame()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_frame_decoder_reassembles_split_input() {
        let a = Message::SystemCommand(SystemCommand::broadcast(SystemCommandKind::Run)).to_frame();
        let b = Message::KnownParticipants(KnownParticipants { peer_infos: vec![] }).to_frame();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        // feed byte by byte
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![a, b]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_corrupt_frames_are_protocol_errors() {
        // unknown kind
        let mut frame = Message::SystemCommand(SystemCommand::broadcast(SystemCommandKind::Run)).to_frame();
        frame[4] = 99;
        assert!(matches!(Message::from_frame(&frame), Err(CsError::Protocol(_))));

        // unknown enum value inside the payload
        let mut frame = Message::SystemCommand(SystemCommand::broadcast(SystemCommandKind::Run)).to_frame();
        frame[5] = 42;
        assert!(matches!(Message::from_frame(&frame), Err(CsError::Protocol(_))));

        // zero length prefix in the stream
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 0, 0, 0, 1]);
        assert!(matches!(decoder.next_frame(), Err(CsError::Protocol(_))));
    }
}
