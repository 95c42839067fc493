//! Connects to every participant announced by the registry.
//!
//! Each peer escalates independently: direct connect, then a registry-relayed request
//! for the peer to dial back, then proxying through the registry. The whole handshake
//! fails as soon as one peer runs out of options.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use indexmap::IndexMap;

use crate::cs_connect_peer::{ConnectPeer, ConnectPeerListener};
use crate::cs_interface::PeerInfo;
use crate::cs_io_context::{IoContext, RawByteStream, Timer};

/// Per-peer progress. Ordered: later stages compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerStage {
    Invalid,
    Failure,
    Direct,
    RemoteConnectRequested,
    RemoteIsConnecting,
    WaitingForReply,
    ReplyReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectStage {
    Invalid,
    Connecting,
    WaitingForAllReplies,
    AllRepliesReceived,
    Failure,
}

/// Notifications about a peer that arrive over the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    RemoteParticipantIsConnecting,
    RemoteParticipantFailedToConnect,
    RemoteParticipantAnnouncement,
    ParticipantAnnouncementReply,
}

/// The ways of reaching a peer, provided by the participant connection.
pub trait ConnectionMethods {
    fn make_connect_peer(&self, peer_info: &PeerInfo) -> ConnectPeer;
    /// Direct link is up: send our announcement and adopt the peer.
    fn handle_connected_peer(&self, peer_info: PeerInfo, stream: Box<dyn RawByteStream>);
    /// True when the peer supports it and the request went out to the registry.
    fn try_remote_connect_request(&self, peer_info: &PeerInfo) -> bool;
    /// True when proxying is enabled and supported, and our announcement was proxied.
    fn try_proxy_connect(&self, peer_info: &PeerInfo) -> bool;
}

pub trait ConnectKnownParticipantsListener {
    fn on_connect_known_participants_waiting_for_all_replies(&self);
    fn on_connect_known_participants_all_replies_received(&self);
    fn on_connect_known_participants_failure(&self, description: String);
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectKnownParticipantsSettings {
    pub remote_connect_request_timeout: Duration,
}

impl Default for ConnectKnownParticipantsSettings {
    fn default() -> Self {
        Self {
            remote_connect_request_timeout: Duration::from_secs(5),
        }
    }
}

struct PeerRecord {
    info: PeerInfo,
    stage: PeerStage,
    /// Dial-back announcement arrived before the registry's is-connecting notice
    announcement_seen: bool,
    failure_reason: String,
    connect_peer: Option<ConnectPeer>,
    timer: Option<Box<dyn Timer>>,
}

impl PeerRecord {
    fn describe(&self) -> String {
        let state = match self.stage {
            PeerStage::Invalid => "has not started connecting".to_string(),
            PeerStage::Failure => format!("has failed{}", self.failure_reason),
            PeerStage::Direct => "is connecting directly".to_string(),
            PeerStage::RemoteConnectRequested => "has requested remote connection".to_string(),
            PeerStage::RemoteIsConnecting => "is connecting remotely".to_string(),
            PeerStage::WaitingForReply => "is waiting for reply".to_string(),
            PeerStage::ReplyReceived => "is connected".to_string(),
        };
        format!(
            "{} ({}) {}",
            self.info.participant_name,
            self.info.acceptor_uris.join(", "),
            state
        )
    }
}

struct Orchestrator {
    self_weak: Weak<Orchestrator>,
    io: Rc<dyn IoContext>,
    methods: Weak<dyn ConnectionMethods>,
    listener: Weak<dyn ConnectKnownParticipantsListener>,
    settings: ConnectKnownParticipantsSettings,
    stage: Cell<ConnectStage>,
    known: RefCell<Option<Vec<PeerInfo>>>,
    peers: RefCell<IndexMap<String, PeerRecord>>,
}

/// Cheap to clone; clones share the same orchestration.
#[derive(Clone)]
pub struct ConnectKnownParticipants {
    inner: Rc<Orchestrator>,
}

impl ConnectKnownParticipants {
    pub fn new(
        io: Rc<dyn IoContext>,
        methods: Weak<dyn ConnectionMethods>,
        listener: Weak<dyn ConnectKnownParticipantsListener>,
        settings: ConnectKnownParticipantsSettings,
    ) -> Self {
        Self {
            inner: Rc::new_cyclic(|self_weak| Orchestrator {
                self_weak: self_weak.clone(),
                io,
                methods,
                listener,
                settings,
                stage: Cell::new(ConnectStage::Invalid),
                known: RefCell::new(None),
                peers: RefCell::new(IndexMap::new()),
            }),
        }
    }

    pub fn set_known_participants(&self, peer_infos: Vec<PeerInfo>) {
        *self.inner.known.borrow_mut() = Some(peer_infos);
    }

    pub fn start_connecting(&self) {
        self.inner.start_connecting();
    }

    /// Unknown names are logged and ignored.
    pub fn handle_peer_event(&self, participant_name: &str, event: PeerEvent) {
        self.inner.handle_peer_event(participant_name, event);
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn describe(&self) -> String {
        self.inner.describe()
    }

    pub fn stage(&self) -> ConnectStage {
        self.inner.stage.get()
    }

    pub fn peer_stage(&self, participant_name: &str) -> Option<PeerStage> {
        self.inner
            .peers
            .borrow()
            .get(participant_name)
            .map(|record| record.stage)
    }

    pub fn knows(&self, participant_name: &str) -> bool {
        self.inner.peers.borrow().contains_key(participant_name)
    }
}

impl Orchestrator {
    fn methods(&self) -> Option<Rc<dyn ConnectionMethods>> {
        self.methods.upgrade()
    }

    fn info_of(&self, name: &str) -> Option<PeerInfo> {
        self.peers.borrow().get(name).map(|record| record.info.clone())
    }

    fn set_stage(&self, name: &str, stage: PeerStage) {
        if let Some(record) = self.peers.borrow_mut().get_mut(name) {
            record.stage = stage;
        }
    }

    fn stage_of(&self, name: &str) -> Option<PeerStage> {
        self.peers.borrow().get(name).map(|record| record.stage)
    }

    fn start_connecting(&self) {
        assert_eq!(self.stage.get(), ConnectStage::Invalid, "start_connecting called twice");
        self.stage.set(ConnectStage::Connecting);

        let known = self.known.borrow_mut().take().unwrap_or_default();
        {
            let mut peers = self.peers.borrow_mut();
            for info in known {
                peers.insert(
                    info.participant_name.clone(),
                    PeerRecord {
                        info,
                        stage: PeerStage::Invalid,
                        announcement_seen: false,
                        failure_reason: String::new(),
                        connect_peer: None,
                        timer: None,
                    },
                );
            }
        }

        let names: Vec<String> = self.peers.borrow().keys().cloned().collect();
        for name in names {
            self.start_peer(&name);
        }

        self.update_stage();
    }

    fn start_peer(&self, name: &str) {
        let (Some(info), Some(methods)) = (self.info_of(name), self.methods()) else {
            return;
        };
        self.set_stage(name, PeerStage::Direct);

        let connect_peer = methods.make_connect_peer(&info);
        let listener = self.self_weak.clone() as Weak<dyn ConnectPeerListener>;
        match connect_peer.async_connect(listener) {
            Ok(()) => {
                if let Some(record) = self.peers.borrow_mut().get_mut(name) {
                    record.connect_peer = Some(connect_peer);
                }
            }
            Err(e) => {
                log::warn!("ConnectKnownParticipants: cannot start connecting to '{}': {}", name, e);
                self.on_connect_peer_failure(info);
            }
        }
    }

    fn handle_peer_event(&self, name: &str, event: PeerEvent) {
        let Some(stage) = self.stage_of(name) else {
            log::warn!("Ignoring event {:?} for peer '{}'", event, name);
            return;
        };

        match event {
            PeerEvent::RemoteParticipantIsConnecting => {
                if stage != PeerStage::RemoteConnectRequested {
                    log::warn!(
                        "Ignoring unexpected remote participant connecting notification from peer '{}' in stage {:?}",
                        name,
                        stage
                    );
                    return;
                }
                let announced = self
                    .peers
                    .borrow()
                    .get(name)
                    .map_or(false, |record| record.announcement_seen);
                if announced {
                    self.remote_connected(name);
                } else {
                    self.set_stage(name, PeerStage::RemoteIsConnecting);
                }
                self.update_stage();
            }
            PeerEvent::RemoteParticipantFailedToConnect => {
                if !matches!(stage, PeerStage::RemoteConnectRequested | PeerStage::RemoteIsConnecting) {
                    log::warn!(
                        "Ignoring unexpected remote participant connection failure notification from peer '{}' in stage {:?}",
                        name,
                        stage
                    );
                    return;
                }
                self.cancel_timer(name);
                self.try_proxy(
                    name,
                    "because direct connection failed, the remote was unable to connect, and proxy-connection is not available",
                );
            }
            PeerEvent::RemoteParticipantAnnouncement => match stage {
                PeerStage::RemoteConnectRequested => {
                    if let Some(record) = self.peers.borrow_mut().get_mut(name) {
                        record.announcement_seen = true;
                    }
                }
                PeerStage::RemoteIsConnecting => {
                    self.remote_connected(name);
                    self.update_stage();
                }
                _ => log::warn!(
                    "Ignoring unexpected remote participant announcement from peer '{}' in stage {:?}",
                    name,
                    stage
                ),
            },
            PeerEvent::ParticipantAnnouncementReply => {
                if stage != PeerStage::WaitingForReply {
                    log::warn!("Ignoring unexpected reply from peer '{}' in stage {:?}", name, stage);
                    return;
                }
                self.set_stage(name, PeerStage::ReplyReceived);
                self.update_stage();
            }
        }
    }

    fn remote_connected(&self, name: &str) {
        self.cancel_timer(name);
        self.set_stage(name, PeerStage::WaitingForReply);
    }

    fn cancel_timer(&self, name: &str) {
        let timer = self
            .peers
            .borrow_mut()
            .get_mut(name)
            .and_then(|record| record.timer.take());
        if let Some(timer) = timer {
            timer.cancel();
        }
    }

    fn on_timer_expired(&self, name: &str) {
        let expired = self
            .peers
            .borrow_mut()
            .get_mut(name)
            .and_then(|record| record.timer.take());
        drop(expired);

        let stage = self.stage_of(name);
        if !matches!(
            stage,
            Some(PeerStage::RemoteConnectRequested | PeerStage::RemoteIsConnecting)
        ) {
            log::debug!(
                "Ignoring expired remote connection request timer for {} in stage {:?}",
                name,
                stage
            );
            return;
        }
        self.try_proxy(
            name,
            "because direct connection failed, remote connections timed out, and proxy-connection is not available",
        );
    }

    fn try_proxy(&self, name: &str, failure_reason: &str) {
        let (Some(info), Some(methods)) = (self.info_of(name), self.methods()) else {
            return;
        };
        self.set_stage(name, PeerStage::WaitingForReply);
        if methods.try_proxy_connect(&info) {
            self.update_stage();
            return;
        }
        self.has_failed(name, failure_reason);
    }

    fn has_failed(&self, name: &str, reason: &str) {
        log::error!("Failed to connect to '{}' {}", name, reason);
        if let Some(record) = self.peers.borrow_mut().get_mut(name) {
            record.failure_reason = format!(" {}", reason);
            record.stage = PeerStage::Failure;
        }
        self.update_stage();
    }

    fn update_stage(&self) {
        let stage = self.stage.get();
        if matches!(
            stage,
            ConnectStage::Invalid | ConnectStage::AllRepliesReceived | ConnectStage::Failure
        ) {
            return;
        }

        let any_failed = self
            .peers
            .borrow()
            .values()
            .any(|record| record.stage == PeerStage::Failure);
        if any_failed {
            self.stage.set(ConnectStage::Failure);
            let description = self.describe();
            if let Some(listener) = self.listener.upgrade() {
                listener.on_connect_known_participants_failure(description);
            }
            return;
        }

        if self.stage.get() == ConnectStage::Connecting {
            let all_waiting = self
                .peers
                .borrow()
                .values()
                .all(|record| record.stage >= PeerStage::WaitingForReply);
            if !all_waiting {
                return;
            }
            self.stage.set(ConnectStage::WaitingForAllReplies);
            if let Some(listener) = self.listener.upgrade() {
                listener.on_connect_known_participants_waiting_for_all_replies();
            }
        }

        if self.stage.get() == ConnectStage::WaitingForAllReplies {
            let all_replied = self
                .peers
                .borrow()
                .values()
                .all(|record| record.stage >= PeerStage::ReplyReceived);
            if !all_replied {
                return;
            }
            self.stage.set(ConnectStage::AllRepliesReceived);
            if let Some(listener) = self.listener.upgrade() {
                listener.on_connect_known_participants_all_replies_received();
            }
        }
    }

    fn shutdown(&self) {
        let mut pending = Vec::new();
        for record in self.peers.borrow_mut().values_mut() {
            pending.push((record.connect_peer.take(), record.timer.take()));
        }
        for (connect_peer, timer) in pending {
            if let Some(connect_peer) = connect_peer {
                connect_peer.shutdown();
            }
            if let Some(timer) = timer {
                timer.cancel();
            }
        }
    }

    fn describe(&self) -> String {
        let peers = self.peers.borrow();
        if peers.is_empty() {
            return "no participants".to_string();
        }
        peers
            .values()
            .map(PeerRecord::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl ConnectPeerListener for Orchestrator {
    fn on_connect_peer_success(&self, peer_info: PeerInfo, stream: Box<dyn RawByteStream>) {
        let name = peer_info.participant_name.clone();
        let connect_peer = {
            let mut peers = self.peers.borrow_mut();
            let Some(record) = peers.get_mut(&name) else { return };
            assert_eq!(
                record.stage,
                PeerStage::Direct,
                "negotiator success for '{}' outside the direct stage",
                name
            );
            record.stage = PeerStage::WaitingForReply;
            record.connect_peer.take()
        };
        drop(connect_peer);

        if let Some(methods) = self.methods() {
            methods.handle_connected_peer(peer_info, stream);
        }
        self.update_stage();
    }

    fn on_connect_peer_failure(&self, peer_info: PeerInfo) {
        let name = peer_info.participant_name.clone();
        let connect_peer = {
            let mut peers = self.peers.borrow_mut();
            let Some(record) = peers.get_mut(&name) else { return };
            assert_eq!(
                record.stage,
                PeerStage::Direct,
                "negotiator failure for '{}' outside the direct stage",
                name
            );
            record.stage = PeerStage::RemoteConnectRequested;
            record.connect_peer.take()
        };
        drop(connect_peer);

        let Some(methods) = self.methods() else { return };
        if methods.try_remote_connect_request(&peer_info) {
            let timer = self.io.make_timer();
            let this = self.self_weak.clone();
            let timer_name = name.clone();
            timer.async_wait_for(
                self.settings.remote_connect_request_timeout,
                Box::new(move || {
                    if let Some(this) = this.upgrade() {
                        this.on_timer_expired(&timer_name);
                    }
                }),
            );
            if let Some(record) = self.peers.borrow_mut().get_mut(&name) {
                record.timer = Some(timer);
            }
            self.update_stage();
            return;
        }

        self.try_proxy(
            &name,
            "because direct connection failed, and both remote-connect, as well as proxy-connection are not available",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs_connect_peer::ConnectPeerOptions;
    use crate::cs_io_context::{Acceptor, Endpoint, SocketOptions};
    use crate::cs_memory_io::MemoryIoContext;
    use std::net::SocketAddr;

    struct MockMethods {
        io: MemoryIoContext,
        remote_connect: Cell<bool>,
        proxy: Cell<bool>,
        calls: RefCell<Vec<String>>,
        streams: RefCell<Vec<Box<dyn RawByteStream>>>,
    }

    impl MockMethods {
        fn new(io: &MemoryIoContext) -> Rc<Self> {
            Rc::new(Self {
                io: io.clone(),
                remote_connect: Cell::new(true),
                proxy: Cell::new(true),
                calls: RefCell::new(Vec::new()),
                streams: RefCell::new(Vec::new()),
            })
        }
    }

    impl ConnectionMethods for MockMethods {
        fn make_connect_peer(&self, peer_info: &PeerInfo) -> ConnectPeer {
            let options = ConnectPeerOptions {
                timeout: Duration::from_millis(500),
                ..ConnectPeerOptions::default()
            };
            ConnectPeer::new(Rc::new(self.io.clone()), peer_info.clone(), options)
        }

        fn handle_connected_peer(&self, peer_info: PeerInfo, stream: Box<dyn RawByteStream>) {
            self.calls
                .borrow_mut()
                .push(format!("connected {}", peer_info.participant_name));
            self.streams.borrow_mut().push(stream);
        }

        fn try_remote_connect_request(&self, peer_info: &PeerInfo) -> bool {
            self.calls
                .borrow_mut()
                .push(format!("remote {}", peer_info.participant_name));
            self.remote_connect.get()
        }

        fn try_proxy_connect(&self, peer_info: &PeerInfo) -> bool {
            self.calls
                .borrow_mut()
                .push(format!("proxy {}", peer_info.participant_name));
            self.proxy.get()
        }
    }

    #[derive(Default)]
    struct Progress {
        events: RefCell<Vec<String>>,
    }

    impl ConnectKnownParticipantsListener for Progress {
        fn on_connect_known_participants_waiting_for_all_replies(&self) {
            self.events.borrow_mut().push("waiting".to_string());
        }
        fn on_connect_known_participants_all_replies_received(&self) {
            self.events.borrow_mut().push("all".to_string());
        }
        fn on_connect_known_participants_failure(&self, description: String) {
            self.events.borrow_mut().push(format!("failure: {}", description));
        }
    }

    struct Fixture {
        io: MemoryIoContext,
        methods: Rc<MockMethods>,
        progress: Rc<Progress>,
        orchestrator: ConnectKnownParticipants,
        _acceptors: Vec<Box<dyn Acceptor>>,
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fixture(peers: Vec<PeerInfo>, listening: &[u16]) -> Fixture {
        let io = MemoryIoContext::new();
        let acceptors = listening
            .iter()
            .map(|port| {
                let endpoint = Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], *port)));
                io.make_acceptor(&endpoint, SocketOptions::default()).unwrap()
            })
            .collect();
        let methods = MockMethods::new(&io);
        let progress = Rc::new(Progress::default());
        let orchestrator = ConnectKnownParticipants::new(
            Rc::new(io.clone()),
            Rc::downgrade(&methods) as Weak<dyn ConnectionMethods>,
            Rc::downgrade(&progress) as Weak<dyn ConnectKnownParticipantsListener>,
            ConnectKnownParticipantsSettings {
                remote_connect_request_timeout: TIMEOUT,
            },
        );
        orchestrator.set_known_participants(peers);
        Fixture {
            io,
            methods,
            progress,
            orchestrator,
            _acceptors: acceptors,
        }
    }

    fn peer(name: &str, port: u16) -> PeerInfo {
        PeerInfo::new(name, vec![format!("tcp://127.0.0.1:{}", port)], String::new())
    }

    fn events(f: &Fixture) -> Vec<String> {
        f.progress.events.borrow().clone()
    }

    #[test]
    fn test_no_known_participants_completes_immediately() {
        let f = fixture(Vec::new(), &[]);
        f.orchestrator.start_connecting();

        assert_eq!(events(&f), vec!["waiting", "all"]);
        assert_eq!(f.orchestrator.stage(), ConnectStage::AllRepliesReceived);
        assert_eq!(f.orchestrator.describe(), "no participants");
    }

    #[test]
    fn test_direct_connections_then_replies() {
        let f = fixture(vec![peer("P2", 2001), peer("P3", 2002)], &[2001, 2002]);
        f.orchestrator.start_connecting();
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::Direct));
        assert!(events(&f).is_empty());

        f.io.run();
        assert_eq!(*f.methods.calls.borrow(), vec!["connected P2", "connected P3"]);
        assert_eq!(f.methods.streams.borrow().len(), 2);
        assert_eq!(events(&f), vec!["waiting"]);

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::ParticipantAnnouncementReply);
        assert_eq!(events(&f), vec!["waiting"]);
        f.orchestrator
            .handle_peer_event("P3", PeerEvent::ParticipantAnnouncementReply);
        assert_eq!(events(&f), vec!["waiting", "all"]);
        assert_eq!(f.orchestrator.peer_stage("P3"), Some(PeerStage::ReplyReceived));
    }

    #[test]
    fn test_remote_connect_is_connecting_then_announcement() {
        let f = fixture(vec![peer("P2", 2001)], &[]);
        f.orchestrator.start_connecting();
        f.io.run_for(Duration::from_secs(1));
        assert_eq!(*f.methods.calls.borrow(), vec!["remote P2"]);
        assert_eq!(
            f.orchestrator.peer_stage("P2"),
            Some(PeerStage::RemoteConnectRequested)
        );

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::RemoteParticipantIsConnecting);
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::RemoteIsConnecting));
        assert!(events(&f).is_empty());

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::RemoteParticipantAnnouncement);
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::WaitingForReply));
        assert_eq!(events(&f), vec!["waiting"]);

        // timer was cancelled: nothing escalates to the proxy later
        f.io.run_for(TIMEOUT * 2);
        assert_eq!(*f.methods.calls.borrow(), vec!["remote P2"]);
        assert_eq!(events(&f), vec!["waiting"]);
    }

    #[test]
    fn test_remote_connect_announcement_then_is_connecting() {
        let f = fixture(vec![peer("P2", 2001)], &[]);
        f.orchestrator.start_connecting();
        f.io.run_for(Duration::from_secs(1));

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::RemoteParticipantAnnouncement);
        assert_eq!(
            f.orchestrator.peer_stage("P2"),
            Some(PeerStage::RemoteConnectRequested)
        );
        assert!(events(&f).is_empty());

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::RemoteParticipantIsConnecting);
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::WaitingForReply));
        assert_eq!(events(&f), vec!["waiting"]);

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::ParticipantAnnouncementReply);
        assert_eq!(events(&f), vec!["waiting", "all"]);
    }

    #[test]
    fn test_remote_failed_to_connect_falls_back_to_proxy() {
        let f = fixture(vec![peer("P2", 2001)], &[]);
        f.orchestrator.start_connecting();
        f.io.run_for(Duration::from_secs(1));

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::RemoteParticipantFailedToConnect);
        assert_eq!(*f.methods.calls.borrow(), vec!["remote P2", "proxy P2"]);
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::WaitingForReply));
        assert_eq!(events(&f), vec!["waiting"]);
    }

    #[test]
    fn test_remote_timeout_without_proxy_fails() {
        let f = fixture(vec![peer("P2", 2001), peer("P3", 2002)], &[2002]);
        f.methods.proxy.set(false);
        f.orchestrator.start_connecting();
        f.io.run();

        assert_eq!(f.orchestrator.stage(), ConnectStage::Failure);
        assert_eq!(
            events(&f),
            vec![
                "failure: P2 (tcp://127.0.0.1:2001) has failed because direct connection failed, \
                 remote connections timed out, and proxy-connection is not available; \
                 P3 (tcp://127.0.0.1:2002) is waiting for reply"
            ]
        );

        // late events do not resurrect the handshake
        f.orchestrator
            .handle_peer_event("P3", PeerEvent::ParticipantAnnouncementReply);
        assert_eq!(events(&f).len(), 1);
    }

    #[test]
    fn test_no_fallback_available_fails() {
        let f = fixture(vec![peer("P2", 2001)], &[]);
        f.methods.remote_connect.set(false);
        f.methods.proxy.set(false);
        f.orchestrator.start_connecting();
        f.io.run();

        assert_eq!(*f.methods.calls.borrow(), vec!["remote P2", "proxy P2"]);
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::Failure));
        assert!(f.orchestrator.describe().ends_with(
            "has failed because direct connection failed, and both remote-connect, \
             as well as proxy-connection are not available"
        ));
    }

    #[test]
    fn test_unexpected_events_are_ignored() {
        let f = fixture(vec![peer("P2", 2001)], &[]);
        f.orchestrator.start_connecting();

        f.orchestrator
            .handle_peer_event("P2", PeerEvent::ParticipantAnnouncementReply);
        f.orchestrator
            .handle_peer_event("P2", PeerEvent::RemoteParticipantIsConnecting);
        f.orchestrator
            .handle_peer_event("Nobody", PeerEvent::RemoteParticipantAnnouncement);
        assert_eq!(f.orchestrator.peer_stage("P2"), Some(PeerStage::Direct));
        assert!(!f.orchestrator.knows("Nobody"));
        assert_eq!(
            f.orchestrator.describe(),
            "P2 (tcp://127.0.0.1:2001) is connecting directly"
        );
    }

    #[test]
    fn test_shutdown_stops_negotiation_and_timers() {
        let f = fixture(vec![peer("P2", 2001)], &[]);
        f.orchestrator.start_connecting();
        f.orchestrator.shutdown();
        f.io.run();

        assert!(f.methods.calls.borrow().is_empty());
        assert!(events(&f).is_empty());
    }
}
