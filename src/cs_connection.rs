//! Participant side of the network: joining through the registry and keeping the peer mesh.
//!
//! A [`Connection`] opens the participant's acceptors, registers with the registry,
//! connects to every already registered participant (see
//! [`crate::cs_known_participants`]) and afterwards answers announcements of
//! participants joining later. Service messages are routed to a [`ServiceReceiver`];
//! services send through the [`MessageSender`] trait.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::cs_config::ParticipantConfiguration;
use crate::cs_connect_peer::{ConnectPeer, ConnectPeerListener, ConnectPeerOptions};
use crate::cs_error::{CsError, Result};
use crate::cs_interface::{
    format_capabilities, PeerInfo, CAPABILITY_PROXY_MESSAGE, CAPABILITY_REQUEST_PARTICIPANT_CONNECTION,
    REGISTRY_PARTICIPANT_NAME,
};
use crate::cs_io_context::{Acceptor, Endpoint, IoContext, RawByteStream};
use crate::cs_known_participants::{
    ConnectKnownParticipants, ConnectKnownParticipantsListener, ConnectKnownParticipantsSettings,
    ConnectionMethods, PeerEvent, PeerStage,
};
use crate::cs_messages::{
    Message, ParticipantAnnouncement, ParticipantAnnouncementReply, ProxyMessage, ReplyStatus,
    RemoteConnectStatus, RemoteParticipantConnectRequest,
};
use crate::cs_peer::{Peer, PeerId, PeerListener};
use crate::cs_registry::registry_local_socket_path;
use crate::cs_uri::{local_socket_path, Uri};

// ============================================================================
// Service Seams
// ============================================================================

/// Outbound path for participant services.
pub trait MessageSender {
    /// Send to every connected participant.
    fn broadcast(&self, message: &Message);
    /// Send to one participant; unknown names are logged and dropped.
    fn send_to(&self, participant_name: &str, message: &Message);
}

/// A participant whose announcement handshake completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub name: String,
    pub time_sync_active: bool,
    pub via_proxy: bool,
}

/// Inbound path for participant services.
pub trait ServiceReceiver {
    fn on_service_message(&self, from: &str, message: Message);
    fn on_peer_connected(&self, peer: &ConnectedPeer);
    fn on_peer_disconnected(&self, participant_name: &str);
}

pub type JoinHandler = Box<dyn FnOnce(Result<()>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    Joining,
    Joined,
    Failed,
}

// ============================================================================
// Peer Table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct(PeerId),
    /// Wrapped in ProxyMessages through the registry
    Proxy,
}

struct RemotePeer {
    route: Route,
    info: PeerInfo,
    time_sync_active: bool,
    /// Our announcement went out on this route
    announced: bool,
    /// Services were told about this peer
    established: bool,
}

// ============================================================================
// Connection
// ============================================================================

/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnectionInner>,
}

struct ConnectionInner {
    self_weak: Weak<ConnectionInner>,
    io: Rc<dyn IoContext>,
    config: ParticipantConfiguration,
    own_info: RefCell<PeerInfo>,
    time_sync_active: Cell<bool>,
    receiver: RefCell<Option<Weak<dyn ServiceReceiver>>>,
    join_state: Cell<JoinState>,
    join_handler: RefCell<Option<JoinHandler>>,
    acceptors: RefCell<Vec<Box<dyn Acceptor>>>,
    links: RefCell<IndexMap<PeerId, Peer>>,
    registry: Cell<Option<PeerId>>,
    registry_negotiator: RefCell<Option<ConnectPeer>>,
    /// Negotiators dialing back participants that asked us to connect
    remote_negotiators: RefCell<IndexMap<String, ConnectPeer>>,
    peers: RefCell<IndexMap<String, RemotePeer>>,
    orchestrator: RefCell<Option<ConnectKnownParticipants>>,
    next_peer_id: Cell<u64>,
    shut_down: Cell<bool>,
}

impl Connection {
    pub fn new(io: Rc<dyn IoContext>, config: ParticipantConfiguration) -> Self {
        Self {
            inner: Rc::new_cyclic(|self_weak| ConnectionInner {
                self_weak: self_weak.clone(),
                io,
                config,
                own_info: RefCell::new(PeerInfo::default()),
                time_sync_active: Cell::new(false),
                receiver: RefCell::new(None),
                join_state: Cell::new(JoinState::Idle),
                join_handler: RefCell::new(None),
                acceptors: RefCell::new(Vec::new()),
                links: RefCell::new(IndexMap::new()),
                registry: Cell::new(None),
                registry_negotiator: RefCell::new(None),
                remote_negotiators: RefCell::new(IndexMap::new()),
                peers: RefCell::new(IndexMap::new()),
                orchestrator: RefCell::new(None),
                next_peer_id: Cell::new(1),
                shut_down: Cell::new(false),
            }),
        }
    }

    pub fn participant_name(&self) -> &str {
        &self.inner.config.participant_name
    }

    pub fn set_service_receiver(&self, receiver: Weak<dyn ServiceReceiver>) {
        *self.inner.receiver.borrow_mut() = Some(receiver);
    }

    /// Advertised in announcements and replies; set before joining.
    pub fn set_time_sync_active(&self, active: bool) {
        self.inner.time_sync_active.set(active);
    }

    /// Starts joining; `on_joined` runs once with the outcome.
    ///
    /// Failing to open any acceptor is reported right away as an error; everything
    /// later is reported through `on_joined`.
    pub fn join_simulation(&self, on_joined: JoinHandler) -> Result<()> {
        self.inner.join_simulation(on_joined)
    }

    pub fn join_state(&self) -> JoinState {
        self.inner.join_state.get()
    }

    /// Our own announced connection metadata, valid once joining started.
    pub fn peer_info(&self) -> PeerInfo {
        self.inner.own_info.borrow().clone()
    }

    /// Names of participants with an established handshake, in connection order.
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner
            .peers
            .borrow()
            .iter()
            .filter(|(_, peer)| peer.established)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_proxied(&self, participant_name: &str) -> bool {
        self.inner
            .peers
            .borrow()
            .get(participant_name)
            .map_or(false, |peer| peer.route == Route::Proxy)
    }

    /// Progress of the known-participants handshake, for diagnostics.
    pub fn describe_known_participants(&self) -> String {
        match self.inner.orchestrator() {
            Some(orchestrator) => orchestrator.describe(),
            None => "known participants not yet received".to_string(),
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl MessageSender for Connection {
    fn broadcast(&self, message: &Message) {
        self.inner.broadcast(message);
    }

    fn send_to(&self, participant_name: &str, message: &Message) {
        self.inner.send_to(participant_name, message);
    }
}

impl ConnectionInner {
    fn own_name(&self) -> &str {
        &self.config.participant_name
    }

    fn orchestrator(&self) -> Option<ConnectKnownParticipants> {
        self.orchestrator.borrow().clone()
    }

    fn receiver(&self) -> Option<Rc<dyn ServiceReceiver>> {
        self.receiver.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn link(&self, id: PeerId) -> Option<Peer> {
        self.links.borrow().get(&id).cloned()
    }

    fn registry_link(&self) -> Option<Peer> {
        self.registry.get().and_then(|id| self.link(id))
    }

    fn connect_options(&self) -> ConnectPeerOptions {
        let middleware = &self.config.middleware;
        ConnectPeerOptions {
            attempts: middleware.connect_passes(),
            timeout: middleware.connect_timeout(),
            enable_domain_sockets: middleware.enable_domain_sockets,
            socket_options: middleware.socket_options(),
        }
    }

    fn announcement(&self) -> Message {
        Message::ParticipantAnnouncement(ParticipantAnnouncement {
            peer_info: self.own_info.borrow().clone(),
            time_sync_active: self.time_sync_active.get(),
        })
    }

    // ------------------------------------------------------------------------
    // Joining
    // ------------------------------------------------------------------------

    fn join_simulation(&self, on_joined: JoinHandler) -> Result<()> {
        if self.join_state.get() != JoinState::Idle {
            return Err(CsError::invalid_state(format!(
                "participant '{}' already joined or is joining",
                self.own_name()
            )));
        }
        let registry_uri = self.config.registry()?;

        let acceptor_uris = self.open_acceptors()?;
        let mut capabilities = Vec::new();
        if self.config.middleware.registry_as_fallback_proxy {
            capabilities.push(CAPABILITY_PROXY_MESSAGE);
        }
        if self.config.middleware.experimental_remote_participant_connection {
            capabilities.push(CAPABILITY_REQUEST_PARTICIPANT_CONNECTION);
        }
        *self.own_info.borrow_mut() = PeerInfo::new(
            self.own_name(),
            acceptor_uris,
            format_capabilities(&capabilities),
        );

        let mut registry_uris = Vec::new();
        if self.config.middleware.enable_domain_sockets {
            registry_uris.push(Uri::local(registry_local_socket_path(registry_uri.port())).to_string());
        }
        registry_uris.push(Uri::tcp(registry_uri.host(), registry_uri.port()).to_string());
        let registry_info = PeerInfo::new(REGISTRY_PARTICIPANT_NAME, registry_uris, String::new());

        log::info!(
            "Connection: '{}' joining through registry {} with acceptors {:?}",
            self.own_name(),
            registry_uri,
            self.own_info.borrow().acceptor_uris
        );

        *self.join_handler.borrow_mut() = Some(on_joined);
        self.join_state.set(JoinState::Joining);

        let negotiator = ConnectPeer::new(self.io.clone(), registry_info, self.connect_options());
        let listener = self.self_weak.clone() as Weak<dyn ConnectPeerListener>;
        negotiator.async_connect(listener)?;
        *self.registry_negotiator.borrow_mut() = Some(negotiator);
        Ok(())
    }

    /// Opens the configured acceptors and returns the URIs they are bound to.
    fn open_acceptors(&self) -> Result<Vec<String>> {
        let socket_options = self.config.middleware.socket_options();
        let mut tcp_uris = Vec::new();
        let mut local_uris = Vec::new();

        for raw in &self.config.acceptor_uris {
            let uri = Uri::parse(raw)?;
            let endpoints: Vec<Endpoint> = if uri.is_local() {
                vec![Endpoint::Local(uri.path().into())]
            } else {
                self.io
                    .resolve(uri.bare_host(), uri.port())
                    .into_iter()
                    .take(1)
                    .map(Endpoint::Tcp)
                    .collect()
            };
            if endpoints.is_empty() {
                log::warn!("Connection: cannot resolve acceptor uri {}", uri);
            }
            for endpoint in endpoints {
                match self.io.make_acceptor(&endpoint, socket_options) {
                    Ok(acceptor) => {
                        let bound = acceptor.local_endpoint();
                        log::debug!("Connection: '{}' accepting on {}", self.own_name(), bound);
                        if bound.is_local() {
                            local_uris.push(bound.to_string());
                        } else {
                            tcp_uris.push(bound.to_string());
                        }
                        self.add_acceptor(acceptor);
                    }
                    Err(e) => log::warn!("Connection: cannot accept on {}: {}", endpoint, e),
                }
            }
        }

        if self.config.middleware.enable_domain_sockets {
            let unique = tcp_uris
                .first()
                .cloned()
                .unwrap_or_else(|| std::process::id().to_string());
            let path = local_socket_path(self.own_name(), &unique);
            match self
                .io
                .make_acceptor(&Endpoint::Local(path.clone()), socket_options)
            {
                Ok(acceptor) => {
                    local_uris.push(acceptor.local_endpoint().to_string());
                    self.add_acceptor(acceptor);
                }
                Err(e) => log::warn!(
                    "Connection: cannot accept on local://{}: {}",
                    path.display(),
                    e
                ),
            }
        }

        if tcp_uris.is_empty() && local_uris.is_empty() {
            return Err(CsError::connection(format!(
                "participant '{}' could not open any acceptor",
                self.own_name()
            )));
        }
        local_uris.extend(tcp_uris);
        Ok(local_uris)
    }

    fn add_acceptor(&self, acceptor: Box<dyn Acceptor>) {
        let index = {
            let mut acceptors = self.acceptors.borrow_mut();
            acceptors.push(acceptor);
            acceptors.len() - 1
        };
        self.accept_next(index);
    }

    fn accept_next(&self, index: usize) {
        if self.shut_down.get() {
            return;
        }
        let this = self.self_weak.clone();
        let acceptors = self.acceptors.borrow();
        let Some(acceptor) = acceptors.get(index) else { return };
        let issued = acceptor.async_accept(
            None,
            Box::new(move |result| {
                let Some(this) = this.upgrade() else { return };
                match result {
                    Ok(stream) => {
                        let link = this.add_link(stream);
                        log::debug!(
                            "Connection: '{}' accepted link {} from {}",
                            this.own_name(),
                            link.id(),
                            link.remote_address()
                        );
                        this.accept_next(index);
                    }
                    Err(CsError::Cancelled) => {}
                    Err(e) => {
                        log::warn!("Connection: accept failed: {}", e);
                        this.accept_next(index);
                    }
                }
            }),
        );
        if let Err(e) = issued {
            log::error!("Connection: cannot accept: {}", e);
        }
    }

    fn add_link(&self, stream: Box<dyn RawByteStream>) -> Peer {
        let id = PeerId(self.next_peer_id.get());
        self.next_peer_id.set(id.0 + 1);
        let listener = self.self_weak.clone() as Weak<dyn PeerListener>;
        let link = Peer::new(id, stream, listener);
        self.links.borrow_mut().insert(id, link.clone());
        link.start_reading();
        link
    }

    fn complete_join(&self, result: Result<()>) {
        if self.join_state.get() != JoinState::Joining {
            return;
        }
        match &result {
            Ok(()) => {
                log::info!("Connection: '{}' joined the simulation", self.own_name());
                self.join_state.set(JoinState::Joined);
            }
            Err(e) => {
                log::error!("Connection: '{}' failed to join: {}", self.own_name(), e);
                self.join_state.set(JoinState::Failed);
            }
        }
        let handler = self.join_handler.borrow_mut().take();
        if let Some(handler) = handler {
            handler(result);
        }
    }

    fn on_registry_connected(&self, stream: Box<dyn RawByteStream>) {
        let negotiator = self.registry_negotiator.borrow_mut().take();
        drop(negotiator);

        let link = self.add_link(stream);
        link.set_info(PeerInfo::new(REGISTRY_PARTICIPANT_NAME, Vec::new(), String::new()));
        self.registry.set(Some(link.id()));
        log::debug!(
            "Connection: '{}' connected to the registry at {}",
            self.own_name(),
            link.remote_address()
        );
        link.send(&self.announcement());
    }

    fn on_registry_message(&self, message: Message) {
        match message {
            Message::ParticipantAnnouncementReply(reply) => match reply.status {
                ReplyStatus::Success => {
                    log::debug!("Connection: '{}' registered", self.own_name())
                }
                ReplyStatus::Failed => self.complete_join(Err(CsError::protocol(format!(
                    "registry rejected participant '{}': {}",
                    self.own_name(),
                    reply.diagnostic
                )))),
            },
            Message::KnownParticipants(known) => self.on_known_participants(known.peer_infos),
            Message::RemoteParticipantConnectRequest(request) => {
                self.on_remote_connect_request(request)
            }
            Message::ProxyMessage(proxy) => self.on_proxy_message(proxy),
            other => log::warn!(
                "Connection: ignoring {:?} message from the registry",
                other.kind()
            ),
        }
    }

    fn on_known_participants(&self, peer_infos: Vec<PeerInfo>) {
        if self.orchestrator.borrow().is_some() {
            log::warn!("Connection: ignoring repeated known participants list");
            return;
        }
        let own_name = self.own_name().to_string();
        let peer_infos: Vec<PeerInfo> = peer_infos
            .into_iter()
            .filter(|info| info.participant_name != own_name)
            .collect();
        log::debug!(
            "Connection: '{}' connecting to {} known participants",
            own_name,
            peer_infos.len()
        );

        let orchestrator = ConnectKnownParticipants::new(
            self.io.clone(),
            self.self_weak.clone() as Weak<dyn ConnectionMethods>,
            self.self_weak.clone() as Weak<dyn ConnectKnownParticipantsListener>,
            ConnectKnownParticipantsSettings {
                remote_connect_request_timeout: self.config.middleware.remote_connect_request_timeout(),
            },
        );
        orchestrator.set_known_participants(peer_infos);
        *self.orchestrator.borrow_mut() = Some(orchestrator.clone());
        orchestrator.start_connecting();
    }

    // ------------------------------------------------------------------------
    // Peer messages
    // ------------------------------------------------------------------------

    fn on_link_message(&self, id: PeerId, message: Message) {
        if Some(id) == self.registry.get() {
            self.on_registry_message(message);
            return;
        }
        match message {
            Message::ParticipantAnnouncement(announcement) => {
                self.on_announcement(Route::Direct(id), announcement)
            }
            other => {
                let name = self.link(id).map(|link| link.name()).unwrap_or_default();
                if name.is_empty() {
                    log::warn!(
                        "Connection: ignoring {:?} on link {} before its announcement",
                        other.kind(),
                        id
                    );
                    return;
                }
                self.on_peer_message(&name, other);
            }
        }
    }

    /// Messages from a named participant, direct or proxied.
    fn on_peer_message(&self, from: &str, message: Message) {
        match message {
            Message::ParticipantAnnouncementReply(reply) => self.on_reply(from, reply),
            message if message.is_service_message() => {
                if !self.peers.borrow().contains_key(from) {
                    log::warn!(
                        "Connection: ignoring {:?} from unknown participant '{}'",
                        message.kind(),
                        from
                    );
                    return;
                }
                if let Some(receiver) = self.receiver() {
                    receiver.on_service_message(from, message);
                }
            }
            other => log::warn!(
                "Connection: ignoring {:?} from participant '{}'",
                other.kind(),
                from
            ),
        }
    }

    fn reply_via(&self, route: Route, name: &str, reply: ParticipantAnnouncementReply) {
        let message = Message::ParticipantAnnouncementReply(reply);
        match route {
            Route::Direct(id) => {
                if let Some(link) = self.link(id) {
                    link.send(&message);
                }
            }
            Route::Proxy => self.send_proxied(name, message.to_frame()),
        }
    }

    fn on_announcement(&self, route: Route, announcement: ParticipantAnnouncement) {
        let info = announcement.peer_info;
        let name = info.participant_name.clone();

        if name == self.own_name() || name.is_empty() || info.is_registry() {
            log::warn!("Connection: rejecting announcement of '{}'", name);
            self.reply_via(
                route,
                &name,
                ParticipantAnnouncementReply::failed(format!("the name '{}' is not allowed", name)),
            );
            return;
        }

        let existing = self.peers.borrow().get(&name).map(|peer| peer.route);
        match existing {
            // our own dial-back link: the requester announces itself in turn
            Some(existing) if existing == route => {
                self.reply_via(route, &name, ParticipantAnnouncementReply::success(self.time_sync_active.get()));
                return;
            }
            Some(_) => {
                log::warn!(
                    "Connection: rejecting announcement of '{}', a participant with this name is already connected",
                    name
                );
                self.reply_via(
                    route,
                    &name,
                    ParticipantAnnouncementReply::failed(format!(
                        "a participant with the name '{}' is already connected to '{}'",
                        name,
                        self.own_name()
                    )),
                );
                return;
            }
            None => {}
        }

        if let Route::Direct(id) = route {
            if let Some(link) = self.link(id) {
                link.set_info(info.clone());
            }
        }
        self.peers.borrow_mut().insert(
            name.clone(),
            RemotePeer {
                route,
                info,
                time_sync_active: announcement.time_sync_active,
                announced: false,
                established: false,
            },
        );
        self.reply_via(route, &name, ParticipantAnnouncementReply::success(self.time_sync_active.get()));
        self.establish(&name);

        if let Some(orchestrator) = self.orchestrator() {
            if orchestrator.knows(&name) {
                orchestrator.handle_peer_event(&name, PeerEvent::RemoteParticipantAnnouncement);
                self.announce_if_waiting(&name);
            }
        }
    }

    fn on_reply(&self, from: &str, reply: ParticipantAnnouncementReply) {
        if reply.status == ReplyStatus::Failed {
            log::error!(
                "Connection: participant '{}' rejected our announcement: {}",
                from,
                reply.diagnostic
            );
            let expected = self.orchestrator().map_or(false, |o| o.knows(from));
            if expected {
                self.complete_join(Err(CsError::protocol(format!(
                    "participant '{}' rejected the announcement of '{}': {}",
                    from,
                    self.own_name(),
                    reply.diagnostic
                ))));
            }
            return;
        }

        {
            let mut peers = self.peers.borrow_mut();
            let Some(peer) = peers.get_mut(from) else {
                log::warn!("Connection: ignoring reply from unknown participant '{}'", from);
                return;
            };
            peer.time_sync_active = reply.time_sync_active;
        }
        self.establish(from);

        if let Some(orchestrator) = self.orchestrator() {
            if orchestrator.knows(from) {
                orchestrator.handle_peer_event(from, PeerEvent::ParticipantAnnouncementReply);
            }
        }
    }

    /// Tells services about a peer once its handshake data is known.
    fn establish(&self, name: &str) {
        let connected = {
            let mut peers = self.peers.borrow_mut();
            let Some(peer) = peers.get_mut(name) else { return };
            if peer.established {
                return;
            }
            peer.established = true;
            ConnectedPeer {
                name: name.to_string(),
                time_sync_active: peer.time_sync_active,
                via_proxy: peer.route == Route::Proxy,
            }
        };
        log::info!(
            "Connection: '{}' connected to '{}'{}",
            self.own_name(),
            name,
            if connected.via_proxy { " through the registry" } else { "" }
        );
        if let Some(receiver) = self.receiver() {
            receiver.on_peer_connected(&connected);
        }
    }

    /// After a dial-back completed, the requester owes the peer its own announcement.
    fn announce_if_waiting(&self, name: &str) {
        let waiting = self
            .orchestrator()
            .and_then(|o| o.peer_stage(name))
            .map_or(false, |stage| stage == PeerStage::WaitingForReply);
        if !waiting {
            return;
        }
        let route = {
            let mut peers = self.peers.borrow_mut();
            match peers.get_mut(name) {
                Some(peer) if !peer.announced => {
                    peer.announced = true;
                    peer.route
                }
                _ => return,
            }
        };
        if let Route::Direct(id) = route {
            if let Some(link) = self.link(id) {
                link.send(&self.announcement());
            }
        }
    }

    fn remove_peer(&self, name: &str) {
        let removed = self.peers.borrow_mut().shift_remove(name);
        let Some(peer) = removed else { return };
        log::info!("Connection: '{}' lost connection to '{}'", self.own_name(), name);
        if peer.established {
            if let Some(receiver) = self.receiver() {
                receiver.on_peer_disconnected(name);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Remote connect
    // ------------------------------------------------------------------------

    fn on_remote_connect_request(&self, request: RemoteParticipantConnectRequest) {
        match request.status {
            RemoteConnectStatus::Request => self.dial_back(request),
            RemoteConnectStatus::Connecting => {
                let target = request.connect_target_peer.participant_name;
                if let Some(orchestrator) = self.orchestrator() {
                    orchestrator.handle_peer_event(&target, PeerEvent::RemoteParticipantIsConnecting);
                }
                self.announce_if_waiting(&target);
            }
            RemoteConnectStatus::FailedToConnect => {
                let target = request.connect_target_peer.participant_name;
                if let Some(orchestrator) = self.orchestrator() {
                    orchestrator
                        .handle_peer_event(&target, PeerEvent::RemoteParticipantFailedToConnect);
                }
            }
        }
    }

    fn dial_back(&self, request: RemoteParticipantConnectRequest) {
        if request.connect_target_peer.participant_name != self.own_name() {
            log::warn!(
                "Connection: ignoring remote connect request addressed to '{}'",
                request.connect_target_peer.participant_name
            );
            return;
        }
        let requester = request.peer_unable_to_connect;
        let name = requester.participant_name.clone();
        if self.peers.borrow().contains_key(&name) || self.remote_negotiators.borrow().contains_key(&name) {
            log::debug!(
                "Connection: already connected or connecting to '{}', ignoring its remote connect request",
                name
            );
            return;
        }

        log::info!("Connection: '{}' connecting to '{}' on request", self.own_name(), name);
        self.notify_remote_connect(&requester, RemoteConnectStatus::Connecting);

        let negotiator = ConnectPeer::new(self.io.clone(), requester, self.connect_options());
        let listener = self.self_weak.clone() as Weak<dyn ConnectPeerListener>;
        match negotiator.async_connect(listener) {
            Ok(()) => {
                self.remote_negotiators.borrow_mut().insert(name, negotiator);
            }
            Err(e) => log::error!("Connection: cannot dial back '{}': {}", name, e),
        }
    }

    fn notify_remote_connect(&self, requester: &PeerInfo, status: RemoteConnectStatus) {
        let Some(registry) = self.registry_link() else { return };
        registry.send(&Message::RemoteParticipantConnectRequest(
            RemoteParticipantConnectRequest {
                peer_unable_to_connect: requester.clone(),
                connect_target_peer: self.own_info.borrow().clone(),
                status,
            },
        ));
    }

    fn on_dial_back_connected(&self, info: PeerInfo, stream: Box<dyn RawByteStream>) {
        let name = info.participant_name.clone();
        let negotiator = self.remote_negotiators.borrow_mut().shift_remove(&name);
        drop(negotiator);

        if self.peers.borrow().contains_key(&name) {
            log::debug!("Connection: '{}' connected meanwhile, dropping dial-back link", name);
            stream.shutdown();
            return;
        }
        let link = self.add_link(stream);
        link.set_info(info.clone());
        self.peers.borrow_mut().insert(
            name,
            RemotePeer {
                route: Route::Direct(link.id()),
                info,
                time_sync_active: false,
                announced: true,
                established: false,
            },
        );
        link.send(&self.announcement());
    }

    fn on_dial_back_failed(&self, info: PeerInfo) {
        let negotiator = self
            .remote_negotiators
            .borrow_mut()
            .shift_remove(&info.participant_name);
        drop(negotiator);
        log::warn!(
            "Connection: '{}' could not connect to '{}' on request",
            self.own_name(),
            info.participant_name
        );
        self.notify_remote_connect(&info, RemoteConnectStatus::FailedToConnect);
    }

    // ------------------------------------------------------------------------
    // Proxy
    // ------------------------------------------------------------------------

    fn send_proxied(&self, destination: &str, frame: Vec<u8>) {
        let Some(registry) = self.registry_link() else {
            log::warn!("Connection: no registry link to proxy through to '{}'", destination);
            return;
        };
        registry.send(&Message::ProxyMessage(ProxyMessage {
            source: self.own_name().to_string(),
            destination: destination.to_string(),
            payload: frame,
        }));
    }

    fn on_proxy_message(&self, proxy: ProxyMessage) {
        if !self.config.middleware.registry_as_fallback_proxy {
            log::warn!(
                "Connection: ignoring proxy message from '{}', proxying is disabled",
                proxy.source
            );
            return;
        }
        if proxy.destination != self.own_name() {
            log::warn!(
                "Connection: ignoring proxy message for '{}' from '{}'",
                proxy.destination,
                proxy.source
            );
            return;
        }
        let source = proxy.source;
        let proxied = self
            .peers
            .borrow()
            .get(&source)
            .map(|peer| peer.route == Route::Proxy);

        // an empty payload announces the disconnect of the proxied participant
        if proxy.payload.is_empty() {
            if proxied == Some(true) {
                self.remove_peer(&source);
            }
            return;
        }

        let message = match Message::from_frame(&proxy.payload) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Connection: malformed proxy message from '{}': {}", source, e);
                if proxied == Some(true) {
                    self.remove_peer(&source);
                }
                return;
            }
        };
        match message {
            Message::ParticipantAnnouncement(announcement) => {
                self.on_announcement(Route::Proxy, announcement)
            }
            other if proxied == Some(true) => self.on_peer_message(&source, other),
            other => log::warn!(
                "Connection: ignoring proxied {:?} from '{}' without a proxy route",
                other.kind(),
                source
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    fn send_frame_to(&self, route: Route, name: &str, frame: Vec<u8>) {
        match route {
            Route::Direct(id) => match self.link(id) {
                Some(link) => link.send_frame(frame),
                None => log::debug!("Connection: link to '{}' is gone", name),
            },
            Route::Proxy => self.send_proxied(name, frame),
        }
    }

    fn broadcast(&self, message: &Message) {
        let frame = message.to_frame();
        let routes: Vec<(String, Route)> = self
            .peers
            .borrow()
            .iter()
            .map(|(name, peer)| (name.clone(), peer.route))
            .collect();
        for (name, route) in routes {
            self.send_frame_to(route, &name, frame.clone());
        }
    }

    fn send_to(&self, participant_name: &str, message: &Message) {
        let route = self.peers.borrow().get(participant_name).map(|peer| peer.route);
        match route {
            Some(route) => self.send_frame_to(route, participant_name, message.to_frame()),
            None => log::warn!(
                "Connection: cannot send {:?} to unknown participant '{}'",
                message.kind(),
                participant_name
            ),
        }
    }

    fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }
        log::debug!("Connection: '{}' shutting down", self.own_name());
        if let Some(orchestrator) = self.orchestrator() {
            orchestrator.shutdown();
        }
        let registry_negotiator = self.registry_negotiator.borrow_mut().take();
        drop(registry_negotiator);
        let remote_negotiators: Vec<ConnectPeer> = self
            .remote_negotiators
            .borrow_mut()
            .drain(..)
            .map(|(_, negotiator)| negotiator)
            .collect();
        drop(remote_negotiators);

        let acceptors: Vec<Box<dyn Acceptor>> = self.acceptors.borrow_mut().drain(..).collect();
        for acceptor in &acceptors {
            acceptor.shutdown();
        }
        let links: Vec<Peer> = self.links.borrow().values().cloned().collect();
        for link in links {
            link.shutdown();
        }
        if self.join_state.get() == JoinState::Joining {
            self.complete_join(Err(CsError::Cancelled));
        }
    }
}

// ============================================================================
// Collaborator Implementations
// ============================================================================

impl PeerListener for ConnectionInner {
    fn on_peer_message(&self, peer: PeerId, message: Message) {
        self.on_link_message(peer, message);
    }

    fn on_peer_shutdown(&self, peer: PeerId) {
        self.links.borrow_mut().shift_remove(&peer);

        if Some(peer) == self.registry.get() {
            self.registry.set(None);
            if !self.shut_down.get() {
                log::warn!("Connection: '{}' lost the registry connection", self.own_name());
            }
            if self.join_state.get() == JoinState::Joining {
                self.complete_join(Err(CsError::connection("registry connection lost while joining")));
            }
            let proxied: Vec<String> = self
                .peers
                .borrow()
                .iter()
                .filter(|(_, p)| p.route == Route::Proxy)
                .map(|(name, _)| name.clone())
                .collect();
            for name in proxied {
                self.remove_peer(&name);
            }
            return;
        }

        let name = self
            .peers
            .borrow()
            .iter()
            .find(|(_, p)| p.route == Route::Direct(peer))
            .map(|(name, _)| name.clone());
        if let Some(name) = name {
            self.remove_peer(&name);
        }
    }
}

impl ConnectPeerListener for ConnectionInner {
    fn on_connect_peer_success(&self, peer_info: PeerInfo, stream: Box<dyn RawByteStream>) {
        if peer_info.is_registry() {
            self.on_registry_connected(stream);
        } else {
            self.on_dial_back_connected(peer_info, stream);
        }
    }

    fn on_connect_peer_failure(&self, peer_info: PeerInfo) {
        if peer_info.is_registry() {
            let negotiator = self.registry_negotiator.borrow_mut().take();
            drop(negotiator);
            self.complete_join(Err(CsError::connection(format!(
                "cannot connect to the registry at {}",
                peer_info.acceptor_uris.join(", ")
            ))));
        } else {
            self.on_dial_back_failed(peer_info);
        }
    }
}

impl ConnectionMethods for ConnectionInner {
    fn make_connect_peer(&self, peer_info: &PeerInfo) -> ConnectPeer {
        ConnectPeer::new(self.io.clone(), peer_info.clone(), self.connect_options())
    }

    fn handle_connected_peer(&self, peer_info: PeerInfo, stream: Box<dyn RawByteStream>) {
        let link = self.add_link(stream);
        link.set_info(peer_info.clone());
        self.peers.borrow_mut().insert(
            peer_info.participant_name.clone(),
            RemotePeer {
                route: Route::Direct(link.id()),
                info: peer_info,
                time_sync_active: false,
                announced: true,
                established: false,
            },
        );
        link.send(&self.announcement());
    }

    fn try_remote_connect_request(&self, peer_info: &PeerInfo) -> bool {
        if !self.config.middleware.experimental_remote_participant_connection {
            log::debug!("Connection: remote participant connection is disabled");
            return false;
        }
        if !peer_info.has_capability(CAPABILITY_REQUEST_PARTICIPANT_CONNECTION) {
            log::debug!(
                "Connection: '{}' does not support remote connection requests",
                peer_info.participant_name
            );
            return false;
        }
        let Some(registry) = self.registry_link() else { return false };
        log::info!(
            "Connection: '{}' cannot reach '{}' directly, asking it to connect back",
            self.own_name(),
            peer_info.participant_name
        );
        registry.send(&Message::RemoteParticipantConnectRequest(
            RemoteParticipantConnectRequest {
                peer_unable_to_connect: self.own_info.borrow().clone(),
                connect_target_peer: peer_info.clone(),
                status: RemoteConnectStatus::Request,
            },
        ));
        true
    }

    fn try_proxy_connect(&self, peer_info: &PeerInfo) -> bool {
        let name = &peer_info.participant_name;
        let direct = self
            .peers
            .borrow()
            .get(name)
            .map_or(false, |peer| matches!(peer.route, Route::Direct(_)));
        if direct {
            // the dial-back arrived before its notification; keep that link
            log::debug!(
                "Connection: '{}' already has a direct link to '{}', no proxy needed",
                self.own_name(),
                name
            );
            self.announce_if_waiting(name);
            return true;
        }
        if !self.config.middleware.registry_as_fallback_proxy {
            log::warn!(
                "Connection: cannot proxy messages to '{}', proxying is disabled",
                name
            );
            return false;
        }
        if !peer_info.has_capability(CAPABILITY_PROXY_MESSAGE) {
            log::warn!(
                "Connection: cannot proxy messages to '{}', it does not support it",
                name
            );
            return false;
        }
        if self.registry_link().is_none() {
            return false;
        }
        log::warn!(
            "Connection: '{}' proxies messages to '{}' through the registry",
            self.own_name(),
            name
        );
        self.peers.borrow_mut().insert(
            name.clone(),
            RemotePeer {
                route: Route::Proxy,
                info: peer_info.clone(),
                time_sync_active: false,
                announced: true,
                established: false,
            },
        );
        self.send_proxied(name, self.announcement().to_frame());
        true
    }
}

impl ConnectKnownParticipantsListener for ConnectionInner {
    fn on_connect_known_participants_waiting_for_all_replies(&self) {
        log::debug!(
            "Connection: '{}' waiting for all announcement replies",
            self.own_name()
        );
    }

    fn on_connect_known_participants_all_replies_received(&self) {
        self.complete_join(Ok(()));
    }

    fn on_connect_known_participants_failure(&self, description: String) {
        self.complete_join(Err(CsError::connection(format!(
            "failed to connect to the known participants: {}",
            description
        ))));
    }
}
