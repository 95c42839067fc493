//! Registry: the rendezvous point every participant connects to first.
//!
//! It answers announcements with the list of already registered participants, relays
//! remote-connect requests between participants that cannot reach each other, and
//! forwards proxy messages for pairs that cannot connect at all. It runs neither a
//! lifecycle nor time synchronization.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};

use crate::cs_config::MiddlewareConfig;
use crate::cs_error::{CsError, Result};
use crate::cs_interface::{PeerInfo, REGISTRY_PARTICIPANT_NAME};
use crate::cs_io_context::{Acceptor, Endpoint, IoContext, RawByteStream};
use crate::cs_messages::{
    KnownParticipants, Message, ParticipantAnnouncement, ParticipantAnnouncementReply, ProxyMessage,
    RemoteConnectStatus, RemoteParticipantConnectRequest,
};
use crate::cs_peer::{Peer, PeerId, PeerListener};
use crate::cs_uri::{local_socket_path, Uri, UriKind};

/// Local-domain socket the registry listening on `port` additionally accepts on.
pub fn registry_local_socket_path(port: u16) -> PathBuf {
    local_socket_path(REGISTRY_PARTICIPANT_NAME, &port.to_string())
}

// ============================================================================
// Acceptor URI Transformation
// ============================================================================

/// Rewrites the acceptor URIs of `advertised` for the participant they are sent to.
///
/// `advertised_remote` is the advertised participant's address as seen by the registry,
/// `audience_local` is the registry's address as seen by the audience. Catch-all
/// acceptors are replaced by concrete addresses on the same port and never forwarded.
pub fn transform_acceptor_uris(
    advertised: &PeerInfo,
    advertised_remote: &Uri,
    audience_local: &Uri,
) -> Vec<String> {
    let src = advertised_remote.info();
    let dst = audience_local.info();

    let mut accepted: BTreeSet<String> = BTreeSet::new();
    for raw in &advertised.acceptor_uris {
        let uri = match Uri::parse(raw) {
            Ok(uri) => uri,
            Err(e) => {
                log::warn!(
                    "Registry: dropping acceptor uri of '{}': {}",
                    advertised.participant_name,
                    e
                );
                continue;
            }
        };
        let info = uri.info();
        if !info.catchall_ip {
            accepted.insert(uri.to_string());
            continue;
        }

        let port = uri.port();
        if src.local {
            if dst.local {
                if info.ip4 {
                    accepted.insert(Uri::tcp("127.0.0.1", port).to_string());
                }
                if info.ip6 {
                    accepted.insert(Uri::tcp("::1", port).to_string());
                }
            }
            if (info.ip4 && dst.ip4) || (info.ip6 && dst.ip6) {
                accepted.insert(Uri::tcp(audience_local.host(), port).to_string());
            }
        }
        if (info.ip4 && src.ip4) || (info.ip6 && src.ip6) {
            accepted.insert(Uri::tcp(advertised_remote.host(), port).to_string());
        }
    }

    // local-domain first; loopback ahead of other tcp only for a local audience
    let (loopback_rank, remote_rank) = if dst.local { (1, 2) } else { (2, 1) };
    let mut ordered: Vec<(u8, String)> = accepted
        .into_iter()
        .map(|raw| {
            let rank = match Uri::parse(&raw) {
                Ok(uri) if uri.is_local() => 0,
                Ok(uri) if uri.info().loopback_ip => loopback_rank,
                _ => remote_rank,
            };
            (rank, raw)
        })
        .collect();
    ordered.sort_by_key(|(rank, _)| *rank);
    ordered.into_iter().map(|(_, raw)| raw).collect()
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry {
    inner: Rc<RegistryInner>,
}

struct RegistryInner {
    self_weak: Weak<RegistryInner>,
    io: Rc<dyn IoContext>,
    middleware: MiddlewareConfig,
    acceptors: RefCell<Vec<Box<dyn Acceptor>>>,
    links: RefCell<IndexMap<PeerId, Peer>>,
    participants: RefCell<IndexMap<String, PeerId>>,
    /// Proxy source -> destinations it has sent through us
    proxy_routes: RefCell<HashMap<String, IndexSet<String>>>,
    next_peer_id: Cell<u64>,
    shut_down: Cell<bool>,
}

impl Registry {
    pub fn new(io: Rc<dyn IoContext>, middleware: MiddlewareConfig) -> Self {
        Self {
            inner: Rc::new_cyclic(|self_weak| RegistryInner {
                self_weak: self_weak.clone(),
                io,
                middleware,
                acceptors: RefCell::new(Vec::new()),
                links: RefCell::new(IndexMap::new()),
                participants: RefCell::new(IndexMap::new()),
                proxy_routes: RefCell::new(HashMap::new()),
                next_peer_id: Cell::new(1),
                shut_down: Cell::new(false),
            }),
        }
    }

    /// Listens on `listen_uri` and returns the URI actually bound.
    ///
    /// Port 0 picks an ephemeral port. The additional local-domain acceptor is optional;
    /// failing to open either acceptor is an error only when both fail.
    pub fn start_listening(&self, listen_uri: &str) -> Result<Uri> {
        let uri = Uri::parse(listen_uri)?;
        if uri.kind() == UriKind::Local {
            return Err(CsError::configuration(format!(
                "registry must listen on a tcp uri, got '{}'",
                uri
            )));
        }
        self.inner.start_listening(&uri)
    }

    /// Names of the currently registered participants, in join order.
    pub fn participant_names(&self) -> Vec<String> {
        self.inner.participants.borrow().keys().cloned().collect()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl RegistryInner {
    fn start_listening(&self, uri: &Uri) -> Result<Uri> {
        let socket_options = self.middleware.socket_options();
        let mut tcp_error = None;
        let mut bound = None;

        match self.io.resolve(uri.bare_host(), uri.port()).first() {
            Some(addr) => match self.io.make_acceptor(&Endpoint::Tcp(*addr), socket_options) {
                Ok(acceptor) => {
                    let local = acceptor.local_endpoint();
                    log::info!("Registry: listening on {}", local);
                    bound = Some(local);
                    self.add_acceptor(acceptor);
                }
                Err(e) => tcp_error = Some(e),
            },
            None => {
                tcp_error = Some(CsError::configuration(format!(
                    "cannot resolve registry host '{}'",
                    uri.host()
                )))
            }
        }
        if let Some(e) = &tcp_error {
            log::error!("Registry: failed to listen on {}: {}", uri, e);
        }

        let mut local_ok = false;
        if self.middleware.enable_domain_sockets {
            let port = bound.as_ref().map_or(uri.port(), Uri::port);
            let path = registry_local_socket_path(port);
            match self
                .io
                .make_acceptor(&Endpoint::Local(path.clone()), socket_options)
            {
                Ok(acceptor) => {
                    log::debug!("Registry: listening on local://{}", path.display());
                    self.add_acceptor(acceptor);
                    local_ok = true;
                }
                Err(e) => log::warn!(
                    "Registry: failed to listen on local://{}: {}",
                    path.display(),
                    e
                ),
            }
        }

        match (bound, tcp_error) {
            (Some(bound), _) => Ok(Uri::tcp(bound.bare_host(), bound.port())),
            (None, _) if local_ok => Ok(uri.clone()),
            (None, Some(e)) => Err(CsError::connection(format!(
                "registry accepts neither tcp nor local-domain connections: {}",
                e
            ))),
            (None, None) => Err(CsError::connection(
                "registry accepts neither tcp nor local-domain connections",
            )),
        }
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
                        this.add_link(stream);
                        this.accept_next(index);
                    }
                    Err(CsError::Cancelled) => log::debug!("Registry: acceptor closed"),
                    Err(e) => {
                        log::warn!("Registry: accept failed: {}", e);
                        this.accept_next(index);
                    }
                }
            }),
        );
        if let Err(e) = issued {
            log::error!("Registry: cannot accept: {}", e);
        }
    }

    fn add_link(&self, stream: Box<dyn RawByteStream>) {
        let id = PeerId(self.next_peer_id.get());
        self.next_peer_id.set(id.0 + 1);
        let listener = self.self_weak.clone() as Weak<dyn PeerListener>;
        let peer = Peer::new(id, stream, listener);
        log::debug!("Registry: accepted link {} from {}", id, peer.remote_address());
        self.links.borrow_mut().insert(id, peer.clone());
        peer.start_reading();
    }

    fn link(&self, id: PeerId) -> Option<Peer> {
        self.links.borrow().get(&id).cloned()
    }

    fn participant_link(&self, name: &str) -> Option<Peer> {
        let id = self.participants.borrow().get(name).copied()?;
        self.link(id)
    }

    fn handle_announcement(&self, from: PeerId, announcement: ParticipantAnnouncement) {
        let Some(link) = self.link(from) else { return };
        let info = announcement.peer_info;
        let name = info.participant_name.clone();

        if name.is_empty() || info.is_registry() {
            log::warn!("Registry: rejecting announcement with invalid name '{}'", name);
            link.send(&Message::ParticipantAnnouncementReply(
                ParticipantAnnouncementReply::failed(format!(
                    "the participant name '{}' is not allowed",
                    name
                )),
            ));
            return;
        }
        if self.participants.borrow().contains_key(&name) {
            log::warn!(
                "Registry: rejecting participant '{}', a participant with this name is already connected",
                name
            );
            link.send(&Message::ParticipantAnnouncementReply(
                ParticipantAnnouncementReply::failed(format!(
                    "a participant with the name '{}' is already connected to the registry",
                    name
                )),
            ));
            return;
        }

        link.set_info(info);
        log::info!(
            "Registry: participant '{}' connected from {}",
            name,
            link.remote_address()
        );

        let audience_local = link.local_address();
        let known: Vec<PeerInfo> = {
            let participants = self.participants.borrow();
            let links = self.links.borrow();
            participants
                .values()
                .filter_map(|id| links.get(id))
                .map(|other| {
                    let mut peer_info = other.info();
                    peer_info.acceptor_uris =
                        transform_acceptor_uris(&peer_info, &other.remote_address(), &audience_local);
                    peer_info
                })
                .collect()
        };
        self.participants.borrow_mut().insert(name, from);

        link.send(&Message::ParticipantAnnouncementReply(
            ParticipantAnnouncementReply::success(false),
        ));
        link.send(&Message::KnownParticipants(KnownParticipants { peer_infos: known }));
    }

    fn relay_remote_connect(&self, request: RemoteParticipantConnectRequest) {
        let requester = request.peer_unable_to_connect.participant_name.clone();
        let target = request.connect_target_peer.participant_name.clone();

        match request.status {
            RemoteConnectStatus::Request => {
                let (Some(requester_link), Some(target_link)) =
                    (self.participant_link(&requester), self.participant_link(&target))
                else {
                    log::warn!(
                        "Registry: dropping remote connect request from '{}' to '{}': unknown participant",
                        requester,
                        target
                    );
                    return;
                };
                let mut peer_unable_to_connect = requester_link.info();
                peer_unable_to_connect.acceptor_uris = transform_acceptor_uris(
                    &peer_unable_to_connect,
                    &requester_link.remote_address(),
                    &target_link.local_address(),
                );
                log::debug!(
                    "Registry: relaying remote connect request from '{}' to '{}'",
                    requester,
                    target
                );
                target_link.send(&Message::RemoteParticipantConnectRequest(
                    RemoteParticipantConnectRequest {
                        peer_unable_to_connect,
                        connect_target_peer: request.connect_target_peer,
                        status: RemoteConnectStatus::Request,
                    },
                ));
            }
            RemoteConnectStatus::Connecting | RemoteConnectStatus::FailedToConnect => {
                let Some(requester_link) = self.participant_link(&requester) else {
                    log::warn!(
                        "Registry: dropping remote connect notification {:?} for unknown participant '{}'",
                        request.status,
                        requester
                    );
                    return;
                };
                requester_link.send(&Message::RemoteParticipantConnectRequest(request));
            }
        }
    }

    fn relay_proxy(&self, from: PeerId, message: ProxyMessage) {
        let sender = self.link(from).map(|link| link.name()).unwrap_or_default();
        if sender != message.source {
            log::warn!(
                "Registry: dropping proxy message claiming source '{}' from '{}'",
                message.source,
                sender
            );
            return;
        }
        let Some(destination) = self.participant_link(&message.destination) else {
            log::error!(
                "Registry: unable to deliver proxy message from '{}' to '{}'",
                message.source,
                message.destination
            );
            return;
        };
        self.proxy_routes
            .borrow_mut()
            .entry(message.source.clone())
            .or_default()
            .insert(message.destination.clone());
        destination.send(&Message::ProxyMessage(message));
    }

    fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }
        let acceptors: Vec<_> = self.acceptors.borrow_mut().drain(..).collect();
        for acceptor in &acceptors {
            acceptor.shutdown();
        }
        let links: Vec<Peer> = self.links.borrow().values().cloned().collect();
        for link in links {
            link.shutdown();
        }
    }
}

impl PeerListener for RegistryInner {
    fn on_peer_message(&self, peer: PeerId, message: Message) {
        match message {
            Message::ParticipantAnnouncement(announcement) => {
                self.handle_announcement(peer, announcement)
            }
            Message::RemoteParticipantConnectRequest(request) => self.relay_remote_connect(request),
            Message::ProxyMessage(proxy) => self.relay_proxy(peer, proxy),
            other => log::warn!(
                "Registry: ignoring {:?} message from link {}",
                other.kind(),
                peer
            ),
        }
    }

    fn on_peer_shutdown(&self, peer: PeerId) {
        let Some(link) = self.links.borrow_mut().shift_remove(&peer) else {
            return;
        };
        let name = link.name();
        let registered = {
            let mut participants = self.participants.borrow_mut();
            participants.get(&name) == Some(&peer) && participants.shift_remove(&name).is_some()
        };
        if !registered {
            return;
        }
        log::info!("Registry: participant '{}' disconnected", name);

        // proxied counterparts learn about the disconnect through an empty payload
        let destinations = self.proxy_routes.borrow_mut().remove(&name).unwrap_or_default();
        for destination in destinations {
            if let Some(destination_link) = self.participant_link(&destination) {
                destination_link.send(&Message::ProxyMessage(ProxyMessage {
                    source: name.clone(),
                    destination,
                    payload: Vec::new(),
                }));
            }
        }
    }
}
