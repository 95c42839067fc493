//! Connection negotiator for a single remote participant.
//!
//! Walks the peer's candidate endpoints one at a time (local-domain first, then TCP),
//! repeating the whole list for the configured number of passes, and reports exactly
//! one outcome to its listener unless shut down first.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::cs_error::{CsError, Result};
use crate::cs_interface::PeerInfo;
use crate::cs_io_context::{Connector, Endpoint, IoContext, RawByteStream, SocketOptions};
use crate::cs_uri::Uri;

/// Receives the single outcome of a [`ConnectPeer`].
pub trait ConnectPeerListener {
    fn on_connect_peer_success(&self, peer_info: PeerInfo, stream: Box<dyn RawByteStream>);
    fn on_connect_peer_failure(&self, peer_info: PeerInfo);
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectPeerOptions {
    /// Passes over the candidate list; clamped to at least one
    pub attempts: usize,
    /// Per-candidate connect timeout
    pub timeout: Duration,
    pub enable_domain_sockets: bool,
    pub socket_options: SocketOptions,
}

impl Default for ConnectPeerOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            timeout: Duration::from_secs(5),
            enable_domain_sockets: true,
            socket_options: SocketOptions::default(),
        }
    }
}

/// Expand announced uris into dialable endpoints, local-domain before TCP.
///
/// Order inside each class follows the announcement. Hosts are resolved here, once;
/// each resolved address is its own candidate.
pub fn candidate_endpoints(
    io: &dyn IoContext,
    acceptor_uris: &[String],
    enable_domain_sockets: bool,
) -> Vec<Endpoint> {
    let mut local = Vec::new();
    let mut tcp = Vec::new();
    for raw in acceptor_uris {
        let uri = match Uri::parse(raw) {
            Ok(uri) => uri,
            Err(e) => {
                log::warn!("ConnectPeer: skipping acceptor uri '{}': {}", raw, e);
                continue;
            }
        };
        if uri.is_local() {
            if enable_domain_sockets {
                local.push(Endpoint::Local(uri.path().into()));
            }
            continue;
        }
        let resolved = io.resolve(uri.bare_host(), uri.port());
        if resolved.is_empty() {
            log::warn!("ConnectPeer: could not resolve '{}'", uri);
        }
        tcp.extend(resolved.into_iter().map(Endpoint::Tcp));
    }
    local.extend(tcp);
    local
}

#[derive(Default)]
struct NegotiationState {
    candidates: Vec<Endpoint>,
    next_index: usize,
    pass: usize,
    connector: Option<Box<dyn Connector>>,
    started: bool,
    finished: bool,
}

struct Negotiation {
    io: Rc<dyn IoContext>,
    peer_info: PeerInfo,
    options: ConnectPeerOptions,
    listener: RefCell<Option<Weak<dyn ConnectPeerListener>>>,
    state: RefCell<NegotiationState>,
}

pub struct ConnectPeer {
    inner: Rc<Negotiation>,
}

impl ConnectPeer {
    pub fn new(io: Rc<dyn IoContext>, peer_info: PeerInfo, options: ConnectPeerOptions) -> Self {
        Self {
            inner: Rc::new(Negotiation {
                io,
                peer_info,
                options,
                listener: RefCell::new(None),
                state: RefCell::new(NegotiationState::default()),
            }),
        }
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.inner.peer_info
    }

    /// Start negotiating. A second call is an `InvalidState` error.
    pub fn async_connect(&self, listener: Weak<dyn ConnectPeerListener>) -> Result<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.started {
                return Err(CsError::invalid_state("ConnectPeer::async_connect called twice"));
            }
            state.started = true;
        }
        *self.inner.listener.borrow_mut() = Some(listener);

        let candidates = candidate_endpoints(
            self.inner.io.as_ref(),
            &self.inner.peer_info.acceptor_uris,
            self.inner.options.enable_domain_sockets,
        );
        log::debug!(
            "ConnectPeer: {} candidates for {}: {:?}",
            candidates.len(),
            self.inner.peer_info.participant_name,
            candidates
        );

        if candidates.is_empty() {
            let weak = Rc::downgrade(&self.inner);
            self.inner.io.post(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.finish_with_failure();
                }
            }));
            return Ok(());
        }

        self.inner.state.borrow_mut().candidates = candidates;
        self.inner.try_next_candidate();
        Ok(())
    }

    /// Cancel the active attempt; no outcome is reported afterwards.
    pub fn shutdown(&self) {
        let connector = {
            let mut state = self.inner.state.borrow_mut();
            state.finished = true;
            state.connector.take()
        };
        if let Some(connector) = connector {
            connector.shutdown();
        }
    }
}

impl Drop for ConnectPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Negotiation {
    fn try_next_candidate(self: &Rc<Self>) {
        let passes = self.options.attempts.max(1);
        loop {
            let endpoint = {
                let mut state = self.state.borrow_mut();
                if state.finished {
                    return;
                }
                if state.next_index >= state.candidates.len() {
                    state.next_index = 0;
                    state.pass += 1;
                    if state.pass >= passes {
                        drop(state);
                        self.finish_with_failure();
                        return;
                    }
                    log::debug!(
                        "ConnectPeer: retrying {} (pass {} of {})",
                        self.peer_info.participant_name,
                        state.pass + 1,
                        passes
                    );
                }
                let endpoint = state.candidates[state.next_index].clone();
                state.next_index += 1;
                endpoint
            };

            let connector = match self.io.make_connector(&endpoint, self.options.socket_options) {
                Ok(connector) => connector,
                Err(e) => {
                    log::debug!("ConnectPeer: cannot create connector for {}: {}", endpoint, e);
                    continue;
                }
            };

            let weak = Rc::downgrade(self);
            let target = endpoint.clone();
            let issued = connector.async_connect(
                self.options.timeout,
                Box::new(move |result| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_connect_result(&target, result);
                    }
                }),
            );
            match issued {
                Ok(()) => {
                    self.state.borrow_mut().connector = Some(connector);
                    return;
                }
                Err(e) => log::debug!("ConnectPeer: connect to {} not issued: {}", endpoint, e),
            }
        }
    }

    fn on_connect_result(self: &Rc<Self>, endpoint: &Endpoint, result: Result<Box<dyn RawByteStream>>) {
        let finished = {
            let mut state = self.state.borrow_mut();
            state.connector = None;
            state.finished
        };
        if finished {
            return;
        }
        match result {
            Ok(stream) => {
                log::debug!(
                    "ConnectPeer: connected to {} via {}",
                    self.peer_info.participant_name,
                    endpoint
                );
                self.state.borrow_mut().finished = true;
                if let Some(listener) = self.listener() {
                    listener.on_connect_peer_success(self.peer_info.clone(), stream);
                }
            }
            Err(e) => {
                log::debug!(
                    "ConnectPeer: connect to {} via {} failed: {}",
                    self.peer_info.participant_name,
                    endpoint,
                    e
                );
                self.try_next_candidate();
            }
        }
    }

    fn finish_with_failure(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        log::debug!(
            "ConnectPeer: giving up on {}",
            self.peer_info.participant_name
        );
        if let Some(listener) = self.listener() {
            listener.on_connect_peer_failure(self.peer_info.clone());
        }
    }

    fn listener(&self) -> Option<Rc<dyn ConnectPeerListener>> {
        self.listener.borrow().as_ref().and_then(Weak::upgrade)
    }
}
