//! Deterministic in-memory event loop and network.
//!
//! Time is virtual: it only advances when the loop has nothing ready and jumps to the
//! next armed timer. Endpoints can be made refused (connect fails at once) or
//! unreachable (connect hangs until its timeout), which lets tests drive every
//! fallback path of connection establishment without sockets.
//!
//! Several participants, and the registry, may share one context.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::time::Duration;

use crate::cs_error::{CsError, Result};
use crate::cs_io_context::{
    AcceptHandler, Acceptor, ConnectHandler, Connector, CrossThreadSignal, Endpoint, IoContext,
    RawByteStream, RawByteStreamListener, SocketOptions, StreamFlags, Task, TaskQueue, Timer,
    TimerHandler, WorkGuard,
};
use crate::cs_uri::Uri;

type TimerKey = (Duration, u64);

const FIRST_EPHEMERAL_PORT: u16 = 40000;

// ============================================================================
// Context
// ============================================================================

#[derive(Clone)]
pub struct MemoryIoContext {
    inner: Rc<MemoryInner>,
}

struct MemoryInner {
    queue: TaskQueue,
    now: Cell<Duration>,
    timers: RefCell<BTreeMap<TimerKey, TimerHandler>>,
    next_timer_seq: Cell<u64>,
    guards: Rc<Cell<usize>>,
    signal_tx: mpsc::Sender<usize>,
    signal_rx: mpsc::Receiver<usize>,
    signals: RefCell<HashMap<usize, Rc<dyn Fn()>>>,
    next_signal: Cell<usize>,
    stopped: Cell<bool>,
    network: RefCell<MemoryNetwork>,
    latency: Cell<Duration>,
    read_interruptions: Cell<usize>,
    max_write_chunk: Cell<Option<usize>>,
}

#[derive(Default)]
struct MemoryNetwork {
    listeners: HashMap<Endpoint, Weak<AcceptorInner>>,
    refused: HashSet<Endpoint>,
    unreachable: HashSet<Endpoint>,
    hosts: HashMap<String, Vec<IpAddr>>,
    connect_log: Vec<Endpoint>,
    next_port: u16,
}

enum ConnectOutcome {
    Listening(Rc<AcceptorInner>),
    Refused,
    Unreachable,
}

impl MemoryNetwork {
    fn allocate_port(&mut self) -> u16 {
        if self.next_port < FIRST_EPHEMERAL_PORT {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        port
    }

    fn listener_for(&self, endpoint: &Endpoint) -> Option<Rc<AcceptorInner>> {
        if let Some(found) = self.listeners.get(endpoint).and_then(Weak::upgrade) {
            return Some(found);
        }
        // catch-all binds accept on every address with their port
        if let Endpoint::Tcp(addr) = endpoint {
            let any: IpAddr = if addr.is_ipv4() {
                Ipv4Addr::UNSPECIFIED.into()
            } else {
                Ipv6Addr::UNSPECIFIED.into()
            };
            let catchall = Endpoint::Tcp(SocketAddr::new(any, addr.port()));
            return self.listeners.get(&catchall).and_then(Weak::upgrade);
        }
        None
    }

    fn outcome(&self, endpoint: &Endpoint) -> ConnectOutcome {
        if self.unreachable.contains(endpoint) {
            return ConnectOutcome::Unreachable;
        }
        if self.refused.contains(endpoint) {
            return ConnectOutcome::Refused;
        }
        match self.listener_for(endpoint) {
            Some(listener) if self.unreachable.contains(&listener.endpoint) => {
                ConnectOutcome::Unreachable
            }
            Some(listener) if self.refused.contains(&listener.endpoint) => ConnectOutcome::Refused,
            Some(listener) => ConnectOutcome::Listening(listener),
            None => ConnectOutcome::Refused,
        }
    }
}

impl MemoryIoContext {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = mpsc::channel();
        Self {
            inner: Rc::new(MemoryInner {
                queue: TaskQueue::new(),
                now: Cell::new(Duration::ZERO),
                timers: RefCell::new(BTreeMap::new()),
                next_timer_seq: Cell::new(0),
                guards: Rc::new(Cell::new(0)),
                signal_tx,
                signal_rx,
                signals: RefCell::new(HashMap::new()),
                next_signal: Cell::new(1),
                stopped: Cell::new(false),
                network: RefCell::new(MemoryNetwork::default()),
                latency: Cell::new(Duration::ZERO),
                read_interruptions: Cell::new(0),
                max_write_chunk: Cell::new(None),
            }),
        }
    }

    /// Virtual time elapsed since the context was created.
    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    /// Run until `duration` of virtual time has passed or nothing is left to do.
    /// Never blocks on work guards.
    pub fn run_for(&self, duration: Duration) {
        let deadline = self.inner.now.get() + duration;
        self.inner.queue.set_in_loop(true);
        while !self.inner.stopped.get() && self.inner.step(false, Some(deadline)) {}
        self.inner.queue.set_in_loop(false);
        self.inner.stopped.set(false);
        if self.inner.now.get() < deadline {
            self.inner.now.set(deadline);
        }
    }

    /// Run until the predicate holds or nothing is left to do.
    pub fn run_until(&self, done: impl Fn() -> bool) {
        self.inner.queue.set_in_loop(true);
        while !done() && !self.inner.stopped.get() && self.inner.step(true, None) {}
        self.inner.queue.set_in_loop(false);
        self.inner.stopped.set(false);
    }

    /// Delay applied to every connect completion and byte delivery.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.latency.set(latency);
    }

    /// Connecting to this endpoint fails immediately.
    pub fn set_refused(&self, endpoint: Endpoint) {
        self.inner.network.borrow_mut().refused.insert(endpoint);
    }

    /// Connecting to this endpoint never completes; the connect times out.
    pub fn set_unreachable(&self, endpoint: Endpoint) {
        self.inner.network.borrow_mut().unreachable.insert(endpoint);
    }

    /// Unreachable variant taking an advertised uri.
    pub fn set_uri_unreachable(&self, uri: &Uri) -> Result<()> {
        let endpoint = self.endpoint_of(uri)?;
        self.set_unreachable(endpoint);
        Ok(())
    }

    pub fn add_host(&self, name: &str, addresses: Vec<IpAddr>) {
        self.inner
            .network
            .borrow_mut()
            .hosts
            .insert(name.to_string(), addresses);
    }

    /// Every endpoint dialled so far, in order.
    pub fn connect_log(&self) -> Vec<Endpoint> {
        self.inner.network.borrow().connect_log.clone()
    }

    pub fn clear_connect_log(&self) {
        self.inner.network.borrow_mut().connect_log.clear();
    }

    /// The next `count` read completions are interrupted and transparently re-issued.
    pub fn interrupt_next_reads(&self, count: usize) {
        self.inner.read_interruptions.set(count);
    }

    /// Cap on the bytes a single write transfers.
    pub fn set_max_write_chunk(&self, chunk: Option<usize>) {
        self.inner.max_write_chunk.set(chunk);
    }

    fn endpoint_of(&self, uri: &Uri) -> Result<Endpoint> {
        if uri.is_local() {
            return Ok(Endpoint::Local(uri.path().into()));
        }
        self.resolve(uri.bare_host(), uri.port())
            .into_iter()
            .next()
            .map(Endpoint::Tcp)
            .ok_or_else(|| CsError::connection(format!("cannot resolve '{}'", uri)))
    }
}

impl Default for MemoryIoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInner {
    /// One unit of progress. Returns false when the loop would have to end.
    fn step(&self, block_on_guards: bool, deadline: Option<Duration>) -> bool {
        if let Some(task) = self.queue.pop() {
            task();
            return true;
        }
        if let Ok(id) = self.signal_rx.try_recv() {
            self.fire_signal(id);
            return true;
        }
        let next = self.timers.borrow().keys().next().copied();
        if let Some(key) = next {
            if deadline.map_or(true, |d| key.0 <= d) {
                let handler = self.timers.borrow_mut().remove(&key);
                if key.0 > self.now.get() {
                    self.now.set(key.0);
                }
                if let Some(handler) = handler {
                    handler();
                }
                return true;
            }
            return false;
        }
        if block_on_guards && self.guards.get() > 0 {
            return match self.signal_rx.recv() {
                Ok(id) => {
                    self.fire_signal(id);
                    true
                }
                Err(_) => false,
            };
        }
        false
    }

    fn fire_signal(&self, id: usize) {
        let handler = self.signals.borrow().get(&id).cloned();
        match handler {
            Some(handler) => handler(),
            None => log::debug!("dropping signal {} without handler", id),
        }
    }

    fn post(&self, task: Task) {
        self.queue.post(task);
    }

    fn add_timer(&self, delay: Duration, handler: TimerHandler) -> TimerKey {
        let seq = self.next_timer_seq.get();
        self.next_timer_seq.set(seq + 1);
        let key = (self.now.get() + delay, seq);
        self.timers.borrow_mut().insert(key, handler);
        key
    }

    fn cancel_timer(&self, key: TimerKey) {
        self.timers.borrow_mut().remove(&key);
    }

    /// Post, or arm a timer when a network latency is configured.
    fn schedule(&self, task: Task) {
        let latency = self.latency.get();
        if latency.is_zero() {
            self.post(task);
        } else {
            self.add_timer(latency, task);
        }
    }
}

impl IoContext for MemoryIoContext {
    fn run(&self) {
        self.inner.queue.set_in_loop(true);
        while !self.inner.stopped.get() && self.inner.step(true, None) {}
        self.inner.queue.set_in_loop(false);
        self.inner.stopped.set(false);
    }

    fn stop(&self) {
        self.inner.stopped.set(true);
    }

    fn post(&self, task: Task) {
        self.inner.post(task);
    }

    fn dispatch(&self, task: Task) {
        self.inner.queue.dispatch(task);
    }

    fn make_timer(&self) -> Box<dyn Timer> {
        Box::new(MemoryTimer {
            ctx: Rc::downgrade(&self.inner),
            key: Rc::new(Cell::new(None)),
        })
    }

    fn make_connector(
        &self,
        endpoint: &Endpoint,
        _options: SocketOptions,
    ) -> Result<Box<dyn Connector>> {
        Ok(Box::new(MemoryConnector(Rc::new(ConnectorInner {
            ctx: Rc::downgrade(&self.inner),
            endpoint: endpoint.clone(),
            pending: RefCell::new(None),
            timer_key: Cell::new(None),
        }))))
    }

    fn make_acceptor(
        &self,
        endpoint: &Endpoint,
        _options: SocketOptions,
    ) -> Result<Box<dyn Acceptor>> {
        let mut network = self.inner.network.borrow_mut();
        let bound = match endpoint {
            Endpoint::Tcp(addr) if addr.port() == 0 => {
                Endpoint::Tcp(SocketAddr::new(addr.ip(), network.allocate_port()))
            }
            other => other.clone(),
        };
        if network.listeners.get(&bound).and_then(Weak::upgrade).is_some() {
            return Err(CsError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{} is already bound", bound),
            )));
        }
        let acceptor = Rc::new(AcceptorInner {
            ctx: Rc::downgrade(&self.inner),
            endpoint: bound.clone(),
            backlog: RefCell::new(VecDeque::new()),
            pending: RefCell::new(None),
            timer_key: Cell::new(None),
            closed: Cell::new(false),
        });
        network.listeners.insert(bound, Rc::downgrade(&acceptor));
        Ok(Box::new(MemoryAcceptor(acceptor)))
    }

    fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, port)];
        }
        let network = self.inner.network.borrow();
        match network.hosts.get(bare) {
            Some(ips) => ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect(),
            None if bare == "localhost" => vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)],
            None => {
                log::debug!("memory network cannot resolve '{}'", bare);
                Vec::new()
            }
        }
    }

    fn work_guard(&self) -> WorkGuard {
        WorkGuard::new(self.inner.guards.clone())
    }

    fn register_signal(&self, handler: Rc<dyn Fn()>) -> CrossThreadSignal {
        let id = self.inner.next_signal.get();
        self.inner.next_signal.set(id + 1);
        self.inner.signals.borrow_mut().insert(id, handler);
        CrossThreadSignal::over_std_channel(id, self.inner.signal_tx.clone())
    }
}

// ============================================================================
// Timer
// ============================================================================

struct MemoryTimer {
    ctx: Weak<MemoryInner>,
    key: Rc<Cell<Option<TimerKey>>>,
}

impl Timer for MemoryTimer {
    fn async_wait_for(&self, duration: Duration, handler: TimerHandler) {
        self.cancel();
        let Some(ctx) = self.ctx.upgrade() else { return };
        let slot = self.key.clone();
        let key = ctx.add_timer(
            duration,
            Box::new(move || {
                slot.set(None);
                handler();
            }),
        );
        self.key.set(Some(key));
    }

    fn cancel(&self) {
        if let (Some(key), Some(ctx)) = (self.key.take(), self.ctx.upgrade()) {
            ctx.cancel_timer(key);
        }
    }
}

impl Drop for MemoryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Connector
// ============================================================================

struct ConnectorInner {
    ctx: Weak<MemoryInner>,
    endpoint: Endpoint,
    pending: RefCell<Option<ConnectHandler>>,
    timer_key: Cell<Option<TimerKey>>,
}

impl ConnectorInner {
    fn complete(&self, result: Result<Box<dyn RawByteStream>>) {
        let handler = self.pending.borrow_mut().take();
        if let Some(handler) = handler {
            if let (Some(key), Some(ctx)) = (self.timer_key.take(), self.ctx.upgrade()) {
                ctx.cancel_timer(key);
            }
            handler(result);
        }
    }
}

struct MemoryConnector(Rc<ConnectorInner>);

impl Connector for MemoryConnector {
    fn async_connect(&self, timeout: Duration, handler: ConnectHandler) -> Result<()> {
        let ctx = self
            .0
            .ctx
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;
        if self.0.pending.borrow().is_some() {
            return Err(CsError::invalid_state("AsyncConnect while a connect is pending"));
        }
        *self.0.pending.borrow_mut() = Some(handler);

        let outcome = {
            let mut network = ctx.network.borrow_mut();
            network.connect_log.push(self.0.endpoint.clone());
            network.outcome(&self.0.endpoint)
        };

        let this = Rc::downgrade(&self.0);
        match outcome {
            ConnectOutcome::Unreachable => {
                let endpoint = self.0.endpoint.clone();
                let key = ctx.add_timer(
                    timeout,
                    Box::new(move || {
                        if let Some(this) = this.upgrade() {
                            this.timer_key.set(None);
                            this.complete(Err(CsError::Timeout(format!(
                                "connect to {} timed out",
                                endpoint
                            ))));
                        }
                    }),
                );
                self.0.timer_key.set(Some(key));
            }
            ConnectOutcome::Refused => {
                let endpoint = self.0.endpoint.clone();
                ctx.schedule(Box::new(move || {
                    if let Some(this) = this.upgrade() {
                        this.complete(Err(CsError::connection(format!(
                            "connection to {} refused",
                            endpoint
                        ))));
                    }
                }));
            }
            ConnectOutcome::Listening(acceptor) => {
                let client_local = match &self.0.endpoint {
                    Endpoint::Tcp(addr) => {
                        let port = ctx.network.borrow_mut().allocate_port();
                        let ip: IpAddr = if addr.is_ipv4() {
                            Ipv4Addr::LOCALHOST.into()
                        } else {
                            Ipv6Addr::LOCALHOST.into()
                        };
                        Endpoint::Tcp(SocketAddr::new(ip, port))
                    }
                    Endpoint::Local(path) => Endpoint::Local(path.clone()),
                };
                let (client, server) =
                    MemoryStream::pair(&ctx, client_local, self.0.endpoint.clone());
                acceptor.incoming(Box::new(server));
                ctx.schedule(Box::new(move || {
                    if let Some(this) = this.upgrade() {
                        this.complete(Ok(Box::new(client)));
                    }
                }));
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        let handler = self.0.pending.borrow_mut().take();
        if let Some(handler) = handler {
            if let Some(ctx) = self.0.ctx.upgrade() {
                if let Some(key) = self.0.timer_key.take() {
                    ctx.cancel_timer(key);
                }
                ctx.post(Box::new(move || handler(Err(CsError::Cancelled))));
            }
        }
    }
}

impl Drop for MemoryConnector {
    fn drop(&mut self) {
        if let (Some(key), Some(ctx)) = (self.0.timer_key.take(), self.0.ctx.upgrade()) {
            ctx.cancel_timer(key);
        }
    }
}

// ============================================================================
// Acceptor
// ============================================================================

struct AcceptorInner {
    ctx: Weak<MemoryInner>,
    endpoint: Endpoint,
    backlog: RefCell<VecDeque<Box<dyn RawByteStream>>>,
    pending: RefCell<Option<AcceptHandler>>,
    timer_key: Cell<Option<TimerKey>>,
    closed: Cell<bool>,
}

impl AcceptorInner {
    fn incoming(&self, stream: Box<dyn RawByteStream>) {
        let handler = self.pending.borrow_mut().take();
        match (handler, self.ctx.upgrade()) {
            (Some(handler), Some(ctx)) => {
                if let Some(key) = self.timer_key.take() {
                    ctx.cancel_timer(key);
                }
                ctx.post(Box::new(move || handler(Ok(stream))));
            }
            (None, _) => self.backlog.borrow_mut().push_back(stream),
            (Some(handler), None) => *self.pending.borrow_mut() = Some(handler),
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else { return };
        ctx.network.borrow_mut().listeners.remove(&self.endpoint);
        if let Some(key) = self.timer_key.take() {
            ctx.cancel_timer(key);
        }
        let handler = self.pending.borrow_mut().take();
        if let Some(handler) = handler {
            ctx.post(Box::new(move || handler(Err(CsError::Cancelled))));
        }
        // dropping queued streams closes them
        let backlog: Vec<_> = self.backlog.borrow_mut().drain(..).collect();
        drop(backlog);
    }
}

struct MemoryAcceptor(Rc<AcceptorInner>);

impl Acceptor for MemoryAcceptor {
    fn local_endpoint(&self) -> Uri {
        self.0.endpoint.to_uri()
    }

    fn async_accept(&self, timeout: Option<Duration>, handler: AcceptHandler) -> Result<()> {
        if self.0.closed.get() {
            return Err(CsError::invalid_state("AsyncAccept on a closed acceptor"));
        }
        if self.0.pending.borrow().is_some() {
            return Err(CsError::invalid_state("AsyncAccept while an accept is pending"));
        }
        let ctx = self
            .0
            .ctx
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;

        let queued = self.0.backlog.borrow_mut().pop_front();
        if let Some(stream) = queued {
            ctx.post(Box::new(move || handler(Ok(stream))));
            return Ok(());
        }

        *self.0.pending.borrow_mut() = Some(handler);
        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            let this = Rc::downgrade(&self.0);
            let key = ctx.add_timer(
                timeout,
                Box::new(move || {
                    let Some(this) = this.upgrade() else { return };
                    this.timer_key.set(None);
                    let handler = this.pending.borrow_mut().take();
                    if let Some(handler) = handler {
                        handler(Err(CsError::Timeout("accept timed out".to_string())));
                    }
                }),
            );
            self.0.timer_key.set(Some(key));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.0.close();
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ============================================================================
// Stream
// ============================================================================

struct StreamInner {
    ctx: Weak<MemoryInner>,
    flags: RefCell<StreamFlags>,
    listener: RefCell<Option<Weak<dyn RawByteStreamListener>>>,
    inbox: RefCell<VecDeque<u8>>,
    peer: RefCell<Weak<StreamInner>>,
    peer_closed: Cell<bool>,
    pending_read: Cell<Option<usize>>,
    local: Endpoint,
    remote: Endpoint,
}

struct MemoryStream(Rc<StreamInner>);

impl MemoryStream {
    fn pair(ctx: &Rc<MemoryInner>, client: Endpoint, server: Endpoint) -> (MemoryStream, MemoryStream) {
        let make = |local: &Endpoint, remote: &Endpoint| {
            Rc::new(StreamInner {
                ctx: Rc::downgrade(ctx),
                flags: RefCell::new(StreamFlags::default()),
                listener: RefCell::new(None),
                inbox: RefCell::new(VecDeque::new()),
                peer: RefCell::new(Weak::new()),
                peer_closed: Cell::new(false),
                pending_read: Cell::new(None),
                local: local.clone(),
                remote: remote.clone(),
            })
        };
        let a = make(&client, &server);
        let b = make(&server, &client);
        *a.peer.borrow_mut() = Rc::downgrade(&b);
        *b.peer.borrow_mut() = Rc::downgrade(&a);
        (MemoryStream(a), MemoryStream(b))
    }
}

impl StreamInner {
    fn listener(&self) -> Option<Rc<dyn RawByteStreamListener>> {
        self.listener.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn try_complete_read(self: &Rc<Self>) {
        let ready = !self.inbox.borrow().is_empty() || self.peer_closed.get();
        if !ready {
            return;
        }
        let Some(max) = self.pending_read.take() else { return };
        let Some(ctx) = self.ctx.upgrade() else { return };
        let this = self.clone();
        ctx.post(Box::new(move || this.finish_read(max)));
    }

    fn finish_read(self: &Rc<Self>, max: usize) {
        if let Some(ctx) = self.ctx.upgrade() {
            let interruptions = ctx.read_interruptions.get();
            if interruptions > 0 && !self.flags.borrow().shutdown_pending() {
                // zero-byte retryable completion, re-issued without involving the listener
                ctx.read_interruptions.set(interruptions - 1);
                self.pending_read.set(Some(max));
                let this = self.clone();
                ctx.post(Box::new(move || this.try_complete_read()));
                return;
            }
        }

        self.flags.borrow_mut().end_read();
        if self.flags.borrow().shutdown_pending() {
            self.begin_shutdown();
            return;
        }

        let data: Vec<u8> = {
            let mut inbox = self.inbox.borrow_mut();
            let n = max.min(inbox.len());
            inbox.drain(..n).collect()
        };
        if data.is_empty() {
            log::debug!("{} reached end of stream", self.local);
            self.begin_shutdown();
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_read_some_done(&data);
        }
    }

    fn finish_write(self: &Rc<Self>, data: Vec<u8>) {
        self.flags.borrow_mut().end_write();
        if self.flags.borrow().shutdown_pending() {
            self.begin_shutdown();
            return;
        }
        let peer = self.peer.borrow().upgrade();
        let Some(peer) = peer.filter(|_| !self.peer_closed.get()) else {
            log::debug!("{} write to closed peer {}", self.local, self.remote);
            self.begin_shutdown();
            return;
        };
        let n = data.len();
        if let Some(ctx) = self.ctx.upgrade() {
            let peer = Rc::downgrade(&peer);
            ctx.schedule(Box::new(move || {
                if let Some(peer) = peer.upgrade() {
                    peer.receive(data);
                }
            }));
        }
        if let Some(listener) = self.listener() {
            listener.on_write_some_done(n);
        }
    }

    fn receive(self: &Rc<Self>, data: Vec<u8>) {
        if self.flags.borrow().shutdown_pending() {
            return;
        }
        self.inbox.borrow_mut().extend(data);
        self.try_complete_read();
    }

    fn begin_shutdown(self: &Rc<Self>) {
        let step = self.flags.borrow_mut().shutdown_step();
        let Some(ctx) = self.ctx.upgrade() else { return };
        if step.close {
            let peer = self.peer.borrow().upgrade();
            if let Some(peer) = peer {
                ctx.schedule(Box::new(move || {
                    peer.peer_closed.set(true);
                    peer.try_complete_read();
                }));
            }
            if self.pending_read.take().is_some() {
                let this = self.clone();
                ctx.post(Box::new(move || {
                    this.flags.borrow_mut().end_read();
                    this.begin_shutdown();
                }));
            }
        }
        if step.notify {
            let this = self.clone();
            ctx.post(Box::new(move || {
                if let Some(listener) = this.listener() {
                    listener.on_shutdown();
                }
            }));
        }
    }
}

impl RawByteStream for MemoryStream {
    fn set_listener(&self, listener: Weak<dyn RawByteStreamListener>) {
        *self.0.listener.borrow_mut() = Some(listener);
    }

    fn local_endpoint(&self) -> Uri {
        self.0.local.to_uri()
    }

    fn remote_endpoint(&self) -> Uri {
        self.0.remote.to_uri()
    }

    fn async_read_some(&self, max_bytes: usize) -> Result<()> {
        if !self.0.flags.borrow_mut().begin_read()? {
            return Ok(());
        }
        self.0.pending_read.set(Some(max_bytes.max(1)));
        self.0.try_complete_read();
        Ok(())
    }

    fn async_write_some(&self, mut data: Vec<u8>) -> Result<()> {
        if !self.0.flags.borrow_mut().begin_write()? {
            return Ok(());
        }
        let ctx = self
            .0
            .ctx
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;
        if let Some(chunk) = ctx.max_write_chunk.get() {
            data.truncate(chunk.max(1));
        }
        let this = self.0.clone();
        ctx.post(Box::new(move || this.finish_write(data)));
        Ok(())
    }

    fn shutdown(&self) {
        self.0.begin_shutdown();
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        if !self.0.flags.borrow().shutdown_pending() {
            self.0.begin_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        reads: RefCell<Vec<Vec<u8>>>,
        writes: RefCell<Vec<usize>>,
        shutdowns: Cell<usize>,
    }

    impl RawByteStreamListener for Recorder {
        fn on_read_some_done(&self, data: &[u8]) {
            self.reads.borrow_mut().push(data.to_vec());
        }
        fn on_write_some_done(&self, bytes_transferred: usize) {
            self.writes.borrow_mut().push(bytes_transferred);
        }
        fn on_shutdown(&self) {
            self.shutdowns.set(self.shutdowns.get() + 1);
        }
    }

    type Slot = Rc<RefCell<Option<Result<Box<dyn RawByteStream>>>>>;

    fn tcp(port: u16) -> Endpoint {
        Endpoint::Tcp(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port))
    }

    fn slot_handler(slot: &Slot) -> Box<dyn FnOnce(Result<Box<dyn RawByteStream>>)> {
        let slot = slot.clone();
        Box::new(move |r| *slot.borrow_mut() = Some(r))
    }

    fn connected_pair(io: &MemoryIoContext) -> (Box<dyn RawByteStream>, Box<dyn RawByteStream>) {
        let acceptor = io.make_acceptor(&tcp(0), SocketOptions::default()).unwrap();
        let port = acceptor.local_endpoint().port();
        let accepted: Slot = Rc::new(RefCell::new(None));
        let connected: Slot = Rc::new(RefCell::new(None));
        acceptor.async_accept(None, slot_handler(&accepted)).unwrap();
        let connector = io.make_connector(&tcp(port), SocketOptions::default()).unwrap();
        connector
            .async_connect(Duration::from_secs(1), slot_handler(&connected))
            .unwrap();
        io.run();
        let client = connected.borrow_mut().take().unwrap().unwrap();
        let server = accepted.borrow_mut().take().unwrap().unwrap();
        (client, server)
    }

    #[test]
    fn test_connect_accept_and_transfer() {
        let io = MemoryIoContext::new();
        let (client, server) = connected_pair(&io);

        let client_rec = Rc::new(Recorder::default());
        let server_rec = Rc::new(Recorder::default());
        client.set_listener(Rc::downgrade(&client_rec) as Weak<dyn RawByteStreamListener>);
        server.set_listener(Rc::downgrade(&server_rec) as Weak<dyn RawByteStreamListener>);

        server.async_read_some(64).unwrap();
        client.async_write_some(b"hello".to_vec()).unwrap();
        io.run();

        assert_eq!(*client_rec.writes.borrow(), vec![5]);
        assert_eq!(*server_rec.reads.borrow(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_completions_are_never_synchronous() {
        let io = MemoryIoContext::new();
        let connector = io.make_connector(&tcp(9), SocketOptions::default()).unwrap();
        let result: Slot = Rc::new(RefCell::new(None));
        connector
            .async_connect(Duration::from_secs(1), slot_handler(&result))
            .unwrap();
        assert!(result.borrow().is_none());

        io.run();
        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(CsError::Connection(_)))
        ));
    }

    #[test]
    fn test_unreachable_endpoint_times_out_in_virtual_time() {
        let io = MemoryIoContext::new();
        io.set_unreachable(tcp(9));
        let connector = io.make_connector(&tcp(9), SocketOptions::default()).unwrap();
        let result: Slot = Rc::new(RefCell::new(None));
        connector
            .async_connect(Duration::from_secs(5), slot_handler(&result))
            .unwrap();

        io.run();
        assert_eq!(io.now(), Duration::from_secs(5));
        assert!(matches!(result.borrow_mut().take(), Some(Err(CsError::Timeout(_)))));
    }

    #[test]
    fn test_second_connect_is_invalid_state_and_shutdown_cancels() {
        let io = MemoryIoContext::new();
        io.set_unreachable(tcp(9));
        let connector = io.make_connector(&tcp(9), SocketOptions::default()).unwrap();
        let result: Slot = Rc::new(RefCell::new(None));
        connector
            .async_connect(Duration::from_secs(5), slot_handler(&result))
            .unwrap();
        let again = connector.async_connect(Duration::from_secs(5), Box::new(|_| {}));
        assert!(matches!(again, Err(CsError::InvalidState(_))));

        connector.shutdown();
        io.run();
        assert!(matches!(result.borrow_mut().take(), Some(Err(CsError::Cancelled))));
        // the connect timer was disarmed
        assert_eq!(io.now(), Duration::ZERO);
    }

    #[test]
    fn test_accept_timeout() {
        let io = MemoryIoContext::new();
        let acceptor = io.make_acceptor(&tcp(0), SocketOptions::default()).unwrap();
        let result: Slot = Rc::new(RefCell::new(None));
        acceptor
            .async_accept(Some(Duration::from_millis(250)), slot_handler(&result))
            .unwrap();
        io.run();
        assert!(matches!(result.borrow_mut().take(), Some(Err(CsError::Timeout(_)))));
        assert_eq!(io.now(), Duration::from_millis(250));
    }

    #[test]
    fn test_exactly_one_shutdown_with_read_and_write_outstanding() {
        let io = MemoryIoContext::new();
        let (client, _server) = connected_pair(&io);
        let rec = Rc::new(Recorder::default());
        client.set_listener(Rc::downgrade(&rec) as Weak<dyn RawByteStreamListener>);

        client.async_read_some(16).unwrap();
        client.async_write_some(vec![1, 2, 3]).unwrap();
        client.shutdown();
        client.shutdown();
        io.run();

        assert_eq!(rec.shutdowns.get(), 1);
        assert!(rec.reads.borrow().is_empty());

        // requests after shutdown are ignored
        client.async_read_some(16).unwrap();
        io.run();
        assert_eq!(rec.shutdowns.get(), 1);
    }

    #[test]
    fn test_peer_close_is_end_of_stream() {
        let io = MemoryIoContext::new();
        let (client, server) = connected_pair(&io);
        let rec = Rc::new(Recorder::default());
        server.set_listener(Rc::downgrade(&rec) as Weak<dyn RawByteStreamListener>);

        server.async_read_some(16).unwrap();
        drop(client);
        io.run();
        assert_eq!(rec.shutdowns.get(), 1);
    }

    #[test]
    fn test_interrupted_reads_are_reissued() {
        let io = MemoryIoContext::new();
        let (client, server) = connected_pair(&io);
        let rec = Rc::new(Recorder::default());
        server.set_listener(Rc::downgrade(&rec) as Weak<dyn RawByteStreamListener>);

        io.interrupt_next_reads(3);
        server.async_read_some(16).unwrap();
        client.async_write_some(vec![9; 4]).unwrap();
        io.run();

        assert_eq!(*rec.reads.borrow(), vec![vec![9; 4]]);
        assert_eq!(rec.shutdowns.get(), 0);
    }

    #[test]
    fn test_partial_writes() {
        let io = MemoryIoContext::new();
        let (client, _server) = connected_pair(&io);
        let rec = Rc::new(Recorder::default());
        client.set_listener(Rc::downgrade(&rec) as Weak<dyn RawByteStreamListener>);

        io.set_max_write_chunk(Some(2));
        client.async_write_some(vec![0; 5]).unwrap();
        io.run();
        assert_eq!(*rec.writes.borrow(), vec![2]);
    }

    #[test]
    fn test_timers_fire_in_deadline_order_and_cancel() {
        let io = MemoryIoContext::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let late = io.make_timer();
        let early = io.make_timer();
        let cancelled = io.make_timer();

        let o = order.clone();
        late.async_wait_for(Duration::from_millis(20), Box::new(move || o.borrow_mut().push("late")));
        let o = order.clone();
        early.async_wait_for(Duration::from_millis(10), Box::new(move || o.borrow_mut().push("early")));
        let o = order.clone();
        cancelled.async_wait_for(Duration::from_millis(5), Box::new(move || o.borrow_mut().push("never")));
        cancelled.cancel();

        io.run();
        assert_eq!(*order.borrow(), vec!["early", "late"]);
        assert_eq!(io.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_signal_from_thread_while_guarded() {
        let io = MemoryIoContext::new();
        let hits = Rc::new(Cell::new(0));
        let guard = Rc::new(RefCell::new(Some(io.work_guard())));

        let h = hits.clone();
        let g = guard.clone();
        let signal = io.register_signal(Rc::new(move || {
            h.set(h.get() + 1);
            g.borrow_mut().take();
        }));

        let remote = signal.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            remote.raise();
        });
        io.run();
        worker.join().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_catchall_bind_and_port_conflicts() {
        let io = MemoryIoContext::new();
        let any = Endpoint::Tcp("0.0.0.0:7000".parse().unwrap());
        let _acceptor = io.make_acceptor(&any, SocketOptions::default()).unwrap();
        assert!(io.make_acceptor(&any, SocketOptions::default()).is_err());

        let connector = io.make_connector(&tcp(7000), SocketOptions::default()).unwrap();
        let result: Slot = Rc::new(RefCell::new(None));
        connector
            .async_connect(Duration::from_secs(1), slot_handler(&result))
            .unwrap();
        io.run_for(Duration::from_millis(1));
        assert!(matches!(result.borrow_mut().take(), Some(Ok(_))));
        assert_eq!(io.connect_log(), vec![tcp(7000)]);
    }
}
