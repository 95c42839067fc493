//! Event loop over real sockets.
//!
//! A current-thread tokio runtime drives a `LocalSet`; every asynchronous operation is
//! a local task whose completion is posted back into the loop's task queue. `run`
//! returns once the queue is empty and no operation, guard or `stop` keeps it going.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp, TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{unix, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::cs_error::{CsError, Result};
use crate::cs_io_context::{
    AcceptHandler, Acceptor, ConnectHandler, Connector, CrossThreadSignal, Endpoint, IoContext,
    RawByteStream, RawByteStreamListener, SocketOptions, StreamFlags, Task, TaskQueue, Timer,
    TimerHandler, WorkGuard,
};
use crate::cs_uri::Uri;

pub struct TokioIoContext {
    shared: Rc<Shared>,
}

struct Shared {
    runtime: tokio::runtime::Runtime,
    local: tokio::task::LocalSet,
    queue: TaskQueue,
    wake: Notify,
    pending_ops: Cell<usize>,
    guards: Rc<Cell<usize>>,
    signal_tx: mpsc::UnboundedSender<usize>,
    signal_rx: RefCell<Option<mpsc::UnboundedReceiver<usize>>>,
    signals: RefCell<HashMap<usize, Rc<dyn Fn()>>>,
    next_signal: Cell<usize>,
    stopped: Cell<bool>,
}

/// Decrements the operation count when the local task ends, however it ends.
struct OpGuard(Weak<Shared>);

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.0.upgrade() {
            shared.pending_ops.set(shared.pending_ops.get().saturating_sub(1));
            shared.wake.notify_one();
        }
    }
}

impl Shared {
    fn post(&self, task: Task) {
        self.queue.post(task);
        self.wake.notify_one();
    }

    fn spawn_op(self: &Rc<Self>, op: impl Future<Output = ()> + 'static) {
        self.pending_ops.set(self.pending_ops.get() + 1);
        let guard = OpGuard(Rc::downgrade(self));
        self.local.spawn_local(async move {
            let _guard = guard;
            op.await;
        });
    }

    fn fire_signal(&self, id: usize) {
        let handler = self.signals.borrow().get(&id).cloned();
        match handler {
            Some(handler) => handler(),
            None => log::debug!("dropping signal {} without handler", id),
        }
    }
}

impl TokioIoContext {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Rc::new(Shared {
                runtime,
                local: tokio::task::LocalSet::new(),
                queue: TaskQueue::new(),
                wake: Notify::new(),
                pending_ops: Cell::new(0),
                guards: Rc::new(Cell::new(0)),
                signal_tx,
                signal_rx: RefCell::new(Some(signal_rx)),
                signals: RefCell::new(HashMap::new()),
                next_signal: Cell::new(1),
                stopped: Cell::new(false),
            }),
        })
    }
}

impl IoContext for TokioIoContext {
    fn run(&self) {
        let shared = self.shared.clone();
        let receiver = shared.signal_rx.borrow_mut().take();
        let Some(mut signals) = receiver else {
            log::warn!("TokioIoContext::run is not re-entrant");
            return;
        };

        shared.queue.set_in_loop(true);
        shared.local.block_on(&shared.runtime, async {
            loop {
                // tasks posted by this batch run in the next one, after pending i/o was polled
                for _ in 0..shared.queue.len() {
                    if shared.stopped.get() {
                        break;
                    }
                    if let Some(task) = shared.queue.pop() {
                        task();
                    }
                }
                if shared.stopped.get() {
                    break;
                }
                if !shared.queue.is_empty() {
                    tokio::task::yield_now().await;
                    continue;
                }
                if shared.pending_ops.get() == 0 && shared.guards.get() == 0 {
                    break;
                }
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    Some(id) = signals.recv() => shared.fire_signal(id),
                }
            }
        });
        shared.queue.set_in_loop(false);
        shared.stopped.set(false);
        *shared.signal_rx.borrow_mut() = Some(signals);
    }

    fn stop(&self) {
        self.shared.stopped.set(true);
        self.shared.wake.notify_one();
    }

    fn post(&self, task: Task) {
        self.shared.post(task);
    }

    fn dispatch(&self, task: Task) {
        if self.shared.queue.in_loop() {
            task();
        } else {
            self.shared.post(task);
        }
    }

    fn make_timer(&self) -> Box<dyn Timer> {
        Box::new(TokioTimer {
            shared: Rc::downgrade(&self.shared),
            generation: Rc::new(Cell::new(0)),
            cancel: RefCell::new(None),
        })
    }

    fn make_connector(&self, endpoint: &Endpoint, options: SocketOptions)
        -> Result<Box<dyn Connector>> {
        Ok(Box::new(TokioConnector {
            shared: Rc::downgrade(&self.shared),
            endpoint: endpoint.clone(),
            options,
            state: Rc::new(RefCell::new(PendingOp::default())),
        }))
    }

    fn make_acceptor(&self, endpoint: &Endpoint, options: SocketOptions)
        -> Result<Box<dyn Acceptor>> {
        let _runtime = self.shared.runtime.enter();
        let (listener, local) = match endpoint {
            Endpoint::Tcp(addr) => {
                let std_listener = std::net::TcpListener::bind(addr)?;
                std_listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(std_listener)?;
                let bound = listener.local_addr()?;
                (
                    Listener::Tcp(listener),
                    Uri::tcp(&bound.ip().to_string(), bound.port()),
                )
            }
            #[cfg(unix)]
            Endpoint::Local(path) => {
                // a stale socket file from an earlier run blocks the bind
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                (Listener::Unix(listener, path.clone()), Uri::local(path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Local(_) => {
                return Err(CsError::configuration(
                    "local-domain sockets are not supported on this platform",
                ))
            }
        };
        log::debug!("acceptor listening on {}", local);
        Ok(Box::new(TokioAcceptor {
            shared: Rc::downgrade(&self.shared),
            listener: Rc::new(listener),
            local,
            options,
            state: Rc::new(RefCell::new(PendingOp::default())),
        }))
    }

    fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match (bare, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                log::debug!("cannot resolve '{}': {}", bare, e);
                Vec::new()
            }
        }
    }

    fn work_guard(&self) -> WorkGuard {
        WorkGuard::new(self.shared.guards.clone())
    }

    fn register_signal(&self, handler: Rc<dyn Fn()>) -> CrossThreadSignal {
        let id = self.shared.next_signal.get();
        self.shared.next_signal.set(id + 1);
        self.shared.signals.borrow_mut().insert(id, handler);
        let sender = self.shared.signal_tx.clone();
        CrossThreadSignal::new(
            id,
            Arc::new(move |id| {
                // a closed loop simply drops the signal
                let _ = sender.send(id);
            }),
        )
    }
}

// ============================================================================
// Sockets
// ============================================================================

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream, PathBuf),
}

async fn open_socket(endpoint: &Endpoint) -> io::Result<Socket> {
    match endpoint {
        Endpoint::Tcp(addr) => Ok(Socket::Tcp(TcpStream::connect(addr).await?)),
        #[cfg(unix)]
        Endpoint::Local(path) => Ok(Socket::Unix(UnixStream::connect(path).await?, path.clone())),
        #[cfg(not(unix))]
        Endpoint::Local(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "local-domain sockets are not supported on this platform",
        )),
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    async fn accept(&self) -> io::Result<Socket> {
        match self {
            Listener::Tcp(listener) => Ok(Socket::Tcp(listener.accept().await?.0)),
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                Ok(Socket::Unix(listener.accept().await?.0, path.clone()))
            }
        }
    }
}

enum ReadHalf {
    Tcp(tcp::OwnedReadHalf),
    #[cfg(unix)]
    Unix(unix::OwnedReadHalf),
}

impl ReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Tcp(half) => half.read(buf).await,
            #[cfg(unix)]
            ReadHalf::Unix(half) => half.read(buf).await,
        }
    }

    /// The kernel clears quick-ack after delayed acks resume, so it is re-armed per read.
    fn quick_ack(&self) {
        #[cfg(target_os = "linux")]
        {
            if let ReadHalf::Tcp(half) = self {
                let stream: &TcpStream = half.as_ref();
                if let Err(e) = socket2::SockRef::from(stream).set_quickack(true) {
                    log::warn!("failed to set TCP_QUICKACK: {}", e);
                }
            }
        }
    }
}

enum WriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    #[cfg(unix)]
    Unix(unix::OwnedWriteHalf),
}

impl WriteHalf {
    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Tcp(half) => half.write(data).await,
            #[cfg(unix)]
            WriteHalf::Unix(half) => half.write(data).await,
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Single in-flight operation plus its cancellation trigger.
#[derive(Default)]
struct PendingOp {
    pending: bool,
    closed: bool,
    cancel: Option<oneshot::Sender<()>>,
}

async fn wait_optional(timeout: Option<Duration>) {
    match timeout.filter(|t| !t.is_zero()) {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// Timer
// ============================================================================

struct TokioTimer {
    shared: Weak<Shared>,
    generation: Rc<Cell<u64>>,
    cancel: RefCell<Option<oneshot::Sender<()>>>,
}

impl Timer for TokioTimer {
    fn async_wait_for(&self, duration: Duration, handler: TimerHandler) {
        self.cancel();
        let Some(shared) = self.shared.upgrade() else { return };
        let armed = self.generation.get();
        let generation = self.generation.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        *self.cancel.borrow_mut() = Some(cancel_tx);

        let weak = self.shared.clone();
        shared.spawn_op(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if let Some(shared) = weak.upgrade() {
                        shared.post(Box::new(move || {
                            // cancelled or re-armed after expiry but before delivery
                            if generation.get() == armed {
                                handler();
                            }
                        }));
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }

    fn cancel(&self) {
        self.generation.set(self.generation.get() + 1);
        self.cancel.borrow_mut().take();
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Connector / Acceptor
// ============================================================================

struct TokioConnector {
    shared: Weak<Shared>,
    endpoint: Endpoint,
    options: SocketOptions,
    state: Rc<RefCell<PendingOp>>,
}

impl Connector for TokioConnector {
    fn async_connect(&self, timeout: Duration, handler: ConnectHandler) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;
        let cancel_rx = {
            let mut state = self.state.borrow_mut();
            if state.pending {
                return Err(CsError::invalid_state("AsyncConnect while a connect is pending"));
            }
            let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
            state.pending = true;
            state.cancel = Some(cancel_tx);
            cancel_rx
        };

        let endpoint = self.endpoint.clone();
        let options = self.options;
        let state = self.state.clone();
        let weak = self.shared.clone();
        shared.spawn_op(async move {
            let result = tokio::select! {
                r = tokio::time::timeout(timeout, open_socket(&endpoint)) => match r {
                    Ok(Ok(socket)) => Ok(socket),
                    Ok(Err(e)) => Err(CsError::Io(e)),
                    Err(_) => Err(CsError::Timeout(format!("connect to {} timed out", endpoint))),
                },
                _ = cancel_rx => Err(CsError::Cancelled),
            };
            let Some(shared) = weak.upgrade() else { return };
            shared.post(Box::new(move || {
                {
                    let mut state = state.borrow_mut();
                    state.pending = false;
                    state.cancel = None;
                }
                let stream = result.and_then(|socket| TokioStream::open(&weak, socket, options));
                handler(stream.map(|s| Box::new(s) as Box<dyn RawByteStream>));
            }));
        });
        Ok(())
    }

    fn shutdown(&self) {
        self.state.borrow_mut().cancel.take();
    }
}

impl Drop for TokioConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct TokioAcceptor {
    shared: Weak<Shared>,
    listener: Rc<Listener>,
    local: Uri,
    options: SocketOptions,
    state: Rc<RefCell<PendingOp>>,
}

impl Acceptor for TokioAcceptor {
    fn local_endpoint(&self) -> Uri {
        self.local.clone()
    }

    fn async_accept(&self, timeout: Option<Duration>, handler: AcceptHandler) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;
        let cancel_rx = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(CsError::invalid_state("AsyncAccept on a closed acceptor"));
            }
            if state.pending {
                return Err(CsError::invalid_state("AsyncAccept while an accept is pending"));
            }
            let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
            state.pending = true;
            state.cancel = Some(cancel_tx);
            cancel_rx
        };

        let listener = self.listener.clone();
        let options = self.options;
        let state = self.state.clone();
        let weak = self.shared.clone();
        shared.spawn_op(async move {
            let result = tokio::select! {
                r = listener.accept() => r.map_err(CsError::Io),
                _ = wait_optional(timeout) => Err(CsError::Timeout("accept timed out".to_string())),
                _ = cancel_rx => Err(CsError::Cancelled),
            };
            let Some(shared) = weak.upgrade() else { return };
            shared.post(Box::new(move || {
                {
                    let mut state = state.borrow_mut();
                    state.pending = false;
                    state.cancel = None;
                }
                let stream = result.and_then(|socket| TokioStream::open(&weak, socket, options));
                handler(stream.map(|s| Box::new(s) as Box<dyn RawByteStream>));
            }));
        });
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.cancel.take();
    }
}

impl Drop for TokioAcceptor {
    fn drop(&mut self) {
        self.shutdown();
        #[cfg(unix)]
        {
            if let Listener::Unix(_, path) = self.listener.as_ref() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

struct StreamInner {
    shared: Weak<Shared>,
    flags: RefCell<StreamFlags>,
    listener: RefCell<Option<Weak<dyn RawByteStreamListener>>>,
    reader: RefCell<Option<ReadHalf>>,
    writer: RefCell<Option<WriteHalf>>,
    closed: watch::Sender<bool>,
    quick_ack: bool,
    local: Uri,
    remote: Uri,
}

pub struct TokioStream(Rc<StreamInner>);

impl TokioStream {
    fn open(shared: &Weak<Shared>, socket: Socket, options: SocketOptions) -> Result<TokioStream> {
        let (reader, writer, local, remote) = match socket {
            Socket::Tcp(stream) => {
                stream.set_nodelay(options.tcp_no_delay)?;
                let local = stream.local_addr()?;
                let remote = stream.peer_addr()?;
                let (r, w) = stream.into_split();
                (
                    ReadHalf::Tcp(r),
                    WriteHalf::Tcp(w),
                    Uri::tcp(&local.ip().to_string(), local.port()),
                    Uri::tcp(&remote.ip().to_string(), remote.port()),
                )
            }
            #[cfg(unix)]
            Socket::Unix(stream, path) => {
                let (r, w) = stream.into_split();
                let uri = Uri::local(path);
                (ReadHalf::Unix(r), WriteHalf::Unix(w), uri.clone(), uri)
            }
        };
        let quick_ack = options.tcp_quick_ack;
        if quick_ack {
            reader.quick_ack();
        }
        let (closed, _) = watch::channel(false);
        Ok(TokioStream(Rc::new(StreamInner {
            shared: shared.clone(),
            flags: RefCell::new(StreamFlags::default()),
            listener: RefCell::new(None),
            reader: RefCell::new(Some(reader)),
            writer: RefCell::new(Some(writer)),
            closed,
            quick_ack,
            local,
            remote,
        })))
    }
}

impl StreamInner {
    fn listener(&self) -> Option<Rc<dyn RawByteStreamListener>> {
        self.listener.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn issue_read(self: &Rc<Self>, max_bytes: usize) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;
        let mut reader = self
            .reader
            .borrow_mut()
            .take()
            .ok_or_else(|| CsError::invalid_state("stream has no read half"))?;
        let mut closed = self.closed.subscribe();
        let this = self.clone();
        shared.spawn_op(async move {
            let mut buf = vec![0u8; max_bytes.max(1)];
            let outcome = tokio::select! {
                r = reader.read(&mut buf) => Some(r),
                _ = closed.changed() => None,
            };
            if this.quick_ack {
                reader.quick_ack();
            }
            let Some(shared) = this.shared.upgrade() else { return };
            shared.post(Box::new(move || this.finish_read(reader, buf, outcome)));
        });
        Ok(())
    }

    fn finish_read(self: &Rc<Self>, reader: ReadHalf, buf: Vec<u8>, outcome: Option<io::Result<usize>>) {
        if self.flags.borrow().shutdown_pending() {
            drop(reader);
            self.flags.borrow_mut().end_read();
            self.begin_shutdown();
            return;
        }
        *self.reader.borrow_mut() = Some(reader);

        if let Some(Err(e)) = &outcome {
            if is_retryable(e) {
                if let Err(e) = self.issue_read(buf.len()) {
                    log::warn!("{}: re-issuing read failed: {}", self.remote, e);
                    self.flags.borrow_mut().end_read();
                    self.begin_shutdown();
                }
                return;
            }
        }

        self.flags.borrow_mut().end_read();
        match outcome {
            Some(Ok(n)) if n > 0 => {
                if let Some(listener) = self.listener() {
                    listener.on_read_some_done(&buf[..n]);
                }
            }
            Some(Ok(_)) => {
                log::debug!("{}: end of stream", self.remote);
                self.begin_shutdown();
            }
            Some(Err(e)) => {
                log::debug!("{}: read failed: {}", self.remote, e);
                self.begin_shutdown();
            }
            None => self.begin_shutdown(),
        }
    }

    fn issue_write(self: &Rc<Self>, data: Vec<u8>) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("io context is gone"))?;
        let mut writer = self
            .writer
            .borrow_mut()
            .take()
            .ok_or_else(|| CsError::invalid_state("stream has no write half"))?;
        let mut closed = self.closed.subscribe();
        let this = self.clone();
        shared.spawn_op(async move {
            let outcome = tokio::select! {
                r = writer.write(&data) => Some(r),
                _ = closed.changed() => None,
            };
            let Some(shared) = this.shared.upgrade() else { return };
            shared.post(Box::new(move || this.finish_write(writer, data, outcome)));
        });
        Ok(())
    }

    fn finish_write(self: &Rc<Self>, writer: WriteHalf, data: Vec<u8>, outcome: Option<io::Result<usize>>) {
        if self.flags.borrow().shutdown_pending() {
            drop(writer);
            self.flags.borrow_mut().end_write();
            self.begin_shutdown();
            return;
        }
        *self.writer.borrow_mut() = Some(writer);

        if let Some(Err(e)) = &outcome {
            if is_retryable(e) {
                if let Err(e) = self.issue_write(data) {
                    log::warn!("{}: re-issuing write failed: {}", self.remote, e);
                    self.flags.borrow_mut().end_write();
                    self.begin_shutdown();
                }
                return;
            }
        }

        self.flags.borrow_mut().end_write();
        match outcome {
            Some(Ok(n)) if n > 0 || data.is_empty() => {
                if let Some(listener) = self.listener() {
                    listener.on_write_some_done(n);
                }
            }
            Some(Ok(_)) => {
                log::debug!("{}: peer stopped accepting data", self.remote);
                self.begin_shutdown();
            }
            Some(Err(e)) => {
                log::debug!("{}: write failed: {}", self.remote, e);
                self.begin_shutdown();
            }
            None => self.begin_shutdown(),
        }
    }

    fn begin_shutdown(self: &Rc<Self>) {
        let step = self.flags.borrow_mut().shutdown_step();
        if step.close {
            self.closed.send_replace(true);
            self.reader.borrow_mut().take();
            self.writer.borrow_mut().take();
        }
        if step.notify {
            if let Some(shared) = self.shared.upgrade() {
                let this = self.clone();
                shared.post(Box::new(move || {
                    if let Some(listener) = this.listener() {
                        listener.on_shutdown();
                    }
                }));
            }
        }
    }
}

impl RawByteStream for TokioStream {
    fn set_listener(&self, listener: Weak<dyn RawByteStreamListener>) {
        *self.0.listener.borrow_mut() = Some(listener);
    }

    fn local_endpoint(&self) -> Uri {
        self.0.local.clone()
    }

    fn remote_endpoint(&self) -> Uri {
        self.0.remote.clone()
    }

    fn async_read_some(&self, max_bytes: usize) -> Result<()> {
        if !self.0.flags.borrow_mut().begin_read()? {
            return Ok(());
        }
        if let Err(e) = self.0.issue_read(max_bytes) {
            self.0.flags.borrow_mut().end_read();
            return Err(e);
        }
        Ok(())
    }

    fn async_write_some(&self, data: Vec<u8>) -> Result<()> {
        if !self.0.flags.borrow_mut().begin_write()? {
            return Ok(());
        }
        if let Err(e) = self.0.issue_write(data) {
            self.0.flags.borrow_mut().end_write();
            return Err(e);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.0.begin_shutdown();
    }
}

impl Drop for TokioStream {
    fn drop(&mut self) {
        if !self.0.flags.borrow().shutdown_pending() {
            self.0.begin_shutdown();
        }
    }
}
