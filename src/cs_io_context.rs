//! Event loop and transport abstraction.
//!
//! Connection logic only talks to these traits. Two implementations exist:
//! [`crate::cs_tokio_io::TokioIoContext`] over real sockets and
//! [`crate::cs_memory_io::MemoryIoContext`], a deterministic in-memory network.
//!
//! All completions are delivered on the event-loop thread by a later loop
//! iteration, never from inside the call that issued the operation.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cs_error::Result;
use crate::cs_uri::Uri;

pub type Task = Box<dyn FnOnce() + 'static>;

pub type ConnectHandler = Box<dyn FnOnce(Result<Box<dyn RawByteStream>>) + 'static>;
pub type AcceptHandler = Box<dyn FnOnce(Result<Box<dyn RawByteStream>>) + 'static>;
pub type TimerHandler = Box<dyn FnOnce() + 'static>;

/// Concrete address a connector dials or an acceptor binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Local(PathBuf),
}

impl Endpoint {
    pub fn to_uri(&self) -> Uri {
        match self {
            Endpoint::Tcp(addr) => Uri::tcp(&addr.ip().to_string(), addr.port()),
            Endpoint::Local(path) => Uri::local(path.clone()),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

/// Socket tuning applied to every connected or accepted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub tcp_no_delay: bool,
    pub tcp_quick_ack: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_no_delay: true,
            tcp_quick_ack: false,
        }
    }
}

// ============================================================================
// Transport Traits
// ============================================================================

/// Receives completions of a [`RawByteStream`].
pub trait RawByteStreamListener {
    fn on_read_some_done(&self, data: &[u8]);
    fn on_write_some_done(&self, bytes_transferred: usize);
    /// Terminal notification, delivered exactly once per stream.
    fn on_shutdown(&self);
}

/// A connected byte stream with at most one outstanding read and one outstanding write.
pub trait RawByteStream {
    fn set_listener(&self, listener: Weak<dyn RawByteStreamListener>);
    fn local_endpoint(&self) -> Uri;
    fn remote_endpoint(&self) -> Uri;
    /// Errors with `InvalidState` when a read is already outstanding.
    fn async_read_some(&self, max_bytes: usize) -> Result<()>;
    /// May transfer fewer bytes than given; the completion reports how many.
    fn async_write_some(&self, data: Vec<u8>) -> Result<()>;
    /// Idempotent. Closes the socket and eventually posts `on_shutdown` once.
    fn shutdown(&self);
}

pub trait Connector {
    /// Errors with `InvalidState` when a connect is already pending.
    fn async_connect(&self, timeout: Duration, handler: ConnectHandler) -> Result<()>;
    /// Cancels a pending connect, whose handler then receives `Cancelled`.
    fn shutdown(&self);
}

pub trait Acceptor {
    fn local_endpoint(&self) -> Uri;
    /// Single in-flight accept; `None` or a zero timeout waits indefinitely.
    fn async_accept(&self, timeout: Option<Duration>, handler: AcceptHandler) -> Result<()>;
    fn shutdown(&self);
}

pub trait Timer {
    /// Re-arming replaces the previous wait.
    fn async_wait_for(&self, duration: Duration, handler: TimerHandler);
    /// A cancelled timer never fires.
    fn cancel(&self);
}

/// Single-threaded completion-based event loop.
pub trait IoContext {
    /// Runs until no work is left or `stop` is called.
    fn run(&self);
    fn stop(&self);
    /// Enqueue for a later loop iteration, preserving submission order.
    fn post(&self, task: Task);
    /// Run inline when called from inside the loop, otherwise post.
    fn dispatch(&self, task: Task);
    fn make_timer(&self) -> Box<dyn Timer>;
    fn make_connector(&self, endpoint: &Endpoint, options: SocketOptions)
        -> Result<Box<dyn Connector>>;
    fn make_acceptor(&self, endpoint: &Endpoint, options: SocketOptions)
        -> Result<Box<dyn Acceptor>>;
    fn resolve(&self, host: &str, port: u16) -> Vec<SocketAddr>;
    /// Keeps `run` from returning while held.
    fn work_guard(&self) -> WorkGuard;
    /// Handler runs on the loop whenever the returned signal is raised from any thread.
    fn register_signal(&self, handler: Rc<dyn Fn()>) -> CrossThreadSignal;
}

// ============================================================================
// Shared Loop Building Blocks
// ============================================================================

/// FIFO task queue with dispatch-inline support.
#[derive(Default)]
pub struct TaskQueue {
    tasks: RefCell<VecDeque<Task>>,
    in_loop: Cell<bool>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    pub fn dispatch(&self, task: Task) {
        if self.in_loop.get() {
            task();
        } else {
            self.post(task);
        }
    }

    pub fn pop(&self) -> Option<Task> {
        self.tasks.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub fn set_in_loop(&self, in_loop: bool) {
        self.in_loop.set(in_loop);
    }

    pub fn in_loop(&self) -> bool {
        self.in_loop.get()
    }
}

/// Keeps an event loop alive while held.
pub struct WorkGuard {
    counter: Rc<Cell<usize>>,
}

impl WorkGuard {
    pub fn new(counter: Rc<Cell<usize>>) -> Self {
        counter.set(counter.get() + 1);
        Self { counter }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.counter.set(self.counter.get().saturating_sub(1));
    }
}

/// Thread-safe trigger for a handler registered on an event loop.
#[derive(Clone)]
pub struct CrossThreadSignal {
    id: usize,
    raise: Arc<dyn Fn(usize) + Send + Sync>,
}

impl CrossThreadSignal {
    pub fn new(id: usize, raise: Arc<dyn Fn(usize) + Send + Sync>) -> Self {
        Self { id, raise }
    }

    /// Wrap a std channel sender, used by loops that drain a `std::sync::mpsc` receiver.
    pub fn over_std_channel(id: usize, sender: std::sync::mpsc::Sender<usize>) -> Self {
        let sender = Arc::new(Mutex::new(sender));
        Self::new(
            id,
            Arc::new(move |id| {
                if let Ok(sender) = sender.lock() {
                    // a closed loop simply drops the signal
                    let _ = sender.send(id);
                }
            }),
        )
    }

    pub fn raise(&self) {
        (self.raise)(self.id)
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl std::fmt::Debug for CrossThreadSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CrossThreadSignal({})", self.id)
    }
}

/// Read/write/shutdown bookkeeping shared by every stream implementation.
///
/// The terminal notification may only be posted once neither a read nor a write is
/// outstanding, and only once.
#[derive(Debug, Default)]
pub struct StreamFlags {
    reading: bool,
    writing: bool,
    shutdown_pending: bool,
    shutdown_posted: bool,
}

/// What a shutdown request requires from the stream implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownStep {
    /// First request: close the underlying socket now
    pub close: bool,
    /// Both directions are quiet: post `on_shutdown` now
    pub notify: bool,
}

impl StreamFlags {
    /// `Ok(false)` means the stream is shutting down and the request is ignored.
    pub fn begin_read(&mut self) -> Result<bool> {
        if self.shutdown_pending {
            return Ok(false);
        }
        if self.reading {
            return Err(crate::cs_error::CsError::invalid_state(
                "AsyncReadSome while a read is outstanding",
            ));
        }
        self.reading = true;
        Ok(true)
    }

    pub fn end_read(&mut self) {
        assert!(self.reading, "read completion without outstanding read");
        self.reading = false;
    }

    pub fn begin_write(&mut self) -> Result<bool> {
        if self.shutdown_pending {
            return Ok(false);
        }
        if self.writing {
            return Err(crate::cs_error::CsError::invalid_state(
                "AsyncWriteSome while a write is outstanding",
            ));
        }
        self.writing = true;
        Ok(true)
    }

    pub fn end_write(&mut self) {
        assert!(self.writing, "write completion without outstanding write");
        self.writing = false;
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    pub fn shutdown_pending(&self) -> bool {
        self.shutdown_pending
    }

    pub fn shutdown_step(&mut self) -> ShutdownStep {
        let close = !self.shutdown_pending;
        self.shutdown_pending = true;
        let notify = !self.reading && !self.writing && !self.shutdown_posted;
        if notify {
            self.shutdown_posted = true;
        }
        ShutdownStep { close, notify }
    }
}

/// Two-state machine guarding single in-flight connect/accept operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpState {
    #[default]
    Idle,
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_preserves_order_and_nested_posts_run_later() {
        let queue = Rc::new(TaskQueue::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            let q = queue.clone();
            queue.post(Box::new(move || {
                order.borrow_mut().push(i);
                if i == 0 {
                    let order = order.clone();
                    q.post(Box::new(move || order.borrow_mut().push(10)));
                }
            }));
        }

        queue.set_in_loop(true);
        while let Some(task) = queue.pop() {
            task();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 10]);
    }

    #[test]
    fn test_dispatch_inline_only_inside_loop() {
        let queue = TaskQueue::new();
        let hit = Rc::new(Cell::new(false));

        let h = hit.clone();
        queue.dispatch(Box::new(move || h.set(true)));
        assert!(!hit.get());
        assert_eq!(queue.len(), 1);

        queue.set_in_loop(true);
        let h = hit.clone();
        queue.dispatch(Box::new(move || h.set(true)));
        assert!(hit.get());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_work_guard_counts() {
        let counter = Rc::new(Cell::new(0));
        let a = WorkGuard::new(counter.clone());
        let b = WorkGuard::new(counter.clone());
        assert_eq!(counter.get(), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_stream_flags_reject_second_read() {
        let mut flags = StreamFlags::default();
        assert!(flags.begin_read().unwrap());
        assert!(flags.begin_read().is_err());
        flags.end_read();
        assert!(flags.begin_read().unwrap());
    }

    #[test]
    fn test_shutdown_notification_waits_for_both_directions() {
        let mut flags = StreamFlags::default();
        flags.begin_read().unwrap();
        flags.begin_write().unwrap();

        let first = flags.shutdown_step();
        assert_eq!(first, ShutdownStep { close: true, notify: false });
        // requests after shutdown are ignored
        assert!(!flags.begin_read().unwrap());

        flags.end_read();
        assert!(!flags.shutdown_step().notify);

        flags.end_write();
        let last = flags.shutdown_step();
        assert_eq!(last, ShutdownStep { close: false, notify: true });

        // never twice
        assert!(!flags.shutdown_step().notify);
    }

    #[test]
    fn test_signal_over_std_channel() {
        let (tx, rx) = std::sync::mpsc::channel();
        let signal = CrossThreadSignal::over_std_channel(7, tx);
        let remote = signal.clone();
        std::thread::spawn(move || remote.raise()).join().unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
    }
}
