// Framed message link over a byte stream

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::cs_interface::PeerInfo;
use crate::cs_io_context::{RawByteStream, RawByteStreamListener};
use crate::cs_messages::{FrameDecoder, Message};
use crate::cs_uri::Uri;

const READ_CHUNK: usize = 64 * 1024;

/// Identifies one link within the owning connection or registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub trait PeerListener {
    fn on_peer_message(&self, peer: PeerId, message: Message);
    /// Delivered once, after the underlying stream is closed.
    fn on_peer_shutdown(&self, peer: PeerId);
}

/// Handle to a framed link. Clones share the same link.
#[derive(Clone)]
pub struct Peer {
    inner: Rc<PeerInner>,
}

struct PeerInner {
    id: PeerId,
    stream: Box<dyn RawByteStream>,
    listener: Weak<dyn PeerListener>,
    info: RefCell<PeerInfo>,
    decoder: RefCell<FrameDecoder>,
    /// Frames waiting behind the one in flight
    queue: RefCell<VecDeque<Vec<u8>>>,
    /// Unsent remainder of the frame being written
    in_flight: RefCell<Option<Vec<u8>>>,
    closed: Cell<bool>,
}

impl Peer {
    /// Wraps the stream; nothing is read until [`Peer::start_reading`].
    pub fn new(id: PeerId, stream: Box<dyn RawByteStream>, listener: Weak<dyn PeerListener>) -> Self {
        let inner = Rc::new(PeerInner {
            id,
            stream,
            listener,
            info: RefCell::new(PeerInfo::default()),
            decoder: RefCell::new(FrameDecoder::new()),
            queue: RefCell::new(VecDeque::new()),
            in_flight: RefCell::new(None),
            closed: Cell::new(false),
        });
        let weak = Rc::downgrade(&inner) as Weak<dyn RawByteStreamListener>;
        inner.stream.set_listener(weak);
        Self { inner }
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn info(&self) -> PeerInfo {
        self.inner.info.borrow().clone()
    }

    pub fn set_info(&self, info: PeerInfo) {
        *self.inner.info.borrow_mut() = info;
    }

    /// Empty until the peer's announcement was processed.
    pub fn name(&self) -> String {
        self.inner.info.borrow().participant_name.clone()
    }

    pub fn local_address(&self) -> Uri {
        self.inner.stream.local_endpoint()
    }

    pub fn remote_address(&self) -> Uri {
        self.inner.stream.remote_endpoint()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub fn start_reading(&self) {
        self.inner.read_next();
    }

    pub fn send(&self, message: &Message) {
        self.send_frame(message.to_frame());
    }

    /// Queue an already encoded frame. Dropped silently once the link is closed.
    pub fn send_frame(&self, frame: Vec<u8>) {
        if self.inner.closed.get() {
            log::debug!("Peer {}: dropping frame on closed link", self.inner.id);
            return;
        }
        self.inner.queue.borrow_mut().push_back(frame);
        self.inner.write_next();
    }

    /// Frames not yet handed to the stream.
    pub fn pending_writes(&self) -> usize {
        self.inner.queue.borrow().len() + usize::from(self.inner.in_flight.borrow().is_some())
    }

    pub fn shutdown(&self) {
        self.inner.stream.shutdown();
    }
}

impl PeerInner {
    fn read_next(&self) {
        if self.closed.get() {
            return;
        }
        if let Err(e) = self.stream.async_read_some(READ_CHUNK) {
            log::warn!("Peer {}: cannot issue read: {}", self.id, e);
            self.stream.shutdown();
        }
    }

    fn write_next(&self) {
        if self.in_flight.borrow().is_some() {
            return;
        }
        let Some(frame) = self.queue.borrow_mut().pop_front() else {
            return;
        };
        let data = frame.clone();
        *self.in_flight.borrow_mut() = Some(frame);
        if let Err(e) = self.stream.async_write_some(data) {
            log::warn!("Peer {}: cannot issue write: {}", self.id, e);
            self.stream.shutdown();
        }
    }

    fn deliver(&self, message: Message) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_peer_message(self.id, message);
        }
    }
}

impl RawByteStreamListener for PeerInner {
    fn on_read_some_done(&self, data: &[u8]) {
        self.decoder.borrow_mut().push(data);
        loop {
            if self.closed.get() {
                return;
            }
            let next = self.decoder.borrow_mut().next_frame();
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Peer {}: {}, closing link", self.id, e);
                    self.stream.shutdown();
                    return;
                }
            };
            match Message::from_frame(&frame) {
                Ok(message) => self.deliver(message),
                Err(e) => {
                    log::error!(
                        "Peer {} ('{}'): {}, closing link",
                        self.id,
                        self.info.borrow().participant_name,
                        e
                    );
                    self.stream.shutdown();
                    return;
                }
            }
        }
        self.read_next();
    }

    fn on_write_some_done(&self, bytes_transferred: usize) {
        let resend = {
            let mut in_flight = self.in_flight.borrow_mut();
            match in_flight.as_mut() {
                Some(frame) if bytes_transferred < frame.len() => {
                    frame.drain(..bytes_transferred);
                    Some(frame.clone())
                }
                _ => {
                    *in_flight = None;
                    None
                }
            }
        };
        match resend {
            Some(rest) => {
                if let Err(e) = self.stream.async_write_some(rest) {
                    log::warn!("Peer {}: cannot continue write: {}", self.id, e);
                    self.stream.shutdown();
                }
            }
            None => self.write_next(),
        }
    }

    fn on_shutdown(&self) {
        self.closed.set(true);
        self.queue.borrow_mut().clear();
        *self.in_flight.borrow_mut() = None;
        log::debug!(
            "Peer {} ('{}') closed",
            self.id,
            self.info.borrow().participant_name
        );
        if let Some(listener) = self.listener.upgrade() {
            listener.on_peer_shutdown(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs_interface::{ParticipantState, ParticipantStatus};
    use crate::cs_io_context::{Acceptor, Endpoint, IoContext, SocketOptions};
    use crate::cs_memory_io::MemoryIoContext;
    use crate::cs_messages::{DataMessage, KnownParticipants};
    use std::net::SocketAddr;
    use std::time::Duration;

    #[derive(Default)]
    struct Inbox {
        messages: RefCell<Vec<(PeerId, Message)>>,
        closed: RefCell<Vec<PeerId>>,
    }

    impl PeerListener for Inbox {
        fn on_peer_message(&self, peer: PeerId, message: Message) {
            self.messages.borrow_mut().push((peer, message));
        }
        fn on_peer_shutdown(&self, peer: PeerId) {
            self.closed.borrow_mut().push(peer);
        }
    }

    /// Two connected peers over the memory network.
    fn linked(io: &MemoryIoContext) -> (Peer, Peer, Rc<Inbox>) {
        let endpoint = Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 3000)));
        let acceptor = io.make_acceptor(&endpoint, SocketOptions::default()).unwrap();
        let connector = io.make_connector(&endpoint, SocketOptions::default()).unwrap();

        let accepted = Rc::new(RefCell::new(None));
        let connected = Rc::new(RefCell::new(None));
        let slot = accepted.clone();
        acceptor
            .async_accept(None, Box::new(move |r| *slot.borrow_mut() = r.ok()))
            .unwrap();
        let slot = connected.clone();
        connector
            .async_connect(Duration::from_secs(1), Box::new(move |r| *slot.borrow_mut() = r.ok()))
            .unwrap();
        io.run();

        let inbox = Rc::new(Inbox::default());
        let listener = Rc::downgrade(&inbox) as Weak<dyn PeerListener>;
        let a = Peer::new(PeerId(1), connected.borrow_mut().take().unwrap(), listener.clone());
        let b = Peer::new(PeerId(2), accepted.borrow_mut().take().unwrap(), listener);
        a.start_reading();
        b.start_reading();
        (a, b, inbox)
    }

    fn data(n: usize) -> Message {
        Message::DataMessage(DataMessage {
            topic: "Topic1".to_string(),
            media_type: String::new(),
            sequence_number: n as u64,
            timestamp: Duration::from_millis(n as u64),
            data: vec![n as u8; 300],
        })
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let io = MemoryIoContext::new();
        let (a, _b, inbox) = linked(&io);

        for n in 0..5 {
            a.send(&data(n));
        }
        a.send(&Message::ParticipantStatus(ParticipantStatus::new(
            "P1",
            ParticipantState::Running,
            "go",
        )));
        io.run_for(Duration::from_millis(1));

        let messages = inbox.messages.borrow();
        assert_eq!(messages.len(), 6);
        for (n, (from, message)) in messages.iter().take(5).enumerate() {
            assert_eq!(*from, PeerId(2));
            assert_eq!(*message, data(n));
        }
        assert!(matches!(messages[5].1, Message::ParticipantStatus(_)));
        assert_eq!(a.pending_writes(), 0);
    }

    #[test]
    fn test_partial_writes_and_split_reads_reassemble() {
        let io = MemoryIoContext::new();
        io.set_max_write_chunk(Some(7));
        io.interrupt_next_reads(3);
        let (a, _b, inbox) = linked(&io);

        a.send(&data(1));
        a.send(&Message::KnownParticipants(KnownParticipants { peer_infos: Vec::new() }));
        io.run_for(Duration::from_millis(1));

        let messages = inbox.messages.borrow();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].1, data(1));
    }

    #[test]
    fn test_corrupt_frame_closes_only_that_link() {
        let io = MemoryIoContext::new();
        let (a, b, inbox) = linked(&io);

        // kind 99 does not exist
        a.send_frame(vec![5, 0, 0, 0, 99]);
        io.run_for(Duration::from_millis(1));

        assert!(inbox.messages.borrow().is_empty());
        assert!(b.is_closed());
        assert!(a.is_closed());
        let mut closed = inbox.closed.borrow().clone();
        closed.sort();
        assert_eq!(closed, vec![PeerId(1), PeerId(2)]);
    }

    #[test]
    fn test_shutdown_notifies_once_and_drops_later_sends() {
        let io = MemoryIoContext::new();
        let (a, _b, inbox) = linked(&io);

        a.shutdown();
        a.shutdown();
        io.run_for(Duration::from_millis(1));
        a.send(&data(0));

        assert_eq!(inbox.closed.borrow().iter().filter(|p| **p == PeerId(1)).count(), 1);
        assert_eq!(a.pending_writes(), 0);
        assert!(inbox.messages.borrow().is_empty());
    }
}
