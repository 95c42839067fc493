// Minimal topic based publish/subscribe over the participant mesh

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::cs_error::{CsError, Result};
use crate::cs_handlers::{HandlerId, HandlerTable};
use crate::cs_interface::{DataMessageEvent, SimTime};
use crate::cs_messages::DataMessage;

/// What publishers need from the owning participant.
pub trait DataBus {
    fn participant_name(&self) -> String;
    fn sim_time(&self) -> SimTime;
    /// Deliver to remote participants and to local subscribers.
    fn send_data(&self, message: DataMessage);
}

/// An empty subscriber media type accepts everything.
pub fn media_type_matches(subscriber: &str, publisher: &str) -> bool {
    subscriber.is_empty() || subscriber == publisher
}

// ============================================================================
// Publisher
// ============================================================================

pub struct DataPublisher {
    topic: String,
    media_type: String,
    next_sequence_number: Cell<u64>,
    bus: Weak<dyn DataBus>,
}

impl DataPublisher {
    pub fn new(topic: &str, media_type: &str, bus: Weak<dyn DataBus>) -> Self {
        Self {
            topic: topic.to_string(),
            media_type: media_type.to_string(),
            next_sequence_number: Cell::new(0),
            bus,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Stamped with the participant's current simulation time.
    pub fn publish(&self, data: &[u8]) -> Result<()> {
        let bus = self.bus.upgrade().ok_or_else(|| {
            CsError::invalid_state(format!("publisher on '{}' outlived its participant", self.topic))
        })?;
        let sequence_number = self.next_sequence_number.get();
        self.next_sequence_number.set(sequence_number + 1);
        log::trace!(
            "PubSub: '{}' publishes #{} on '{}' ({} bytes)",
            bus.participant_name(),
            sequence_number,
            self.topic,
            data.len()
        );
        bus.send_data(DataMessage {
            topic: self.topic.clone(),
            media_type: self.media_type.clone(),
            sequence_number,
            timestamp: bus.sim_time(),
            data: data.to_vec(),
        });
        Ok(())
    }
}

// ============================================================================
// Subscribers
// ============================================================================

pub type DataHandler = dyn Fn(&DataMessageEvent);

pub struct SubscriberEntry {
    topic: String,
    media_type: String,
    handler: Box<DataHandler>,
}

/// Subscribers of one participant.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RefCell<HandlerTable<SubscriberEntry>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        topic: &str,
        media_type: &str,
        handler: impl Fn(&DataMessageEvent) + 'static,
    ) -> HandlerId {
        self.subscribers.borrow_mut().add(Rc::new(SubscriberEntry {
            topic: topic.to_string(),
            media_type: media_type.to_string(),
            handler: Box::new(handler),
        }))
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        self.subscribers.borrow_mut().remove(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    /// Hands the message to every matching subscriber; returns how many matched.
    pub fn deliver(&self, source_participant: &str, message: &DataMessage) -> usize {
        let matching: Vec<Rc<SubscriberEntry>> = self
            .subscribers
            .borrow()
            .snapshot()
            .into_iter()
            .filter(|entry| {
                entry.topic == message.topic
                    && media_type_matches(&entry.media_type, &message.media_type)
            })
            .collect();
        if matching.is_empty() {
            return 0;
        }
        let event = DataMessageEvent {
            timestamp: message.timestamp,
            topic: message.topic.clone(),
            source_participant: source_participant.to_string(),
            sequence_number: message.sequence_number,
            data: message.data.clone(),
        };
        for entry in &matching {
            (entry.handler)(&event);
        }
        matching.len()
    }
}

/// Registration handle returned by the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSubscriber {
    id: HandlerId,
}

impl DataSubscriber {
    pub fn new(id: HandlerId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Bus {
        name: String,
        now: Cell<SimTime>,
        sent: RefCell<Vec<DataMessage>>,
    }

    impl DataBus for Bus {
        fn participant_name(&self) -> String {
            self.name.clone()
        }
        fn sim_time(&self) -> SimTime {
            self.now.get()
        }
        fn send_data(&self, message: DataMessage) {
            self.sent.borrow_mut().push(message);
        }
    }

    fn bus() -> Rc<Bus> {
        Rc::new(Bus {
            name: "PubSub1".to_string(),
            now: Cell::new(Duration::ZERO),
            sent: RefCell::new(Vec::new()),
        })
    }

    #[test]
    fn test_publish_numbers_and_stamps() {
        let bus = bus();
        let publisher = DataPublisher::new("Topic1", "text/plain", Rc::downgrade(&bus) as Weak<dyn DataBus>);
        publisher.publish(b"first").unwrap();
        bus.now.set(Duration::from_millis(3));
        publisher.publish(b"second").unwrap();

        let sent = bus.sent.borrow();
        assert_eq!(sent[0].sequence_number, 0);
        assert_eq!(sent[1].sequence_number, 1);
        assert_eq!(sent[1].timestamp, Duration::from_millis(3));
        assert_eq!(sent[1].media_type, "text/plain");
        assert_eq!(sent[1].data, b"second".to_vec());
    }

    #[test]
    fn test_publish_without_participant_fails() {
        let bus = bus();
        let publisher = DataPublisher::new("Topic1", "", Rc::downgrade(&bus) as Weak<dyn DataBus>);
        drop(bus);
        assert!(matches!(publisher.publish(b"x"), Err(CsError::InvalidState(_))));
    }

    #[test]
    fn test_topic_and_media_type_filtering() {
        let registry = SubscriberRegistry::new();
        let received = Rc::new(RefCell::new(Vec::new()));
        for (topic, media_type) in [("Topic1", ""), ("Topic1", "text/plain"), ("Topic1", "application/json"), ("Topic2", "")] {
            let received = received.clone();
            let tag = format!("{}:{}", topic, media_type);
            registry.add(topic, media_type, move |event| {
                received.borrow_mut().push((tag.clone(), event.source_participant.clone()))
            });
        }

        let message = DataMessage {
            topic: "Topic1".to_string(),
            media_type: "text/plain".to_string(),
            sequence_number: 4,
            timestamp: Duration::from_millis(1),
            data: b"hello".to_vec(),
        };
        assert_eq!(registry.deliver("PubSub1", &message), 2);
        let tags: Vec<String> = received.borrow().iter().map(|(tag, _)| tag.clone()).collect();
        assert_eq!(tags, vec!["Topic1:", "Topic1:text/plain"]);
        assert_eq!(received.borrow()[0].1, "PubSub1");
    }

    #[test]
    fn test_removed_subscriber_gets_nothing() {
        let registry = SubscriberRegistry::new();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let id = registry.add("Topic1", "", move |_| counter.set(counter.get() + 1));
        assert!(registry.remove(id));
        assert!(registry.is_empty());

        let message = DataMessage {
            topic: "Topic1".to_string(),
            media_type: String::new(),
            sequence_number: 0,
            timestamp: Duration::ZERO,
            data: Vec::new(),
        };
        assert_eq!(registry.deliver("P", &message), 0);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_media_type_rules() {
        assert!(media_type_matches("", "anything"));
        assert!(media_type_matches("a/b", "a/b"));
        assert!(!media_type_matches("a/b", ""));
    }
}
