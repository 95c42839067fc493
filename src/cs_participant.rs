//! The participant: one simulation member with its services.
//!
//! A [`Participant`] owns the [`Connection`] to the other participants and wires
//! the lifecycle, time synchronization, system monitor/controller and pub/sub
//! services to it. Everything runs on the participant's event loop.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::cs_config::ParticipantConfiguration;
use crate::cs_connection::{ConnectedPeer, Connection, JoinHandler, JoinState, MessageSender, ServiceReceiver};
use crate::cs_error::{CsError, Result};
use crate::cs_handlers::HandlerId;
use crate::cs_interface::{
    DataMessageEvent, Event, EventSink, NextSimTask, NoOpSink, ParticipantState, ParticipantStatus,
    PeerInfo, SimTime, SystemCommand, WorkflowConfiguration,
};
use crate::cs_io_context::IoContext;
use crate::cs_lifecycle::{LifecycleHost, LifecycleService};
use crate::cs_messages::{DataMessage, Message};
use crate::cs_pubsub::{DataBus, DataPublisher, DataSubscriber, SubscriberRegistry};
use crate::cs_system_state::{SystemCommandDispatch, SystemController, SystemMonitor};
use crate::cs_time_sync::{TimeSyncHost, TimeSyncService};

/// Outcome of the join, kept for callers asking after it completed.
enum JoinOutcome {
    Pending,
    Joined,
    Failed(String),
}

pub struct Participant {
    inner: Rc<ParticipantInner>,
}

struct ParticipantInner {
    self_weak: Weak<ParticipantInner>,
    io: Rc<dyn IoContext>,
    name: String,
    connection: Connection,
    lifecycle: LifecycleService,
    time_sync: TimeSyncService,
    monitor: SystemMonitor,
    subscribers: SubscriberRegistry,
    workflow: RefCell<Option<WorkflowConfiguration>>,
    join_outcome: RefCell<JoinOutcome>,
    join_waiters: RefCell<Vec<JoinHandler>>,
    join_requested: Cell<bool>,
    sink: RefCell<Box<dyn EventSink>>,
}

impl Participant {
    /// Validates the configuration; nothing touches the network until joining.
    pub fn new(io: Rc<dyn IoContext>, config: ParticipantConfiguration) -> Result<Self> {
        config.validate()?;
        let inner = Rc::new_cyclic(|self_weak: &Weak<ParticipantInner>| {
            let name = config.participant_name.clone();
            ParticipantInner {
                self_weak: self_weak.clone(),
                io: io.clone(),
                lifecycle: LifecycleService::new(
                    &name,
                    config.lifecycle.coordinated,
                    self_weak.clone() as Weak<dyn LifecycleHost>,
                ),
                time_sync: TimeSyncService::new(
                    &name,
                    io.clone(),
                    config.step_period(),
                    self_weak.clone() as Weak<dyn TimeSyncHost>,
                ),
                connection: Connection::new(io.clone(), config),
                name,
                monitor: SystemMonitor::new(),
                subscribers: SubscriberRegistry::new(),
                workflow: RefCell::new(None),
                join_outcome: RefCell::new(JoinOutcome::Pending),
                join_waiters: RefCell::new(Vec::new()),
                join_requested: Cell::new(false),
                sink: RefCell::new(Box::new(NoOpSink)),
            }
        });
        inner
            .connection
            .set_service_receiver(inner.self_weak.clone() as Weak<dyn ServiceReceiver>);
        Ok(Self { inner })
    }

    pub fn participant_name(&self) -> &str {
        &self.inner.name
    }

    pub fn lifecycle(&self) -> LifecycleService {
        self.inner.lifecycle.clone()
    }

    pub fn time_sync(&self) -> TimeSyncService {
        self.inner.time_sync.clone()
    }

    pub fn system_monitor(&self) -> &SystemMonitor {
        &self.inner.monitor
    }

    pub fn system_controller(&self) -> SystemController {
        SystemController::new(self.inner.self_weak.clone() as Weak<dyn SystemCommandDispatch>)
    }

    pub fn create_data_publisher(&self, topic: &str, media_type: &str) -> DataPublisher {
        DataPublisher::new(topic, media_type, self.inner.self_weak.clone() as Weak<dyn DataBus>)
    }

    /// An empty media type subscribes to every media type on the topic.
    pub fn create_data_subscriber(
        &self,
        topic: &str,
        media_type: &str,
        handler: impl Fn(&DataMessageEvent) + 'static,
    ) -> DataSubscriber {
        DataSubscriber::new(self.inner.subscribers.add(topic, media_type, handler))
    }

    pub fn remove_data_subscriber(&self, subscriber: DataSubscriber) -> bool {
        self.inner.subscribers.remove(subscriber.id())
    }

    /// Joins without running a lifecycle, e.g. for a pure system controller.
    ///
    /// Joining happens once per participant; later calls wait for the same outcome.
    pub fn join_simulation(&self, on_joined: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        self.inner.ensure_joined(Box::new(on_joined))
    }

    pub fn join_state(&self) -> JoinState {
        self.inner.connection.join_state()
    }

    /// Shorthand for the system monitor's handler registration.
    pub fn add_system_state_handler(
        &self,
        handler: impl Fn(ParticipantState) + 'static,
    ) -> HandlerId {
        self.inner.monitor.add_system_state_handler(handler)
    }

    pub fn is_joined(&self) -> bool {
        matches!(*self.inner.join_outcome.borrow(), JoinOutcome::Joined)
    }

    /// Our announced connection metadata; acceptor URIs are known once joining started.
    pub fn peer_info(&self) -> PeerInfo {
        self.inner.connection.peer_info()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.inner.connection.connected_peers()
    }

    pub fn is_proxied(&self, participant_name: &str) -> bool {
        self.inner.connection.is_proxied(participant_name)
    }

    pub fn describe_connection(&self) -> String {
        self.inner.connection.describe_known_participants()
    }

    pub fn set_event_sink(&self, sink: Box<dyn EventSink>) {
        *self.inner.sink.borrow_mut() = sink;
    }

    /// Closes every link; peers see this participant disconnect.
    pub fn shutdown(&self) {
        self.inner.connection.shutdown();
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ParticipantInner {
    fn emit(&self, event: Event) {
        self.sink.borrow_mut().log(&self.name, event);
    }

    fn ensure_joined(&self, on_joined: JoinHandler) -> Result<()> {
        let resolved: Option<Result<()>> = match &*self.join_outcome.borrow() {
            JoinOutcome::Pending => None,
            JoinOutcome::Joined => Some(Ok(())),
            JoinOutcome::Failed(reason) => Some(Err(CsError::connection(reason.clone()))),
        };
        if let Some(result) = resolved {
            self.io.post(Box::new(move || on_joined(result)));
            return Ok(());
        }
        self.join_waiters.borrow_mut().push(on_joined);
        if self.join_requested.replace(true) {
            return Ok(());
        }

        self.connection.set_time_sync_active(self.time_sync.is_active());
        let weak = self.self_weak.clone();
        let started = self.connection.join_simulation(Box::new(move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.on_join_result(result);
            }
        }));
        if let Err(e) = started {
            self.join_requested.set(false);
            self.join_waiters.borrow_mut().clear();
            return Err(e);
        }
        Ok(())
    }

    fn on_join_result(&self, result: Result<()>) {
        *self.join_outcome.borrow_mut() = match &result {
            Ok(()) => JoinOutcome::Joined,
            Err(e) => {
                self.emit(Event::ConnectFailed {
                    description: e.to_string(),
                });
                JoinOutcome::Failed(e.to_string())
            }
        };
        let waiters: Vec<JoinHandler> = self.join_waiters.borrow_mut().drain(..).collect();
        let mut first = Some(result);
        for waiter in waiters {
            let result = match first.take() {
                Some(result) => result,
                None => match &*self.join_outcome.borrow() {
                    JoinOutcome::Failed(reason) => Err(CsError::connection(reason.clone())),
                    _ => Ok(()),
                },
            };
            waiter(result);
        }
    }

    fn send_history(&self, peer: &str) {
        if self.lifecycle.state() != ParticipantState::ServicesCreated {
            self.connection
                .send_to(peer, &Message::ParticipantStatus(self.lifecycle.status()));
        }
        let workflow = self.workflow.borrow().clone();
        if let Some(workflow) = workflow {
            self.connection
                .send_to(peer, &Message::WorkflowConfiguration(workflow));
        }
        if let Some(task) = self.time_sync.next_task() {
            self.connection.send_to(peer, &Message::NextSimTask(task));
        }
    }
}

// ============================================================================
// Service Wiring
// ============================================================================

impl ServiceReceiver for ParticipantInner {
    fn on_service_message(&self, from: &str, message: Message) {
        match message {
            Message::ParticipantStatus(status) => {
                if status.state == ParticipantState::Shutdown {
                    self.time_sync.remove_peer(from);
                }
                self.monitor.on_participant_status(status);
            }
            Message::WorkflowConfiguration(workflow) => {
                self.monitor.set_workflow_configuration(&workflow);
                *self.workflow.borrow_mut() = Some(workflow);
            }
            Message::SystemCommand(command) => {
                if self.lifecycle.state() != ParticipantState::ServicesCreated {
                    self.lifecycle.handle_system_command(&command);
                }
            }
            Message::NextSimTask(task) => self.time_sync.on_next_sim_task(from, task),
            Message::DataMessage(data) => {
                self.subscribers.deliver(from, &data);
            }
            other => log::warn!(
                "Participant: '{}' ignoring {:?} from '{}'",
                self.name,
                other.kind(),
                from
            ),
        }
    }

    fn on_peer_connected(&self, peer: &ConnectedPeer) {
        if peer.time_sync_active && self.time_sync.is_active() {
            self.time_sync.add_peer(&peer.name);
        }
        self.emit(Event::PeerConnected {
            peer: peer.name.clone(),
            via_proxy: peer.via_proxy,
        });
        self.send_history(&peer.name);
    }

    fn on_peer_disconnected(&self, participant_name: &str) {
        self.time_sync.remove_peer(participant_name);
        self.monitor.on_participant_disconnected(participant_name);
        self.emit(Event::PeerDisconnected {
            peer: participant_name.to_string(),
        });
    }
}

impl LifecycleHost for ParticipantInner {
    fn join_simulation(&self, on_joined: JoinHandler) -> Result<()> {
        self.ensure_joined(on_joined)
    }

    fn status_changed(&self, previous: ParticipantState, status: &ParticipantStatus) {
        if status.state == ParticipantState::Reinitializing {
            self.time_sync.reset();
        }
        self.time_sync
            .set_running(status.state == ParticipantState::Running);
        self.connection
            .broadcast(&Message::ParticipantStatus(status.clone()));
        self.emit(Event::StateChanged {
            from: previous,
            to: status.state,
            reason: status.enter_reason.clone(),
        });
        self.monitor.on_participant_status(status.clone());
    }
}

impl TimeSyncHost for ParticipantInner {
    fn broadcast_next_task(&self, task: &NextSimTask) {
        self.connection.broadcast(&Message::NextSimTask(*task));
    }

    fn report_step_error(&self, reason: String) {
        self.lifecycle.report_error(&reason);
    }

    fn step_executed(&self, now: SimTime, duration: Duration) {
        self.emit(Event::StepExecuted { now, duration });
    }
}

impl DataBus for ParticipantInner {
    fn participant_name(&self) -> String {
        self.name.clone()
    }

    fn sim_time(&self) -> SimTime {
        self.time_sync.now()
    }

    fn send_data(&self, message: DataMessage) {
        let message = Message::DataMessage(message);
        self.connection.broadcast(&message);
        let weak = self.self_weak.clone();
        self.io.post(Box::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            if let Message::DataMessage(data) = &message {
                inner.subscribers.deliver(&inner.name, data);
            }
        }));
    }
}

impl SystemCommandDispatch for ParticipantInner {
    fn dispatch_workflow_configuration(&self, workflow: &WorkflowConfiguration) {
        *self.workflow.borrow_mut() = Some(workflow.clone());
        self.connection
            .broadcast(&Message::WorkflowConfiguration(workflow.clone()));
        self.monitor.set_workflow_configuration(workflow);
    }

    fn dispatch_system_command(&self, command: &SystemCommand) {
        self.connection
            .broadcast(&Message::SystemCommand(command.clone()));
        // applied on a later loop iteration, outside any handler issuing it
        let weak = self.self_weak.clone();
        let command = command.clone();
        self.io.post(Box::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            if inner.lifecycle.state() != ParticipantState::ServicesCreated {
                inner.lifecycle.handle_system_command(&command);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs_config::MiddlewareConfig;
    use crate::cs_io_context::Endpoint;
    use crate::cs_memory_io::MemoryIoContext;
    use crate::cs_registry::Registry;
    use crate::cs_uri::Uri;
    use std::net::{Ipv4Addr, SocketAddr};

    fn middleware() -> MiddlewareConfig {
        MiddlewareConfig {
            enable_domain_sockets: false,
            connect_timeout_seconds: 0.5,
            remote_connect_request_timeout_seconds: 2.0,
            ..MiddlewareConfig::default()
        }
    }

    fn registry(io: &MemoryIoContext) -> Registry {
        let registry = Registry::new(Rc::new(io.clone()), middleware());
        registry.start_listening("silkit://127.0.0.1:8500").unwrap();
        registry
    }

    fn participant(io: &MemoryIoContext, name: &str, coordinated: bool, period_ms: u64) -> Participant {
        let mut config = ParticipantConfiguration::named(name);
        config.registry_uri = "silkit://127.0.0.1:8500".to_string();
        config.middleware = middleware();
        config.lifecycle.coordinated = coordinated;
        config.time_sync.step_period_ns = period_ms * 1_000_000;
        Participant::new(Rc::new(io.clone()), config).unwrap()
    }

    fn join(participant: &Participant) -> Rc<RefCell<Option<bool>>> {
        let joined = Rc::new(RefCell::new(None));
        let slot = joined.clone();
        participant
            .join_simulation(move |result| *slot.borrow_mut() = Some(result.is_ok()))
            .unwrap();
        joined
    }

    fn make_unreachable(io: &MemoryIoContext, participant: &Participant) {
        let info = participant.peer_info();
        let uri = Uri::parse(&info.acceptor_uris[0]).unwrap();
        io.set_unreachable(Endpoint::Tcp(SocketAddr::new(
            Ipv4Addr::UNSPECIFIED.into(),
            uri.port(),
        )));
    }

    fn sorted(mut names: Vec<String>) -> Vec<String> {
        names.sort();
        names
    }

    #[test]
    fn test_three_participant_mesh_with_fallbacks() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);

        let p1 = participant(&io, "P1", true, 1);
        let j1 = join(&p1);
        io.run_for(Duration::from_millis(10));
        make_unreachable(&io, &p1);

        // P2 reaches P1 only through a dial-back
        let p2 = participant(&io, "P2", true, 1);
        let j2 = join(&p2);
        io.run_for(Duration::from_secs(1));

        // P3 and P1 cannot reach each other at all
        let p3 = participant(&io, "P3", true, 1);
        let j3 = join(&p3);
        make_unreachable(&io, &p3);
        io.run_for(Duration::from_secs(3));

        for (joined, p) in [(&j1, &p1), (&j2, &p2), (&j3, &p3)] {
            assert_eq!(*joined.borrow(), Some(true), "{}", p.describe_connection());
        }
        assert_eq!(sorted(p1.connected_peers()), vec!["P2", "P3"]);
        assert_eq!(sorted(p2.connected_peers()), vec!["P1", "P3"]);
        assert_eq!(sorted(p3.connected_peers()), vec!["P1", "P2"]);
        assert!(!p2.is_proxied("P1"));
        assert!(p3.is_proxied("P1"));
        assert!(p1.is_proxied("P3"));
        assert!(!p3.is_proxied("P2"));

        // a second join request resolves with the same outcome
        let again = join(&p3);
        io.run_for(Duration::from_millis(1));
        assert_eq!(*again.borrow(), Some(true));
    }

    #[test]
    fn test_pubsub_end_to_end() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);
        let publisher_participant = participant(&io, "PubSub1", false, 1);
        let subscriber_participant = participant(&io, "Sub1", false, 1);

        let remote = Rc::new(RefCell::new(Vec::new()));
        let sink = remote.clone();
        subscriber_participant.create_data_subscriber("Topic1", "", move |event| {
            sink.borrow_mut().push(event.clone())
        });
        let local = Rc::new(Cell::new(0));
        let counter = local.clone();
        publisher_participant.create_data_subscriber("Topic1", "", move |_| {
            counter.set(counter.get() + 1)
        });
        let ignored = Rc::new(Cell::new(0));
        let counter = ignored.clone();
        subscriber_participant.create_data_subscriber("Topic1", "application/json", move |_| {
            counter.set(counter.get() + 1)
        });

        join(&publisher_participant);
        io.run_for(Duration::from_millis(10));
        join(&subscriber_participant);
        io.run_for(Duration::from_millis(10));

        let publisher = publisher_participant.create_data_publisher("Topic1", "text/plain");
        publisher.publish(b"Topic1_from_Pub1 LocalMsgId=0").unwrap();
        io.run_for(Duration::from_millis(10));

        let received = remote.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(
            String::from_utf8(received[0].data.clone()).unwrap(),
            "Topic1_from_Pub1 LocalMsgId=0"
        );
        assert_eq!(received[0].source_participant, "PubSub1");
        assert_eq!(received[0].topic, "Topic1");
        assert_eq!(received[0].sequence_number, 0);
        assert_eq!(local.get(), 1);
        assert_eq!(ignored.get(), 0);
    }

    #[test]
    fn test_coordinated_run_with_heterogeneous_periods() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);

        let controller_participant = participant(&io, "Controller", true, 1);
        let controller = controller_participant.system_controller();
        controller.set_workflow_configuration(&["Fast", "Slow"]).unwrap();
        let driver = controller.clone();
        controller_participant.add_system_state_handler(move |state| {
            let _ = match state {
                ParticipantState::ReadyToRun => driver.run(),
                ParticipantState::Stopped => driver.shutdown(),
                _ => Ok(()),
            };
        });
        join(&controller_participant);
        io.run_for(Duration::from_millis(10));

        let fast = participant(&io, "Fast", true, 1);
        let slow = participant(&io, "Slow", true, 7);
        let fast_count = Rc::new(Cell::new(0u64));
        let slow_count = Rc::new(Cell::new(0u64));
        let worst_skew = Rc::new(Cell::new(0i64));

        let (count, other, skew, stopper) = (
            fast_count.clone(),
            slow_count.clone(),
            worst_skew.clone(),
            controller.clone(),
        );
        fast.time_sync().set_simulation_step_handler(move |now, _| {
            count.set(count.get() + 1);
            let diff = (other.get() as i64 * 7 - count.get() as i64).abs();
            skew.set(skew.get().max(diff));
            if now == Duration::from_millis(70) {
                stopper.stop().unwrap();
            }
        });
        let (count, slow_times) = (slow_count.clone(), Rc::new(RefCell::new(Vec::new())));
        let times = slow_times.clone();
        slow.time_sync().set_simulation_step_handler(move |now, _| {
            count.set(count.get() + 1);
            times.borrow_mut().push(now);
        });

        fast.lifecycle().start_lifecycle().unwrap();
        slow.lifecycle().start_lifecycle().unwrap();
        let monitor_done = || {
            controller_participant.system_monitor().system_state() == ParticipantState::Shutdown
        };
        io.run_until(monitor_done);

        assert_eq!(fast.lifecycle().state(), ParticipantState::Shutdown);
        assert_eq!(slow.lifecycle().state(), ParticipantState::Shutdown);
        assert!(fast_count.get() >= 71);
        assert!(worst_skew.get() < 7, "skew {}", worst_skew.get());
        assert!(slow_times
            .borrow()
            .iter()
            .all(|t| t.as_nanos() % 7_000_000 == 0));
        assert!(slow_count.get() >= 10);
    }

    #[test]
    fn test_panicking_step_handler_is_visible_to_peers() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);
        let p1 = participant(&io, "P1", false, 1);
        let p2 = participant(&io, "P2", false, 1);
        p1.time_sync().set_simulation_step_handler(|now, _| {
            if now == Duration::from_millis(3) {
                panic!("lost track of the vehicle");
            }
        });
        let p2_steps = Rc::new(Cell::new(0));
        let counter = p2_steps.clone();
        p2.time_sync()
            .set_simulation_step_handler(move |_, _| counter.set(counter.get() + 1));
        p2.system_controller().set_workflow_configuration(&["P1", "P2"]).unwrap();

        p1.lifecycle().start_lifecycle().unwrap();
        io.run_for(Duration::from_millis(10));
        p2.lifecycle().start_lifecycle().unwrap();
        io.run_until(|| {
            p2.system_monitor()
                .participant_status("P1")
                .map_or(false, |s| s.state == ParticipantState::Error)
        });

        assert_eq!(p1.lifecycle().state(), ParticipantState::Error);
        assert!(p1.lifecycle().status().enter_reason.contains("lost track of the vehicle"));
        assert_eq!(p2.system_monitor().system_state(), ParticipantState::Error);
        // P2 cannot run ahead of the failed participant
        io.run_for(Duration::from_millis(10));
        assert!(p2_steps.get() <= 4, "{} steps", p2_steps.get());
    }

    #[test]
    fn test_participant_without_step_handler_keeps_time_still() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);
        let idle = participant(&io, "Idle", false, 1);
        let steps = Rc::new(Cell::new(0));
        let counter = steps.clone();
        idle.set_event_sink(Box::new(StepCounter(counter)));

        idle.lifecycle().start_lifecycle().unwrap();
        io.run_for(Duration::from_millis(100));

        assert_eq!(idle.lifecycle().state(), ParticipantState::Running);
        assert!(!idle.time_sync().is_active());
        assert_eq!(idle.time_sync().now(), Duration::ZERO);
        assert_eq!(idle.time_sync().next_task(), None);
        assert_eq!(steps.get(), 0);
    }

    struct StepCounter(Rc<Cell<u64>>);

    impl EventSink for StepCounter {
        fn log(&mut self, _participant: &str, event: Event) {
            if let Event::StepExecuted { .. } = event {
                self.0.set(self.0.get() + 1);
            }
        }
    }

    #[test]
    fn test_restart_after_step_panic_resumes_stepping() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);
        let controller_participant = participant(&io, "Controller", true, 1);
        let controller = controller_participant.system_controller();
        controller.set_workflow_configuration(&["P1"]).unwrap();
        let driver = controller.clone();
        controller_participant.add_system_state_handler(move |state| {
            if state == ParticipantState::ReadyToRun {
                let _ = driver.run();
            }
        });
        join(&controller_participant);
        io.run_for(Duration::from_millis(10));

        let p1 = participant(&io, "P1", true, 1);
        let armed = Rc::new(Cell::new(true));
        let steps = Rc::new(RefCell::new(Vec::new()));
        let (trap, seen) = (armed.clone(), steps.clone());
        p1.time_sync().set_simulation_step_handler(move |now, _| {
            seen.borrow_mut().push(now);
            if now == Duration::from_millis(2) && trap.replace(false) {
                panic!("solver diverged");
            }
        });
        p1.lifecycle().start_lifecycle().unwrap();
        io.run_until(|| p1.lifecycle().state() == ParticipantState::Error);
        assert_eq!(steps.borrow().len(), 3);

        controller.restart("P1").unwrap();
        io.run_until(|| p1.lifecycle().state() == ParticipantState::ServicesCreated);
        assert_eq!(p1.time_sync().now(), Duration::ZERO);

        p1.lifecycle().start_lifecycle().unwrap();
        io.run_until(|| steps.borrow().len() >= 8);
        assert_eq!(p1.lifecycle().state(), ParticipantState::Running);
        let ms = Duration::from_millis;
        assert_eq!(steps.borrow()[3..6], [ms(0), ms(1), ms(2)]);
    }

    #[test]
    fn test_late_joiner_receives_history() {
        let io = MemoryIoContext::new();
        let _registry = registry(&io);
        let controller_participant = participant(&io, "Controller", true, 1);
        controller_participant
            .system_controller()
            .set_workflow_configuration(&["P1"])
            .unwrap();
        join(&controller_participant);
        io.run_for(Duration::from_millis(10));

        let p1 = participant(&io, "P1", true, 1);
        p1.lifecycle().start_lifecycle().unwrap();
        io.run_for(Duration::from_millis(10));
        assert_eq!(p1.lifecycle().state(), ParticipantState::ReadyToRun);

        // the workflow arrived with the connection, statuses flow back
        assert_eq!(p1.system_monitor().required_participants(), vec!["P1"]);
        assert_eq!(
            controller_participant.system_monitor().system_state(),
            ParticipantState::ReadyToRun
        );

        let late = participant(&io, "Observer", true, 1);
        join(&late);
        io.run_for(Duration::from_millis(10));
        assert_eq!(
            late.system_monitor().participant_status("P1").map(|s| s.state),
            Some(ParticipantState::ReadyToRun)
        );
        assert_eq!(late.system_monitor().system_state(), ParticipantState::ReadyToRun);

        drop(p1);
        io.run_for(Duration::from_millis(10));
        assert_eq!(late.system_monitor().system_state(), ParticipantState::Error);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let io = MemoryIoContext::new();
        let config = ParticipantConfiguration::named("");
        assert!(matches!(
            Participant::new(Rc::new(io), config),
            Err(CsError::Configuration(_))
        ));
    }
}
