//! Co-simulation simulation runner
//!
//! Drives a registry and a set of participants on one deterministic in-memory
//! event loop: staggered joins over a partially unreachable network, then a
//! synchronized run until every participant has shut down.

use super::config::{CosimSimConfig, ParticipantPlan};
use super::stats::{
    ConnectionStats, EventCounts, ParticipantSummary, SimResult, TimeStats, TrafficStats,
};
use cs_link::cs_io_context::{Endpoint, Timer};
use cs_link::{
    compute_system_state, DataPublisher, Event, EventSink, IoContext, MemoryIoContext,
    MiddlewareConfig, Participant, ParticipantConfiguration, ParticipantState, ParticipantStatus,
    Registry, SimTaskCompleter, Uri,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

const REGISTRY_URI: &str = "silkit://127.0.0.1:8500";
const CONTROLLER_NAME: &str = "SystemController";

/// Event sink feeding the shared counters
struct CollectingSink {
    events: Rc<RefCell<EventCounts>>,
}

impl EventSink for CollectingSink {
    fn log(&mut self, participant: &str, event: Event) {
        self.events.borrow_mut().record(participant, &event);
    }
}

/// Counters shared with one participant's handlers
#[derive(Default)]
struct Probe {
    steps: Cell<u64>,
    received: Cell<u64>,
    published: Cell<u64>,
    joined: Cell<Option<bool>>,
    stop_requested: Cell<bool>,
}

struct SimParticipant {
    plan: ParticipantPlan,
    participant: Participant,
    probe: Rc<Probe>,
    unreachable: bool,
}

/// Co-simulation simulation runner
pub struct CosimRunner {
    config: CosimSimConfig,
    seed: [u8; 32],
    rng: Rc<RefCell<StdRng>>,
    io: MemoryIoContext,
    _registry: Registry,
    controller: Option<Participant>,
    participants: Vec<SimParticipant>,
    events: Rc<RefCell<EventCounts>>,

    /// Time point of every participant's latest step
    last_step: Rc<RefCell<BTreeMap<String, Duration>>>,
    max_skew: Rc<Cell<Duration>>,
    system_stop_requested: Rc<Cell<bool>>,
}

impl CosimRunner {
    /// Create a new runner; nothing joins until `run`
    pub fn new(config: CosimSimConfig) -> Self {
        let seed = config.resolve_seed();
        let rng = Rc::new(RefCell::new(StdRng::from_seed(seed)));
        let io = MemoryIoContext::new();
        io.set_latency(Duration::from_micros(config.network.latency_us));

        let registry = Registry::new(Rc::new(io.clone()), middleware(&config));
        registry
            .start_listening(REGISTRY_URI)
            .expect("registry listens on the in-memory network");

        let mut runner = Self {
            config,
            seed,
            rng,
            io,
            _registry: registry,
            controller: None,
            participants: Vec::new(),
            events: Rc::new(RefCell::new(EventCounts::default())),
            last_step: Rc::new(RefCell::new(BTreeMap::new())),
            max_skew: Rc::new(Cell::new(Duration::ZERO)),
            system_stop_requested: Rc::new(Cell::new(false)),
        };

        runner.initialize_participants();
        runner
    }

    fn participant_config(&self, name: &str, period_ms: u64) -> ParticipantConfiguration {
        let mut config = ParticipantConfiguration::named(name);
        config.registry_uri = REGISTRY_URI.to_string();
        config.middleware = middleware(&self.config);
        config.lifecycle.coordinated = self.config.coordinated;
        config.time_sync.step_period_ns = period_ms.max(1) * 1_000_000;
        config
    }

    fn create_participant(&self, name: &str, period_ms: u64) -> Participant {
        let participant =
            Participant::new(Rc::new(self.io.clone()), self.participant_config(name, period_ms))
                .unwrap_or_else(|e| panic!("participant '{}' rejected: {}", name, e));
        participant.set_event_sink(Box::new(CollectingSink {
            events: self.events.clone(),
        }));
        participant
    }

    fn initialize_participants(&mut self) {
        let required: Vec<&str> = self
            .config
            .participants
            .iter()
            .map(|p| p.name.as_str())
            .collect();

        if self.config.coordinated {
            let controller_participant = self.create_participant(CONTROLLER_NAME, 1);
            let controller = controller_participant.system_controller();
            controller
                .set_workflow_configuration(&required)
                .expect("workflow with at least one participant");
            let driver = controller.clone();
            controller_participant.add_system_state_handler(move |state| {
                let outcome = match state {
                    ParticipantState::ReadyToRun => driver.run(),
                    ParticipantState::Stopped => driver.shutdown(),
                    _ => Ok(()),
                };
                if let Err(e) = outcome {
                    log::warn!("Runner: system controller command failed: {}", e);
                }
            });
            self.controller = Some(controller_participant);
        }

        let plans = self.config.participants.clone();
        for (index, plan) in plans.into_iter().enumerate() {
            let participant = self.create_participant(&plan.name, plan.period_ms);
            if !self.config.coordinated && index == 0 {
                // autonomous runs still share a workflow so system state is meaningful
                participant
                    .system_controller()
                    .set_workflow_configuration(&required)
                    .expect("workflow with at least one participant");
            }

            let probe = Rc::new(Probe::default());
            let counter = probe.clone();
            participant.create_data_subscriber(&self.config.traffic.topic, "", move |_| {
                counter.received.set(counter.received.get() + 1)
            });
            self.install_step_handler(&plan, &participant, &probe);

            let fraction = self.config.network.unreachable_fraction.clamp(0.0, 1.0);
            let unreachable = plan.unreachable || self.rng.borrow_mut().gen_bool(fraction);
            self.participants.push(SimParticipant {
                plan,
                participant,
                probe,
                unreachable,
            });
        }
    }

    fn install_step_handler(&self, plan: &ParticipantPlan, participant: &Participant, probe: &Rc<Probe>) {
        let publisher = participant.create_data_publisher(&self.config.traffic.topic, "text/plain");
        let on_step = self.step_action(plan, participant, probe.clone(), publisher);

        let time_sync = participant.time_sync();
        if !plan.async_steps {
            time_sync.set_simulation_step_handler(move |now, _| on_step(now));
            return;
        }

        let io = self.io.clone();
        let rng = self.rng.clone();
        let (low, high) = self.config.traffic.completion_delay_us;
        let timer: Rc<RefCell<Option<Box<dyn Timer>>>> = Rc::new(RefCell::new(None));
        time_sync.set_simulation_step_handler_async(move |now, _, completer: SimTaskCompleter| {
            on_step(now);
            let delay = Duration::from_micros(rng.borrow_mut().gen_range(low..=high.max(low)));
            let step_timer = io.make_timer();
            step_timer.async_wait_for(delay, Box::new(move || completer.complete()));
            *timer.borrow_mut() = Some(step_timer);
        });
    }

    /// Work done on every step: skew bookkeeping, publishing and the stop trigger
    fn step_action(
        &self,
        plan: &ParticipantPlan,
        participant: &Participant,
        probe: Rc<Probe>,
        publisher: DataPublisher,
    ) -> impl Fn(Duration) + 'static {
        let name = plan.name.clone();
        let topic = self.config.traffic.topic.clone();
        let last_step = self.last_step.clone();
        let max_skew = self.max_skew.clone();
        let publish_every = self.config.traffic.publish_every_steps;
        let stop_at = Duration::from_millis(self.config.stop_at_ms);
        let io = self.io.clone();
        let lifecycle = participant.lifecycle();
        let controller = self.controller.as_ref().map(|c| c.system_controller());
        let system_stop_requested = self.system_stop_requested.clone();

        move |now: Duration| {
            let steps = probe.steps.get() + 1;
            probe.steps.set(steps);

            {
                let mut last = last_step.borrow_mut();
                for (other, &time) in last.iter() {
                    if *other != name && now > time {
                        max_skew.set(max_skew.get().max(now - time));
                    }
                }
                last.insert(name.clone(), now);
            }

            if publish_every > 0 && steps % publish_every == 0 {
                let payload = format!("{}_from_{} LocalMsgId={}", topic, name, probe.published.get());
                match publisher.publish(payload.as_bytes()) {
                    Ok(()) => probe.published.set(probe.published.get() + 1),
                    Err(e) => log::warn!("Runner: '{}' failed to publish: {}", name, e),
                }
            }

            if now < stop_at {
                return;
            }
            match &controller {
                Some(controller) => {
                    if !system_stop_requested.replace(true) {
                        let controller = controller.clone();
                        io.post(Box::new(move || {
                            if let Err(e) = controller.stop() {
                                log::warn!("Runner: stop failed: {}", e);
                            }
                        }));
                    }
                }
                None => {
                    if !probe.stop_requested.replace(true) {
                        // a stopped participant no longer holds the others back
                        last_step.borrow_mut().remove(&name);
                        let lifecycle = lifecycle.clone();
                        io.post(Box::new(move || {
                            if let Err(e) = lifecycle.stop("end of scenario") {
                                log::warn!("Runner: stop failed: {}", e);
                            }
                        }));
                    }
                }
            }
        }
    }

    fn make_unreachable(&self, participant: &Participant) {
        let info = participant.peer_info();
        let Some(port) = info
            .acceptor_uris
            .iter()
            .filter_map(|uri| Uri::parse(uri).ok())
            .find(|uri| uri.is_tcp())
            .map(|uri| uri.port())
        else {
            return;
        };
        // the catch-all listener endpoint hides every address of the participant
        self.io.set_unreachable(Endpoint::Tcp(SocketAddr::new(
            Ipv4Addr::UNSPECIFIED.into(),
            port,
        )));
        log::info!("Runner: '{}' is unreachable on port {}", info.participant_name, port);
    }

    fn join_all(&self) {
        let gap = Duration::from_millis(self.config.join_gap_ms);
        if let Some(controller) = &self.controller {
            if let Err(e) = controller.join_simulation(|_| {}) {
                log::warn!("Runner: system controller cannot join: {}", e);
            }
            self.io.run_for(gap);
        }

        for sim in &self.participants {
            let probe = sim.probe.clone();
            let joined = sim
                .participant
                .join_simulation(move |result| probe.joined.set(Some(result.is_ok())));
            if let Err(e) = joined {
                log::warn!("Runner: '{}' cannot join: {}", sim.plan.name, e);
                sim.probe.joined.set(Some(false));
                continue;
            }
            if sim.unreachable {
                self.make_unreachable(&sim.participant);
            }
            self.io.run_for(gap);
        }

        // nothing steps yet, so the loop drains once every join resolved
        self.io
            .run_until(|| self.participants.iter().all(|sim| sim.probe.joined.get().is_some()));
    }

    fn connection_stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        for sim in &self.participants {
            match sim.probe.joined.get() {
                Some(true) => stats.joined += 1,
                _ => stats.failed_joins += 1,
            }
            if sim.unreachable {
                stats.unreachable += 1;
            }
        }
        for (i, a) in self.participants.iter().enumerate() {
            let peers = a.participant.connected_peers();
            for b in &self.participants[i + 1..] {
                if !peers.contains(&b.plan.name) {
                    continue;
                }
                if a.participant.is_proxied(&b.plan.name) {
                    stats.proxied_links += 1;
                } else {
                    stats.direct_links += 1;
                }
            }
        }
        stats
    }

    fn finished(&self) -> bool {
        self.participants.iter().all(|sim| {
            matches!(
                sim.participant.lifecycle().state(),
                ParticipantState::Shutdown | ParticipantState::Error
            )
        })
    }

    /// Run the simulation
    pub fn run(self) -> SimResult {
        log::info!(
            "Runner: {} participants, coordinated={}",
            self.participants.len(),
            self.config.coordinated
        );
        self.join_all();
        let connection_stats = self.connection_stats();
        let peer_snapshot: Vec<(usize, usize)> = self
            .participants
            .iter()
            .map(|sim| {
                let peers = sim.participant.connected_peers();
                let proxied = peers
                    .iter()
                    .filter(|peer| sim.participant.is_proxied(peer))
                    .count();
                (peers.len(), proxied)
            })
            .collect();

        for sim in &self.participants {
            if let Err(e) = sim.participant.lifecycle().start_lifecycle() {
                log::warn!("Runner: '{}' cannot start: {}", sim.plan.name, e);
            }
        }

        let started = Instant::now();
        let iterations = Cell::new(0u64);
        let cap = self.config.max_loop_iterations;
        self.io.run_until(|| {
            iterations.set(iterations.get() + 1);
            iterations.get() > cap || self.finished()
        });
        let wall_time = started.elapsed();
        let abandoned = iterations.get() > cap;

        let mut statuses = hashbrown::HashMap::new();
        let mut participants = Vec::new();
        let mut time_stats = TimeStats {
            max_skew: self.max_skew.get(),
            ..TimeStats::default()
        };
        let mut traffic_stats = TrafficStats::default();
        for (sim, (peers, proxied_peers)) in self.participants.iter().zip(peer_snapshot) {
            let status: ParticipantStatus = sim.participant.lifecycle().status();
            let steps = sim.probe.steps.get();
            time_stats.total_steps += steps;
            time_stats.largest_period = time_stats
                .largest_period
                .max(Duration::from_millis(sim.plan.period_ms.max(1)));
            traffic_stats.published += sim.probe.published.get();
            traffic_stats.delivered += sim.probe.received.get();
            participants.push(ParticipantSummary {
                name: sim.plan.name.clone(),
                state: status.state,
                reason: (status.state == ParticipantState::Error)
                    .then(|| status.enter_reason.clone()),
                steps,
                final_time: sim.participant.time_sync().now(),
                peers,
                proxied_peers,
                received: sim.probe.received.get(),
            });
            statuses.insert(sim.plan.name.clone(), status);
        }
        let required: Vec<String> = self.participants.iter().map(|s| s.plan.name.clone()).collect();

        SimResult {
            seed_used: self.seed,
            virtual_time: self.io.now(),
            wall_time,
            abandoned,
            system_state: compute_system_state(&required, &statuses),
            participants,
            connection_stats,
            time_stats,
            traffic_stats,
            events: self.events.borrow().clone(),
        }
    }
}

fn middleware(config: &CosimSimConfig) -> MiddlewareConfig {
    MiddlewareConfig {
        enable_domain_sockets: false,
        experimental_remote_participant_connection: config.network.remote_connect,
        registry_as_fallback_proxy: config.network.registry_proxy,
        connect_timeout_seconds: config.network.connect_timeout_ms.max(1) as f64 / 1000.0,
        remote_connect_request_timeout_seconds: config.network.remote_connect_timeout_ms.max(1)
            as f64
            / 1000.0,
        ..MiddlewareConfig::default()
    }
}
