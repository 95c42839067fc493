//! Distributed virtual-time barrier.
//!
//! Every synchronized participant announces the time point of its next step in a
//! `NextSimTask`. A step at `T` is executed once the participant is running and
//! no synchronized peer announced a time point below `T`; peers that did not
//! announce yet count as time zero. Each participant advances by its own period,
//! so with a fixed period a handler only ever observes multiples of it.
//!
//! Without a step handler the service stays inactive: it neither steps nor
//! announces, and peers do not wait for it.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use crate::cs_interface::{NextSimTask, SimTime};
use crate::cs_io_context::{CrossThreadSignal, IoContext, WorkGuard};
use crate::cs_lifecycle::invoke_guarded;

/// What time sync needs from the owning participant.
pub trait TimeSyncHost {
    fn broadcast_next_task(&self, task: &NextSimTask);
    /// A step handler panicked; stepping has stopped.
    fn report_step_error(&self, reason: String);
    fn step_executed(&self, now: SimTime, duration: Duration);
}

/// Finishes the step it was handed out for. May be used from any thread.
///
/// Completing more than once is a no-op, as is completing after the step was
/// abandoned.
#[derive(Clone)]
pub struct SimTaskCompleter {
    done: Arc<AtomicBool>,
    signal: CrossThreadSignal,
}

impl SimTaskCompleter {
    pub fn complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.signal.raise();
        }
    }
}

#[derive(Clone)]
enum StepHandler {
    Sync(Rc<dyn Fn(SimTime, Duration)>),
    Async(Rc<dyn Fn(SimTime, Duration, SimTaskCompleter)>),
}

struct PendingStep {
    completer: SimTaskCompleter,
    /// Keeps the loop alive while another thread holds the completer
    _guard: WorkGuard,
}

/// Cheap to clone; clones share the same service.
#[derive(Clone)]
pub struct TimeSyncService {
    inner: Rc<TimeSyncInner>,
}

struct TimeSyncInner {
    self_weak: Weak<TimeSyncInner>,
    participant_name: String,
    io: Rc<dyn IoContext>,
    host: Weak<dyn TimeSyncHost>,
    signal: RefCell<Option<CrossThreadSignal>>,
    period: Cell<Duration>,
    /// Time point of the step being executed or last executed
    now: Cell<SimTime>,
    /// Time point of the next step
    next: Cell<SimTime>,
    /// Duration handed to the step being executed
    step_duration: Cell<Duration>,
    handler: RefCell<Option<StepHandler>>,
    /// Synchronized peers and their announced next time point
    peers: RefCell<IndexMap<String, Option<SimTime>>>,
    /// Announcements of participants not registered as synchronized peers yet
    early: RefCell<IndexMap<String, SimTime>>,
    running: Cell<bool>,
    announced: Cell<bool>,
    in_step: Cell<bool>,
    pending: RefCell<Option<PendingStep>>,
    evaluate_posted: Cell<bool>,
    failed: Cell<bool>,
}

impl TimeSyncService {
    pub fn new(
        participant_name: &str,
        io: Rc<dyn IoContext>,
        period: Duration,
        host: Weak<dyn TimeSyncHost>,
    ) -> Self {
        let inner = Rc::new_cyclic(|self_weak| TimeSyncInner {
            self_weak: self_weak.clone(),
            participant_name: participant_name.to_string(),
            io: io.clone(),
            host,
            signal: RefCell::new(None),
            period: Cell::new(period),
            now: Cell::new(Duration::ZERO),
            next: Cell::new(Duration::ZERO),
            step_duration: Cell::new(Duration::ZERO),
            handler: RefCell::new(None),
            peers: RefCell::new(IndexMap::new()),
            early: RefCell::new(IndexMap::new()),
            running: Cell::new(false),
            announced: Cell::new(false),
            in_step: Cell::new(false),
            pending: RefCell::new(None),
            evaluate_posted: Cell::new(false),
            failed: Cell::new(false),
        });
        let weak = inner.self_weak.clone();
        let signal = io.register_signal(Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_completion_signal();
            }
        }));
        *inner.signal.borrow_mut() = Some(signal);
        Self { inner }
    }

    /// True once a step handler is registered; advertised during the handshake.
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn now(&self) -> SimTime {
        self.inner.now.get()
    }

    pub fn period(&self) -> Duration {
        self.inner.period.get()
    }

    /// Takes effect with the next step to be executed. A step already announced to
    /// peers keeps its time point; the ones after it land on multiples of the new
    /// period.
    pub fn set_period(&self, period: Duration) {
        if period.is_zero() {
            log::warn!("TimeSync: '{}' ignoring zero period", self.inner.participant_name);
            return;
        }
        self.inner.period.set(period);
    }

    pub fn set_simulation_step_handler(&self, handler: impl Fn(SimTime, Duration) + 'static) {
        self.inner.replace_handler(StepHandler::Sync(Rc::new(handler)));
    }

    /// The step stays open until the handed-out completer or
    /// [`TimeSyncService::complete_simulation_task`] is called.
    pub fn set_simulation_step_handler_async(
        &self,
        handler: impl Fn(SimTime, Duration, SimTaskCompleter) + 'static,
    ) {
        self.inner.replace_handler(StepHandler::Async(Rc::new(handler)));
    }

    /// Completes the currently open asynchronous step, if any.
    pub fn complete_simulation_task(&self) {
        let completer = self
            .inner
            .pending
            .borrow()
            .as_ref()
            .map(|pending| pending.completer.clone());
        match completer {
            Some(completer) => completer.complete(),
            None => log::debug!(
                "TimeSync: '{}' has no open step to complete",
                self.inner.participant_name
            ),
        }
    }

    /// Next step announcement, once stepping has begun.
    pub fn next_task(&self) -> Option<NextSimTask> {
        if self.inner.announced.get() {
            Some(self.inner.next_task())
        } else {
            None
        }
    }

    /// Steps are only granted while running.
    pub fn set_running(&self, running: bool) {
        self.inner.set_running(running);
    }

    /// Registers a participant whose announcements hold back our steps.
    ///
    /// An announcement that arrived before the registration is applied now.
    pub fn add_peer(&self, participant_name: &str) {
        let early = self.inner.early.borrow_mut().shift_remove(participant_name);
        {
            let mut peers = self.inner.peers.borrow_mut();
            let announced = peers.entry(participant_name.to_string()).or_insert(None);
            if early.is_some() {
                *announced = early;
            }
        }
        log::debug!(
            "TimeSync: '{}' synchronizes with '{}'",
            self.inner.participant_name,
            participant_name
        );
        self.inner.schedule_evaluate();
    }

    pub fn remove_peer(&self, participant_name: &str) {
        self.inner.early.borrow_mut().shift_remove(participant_name);
        if self.inner.peers.borrow_mut().shift_remove(participant_name).is_some() {
            log::debug!(
                "TimeSync: '{}' no longer waits for '{}'",
                self.inner.participant_name,
                participant_name
            );
            self.inner.schedule_evaluate();
        }
    }

    pub fn synchronized_peers(&self) -> Vec<String> {
        self.inner.peers.borrow().keys().cloned().collect()
    }

    pub fn on_next_sim_task(&self, from: &str, task: NextSimTask) {
        let synchronized = match self.inner.peers.borrow_mut().get_mut(from) {
            Some(announced) => {
                *announced = Some(task.time_point);
                true
            }
            None => false,
        };
        if synchronized {
            self.inner.schedule_evaluate();
        } else {
            self.inner
                .early
                .borrow_mut()
                .insert(from.to_string(), task.time_point);
        }
    }

    /// Back to time zero after the lifecycle was reinitialized.
    ///
    /// A failed or open step is abandoned. Peers are told right away, so they do
    /// not run ahead on the announcement of the previous run.
    pub fn reset(&self) {
        let inner = &self.inner;
        let pending = inner.pending.borrow_mut().take();
        drop(pending);
        inner.failed.set(false);
        inner.in_step.set(false);
        inner.running.set(false);
        inner.now.set(Duration::ZERO);
        inner.next.set(Duration::ZERO);
        inner.step_duration.set(Duration::ZERO);
        inner.announced.set(false);
        if inner.is_active() {
            inner.announced.set(true);
            inner.announce();
        }
        log::debug!("TimeSync: '{}' reset to time zero", inner.participant_name);
    }
}

/// First multiple of `period` after `now`.
fn next_multiple(now: SimTime, period: Duration) -> SimTime {
    let period_ns = period.as_nanos().max(1);
    let next_ns = (now.as_nanos() / period_ns + 1) * period_ns;
    Duration::from_nanos(u64::try_from(next_ns).unwrap_or(u64::MAX))
}

impl TimeSyncInner {
    fn is_active(&self) -> bool {
        self.handler.borrow().is_some()
    }

    fn next_task(&self) -> NextSimTask {
        NextSimTask {
            time_point: self.next.get(),
            duration: self.period.get(),
        }
    }

    fn replace_handler(&self, handler: StepHandler) {
        let previous = self.handler.borrow_mut().replace(handler);
        if previous.is_some() {
            log::warn!(
                "TimeSync: '{}' replaces its previously registered step handler",
                self.participant_name
            );
        }
    }

    fn set_running(&self, running: bool) {
        self.running.set(running);
        if !running || !self.is_active() {
            return;
        }
        if !self.announced.replace(true) {
            self.announce();
        }
        self.schedule_evaluate();
    }

    fn announce(&self) {
        if !self.is_active() {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            host.broadcast_next_task(&self.next_task());
        }
    }

    fn schedule_evaluate(&self) {
        if self.evaluate_posted.replace(true) {
            return;
        }
        let weak = self.self_weak.clone();
        self.io.post(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.evaluate_posted.set(false);
                inner.evaluate();
            }
        }));
    }

    fn step_granted(&self) -> bool {
        let next = self.next.get();
        self.peers
            .borrow()
            .values()
            .all(|announced| announced.unwrap_or(Duration::ZERO) >= next)
    }

    fn evaluate(&self) {
        if !self.running.get() || self.in_step.get() || self.failed.get() {
            return;
        }
        let Some(handler) = self.handler.borrow().clone() else {
            return;
        };
        if !self.step_granted() {
            return;
        }

        let now = self.next.get();
        let duration = self.period.get();
        self.now.set(now);
        self.step_duration.set(duration);
        self.in_step.set(true);
        log::trace!("TimeSync: '{}' step at {:?}", self.participant_name, now);

        match handler {
            StepHandler::Sync(handler) => match invoke_guarded(|| handler(now, duration)) {
                Ok(()) => self.finish_step(),
                Err(message) => self.fail(message),
            },
            StepHandler::Async(handler) => {
                let Some(signal) = self.signal.borrow().clone() else {
                    self.fail("no completion signal".to_string());
                    return;
                };
                let completer = SimTaskCompleter {
                    done: Arc::new(AtomicBool::new(false)),
                    signal,
                };
                *self.pending.borrow_mut() = Some(PendingStep {
                    completer: completer.clone(),
                    _guard: self.io.work_guard(),
                });
                if let Err(message) = invoke_guarded(|| handler(now, duration, completer)) {
                    self.fail(message);
                }
            }
        }
    }

    fn on_completion_signal(&self) {
        let completed = matches!(
            &*self.pending.borrow(),
            Some(pending) if pending.completer.done.load(Ordering::Acquire)
        );
        if !completed {
            return;
        }
        let pending = self.pending.borrow_mut().take();
        drop(pending);
        self.finish_step();
    }

    fn finish_step(&self) {
        if !self.in_step.replace(false) {
            return;
        }
        let now = self.now.get();
        if let Some(host) = self.host.upgrade() {
            host.step_executed(now, self.step_duration.get());
        }
        self.next.set(next_multiple(now, self.period.get()));
        self.announce();
        self.schedule_evaluate();
    }

    fn fail(&self, message: String) {
        log::error!(
            "TimeSync: '{}' step handler at {:?} panicked: {}",
            self.participant_name,
            self.now.get(),
            message
        );
        self.failed.set(true);
        self.in_step.set(false);
        let pending = self.pending.borrow_mut().take();
        drop(pending);
        if let Some(host) = self.host.upgrade() {
            host.report_step_error(format!("step handler panicked: {}", message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs_memory_io::MemoryIoContext;

    #[derive(Default)]
    struct Host {
        announced: RefCell<Vec<NextSimTask>>,
        errors: RefCell<Vec<String>>,
        steps: RefCell<Vec<SimTime>>,
    }

    impl TimeSyncHost for Host {
        fn broadcast_next_task(&self, task: &NextSimTask) {
            self.announced.borrow_mut().push(*task);
        }
        fn report_step_error(&self, reason: String) {
            self.errors.borrow_mut().push(reason);
        }
        fn step_executed(&self, now: SimTime, _duration: Duration) {
            self.steps.borrow_mut().push(now);
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn service(io: &MemoryIoContext, host: &Rc<Host>, period: Duration) -> TimeSyncService {
        TimeSyncService::new(
            "P1",
            Rc::new(io.clone()),
            period,
            Rc::downgrade(host) as Weak<dyn TimeSyncHost>,
        )
    }

    fn task(time_point: Duration) -> NextSimTask {
        NextSimTask {
            time_point,
            duration: ms(1),
        }
    }

    #[test]
    fn test_waits_for_slowest_peer() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ts.set_simulation_step_handler(move |now, _| sink.borrow_mut().push(now));
        ts.add_peer("P2");

        ts.set_running(true);
        io.run();
        // the silent peer counts as time zero
        assert_eq!(*seen.borrow(), vec![ms(0)]);
        assert_eq!(host.announced.borrow().last(), Some(&task(ms(1))));

        ts.on_next_sim_task("P2", task(ms(3)));
        io.run();
        assert_eq!(*seen.borrow(), vec![ms(0), ms(1), ms(2), ms(3)]);
        assert_eq!(ts.now(), ms(3));
        assert_eq!(ts.next_task(), Some(task(ms(4))));

        ts.remove_peer("P2");
        ts.set_running(false);
        io.run();
        assert_eq!(seen.borrow().len(), 4);
    }

    #[test]
    fn test_paused_participant_does_not_step() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(5));
        ts.set_simulation_step_handler(|_, _| {});
        ts.add_peer("P2");
        ts.set_running(true);
        io.run();
        ts.set_running(false);
        ts.on_next_sim_task("P2", task(ms(100)));
        io.run();
        assert_eq!(*host.steps.borrow(), vec![ms(0)]);

        ts.set_running(true);
        io.run();
        assert_eq!(host.steps.borrow().last(), Some(&ms(100)));
        // only multiples of the own period
        assert!(host.steps.borrow().iter().all(|t| t.as_millis() % 5 == 0));
    }

    #[test]
    fn test_without_step_handler_time_stands_still() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        ts.set_running(true);
        io.run();

        assert!(!ts.is_active());
        assert_eq!(ts.now(), ms(0));
        assert_eq!(ts.next_task(), None);
        assert!(host.steps.borrow().is_empty());
        assert!(host.announced.borrow().is_empty());
    }

    #[test]
    fn test_unregistered_sender_joins_barrier_on_add_peer() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        ts.set_simulation_step_handler(|_, _| {});
        ts.add_peer("P2");
        ts.on_next_sim_task("P3", task(ms(1)));
        ts.on_next_sim_task("P2", task(ms(5)));
        ts.set_running(true);
        io.run();

        // P3 is not synchronized yet and holds nothing back
        assert_eq!(ts.synchronized_peers(), vec!["P2"]);
        assert_eq!(*host.steps.borrow(), vec![ms(0), ms(1), ms(2), ms(3), ms(4), ms(5)]);

        // its earlier announcement counts once it is registered
        ts.add_peer("P3");
        ts.on_next_sim_task("P2", task(ms(9)));
        io.run();
        assert_eq!(host.steps.borrow().len(), 6);
        ts.on_next_sim_task("P3", task(ms(7)));
        io.run();
        assert_eq!(host.steps.borrow().last(), Some(&ms(7)));
    }

    #[test]
    fn test_reset_after_failed_step_resumes_from_zero() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        let armed = Rc::new(Cell::new(true));
        let trap = armed.clone();
        ts.set_simulation_step_handler(move |now, _| {
            if now == ms(2) && trap.replace(false) {
                panic!("solver diverged");
            }
        });
        ts.add_peer("P2");
        ts.on_next_sim_task("P2", task(ms(5)));
        ts.set_running(true);
        io.run_for(ms(10));
        assert_eq!(*host.steps.borrow(), vec![ms(0), ms(1)]);
        assert_eq!(host.errors.borrow().len(), 1);

        ts.reset();
        assert_eq!(ts.now(), ms(0));
        assert_eq!(host.announced.borrow().last(), Some(&task(ms(0))));

        ts.set_running(true);
        io.run_for(ms(10));
        assert_eq!(
            *host.steps.borrow(),
            vec![ms(0), ms(1), ms(0), ms(1), ms(2), ms(3), ms(4), ms(5)]
        );
        assert_eq!(ts.next_task(), Some(task(ms(6))));
    }

    #[test]
    fn test_async_step_never_completed_holds_time() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        ts.set_simulation_step_handler_async(move |_, _, _completer| {
            counter.set(counter.get() + 1)
        });
        ts.add_peer("P2");
        ts.on_next_sim_task("P2", task(ms(50)));
        ts.set_running(true);
        io.run_for(ms(20));

        assert_eq!(calls.get(), 1);
        assert!(host.steps.borrow().is_empty());
        assert_eq!(ts.now(), ms(0));
        // peers keep seeing time zero as this participant's next step
        assert_eq!(*host.announced.borrow(), vec![task(ms(0))]);
        assert_eq!(ts.next_task(), Some(task(ms(0))));
    }

    #[test]
    fn test_async_completion_counts_once() {
        for completions in [1usize, 3] {
            let io = MemoryIoContext::new();
            let host = Rc::new(Host::default());
            let ts = service(&io, &host, ms(1));
            ts.add_peer("P2");
            ts.set_simulation_step_handler_async(move |_, _, completer| {
                for _ in 0..completions {
                    completer.complete();
                }
            });
            ts.set_running(true);
            io.run();
            assert_eq!(*host.steps.borrow(), vec![ms(0)], "{} completions", completions);
            assert_eq!(ts.next_task(), Some(task(ms(1))));
        }
    }

    #[test]
    fn test_async_completion_from_another_thread() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        ts.add_peer("P2");
        let workers = Rc::new(RefCell::new(Vec::new()));
        let spawned = workers.clone();
        ts.set_simulation_step_handler_async(move |_, _, completer| {
            spawned.borrow_mut().push(std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                completer.complete();
            }));
        });
        ts.set_running(true);
        // the open step holds a work guard, so run blocks until the worker completes
        io.run_until(|| !host.steps.borrow().is_empty());
        assert_eq!(*host.steps.borrow(), vec![ms(0)]);
        for worker in workers.borrow_mut().drain(..) {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_completion_through_service_and_stale_completer() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(2));
        let kept = Rc::new(RefCell::new(Vec::new()));
        let slot = kept.clone();
        ts.set_simulation_step_handler_async(move |_, _, completer| slot.borrow_mut().push(completer));
        ts.add_peer("P2");
        ts.set_running(true);
        io.run_for(ms(1));
        assert!(host.steps.borrow().is_empty());

        ts.complete_simulation_task();
        ts.complete_simulation_task();
        io.run_for(ms(1));
        assert_eq!(*host.steps.borrow(), vec![ms(0)]);

        ts.on_next_sim_task("P2", task(ms(2)));
        io.run_for(ms(1));
        assert_eq!(kept.borrow().len(), 2);
        // the first step's completer no longer affects anything
        kept.borrow()[0].complete();
        io.run_for(ms(1));
        assert_eq!(host.steps.borrow().len(), 1);
        kept.borrow()[1].complete();
        io.run_for(ms(1));
        assert_eq!(*host.steps.borrow(), vec![ms(0), ms(2)]);
    }

    #[test]
    fn test_panicking_step_handler_stops_stepping() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        ts.set_simulation_step_handler(|now, _| {
            if now == Duration::from_millis(2) {
                panic!("division by zero");
            }
        });
        ts.set_running(true);
        io.run_for(ms(10));

        assert_eq!(*host.steps.borrow(), vec![ms(0), ms(1)]);
        assert_eq!(host.errors.borrow().len(), 1);
        assert!(host.errors.borrow()[0].contains("division by zero"));
        assert_eq!(ts.now(), ms(2));
    }

    #[test]
    fn test_last_handler_registration_wins() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        assert!(!ts.is_active());
        let first = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(0));
        let counter = first.clone();
        ts.set_simulation_step_handler_async(move |_, _, _| counter.set(counter.get() + 1));
        let counter = second.clone();
        ts.set_simulation_step_handler(move |_, _| counter.set(counter.get() + 1));
        assert!(ts.is_active());

        ts.add_peer("P2");
        ts.set_running(true);
        io.run();
        assert_eq!((first.get(), second.get()), (0, 1));
    }

    #[test]
    fn test_period_change_applies_after_current_step() {
        let io = MemoryIoContext::new();
        let host = Rc::new(Host::default());
        let ts = service(&io, &host, ms(1));
        let durations = Rc::new(RefCell::new(Vec::new()));
        let seen = durations.clone();
        ts.set_simulation_step_handler(move |_, duration| seen.borrow_mut().push(duration));
        ts.add_peer("P2");
        ts.set_running(true);
        io.run();
        ts.set_period(ms(4));
        ts.set_period(Duration::ZERO);
        ts.on_next_sim_task("P2", task(ms(9)));
        io.run();
        // the step after the change lands on the next multiple of the new period
        assert_eq!(*host.steps.borrow(), vec![ms(0), ms(1), ms(4), ms(8)]);
        assert_eq!(*durations.borrow(), vec![ms(1), ms(4), ms(4), ms(4)]);
    }
}
