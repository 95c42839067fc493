//! Participant lifecycle state machine.
//!
//! The lifecycle moves a participant from `ServicesCreated` through joining and
//! running to `Shutdown`, invoking user callbacks on the way. Coordinated
//! participants wait for system commands at `ReadyToRun` and `Stopped`; autonomous
//! ones proceed by themselves. A panicking callback drives the participant to
//! `Error`, which only Restart or AbortSimulation leave.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::cs_connection::JoinHandler;
use crate::cs_error::{CsError, Result};
use crate::cs_interface::{ParticipantState, ParticipantStatus, SystemCommand, SystemCommandKind};

pub type LifecycleHandler = Rc<dyn Fn()>;
pub type AbortHandler = Rc<dyn Fn(ParticipantState)>;

/// What the lifecycle needs from the owning participant.
pub trait LifecycleHost {
    /// Join the simulation; `on_joined` runs once with the outcome.
    fn join_simulation(&self, on_joined: JoinHandler) -> Result<()>;
    /// Every transition, after the new state is in place.
    fn status_changed(&self, previous: ParticipantState, status: &ParticipantStatus);
}

/// Runs a user callback, turning a panic into its message.
pub(crate) fn invoke_guarded<F: FnOnce()>(callback: F) -> std::result::Result<(), String> {
    catch_unwind(AssertUnwindSafe(callback)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Default)]
struct Handlers {
    communication_ready: Option<LifecycleHandler>,
    /// Communication-ready completes only through `complete_communication_ready_handler`
    communication_ready_async: bool,
    starting: Option<LifecycleHandler>,
    stop: Option<LifecycleHandler>,
    shutdown: Option<LifecycleHandler>,
    abort: Option<AbortHandler>,
}

/// Cheap to clone; clones share the same state machine.
#[derive(Clone)]
pub struct LifecycleService {
    inner: Rc<LifecycleInner>,
}

struct LifecycleInner {
    self_weak: Weak<LifecycleInner>,
    participant_name: String,
    coordinated: bool,
    host: Weak<dyn LifecycleHost>,
    status: RefCell<ParticipantStatus>,
    handlers: RefCell<Handlers>,
    awaiting_communication_ready: Cell<bool>,
}

impl LifecycleService {
    pub fn new(participant_name: &str, coordinated: bool, host: Weak<dyn LifecycleHost>) -> Self {
        Self {
            inner: Rc::new_cyclic(|self_weak| LifecycleInner {
                self_weak: self_weak.clone(),
                participant_name: participant_name.to_string(),
                coordinated,
                host,
                status: RefCell::new(ParticipantStatus::new(
                    participant_name,
                    ParticipantState::ServicesCreated,
                    "participant created",
                )),
                handlers: RefCell::new(Handlers::default()),
                awaiting_communication_ready: Cell::new(false),
            }),
        }
    }

    pub fn state(&self) -> ParticipantState {
        self.inner.state()
    }

    pub fn status(&self) -> ParticipantStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_coordinated(&self) -> bool {
        self.inner.coordinated
    }

    pub fn set_communication_ready_handler(&self, handler: impl Fn() + 'static) {
        let mut handlers = self.inner.handlers.borrow_mut();
        handlers.communication_ready = Some(Rc::new(handler));
        handlers.communication_ready_async = false;
    }

    /// The participant stays `CommunicationInitialized` until
    /// [`LifecycleService::complete_communication_ready_handler`] is called.
    pub fn set_communication_ready_handler_async(&self, handler: impl Fn() + 'static) {
        let mut handlers = self.inner.handlers.borrow_mut();
        handlers.communication_ready = Some(Rc::new(handler));
        handlers.communication_ready_async = true;
    }

    pub fn complete_communication_ready_handler(&self) {
        self.inner.complete_communication_ready();
    }

    pub fn set_starting_handler(&self, handler: impl Fn() + 'static) {
        self.inner.handlers.borrow_mut().starting = Some(Rc::new(handler));
    }

    pub fn set_stop_handler(&self, handler: impl Fn() + 'static) {
        self.inner.handlers.borrow_mut().stop = Some(Rc::new(handler));
    }

    pub fn set_shutdown_handler(&self, handler: impl Fn() + 'static) {
        self.inner.handlers.borrow_mut().shutdown = Some(Rc::new(handler));
    }

    /// Receives the state the participant was in when the abort arrived.
    pub fn set_abort_handler(&self, handler: impl Fn(ParticipantState) + 'static) {
        self.inner.handlers.borrow_mut().abort = Some(Rc::new(handler));
    }

    /// ServicesCreated → CommunicationInitializing, then joins the simulation.
    pub fn start_lifecycle(&self) -> Result<()> {
        self.inner.start_lifecycle()
    }

    pub fn pause(&self, reason: &str) -> Result<()> {
        self.inner.expect_state(&[ParticipantState::Running], "pause")?;
        self.inner.change_state(ParticipantState::Paused, reason);
        Ok(())
    }

    pub fn continue_simulation(&self) -> Result<()> {
        self.inner.expect_state(&[ParticipantState::Paused], "continue")?;
        self.inner
            .change_state(ParticipantState::Running, "simulation continued");
        Ok(())
    }

    pub fn stop(&self, reason: &str) -> Result<()> {
        self.inner.expect_state(
            &[ParticipantState::Running, ParticipantState::Paused],
            "stop",
        )?;
        self.inner.stop(reason);
        Ok(())
    }

    /// Any state but `Shutdown` → Error. The first reason is kept.
    pub fn report_error(&self, reason: &str) {
        self.inner.report_error(reason);
    }

    pub fn handle_system_command(&self, command: &SystemCommand) {
        self.inner.handle_system_command(command);
    }
}

impl LifecycleInner {
    fn state(&self) -> ParticipantState {
        self.status.borrow().state
    }

    fn expect_state(&self, allowed: &[ParticipantState], operation: &str) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(CsError::invalid_state(format!(
                "participant '{}' cannot {} in state {}",
                self.participant_name, operation, state
            )))
        }
    }

    fn change_state(&self, state: ParticipantState, reason: &str) {
        let (previous, status) = {
            let mut status = self.status.borrow_mut();
            let previous = status.state;
            if previous == state {
                return;
            }
            *status = ParticipantStatus::new(&self.participant_name, state, reason);
            (previous, status.clone())
        };
        log::info!(
            "Lifecycle: '{}' {} -> {} ({})",
            self.participant_name,
            previous,
            state,
            reason
        );
        if let Some(host) = self.host.upgrade() {
            host.status_changed(previous, &status);
        }
    }

    /// Runs a callback; false when it panicked and the participant went to Error.
    fn run_handler(&self, name: &str, handler: Option<LifecycleHandler>) -> bool {
        let Some(handler) = handler else { return true };
        match invoke_guarded(|| handler()) {
            Ok(()) => true,
            Err(message) => {
                log::error!(
                    "Lifecycle: '{}' {} handler panicked: {}",
                    self.participant_name,
                    name,
                    message
                );
                self.report_error(&format!("{} handler panicked: {}", name, message));
                false
            }
        }
    }

    fn start_lifecycle(&self) -> Result<()> {
        self.expect_state(&[ParticipantState::ServicesCreated], "start its lifecycle")?;
        let host = self.host.upgrade().ok_or_else(|| {
            CsError::invalid_state(format!("participant '{}' is gone", self.participant_name))
        })?;
        self.change_state(
            ParticipantState::CommunicationInitializing,
            "lifecycle started",
        );

        let this = self.self_weak.clone();
        host.join_simulation(Box::new(move |result| {
            let Some(this) = this.upgrade() else { return };
            match result {
                Ok(()) => this.on_joined(),
                Err(e) => this.report_error(&format!("failed to join the simulation: {}", e)),
            }
        }))
        .map_err(|e| {
            self.report_error(&format!("failed to join the simulation: {}", e));
            e
        })
    }

    fn on_joined(&self) {
        if self.state() != ParticipantState::CommunicationInitializing {
            log::warn!(
                "Lifecycle: '{}' joined while in state {}",
                self.participant_name,
                self.state()
            );
            return;
        }
        self.change_state(
            ParticipantState::CommunicationInitialized,
            "all participants connected",
        );

        let (handler, is_async) = {
            let handlers = self.handlers.borrow();
            (handlers.communication_ready.clone(), handlers.communication_ready_async)
        };
        if is_async {
            self.awaiting_communication_ready.set(true);
            self.run_handler("communication ready", handler);
            return;
        }
        if self.run_handler("communication ready", handler) {
            self.ready_to_run();
        }
    }

    fn complete_communication_ready(&self) {
        if !self.awaiting_communication_ready.replace(false) {
            log::debug!(
                "Lifecycle: '{}' ignoring completion of communication ready handler",
                self.participant_name
            );
            return;
        }
        self.ready_to_run();
    }

    fn ready_to_run(&self) {
        if self.state() != ParticipantState::CommunicationInitialized {
            return;
        }
        self.change_state(ParticipantState::ReadyToRun, "communication ready");
        if !self.coordinated {
            self.start_running("autonomous participant starts running");
        }
    }

    fn start_running(&self, reason: &str) {
        let starting = self.handlers.borrow().starting.clone();
        if !self.run_handler("starting", starting) {
            return;
        }
        if self.state() == ParticipantState::ReadyToRun {
            self.change_state(ParticipantState::Running, reason);
        }
    }

    fn stop(&self, reason: &str) {
        self.change_state(ParticipantState::Stopping, reason);
        let stop = self.handlers.borrow().stop.clone();
        if !self.run_handler("stop", stop) {
            return;
        }
        if self.state() != ParticipantState::Stopping {
            return;
        }
        self.change_state(ParticipantState::Stopped, "stop handler completed");
        if !self.coordinated {
            self.shutdown("autonomous participant shuts down");
        }
    }

    fn shutdown(&self, reason: &str) {
        self.change_state(ParticipantState::ShuttingDown, reason);
        let shutdown = self.handlers.borrow().shutdown.clone();
        if !self.run_handler("shutdown", shutdown) {
            return;
        }
        if self.state() == ParticipantState::ShuttingDown {
            self.change_state(ParticipantState::Shutdown, "shutdown handler completed");
        }
    }

    fn report_error(&self, reason: &str) {
        match self.state() {
            ParticipantState::Error => {
                log::debug!(
                    "Lifecycle: '{}' already in Error, ignoring: {}",
                    self.participant_name,
                    reason
                );
            }
            ParticipantState::Shutdown => {
                log::warn!(
                    "Lifecycle: '{}' reported an error after shutdown: {}",
                    self.participant_name,
                    reason
                );
            }
            _ => {
                self.awaiting_communication_ready.set(false);
                self.change_state(ParticipantState::Error, reason);
            }
        }
    }

    fn abort(&self) {
        let state = self.state();
        if matches!(state, ParticipantState::ShuttingDown | ParticipantState::Shutdown) {
            log::debug!(
                "Lifecycle: '{}' ignoring abort while {}",
                self.participant_name,
                state
            );
            return;
        }
        self.awaiting_communication_ready.set(false);
        self.change_state(ParticipantState::Aborting, "simulation aborted");

        let abort = self.handlers.borrow().abort.clone();
        if let Some(abort) = abort {
            if let Err(message) = invoke_guarded(|| abort(state)) {
                // already on the way out, no detour through Error
                log::error!(
                    "Lifecycle: '{}' abort handler panicked: {}",
                    self.participant_name,
                    message
                );
            }
        }
        self.change_state(ParticipantState::ShuttingDown, "simulation aborted");
        self.change_state(ParticipantState::Shutdown, "simulation aborted");
    }

    fn restart(&self) {
        self.change_state(ParticipantState::Reinitializing, "restart requested");
        self.change_state(ParticipantState::ServicesCreated, "participant reinitialized");
    }

    fn handle_system_command(&self, command: &SystemCommand) {
        if !command.applies_to(&self.participant_name) {
            return;
        }
        if command.kind == SystemCommandKind::AbortSimulation {
            self.abort();
            return;
        }
        if !self.coordinated {
            log::debug!(
                "Lifecycle: autonomous '{}' ignores {:?}",
                self.participant_name,
                command.kind
            );
            return;
        }

        let state = self.state();
        match (command.kind, state) {
            (SystemCommandKind::Run, ParticipantState::ReadyToRun) => {
                self.start_running("run requested by system controller")
            }
            (SystemCommandKind::Stop, ParticipantState::Running | ParticipantState::Paused) => {
                self.stop("stop requested by system controller")
            }
            (SystemCommandKind::Shutdown, ParticipantState::Stopped | ParticipantState::Error) => {
                self.shutdown("shutdown requested by system controller")
            }
            (SystemCommandKind::Restart, ParticipantState::Stopped | ParticipantState::Error) => {
                self.restart()
            }
            (kind, state) => log::warn!(
                "Lifecycle: '{}' ignoring {:?} in state {}",
                self.participant_name,
                kind,
                state
            ),
        }
    }
}
