// System-wide state: aggregation over required participants, monitoring, control

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use hashbrown::HashMap;

use crate::cs_error::{CsError, Result};
use crate::cs_handlers::{HandlerId, HandlerTable};
use crate::cs_interface::{
    ParticipantState, ParticipantStatus, SystemCommand, SystemCommandKind, SystemState,
    WorkflowConfiguration,
};

/// Reason recorded for participants that vanish before reaching Shutdown.
pub const CONNECTION_LOST_REASON: &str = "connection lost";

// ============================================================================
// Aggregation
// ============================================================================

/// Coarsest state consistent with every required participant's state.
pub fn compute_system_state(
    required: &[String],
    statuses: &HashMap<String, ParticipantStatus>,
) -> SystemState {
    use ParticipantState::*;

    if required.is_empty() {
        return Invalid;
    }
    let mut states = Vec::with_capacity(required.len());
    for name in required {
        match statuses.get(name) {
            Some(status) => states.push(status.state),
            None => return Invalid,
        }
    }

    let any = |wanted: &[ParticipantState]| states.iter().any(|s| wanted.contains(s));
    let all = |wanted: &[ParticipantState]| states.iter().all(|s| wanted.contains(s));

    if any(&[Error]) {
        Error
    } else if any(&[Aborting]) {
        Aborting
    } else if all(&[Shutdown]) {
        Shutdown
    } else if any(&[ShuttingDown, Shutdown]) {
        ShuttingDown
    } else if any(&[Reinitializing]) {
        ServicesCreated
    } else if all(&[Stopped]) {
        Stopped
    } else if any(&[Stopping, Stopped]) {
        Stopping
    } else if all(&[Running]) {
        Running
    } else if all(&[Running, Paused]) {
        Paused
    } else {
        // only pre-run phases and Running remain
        states.iter().copied().min().unwrap_or(Invalid)
    }
}

// ============================================================================
// System Monitor
// ============================================================================

pub type SystemStateHandler = dyn Fn(SystemState);
pub type ParticipantStatusHandler = dyn Fn(&ParticipantStatus);

/// Tracks the status of every participant and the resulting system state.
pub struct SystemMonitor {
    statuses: RefCell<HashMap<String, ParticipantStatus>>,
    required: RefCell<Vec<String>>,
    system_state: Cell<SystemState>,
    state_handlers: RefCell<HandlerTable<SystemStateHandler>>,
    status_handlers: RefCell<HandlerTable<ParticipantStatusHandler>>,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            statuses: RefCell::new(HashMap::new()),
            required: RefCell::new(Vec::new()),
            system_state: Cell::new(SystemState::Invalid),
            state_handlers: RefCell::new(HandlerTable::new()),
            status_handlers: RefCell::new(HandlerTable::new()),
        }
    }

    pub fn system_state(&self) -> SystemState {
        self.system_state.get()
    }

    pub fn participant_status(&self, participant_name: &str) -> Option<ParticipantStatus> {
        self.statuses.borrow().get(participant_name).cloned()
    }

    pub fn required_participants(&self) -> Vec<String> {
        self.required.borrow().clone()
    }

    /// Called right away with the current state unless it is Invalid.
    pub fn add_system_state_handler(&self, handler: impl Fn(SystemState) + 'static) -> HandlerId {
        let handler: Rc<SystemStateHandler> = Rc::new(handler);
        let id = self.state_handlers.borrow_mut().add(handler.clone());
        let state = self.system_state.get();
        if state != SystemState::Invalid {
            handler(state);
        }
        id
    }

    pub fn remove_system_state_handler(&self, id: HandlerId) -> bool {
        self.state_handlers.borrow_mut().remove(id)
    }

    pub fn add_participant_status_handler(
        &self,
        handler: impl Fn(&ParticipantStatus) + 'static,
    ) -> HandlerId {
        self.status_handlers.borrow_mut().add(Rc::new(handler))
    }

    pub fn remove_participant_status_handler(&self, id: HandlerId) -> bool {
        self.status_handlers.borrow_mut().remove(id)
    }

    pub fn set_workflow_configuration(&self, workflow: &WorkflowConfiguration) {
        log::debug!(
            "SystemMonitor: required participants {:?}",
            workflow.required_participant_names
        );
        *self.required.borrow_mut() = workflow.required_participant_names.clone();
        self.update_system_state();
    }

    pub fn on_participant_status(&self, status: ParticipantStatus) {
        self.statuses
            .borrow_mut()
            .insert(status.participant_name.clone(), status.clone());
        let handlers = self.status_handlers.borrow().snapshot();
        for handler in handlers {
            handler(&status);
        }
        self.update_system_state();
    }

    /// A participant that is gone before Shutdown counts as failed.
    pub fn on_participant_disconnected(&self, participant_name: &str) {
        let state = self
            .statuses
            .borrow()
            .get(participant_name)
            .map(|status| status.state);
        match state {
            Some(ParticipantState::Shutdown) | None => {}
            Some(_) => {
                log::warn!(
                    "SystemMonitor: '{}' disconnected before shutting down",
                    participant_name
                );
                self.on_participant_status(ParticipantStatus::new(
                    participant_name,
                    ParticipantState::Error,
                    CONNECTION_LOST_REASON,
                ));
            }
        }
    }

    fn update_system_state(&self) {
        let state = compute_system_state(&self.required.borrow(), &self.statuses.borrow());
        if self.system_state.replace(state) == state {
            return;
        }
        log::info!("SystemMonitor: system state is now {}", state);
        let handlers = self.state_handlers.borrow().snapshot();
        for handler in handlers {
            handler(state);
        }
    }
}

// ============================================================================
// System Controller
// ============================================================================

/// Delivery of controller output to the simulation, including the local participant.
pub trait SystemCommandDispatch {
    fn dispatch_workflow_configuration(&self, workflow: &WorkflowConfiguration);
    fn dispatch_system_command(&self, command: &SystemCommand);
}

/// Issues workflow configuration and system commands. Cheap to clone.
#[derive(Clone)]
pub struct SystemController {
    dispatch: Weak<dyn SystemCommandDispatch>,
}

impl SystemController {
    pub fn new(dispatch: Weak<dyn SystemCommandDispatch>) -> Self {
        Self { dispatch }
    }

    fn dispatcher(&self) -> Result<Rc<dyn SystemCommandDispatch>> {
        self.dispatch
            .upgrade()
            .ok_or_else(|| CsError::invalid_state("system controller outlived its participant"))
    }

    pub fn set_workflow_configuration(&self, required_participant_names: &[&str]) -> Result<()> {
        let workflow = WorkflowConfiguration {
            required_participant_names: required_participant_names
                .iter()
                .map(|name| name.to_string())
                .collect(),
        };
        self.dispatcher()?.dispatch_workflow_configuration(&workflow);
        Ok(())
    }

    fn broadcast(&self, kind: SystemCommandKind) -> Result<()> {
        log::info!("SystemController: {:?}", kind);
        self.dispatcher()?
            .dispatch_system_command(&SystemCommand::broadcast(kind));
        Ok(())
    }

    pub fn run(&self) -> Result<()> {
        self.broadcast(SystemCommandKind::Run)
    }

    pub fn stop(&self) -> Result<()> {
        self.broadcast(SystemCommandKind::Stop)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.broadcast(SystemCommandKind::Shutdown)
    }

    pub fn abort_simulation(&self) -> Result<()> {
        self.broadcast(SystemCommandKind::AbortSimulation)
    }

    pub fn restart(&self, participant_name: &str) -> Result<()> {
        if participant_name.is_empty() {
            return Err(CsError::invalid_state("restart needs a participant name"));
        }
        log::info!("SystemController: Restart '{}'", participant_name);
        self.dispatcher()?.dispatch_system_command(&SystemCommand {
            kind: SystemCommandKind::Restart,
            target: participant_name.to_string(),
        });
        Ok(())
    }
}
