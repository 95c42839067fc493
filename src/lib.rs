//! # cosim-link - Distributed Co-Simulation Middleware Core
//!
//! Participants of a co-simulation find each other through a well-known registry,
//! connect into a full mesh, agree on a shared lifecycle and advance a common
//! virtual time in lock step.
//!
//! ## Core Components
//!
//! - **Connection**: joins through the registry and keeps the peer mesh, falling back
//!   from direct connects to dial-back requests and finally to registry proxying
//! - **ConnectPeer**: tries one peer's candidate URIs in order, with retries
//! - **ConnectKnownParticipants**: connects to every already registered participant
//! - **Registry**: rendezvous point relaying dial-back requests and proxy traffic
//! - **LifecycleService / SystemMonitor / SystemController**: participant and system state
//! - **TimeSyncService**: the distributed virtual-time barrier
//! - **DataPublisher / DataSubscriber**: minimal topic based pub/sub
//!
//! ## Event Loops
//!
//! All components are single-threaded and driven by an [`cs_io_context::IoContext`]:
//! [`cs_tokio_io::TokioIoContext`] over real sockets, or the deterministic
//! [`cs_memory_io::MemoryIoContext`] used by tests and the simulator.
//!
//! ```no_run
//! use cs_link::{IoContext, Participant, ParticipantConfiguration, TokioIoContext};
//! use std::rc::Rc;
//!
//! let io = Rc::new(TokioIoContext::new().unwrap());
//! let config = ParticipantConfiguration::named("PubSub1");
//! let participant = Participant::new(io.clone(), config).unwrap();
//!
//! let publisher = participant.create_data_publisher("Topic1", "");
//! participant.lifecycle().set_starting_handler(move || {
//!     publisher.publish(b"Topic1_from_Pub1 LocalMsgId=0").unwrap();
//! });
//! participant.lifecycle().start_lifecycle().unwrap();
//! io.run();
//! ```

// Interfaces and wire format
pub mod cs_error;
pub mod cs_interface;
pub mod cs_messages;
pub mod cs_serdes;
pub mod cs_uri;

// Event loops and transport
pub mod cs_io_context;
pub mod cs_memory_io;
pub mod cs_tokio_io;

// Connection establishment
pub mod cs_connect_peer;
pub mod cs_connection;
pub mod cs_known_participants;
pub mod cs_peer;
pub mod cs_registry;

// Participant services
pub mod cs_config;
pub mod cs_handlers;
pub mod cs_lifecycle;
pub mod cs_participant;
pub mod cs_pubsub;
pub mod cs_system_state;
pub mod cs_time_sync;

// Re-export commonly used types
pub use cs_config::{LifecycleConfig, MiddlewareConfig, ParticipantConfiguration, TimeSyncConfig};
pub use cs_error::{CsError, Result};
pub use cs_interface::{
    DataMessageEvent, Event, EventSink, NextSimTask, NoOpSink, ParticipantState,
    ParticipantStatus, PeerInfo, SimTime, SystemCommand, SystemCommandKind, SystemState,
    WorkflowConfiguration,
};
pub use cs_io_context::IoContext;
pub use cs_lifecycle::LifecycleService;
pub use cs_memory_io::MemoryIoContext;
pub use cs_participant::Participant;
pub use cs_pubsub::{DataPublisher, DataSubscriber};
pub use cs_registry::Registry;
pub use cs_system_state::{compute_system_state, SystemController, SystemMonitor};
pub use cs_time_sync::{SimTaskCompleter, TimeSyncService};
pub use cs_tokio_io::TokioIoContext;
pub use cs_uri::Uri;
