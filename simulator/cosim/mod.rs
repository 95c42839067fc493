//! Co-simulation simulator module
//!
//! Runs a registry and a set of participants on the deterministic in-memory
//! event loop. It focuses on:
//! - Mesh establishment when some participants cannot be reached directly
//! - Lock-step virtual time across heterogeneous step periods
//! - Coordinated and autonomous lifecycles
//! - Pub/sub traffic between the participants

pub mod config;
pub mod runner;
pub mod stats;

pub use config::{CosimSimConfig, NetworkConfig, ParticipantPlan, TrafficConfig};
pub use runner::CosimRunner;
pub use stats::{ConnectionStats, EventCounts, SimResult, TimeStats, TrafficStats};
