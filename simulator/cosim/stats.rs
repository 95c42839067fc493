//! Statistics and results for the co-simulation simulator

use cs_link::{Event, ParticipantState};
use std::collections::BTreeMap;
use std::time::Duration;

/// Simulation result
#[derive(Debug)]
pub struct SimResult {
    /// Seed used for the simulation
    pub seed_used: [u8; 32],

    /// Virtual time when the run ended
    pub virtual_time: Duration,

    /// Wall clock spent inside the event loop
    pub wall_time: Duration,

    /// True when the loop iteration cap was hit
    pub abandoned: bool,

    /// System state derived from every participant's final status
    pub system_state: ParticipantState,

    pub participants: Vec<ParticipantSummary>,

    pub connection_stats: ConnectionStats,

    pub time_stats: TimeStats,

    pub traffic_stats: TrafficStats,

    pub events: EventCounts,
}

impl SimResult {
    /// Print a summary of the simulation results
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        Co-Simulation Results                           ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration:");
        println!("  Seed: 0x{}", hex(&self.seed_used));
        println!("  Virtual time: {:?}", self.virtual_time);
        println!("  Wall time: {:?}", self.wall_time);
        if self.abandoned {
            println!("  ⚠ Loop iteration cap reached, run abandoned");
        }
        println!("  System state: {}\n", self.system_state);

        println!("Participants:");
        for p in &self.participants {
            println!(
                "  {:<12} {:<12} steps={:<6} now={:<10?} peers={} proxied={} received={}",
                p.name,
                p.state.to_string(),
                p.steps,
                p.final_time,
                p.peers,
                p.proxied_peers,
                p.received
            );
            if let Some(ref reason) = p.reason {
                println!("  {:<12} reason: {}", "", reason);
            }
        }
        println!();

        println!("Connection Statistics:");
        println!("  Joined: {}", self.connection_stats.joined);
        println!("  Failed joins: {}", self.connection_stats.failed_joins);
        println!("  Unreachable participants: {}", self.connection_stats.unreachable);
        println!("  Direct links: {}", self.connection_stats.direct_links);
        println!("  Proxied links: {}", self.connection_stats.proxied_links);
        println!();

        println!("Time Synchronization:");
        println!("  Total steps: {}", self.time_stats.total_steps);
        println!("  Max skew: {:?}", self.time_stats.max_skew);
        println!("  Largest period: {:?}", self.time_stats.largest_period);
        if self.wall_time.as_secs_f64() > 0.0 {
            println!(
                "  Steps per second (wall): {:.0}",
                self.time_stats.total_steps as f64 / self.wall_time.as_secs_f64()
            );
        }
        println!();

        println!("Traffic Statistics:");
        println!("  Published: {}", self.traffic_stats.published);
        println!("  Delivered: {}", self.traffic_stats.delivered);
        println!();

        println!("Events:");
        println!("  PeerConnected: {}", self.events.peer_connected);
        println!("  PeerDisconnected: {}", self.events.peer_disconnected);
        println!("  StateChanged: {}", self.events.state_changed);
        println!("  StepExecuted: {}", self.events.step_executed);
        println!("  ConnectFailed: {}", self.events.connect_failed);
        println!();
    }

    /// No participant ever leads another by more than the largest step period.
    pub fn skew_within_bounds(&self) -> bool {
        self.time_stats.max_skew <= self.time_stats.largest_period
    }
}

/// Final view of one participant
#[derive(Debug, Clone)]
pub struct ParticipantSummary {
    pub name: String,
    pub state: ParticipantState,
    pub reason: Option<String>,
    pub steps: u64,
    pub final_time: Duration,
    pub peers: usize,
    pub proxied_peers: usize,
    pub received: u64,
}

/// Connection statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub joined: usize,
    pub failed_joins: usize,
    pub unreachable: usize,
    /// Each mesh link is counted once
    pub direct_links: usize,
    pub proxied_links: usize,
}

/// Time synchronization statistics
#[derive(Debug, Default)]
pub struct TimeStats {
    pub total_steps: u64,

    /// Largest lead of a stepping participant over any other running participant
    pub max_skew: Duration,

    pub largest_period: Duration,
}

/// Pub/sub statistics
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub published: u64,
    pub delivered: u64,
}

/// Participant events by kind
#[derive(Debug, Default, Clone)]
pub struct EventCounts {
    pub peer_connected: usize,
    pub peer_disconnected: usize,
    pub state_changed: usize,
    pub step_executed: usize,
    pub connect_failed: usize,

    /// Lifecycle transitions per participant, in order
    pub transitions: BTreeMap<String, Vec<ParticipantState>>,
}

impl EventCounts {
    pub fn record(&mut self, participant: &str, event: &Event) {
        match event {
            Event::PeerConnected { .. } => self.peer_connected += 1,
            Event::PeerDisconnected { .. } => self.peer_disconnected += 1,
            Event::StateChanged { to, .. } => {
                self.state_changed += 1;
                self.transitions
                    .entry(participant.to_string())
                    .or_default()
                    .push(*to);
            }
            Event::StepExecuted { .. } => self.step_executed += 1,
            Event::ConnectFailed { .. } => self.connect_failed += 1,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
