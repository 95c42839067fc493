//! Configuration for the co-simulation scenario simulator

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;

/// Configuration for one simulated co-simulation run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CosimSimConfig {
    /// Random seed (None = generate random)
    #[serde(skip)]
    pub seed: Option<[u8; 32]>,

    /// Participants taking part, joined in this order
    pub participants: Vec<ParticipantPlan>,

    /// Add a system controller participant that runs, stops and shuts down the system
    pub coordinated: bool,

    /// Virtual time at which the simulation is stopped
    pub stop_at_ms: u64,

    /// Virtual time between two joins
    pub join_gap_ms: u64,

    /// Upper bound on event loop iterations before the run is abandoned
    pub max_loop_iterations: u64,

    pub network: NetworkConfig,

    pub traffic: TrafficConfig,
}

impl Default for CosimSimConfig {
    fn default() -> Self {
        Self {
            seed: None,
            participants: vec![
                ParticipantPlan::new("Fast", 1),
                ParticipantPlan::new("Slow", 7),
            ],
            coordinated: true,
            stop_at_ms: 100,
            join_gap_ms: 10,
            max_loop_iterations: 5_000_000,
            network: NetworkConfig::default(),
            traffic: TrafficConfig::default(),
        }
    }
}

impl CosimSimConfig {
    /// Get or generate seed
    pub fn resolve_seed(&self) -> [u8; 32] {
        self.seed.unwrap_or_else(|| {
            let mut temp_rng = StdRng::from_entropy();
            let mut seed = [0u8; 32];
            use rand::RngCore;
            temp_rng.fill_bytes(&mut seed);
            seed
        })
    }
}

/// One simulated participant
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParticipantPlan {
    pub name: String,

    /// Step period in milliseconds of virtual time
    pub period_ms: u64,

    /// Complete steps from a timer instead of inside the step handler
    pub async_steps: bool,

    /// Force the acceptor unreachable regardless of `unreachable_fraction`
    pub unreachable: bool,
}

impl ParticipantPlan {
    pub fn new(name: &str, period_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            period_ms,
            ..Self::default()
        }
    }
}

impl Default for ParticipantPlan {
    fn default() -> Self {
        Self {
            name: String::new(),
            period_ms: 1,
            async_steps: false,
            unreachable: false,
        }
    }
}

/// Network and connection fallback configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Delay applied to every connect and byte delivery, in microseconds
    pub latency_us: u64,

    /// Fraction of participants whose acceptors cannot be reached by anyone
    pub unreachable_fraction: f64,

    /// Ask unreachable peers to dial back
    pub remote_connect: bool,

    /// Relay through the registry as last resort
    pub registry_proxy: bool,

    pub connect_timeout_ms: u64,

    pub remote_connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency_us: 50,
            unreachable_fraction: 0.0,
            remote_connect: true,
            registry_proxy: true,
            connect_timeout_ms: 500,
            remote_connect_timeout_ms: 2000,
        }
    }
}

/// Pub/sub traffic and asynchronous step completion
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub topic: String,

    /// Every participant publishes once per this many of its own steps (0 = never)
    pub publish_every_steps: u64,

    /// Range of virtual delay before an asynchronous step completes, in microseconds
    pub completion_delay_us: (u64, u64),
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            topic: "Topic1".to_string(),
            publish_every_steps: 1,
            completion_delay_us: (10, 200),
        }
    }
}
