//! Heterogeneous Step Period Simulation Example
//!
//! Run with: cargo run --example heterogeneous_periods_sim

mod cosim;

use cosim::{CosimSimConfig, NetworkConfig, ParticipantPlan, TrafficConfig};
use log::info;
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║        Heterogeneous Step Period Simulator             ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    info!("Setting up co-simulation...");

    // Configure simulation
    let config = CosimSimConfig {
        seed: None, // Will be auto-generated
        participants: vec![
            ParticipantPlan::new("Engine", 1),
            ParticipantPlan::new("Brakes", 2),
            ParticipantPlan {
                async_steps: true, // completes from a timer like an external solver
                ..ParticipantPlan::new("Vehicle", 5)
            },
            ParticipantPlan::new("Environment", 10),
        ],
        coordinated: true,
        stop_at_ms: 500,
        join_gap_ms: 10,
        max_loop_iterations: 10_000_000,
        network: NetworkConfig {
            latency_us: 20,
            ..NetworkConfig::default()
        },
        traffic: TrafficConfig {
            topic: "VehicleBus".to_string(),
            publish_every_steps: 10,
            completion_delay_us: (50, 800),
        },
    };

    info!("Configuration:");
    for plan in &config.participants {
        info!("  {}: {}ms{}", plan.name, plan.period_ms, if plan.async_steps { " (async)" } else { "" });
    }
    info!("  Stop at: {}ms", config.stop_at_ms);
    info!("");

    info!("Starting simulation...");

    let runner = cosim::CosimRunner::new(config);
    let result = runner.run();

    // Display results
    result.print_summary();

    if result.skew_within_bounds() {
        info!("✓ Max skew {:?} stays within the largest period", result.time_stats.max_skew);
    } else {
        info!(
            "✗ Max skew {:?} exceeds the largest period {:?}",
            result.time_stats.max_skew, result.time_stats.largest_period
        );
    }

    info!("✓ Simulation complete!");
}
