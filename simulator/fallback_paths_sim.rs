// Connection Fallback Comparison
//
// Runs the same partially unreachable network three times: with direct
// connects only, with dial-back requests, and with dial-back plus the
// registry proxy. Shows which links each fallback recovers.

mod cosim;

use cosim::{CosimRunner, CosimSimConfig, NetworkConfig, ParticipantPlan, SimResult};
use rand::RngCore;

fn main() {
    println!("╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO: Connection Fallback Comparison              ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Objective:");
    println!("  Five participants join one after another; P1 and P4 cannot");
    println!("  be reached by anyone. Compare how many links each fallback");
    println!("  configuration establishes.\n");
    println!("Variants:");
    println!("  - 'direct':     no dial-back, no proxy");
    println!("  - 'dial-back':  peers ask unreachable participants to connect back");
    println!("  - 'full':       dial-back, then relay through the registry");
    println!("\n");

    // one seed for all variants
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);

    let variants = [("direct", false, false), ("dial-back", true, false), ("full", true, true)];
    let mut results: Vec<(&str, SimResult)> = Vec::new();
    for (name, remote_connect, registry_proxy) in variants {
        let config = CosimSimConfig {
            seed: Some(seed),
            participants: vec![
                ParticipantPlan { unreachable: true, ..ParticipantPlan::new("P1", 1) },
                ParticipantPlan::new("P2", 1),
                ParticipantPlan::new("P3", 2),
                ParticipantPlan { unreachable: true, ..ParticipantPlan::new("P4", 1) },
                ParticipantPlan::new("P5", 3),
            ],
            coordinated: true,
            stop_at_ms: 50,
            join_gap_ms: 3000,
            network: NetworkConfig {
                remote_connect,
                registry_proxy,
                ..NetworkConfig::default()
            },
            ..CosimSimConfig::default()
        };

        println!("Running variant '{}'...", name);
        let result = CosimRunner::new(config).run();
        results.push((name, result));
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  Results                                               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!(
        "{:<12} {:>8} {:>8} {:>8} {:>10} {:>14}",
        "Variant", "Joined", "Failed", "Direct", "Proxied", "System state"
    );
    println!("{}", "-".repeat(66));
    for (name, result) in &results {
        println!(
            "{:<12} {:>8} {:>8} {:>8} {:>10} {:>14}",
            name,
            result.connection_stats.joined,
            result.connection_stats.failed_joins,
            result.connection_stats.direct_links,
            result.connection_stats.proxied_links,
            result.system_state.to_string()
        );
    }

    println!("\nKey Observations:");
    println!("  1. Without fallbacks no later joiner can reach P1, so every");
    println!("     join after the first fails and the system ends up in Error.\n");
    println!("  2. Dial-back recovers every link that has at least one");
    println!("     reachable side. P1-P4 still fails in both directions.\n");
    println!("  3. With the registry proxy every pair is connected; only");
    println!("     P1-P4 is relayed.\n");
    println!("✓ Scenario complete!");
}
