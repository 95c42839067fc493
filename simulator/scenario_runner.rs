// Scenario Runner - Load and execute co-simulation scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner simulator/scenarios/proxy_fallback.yaml
//   cargo run --bin scenario_runner simulator/scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner simulator/scenarios/proxy_fallback.yaml --seed 0x1234...

mod cosim;

use cosim::{CosimRunner, CosimSimConfig, SimResult};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::path::Path;

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Simulation configuration; omitted keys keep their defaults
    #[serde(default)]
    config: CosimSimConfig,

    /// Checks applied to the result
    #[serde(default)]
    expect: ScenarioExpectations,

    /// trace, debug, info, warn, error or off (default info)
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioExpectations {
    system_state: Option<String>,
    failed_joins: Option<usize>,
    min_direct_links: Option<usize>,
    min_proxied_links: Option<usize>,
    min_delivered: Option<u64>,
    skew_within_bounds: Option<bool>,
}

impl ScenarioExpectations {
    /// Prints every check; returns false when any failed.
    fn check(&self, result: &SimResult) -> bool {
        let mut checks: Vec<(String, bool)> = Vec::new();
        if let Some(ref state) = self.system_state {
            checks.push((
                format!("system state {} (got {})", state, result.system_state),
                result.system_state.to_string() == *state,
            ));
        }
        if let Some(v) = self.failed_joins {
            let got = result.connection_stats.failed_joins;
            checks.push((format!("failed joins == {} (got {})", v, got), got == v));
        }
        if let Some(v) = self.min_direct_links {
            let got = result.connection_stats.direct_links;
            checks.push((format!("direct links >= {} (got {})", v, got), got >= v));
        }
        if let Some(v) = self.min_proxied_links {
            let got = result.connection_stats.proxied_links;
            checks.push((format!("proxied links >= {} (got {})", v, got), got >= v));
        }
        if let Some(v) = self.min_delivered {
            let got = result.traffic_stats.delivered;
            checks.push((format!("delivered >= {} (got {})", v, got), got >= v));
        }
        if let Some(v) = self.skew_within_bounds {
            checks.push((
                format!(
                    "skew within bounds == {} (max skew {:?})",
                    v, result.time_stats.max_skew
                ),
                result.skew_within_bounds() == v,
            ));
        }
        if checks.is_empty() {
            return true;
        }

        println!("Expectations:");
        let mut all_passed = true;
        for (description, passed) in &checks {
            println!("  {} {}", if *passed { "✓" } else { "✗" }, description);
            all_passed &= *passed;
        }
        all_passed
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--seed SEED_HEX] [--verbose]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} simulator/scenarios/proxy_fallback.yaml", args[0]);
        eprintln!("  {} simulator/scenarios/", args[0]);
        eprintln!("  {} simulator/scenarios/proxy_fallback.yaml --seed 0x123456...", args[0]);
        std::process::exit(1);
    }

    let path = Path::new(&args[1]);

    // Parse optional seed
    let seed: Option<[u8; 32]> = args
        .iter()
        .position(|a| a == "--seed")
        .and_then(|i| args.get(i + 1))
        .map(|hex| parse_seed_hex(hex));

    // the level is narrowed per scenario
    SimpleLogger::new().with_level(log::LevelFilter::Trace).init().unwrap();
    let verbose = args.iter().any(|a| a == "--verbose");

    let passed = if path.is_file() {
        run_scenario_file(path, seed, verbose)
    } else if path.is_dir() {
        run_scenario_directory(path, seed, verbose)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if !passed {
        std::process::exit(2);
    }
}

fn run_scenario_directory(dir: &Path, seed: Option<[u8; 32]>, verbose: bool) -> bool {
    let mut scenarios = Vec::new();

    // Find all .yaml files
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("yaml") ||
               path.extension().and_then(|s| s.to_str()) == Some("yml") {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                  ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    let mut failed = Vec::new();
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        if !run_scenario_file(scenario_path, seed, verbose) {
            failed.push(scenario_path.display().to_string());
        }
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    if failed.is_empty() {
        println!("║  All scenarios complete!                               ║");
    } else {
        println!("║  {} scenario(s) missed their expectations              ║", failed.len());
    }
    println!("╚════════════════════════════════════════════════════════╝\n");
    for path in &failed {
        println!("  ✗ {}", path);
    }

    failed.is_empty()
}

fn run_scenario_file(path: &Path, seed: Option<[u8; 32]>, verbose: bool) -> bool {
    println!("Loading scenario from: {}", path.display());

    // Load and parse YAML
    let yaml_content = fs::read_to_string(path)
        .unwrap_or_else(|e| {
            eprintln!("Failed to read {}: {}", path.display(), e);
            std::process::exit(1);
        });

    let scenario: ScenarioFile = serde_yaml::from_str(&yaml_content)
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse {}: {}", path.display(), e);
            std::process::exit(1);
        });

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        scenario
            .log_level
            .as_deref()
            .map(|level| {
                level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
                    eprintln!("Invalid log_level '{}' in {}", level, path.display());
                    std::process::exit(1);
                })
            })
            .unwrap_or(log::LevelFilter::Info)
    };
    log::set_max_level(level);

    // Print scenario header
    println!("\n╔════════════════════════════════════════════════════════╗");
    if let Some(ref name) = scenario.meta.name {
        println!("║  {}{}║", name, " ".repeat(54_usize.saturating_sub(name.len())));
    } else {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unnamed");
        println!("║  Scenario: {}  ", stem);
    }
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    config.seed = seed;

    println!("Configuration:");
    println!("  Participants: {}", config.participants.len());
    for plan in &config.participants {
        println!(
            "    {} period={}ms{}{}",
            plan.name,
            plan.period_ms,
            if plan.async_steps { " async" } else { "" },
            if plan.unreachable { " unreachable" } else { "" }
        );
    }
    println!("  Coordinated: {}", config.coordinated);
    println!("  Stop at: {}ms", config.stop_at_ms);
    println!("  Unreachable fraction: {:.0}%", config.network.unreachable_fraction * 100.0);
    println!(
        "  Remote connect: {}, registry proxy: {}",
        config.network.remote_connect, config.network.registry_proxy
    );
    println!("\nStarting simulation...\n");

    // Run simulation
    let runner = CosimRunner::new(config);
    let result = runner.run();

    // Print results
    result.print_summary();
    let passed = scenario.expect.check(&result);

    if passed {
        println!("\n✓ Scenario complete!\n");
    } else {
        println!("\n✗ Scenario missed its expectations\n");
    }
    passed
}

fn parse_seed_hex(hex: &str) -> [u8; 32] {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let byte_str = std::str::from_utf8(chunk).unwrap_or_else(|e| {
            eprintln!("Invalid hex seed: {}", e);
            std::process::exit(1);
        });
        seed[i] = u8::from_str_radix(byte_str, 16)
            .unwrap_or_else(|e| {
                eprintln!("Invalid hex seed: {}", e);
                std::process::exit(1);
            });
    }

    seed
}
