use cs_link::cs_messages::{DataMessage, FrameDecoder, Message};
use cs_link::{
    IoContext, MemoryIoContext, MiddlewareConfig, NextSimTask, Participant, ParticipantConfiguration,
    ParticipantState, Registry,
};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const REGISTRY_URI: &str = "silkit://127.0.0.1:8500";

/// Benchmark lock-step throughput of synchronized participants and the frame codec
fn main() {
    std::env::set_var("RUST_LOG", "error");
    let _ = simple_logger::init_with_level(log::Level::Error);

    println!("\n=== Time Sync Step Throughput Benchmark ===\n");

    let configs = vec![
        ("2 participants, 1ms", 2, 1, 2_000),
        ("4 participants, 1ms", 4, 1, 2_000),
        ("8 participants, 1ms", 8, 1, 1_000),
        ("8 participants, mixed periods", 8, 0, 1_000),
        ("16 participants, 1ms", 16, 1, 500),
    ];

    println!(
        "{:<36} {:>10} {:>12} {:>14} {:>16}",
        "Configuration", "Steps", "Time (ms)", "Steps/s", "Virtual ms/s"
    );
    println!("{}", "-".repeat(92));

    for (name, count, period_ms, stop_at_ms) in configs {
        let (steps, wall) = run_lock_step(count, period_ms, stop_at_ms);
        let secs = wall.as_secs_f64().max(f64::EPSILON);
        println!(
            "{:<36} {:>10} {:>12.1} {:>14.0} {:>16.0}",
            name,
            steps,
            secs * 1000.0,
            steps as f64 / secs,
            stop_at_ms as f64 / secs
        );
    }

    println!("\n=== Frame Codec ===\n");
    println!("{:<36} {:>12} {:>14} {:>14}", "Message", "Bytes", "Encode ns", "Decode ns");
    println!("{}", "-".repeat(80));

    let messages = vec![
        (
            "NextSimTask",
            Message::NextSimTask(NextSimTask {
                time_point: Duration::from_millis(42),
                duration: Duration::from_millis(1),
            }),
        ),
        (
            "DataMessage (64 B)",
            Message::DataMessage(DataMessage {
                topic: "Topic1".to_string(),
                media_type: "text/plain".to_string(),
                sequence_number: 7,
                timestamp: Duration::from_millis(42),
                data: vec![0x42; 64],
            }),
        ),
        (
            "DataMessage (64 KiB)",
            Message::DataMessage(DataMessage {
                topic: "Topic1".to_string(),
                media_type: "application/octet-stream".to_string(),
                sequence_number: 7,
                timestamp: Duration::from_millis(42),
                data: vec![0x42; 64 * 1024],
            }),
        ),
    ];

    for (name, message) in messages {
        let samples = 10_000;
        let start = Instant::now();
        let mut frame = Vec::new();
        for _ in 0..samples {
            frame = message.to_frame();
        }
        let encode_ns = start.elapsed().as_nanos() as f64 / samples as f64;

        let start = Instant::now();
        let mut decoder = FrameDecoder::new();
        for _ in 0..samples {
            decoder.push(&frame);
            let complete = decoder.next_frame().unwrap().unwrap();
            let decoded = Message::from_frame(&complete).unwrap();
            assert_eq!(decoded.kind(), message.kind());
        }
        let decode_ns = start.elapsed().as_nanos() as f64 / samples as f64;

        println!("{:<36} {:>12} {:>14.0} {:>14.0}", name, frame.len(), encode_ns, decode_ns);
    }

    println!("\n{}", "=".repeat(92));
}

/// Runs `count` autonomous participants until every one passed `stop_at_ms`.
/// A `period_ms` of 0 cycles through 1, 2, 3 and 5 ms.
fn run_lock_step(count: usize, period_ms: u64, stop_at_ms: u64) -> (u64, Duration) {
    let io = MemoryIoContext::new();
    let middleware = MiddlewareConfig {
        enable_domain_sockets: false,
        ..MiddlewareConfig::default()
    };
    let registry = Registry::new(Rc::new(io.clone()), middleware.clone());
    registry.start_listening(REGISTRY_URI).unwrap();

    let steps = Rc::new(Cell::new(0u64));
    let mut participants = Vec::new();
    for i in 0..count {
        let period = if period_ms == 0 { [1, 2, 3, 5][i % 4] } else { period_ms };
        let mut config = ParticipantConfiguration::named(&format!("Bench{}", i));
        config.registry_uri = REGISTRY_URI.to_string();
        config.middleware = middleware.clone();
        config.lifecycle.coordinated = false;
        config.time_sync.step_period_ns = period * 1_000_000;
        let participant = Participant::new(Rc::new(io.clone()), config).unwrap();

        let counter = steps.clone();
        let lifecycle = participant.lifecycle();
        let stop_at = Duration::from_millis(stop_at_ms);
        let stopping = Cell::new(false);
        let stopper = io.clone();
        participant.time_sync().set_simulation_step_handler(move |now, _| {
            counter.set(counter.get() + 1);
            if now >= stop_at && !stopping.replace(true) {
                let lifecycle = lifecycle.clone();
                stopper.post(Box::new(move || {
                    let _ = lifecycle.stop("benchmark done");
                }));
            }
        });
        participant.join_simulation(|_| {}).unwrap();
        io.run_for(Duration::from_millis(10));
        participants.push(participant);
    }

    let start = Instant::now();
    for participant in &participants {
        participant.lifecycle().start_lifecycle().unwrap();
    }
    io.run_until(|| {
        participants
            .iter()
            .all(|p| p.lifecycle().state() == ParticipantState::Shutdown)
    });
    (steps.get(), start.elapsed())
}
