use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use log::info;
use simple_logger::SimpleLogger;

use cs_link::{
    IoContext, MiddlewareConfig, Participant, ParticipantConfiguration, ParticipantState,
    Registry, TokioIoContext,
};

const STOP_AT: Duration = Duration::from_millis(10);

/// Registry plus a publisher and a subscriber over loopback tcp. The subscriber
/// doubles as system controller: it runs the system once both are ready and
/// shuts it down after the publisher stopped it at `STOP_AT`.
fn main() -> cs_link::Result<()> {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    info!("starting");

    let io = Rc::new(TokioIoContext::new()?);
    let middleware = MiddlewareConfig::default();
    let registry = Registry::new(io.clone(), middleware.clone());
    let registry_uri = registry.start_listening("silkit://127.0.0.1:0")?;
    info!("registry at {}", registry_uri);

    let make = |name: &str| -> cs_link::Result<Participant> {
        let mut config = ParticipantConfiguration::named(name);
        config.registry_uri = registry_uri.to_string();
        config.acceptor_uris = vec!["tcp://127.0.0.1:0".to_string()];
        config.middleware = middleware.clone();
        Participant::new(io.clone(), config)
    };
    let publisher_participant = make("Publisher")?;
    let subscriber_participant = make("Subscriber")?;

    let controller = subscriber_participant.system_controller();
    controller.set_workflow_configuration(&["Publisher", "Subscriber"])?;
    let (driver, stopper) = (controller.clone(), io.clone());
    subscriber_participant.add_system_state_handler(move |state| {
        info!("system state {}", state);
        let outcome = match state {
            ParticipantState::ReadyToRun => driver.run(),
            ParticipantState::Stopped => driver.shutdown(),
            ParticipantState::Shutdown | ParticipantState::Error => {
                let io = stopper.clone();
                stopper.post(Box::new(move || io.stop()));
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            log::warn!("system command failed: {}", e);
        }
    });

    subscriber_participant.create_data_subscriber("Topic1", "", |event| {
        info!(
            "received '{}' from {} at {:?}",
            String::from_utf8_lossy(&event.data),
            event.source_participant,
            event.timestamp
        );
    });

    let publisher = publisher_participant.create_data_publisher("Topic1", "text/plain");
    let next_id = Cell::new(0u64);
    let stopping = Cell::new(false);
    let poster = io.clone();
    publisher_participant
        .time_sync()
        .set_simulation_step_handler(move |now, _| {
            let payload = format!("Topic1_from_Pub1 LocalMsgId={}", next_id.get());
            next_id.set(next_id.get() + 1);
            if let Err(e) = publisher.publish(payload.as_bytes()) {
                log::warn!("publish failed: {}", e);
            }
            if now >= STOP_AT && !stopping.replace(true) {
                let controller = controller.clone();
                poster.post(Box::new(move || {
                    if let Err(e) = controller.stop() {
                        log::warn!("stop failed: {}", e);
                    }
                }));
            }
        });

    publisher_participant.lifecycle().start_lifecycle()?;
    subscriber_participant.lifecycle().start_lifecycle()?;
    io.run();

    info!(
        "publisher reached {:?}, system is {}",
        publisher_participant.time_sync().now(),
        subscriber_participant.system_monitor().system_state()
    );
    info!("done");
    Ok(())
}
