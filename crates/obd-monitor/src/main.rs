//! OBD Monitor - Live Data Entry Point
//!
//! Polls the configured PIDs and prints every decoded signal to stdout as
//! one JSON object per line until interrupted.

mod config;

use config::MonitorConfig;
use obd_protocol::mock::MockAdapter;
use obd_protocol::{PidRegistry, SerialConnector, Session};
use obd_scheduler::{Poller, PollerEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Log to stderr so stdout carries only signal records
fn init_logging(level: &str) -> Result<(), SetGlobalDefaultError> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

async fn print_events(name: &'static str, mut events: broadcast::Receiver<PollerEvent>) {
    loop {
        match events.recv().await {
            Ok(PollerEvent::Data(signal)) => match serde_json::to_string(&signal) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize {} signal: {}", name, e),
            },
            Ok(PollerEvent::Error(e)) => warn!("{} poll failed: {}", name, e),
            Err(RecvError::Lagged(skipped)) => warn!("{} output lagged, {} signals dropped", name, skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1);
    let config = MonitorConfig::load(path.as_deref())?;
    init_logging(&config.log_level)?;

    info!("=== OBD Monitor v{} ===", env!("CARGO_PKG_VERSION"));

    let session = Session::new(config.session.clone());
    if config.mock {
        info!("Using simulated adapter");
        session.set_connector(MockAdapter::new(PidRegistry::standard()).connector());
    } else {
        let connector = match config.baud_rate {
            Some(baud_rate) => SerialConnector::new(config.device.as_str(), baud_rate),
            None => SerialConnector::for_protocol(config.device.as_str(), config.session.protocol),
        };
        info!("Using adapter on {} at {} baud", connector.device(), connector.baud_rate());
        session.set_connector(connector);
    }

    let mut pollers = Vec::with_capacity(config.pids.len());
    for code in &config.pids {
        let pid = *session.registry().get(code)?;
        let poller = Poller::with_config(session.clone(), pid, config.poller.clone());
        tokio::spawn(print_events(pid.name(), poller.subscribe()));
        poller.start_polling();
        pollers.push(poller);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for poller in &pollers {
        poller.stop_polling();
    }
    session.close().await;

    Ok(())
}
