//! syde-diagd - Diagnostic session daemon
//!
//! Runs one diagnostic session as described by a project file and logs
//! live values until Ctrl-C.
//!
//! Usage:
//!   syde-diagd [project.toml]
//!
//! Without a project file a built-in demo project runs on the mock bus.

mod project;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use project::ProjectConfig;
use syde_core::SystemDefinition;
use syde_diag::transport::mock::MockBus;
use syde_diag::{
    BusDispatcher, CanFrame, CommunicationDriver, DispatcherConfig, DriverError, SignalEvent,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parsed command-line arguments
struct Args {
    /// Project file (TOML)
    project_path: Option<String>,
}

fn parse_args() -> Args {
    let mut result = Args { project_path: None };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => result.project_path = Some(arg.to_string()),
            _ => tracing::warn!("Unknown argument: {}", arg),
        }
    }
    result
}

fn print_help() {
    eprintln!(
        r#"syde-diagd - Diagnostic session daemon

Usage: syde-diagd [project.toml]

Options:
  -h, --help    Print this help message

Examples:
  # Run the demo project on the mock bus
  syde-diagd

  # Run a project
  RUST_LOG=syde_diag=debug syde-diagd project.toml
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syde_diagd=info,syde_diag=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting syde-diagd");

    let args = parse_args();
    let project = match args.project_path {
        Some(ref path) => {
            tracing::info!("Loading project from: {}", path);
            ProjectConfig::from_file(Path::new(path))?
        }
        None => {
            tracing::info!("No project file provided, running demo on the mock bus");
            ProjectConfig::demo()?
        }
    };

    let system = Arc::new(SystemDefinition::from(project.system.clone()));
    let dispatcher: Arc<dyn BusDispatcher> = match &project.driver.dispatcher {
        DispatcherConfig::Mock(config) => {
            let bus = Arc::new(MockBus::new(config));
            spawn_demo_traffic(bus.clone(), &system);
            bus
        }
    };

    let mut driver = CommunicationDriver::with_dispatcher(
        project.driver.clone(),
        system.clone(),
        project.view.clone(),
        dispatcher,
    );

    driver.init_diag().await?;
    match driver.set_diagnostic_mode().await {
        Ok(()) => {}
        Err(DriverError::SessionStart(report)) => {
            tracing::warn!("Session start incomplete, continuing without:\n{}", report);
        }
        Err(e) => return Err(e.into()),
    }

    let setup = driver.set_up_cyclic_transmissions().await?;
    for (element, reason) in &setup.failed {
        tracing::warn!(%element, %reason, "Transmission not registered");
    }
    if let Some(position) = setup.first_slot_exhausted {
        tracing::warn!(position, "Server ran out of transmission slots");
    }

    let (sink, mut signals) = mpsc::unbounded_channel();
    for subscription in &project.subscriptions {
        if let Err(e) = driver.register_signal_subscriber(
            subscription.element,
            &subscription.message,
            &subscription.signal,
            sink.clone(),
        ) {
            tracing::warn!(element = %subscription.element, error = %e, "Subscription rejected");
        }
    }
    drop(sink);

    let mut events = driver.subscribe_data_pool_events();
    driver.start_cycling()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            Some(event) = signals.recv() => match event {
                SignalEvent::Value { element, content, timestamp_us } => {
                    tracing::info!(%element, value = content.as_f64(), timestamp_us, "Signal");
                }
                SignalEvent::InvalidDlc { element, dlc } => {
                    tracing::warn!(%element, dlc, "Frame too short for signal");
                }
            },
            Ok(event) = events.recv() => {
                tracing::info!(element = %event.element, data = ?event.data, "Data pool event");
            }
        }
    }

    let report = driver.stop_diagnosis_server().await;
    if !report.is_empty() {
        tracing::warn!("Teardown incomplete:\n{}", report);
    }
    Ok(())
}

/// Put frames of the first defined message on the mock bus
fn spawn_demo_traffic(bus: Arc<MockBus>, system: &SystemDefinition) {
    let Some(message) = system.can_messages.first() else {
        return;
    };
    let (id, extended, dlc) = (message.id, message.extended, message.dlc);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        let mut counter: u16 = 0;
        loop {
            ticker.tick().await;
            counter = counter.wrapping_add(25);
            let mut payload = vec![0u8; usize::from(dlc.min(8))];
            for (slot, byte) in payload.iter_mut().zip(counter.to_le_bytes()) {
                *slot = byte;
            }
            if let Some(temp) = payload.get_mut(2) {
                *temp = (counter % 120) as u8;
            }
            bus.inject_frame(CanFrame::new(id, extended, &payload, u64::from(counter) * 1000));
        }
    });
}
