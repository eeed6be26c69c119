pub mod codes;
pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;

use clap::Parser;
use color_eyre::Result;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::codes::CodeResolver;
use crate::config::{BridgeConfig, Cli, DeviceConfig};
use crate::device::{DeviceLocator, SerialChannel};
use crate::error::BridgeError;
use crate::mqtt::message_manager::MessageHandler;
use crate::mqtt::mqtt_handler::BrokerSession;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup(cli.log_level)?;

    match run(cli).await {
        Ok(()) => {
            info!("mqtt2nec stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::from(e.exit_code()))
        }
    }
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn run(cli: Cli) -> Result<(), BridgeError> {
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_interrupt(cancel.clone()));

    let result = bridge(cli, &cancel).await;

    interrupt.abort();
    result
}

async fn bridge(cli: Cli, cancel: &CancellationToken) -> Result<(), BridgeError> {
    let config = BridgeConfig::load(cli).await?;

    let Some(device) = open_device(&config.device, cancel)? else {
        info!("Interrupted before the serial device was opened");
        return Ok(());
    };
    let mut handler = MessageHandler::new(CodeResolver::new(config.aliases), device);

    let result = serve(config.mqtt, &mut handler, cancel.clone()).await;

    handler.close();
    info!(
        "Forwarded {} commands, dropped {} messages",
        handler.stats().forwarded,
        handler.stats().dropped
    );
    result
}

/// Finds and opens the serial device, or nothing if shutdown was requested meanwhile
fn open_device(
    device: &DeviceConfig,
    cancel: &CancellationToken,
) -> Result<Option<SerialChannel>, BridgeError> {
    let port_name = match &device.port {
        Some(port) => {
            info!("Using configured serial port {}", port);
            port.clone()
        }
        None => DeviceLocator::new(device.vendor.as_str()).locate()?,
    };

    if cancel.is_cancelled() {
        return Ok(None);
    }
    Ok(Some(SerialChannel::open(&port_name, &device.serial)?))
}

async fn serve(
    mqtt: mqtt::config::MqttConfig,
    handler: &mut MessageHandler<SerialChannel>,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let session = tokio::select! {
        _ = cancel.cancelled() => {
            info!("Interrupted before the broker connection was established");
            return Ok(());
        }
        connected = BrokerSession::create(mqtt).connect() => connected?,
    };

    session.run(handler, cancel).await?;
    Ok(())
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Interrupt received");
            cancel.cancel();
        }
        Err(e) => error!("Unable to listen for interrupt signal: {}", e),
    }
}
