use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use log::{error, info, warn};
use time::UtcOffset;
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::config::io::ConfigIO;
use crate::config::types::{Config, ReconnectPolicy};
use crate::device::codec::Payload;
use crate::device::command::Command;
use crate::device::manager::SessionManager;
use crate::device::telemetry::Telemetry;
use crate::device::radio::BtleRadio;
use crate::device::transport::BleTransport;
use crate::device::types::{DeviceEvent, SessionStatus};
use crate::error::{AppRunError, ConfigError, SessionError};

#[derive(Parser, Debug)]
#[command(version, about = "Talks to the ESP32 flow controller over Bluetooth LE")]
pub struct Cli {
    /// Path of the JSON config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Advertised name of the device, overrides the config file
    #[arg(long, global = true)]
    pub device_name: Option<String>,

    /// What to do when the link drops, overrides the config file
    #[arg(long, global = true, value_enum)]
    pub reconnect: Option<ReconnectPolicy>,

    /// Log more; repeat for even more
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Connect and print readings until interrupted
    Monitor {
        /// Ask the device for its flow rate and volume once connected
        #[arg(long)]
        initial_data: bool,
    },
    /// Connect, send commands such as `set/flowRate/42` and print the replies
    Send {
        #[arg(required = true)]
        commands: Vec<String>,

        /// How long (milliseconds) to keep listening for replies after the last command
        #[arg(long, default_value_t = 2000)]
        listen_ms: u64,

        /// How long (milliseconds) to wait for the device
        #[arg(long, default_value_t = 30000)]
        connect_timeout_ms: u64,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    fn apply(&self, config: &mut Config) {
        if let Some(name) = &self.device_name {
            config.device_name = name.clone();
        }
        if let Some(policy) = self.reconnect {
            config.reconnect_policy = policy;
        }
    }
}

fn report<T: BleTransport + 'static>(manager: &SessionManager<T>, event: DeviceEvent) {
    match event {
        DeviceEvent::StateChange(status) => info!("Status: {}", status),
        DeviceEvent::Reading { characteristic, payload: Payload::Timestamp(_) } => {
            let telemetry = manager.telemetry();
            if let Some(entry) = telemetry.history().last() {
                info!("{}: {} ({} kept)", characteristic, entry.display, telemetry.history_len());
            }
        },
        DeviceEvent::Reading { payload: Payload::Reading { key, value }, .. } => info!("{} = {}", key, value),
        DeviceEvent::Alert(message) => error!("{}", message),
    }
}

async fn wait_until_connected<T: BleTransport + 'static>(
    manager: &SessionManager<T>,
    events: &mut UnboundedReceiver<DeviceEvent>,
) -> Result<(), AppRunError> {
    while let Some(event) = events.next().await {
        match event {
            DeviceEvent::StateChange(SessionStatus::Connected) => {
                info!("Status: {}", SessionStatus::Connected);
                return Ok(());
            },
            DeviceEvent::StateChange(SessionStatus::Error) => {
                let message = manager.last_error().unwrap_or_else(|| SessionStatus::Error.to_string());
                return Err(AppRunError::ConnectionFailed(message));
            },
            event => report(manager, event),
        }
    }

    Err(AppRunError::ConnectionFailed("the session closed".to_string()))
}

/// Reports events until `interrupt` resolves. A failed attempt is retried after the configured
/// reconnect delay.
pub async fn watch<T, F>(
    manager: &SessionManager<T>,
    events: &mut UnboundedReceiver<DeviceEvent>,
    interrupt: F,
    initial_data: bool,
) where
    T: BleTransport + 'static,
    F: Future<Output = ()>,
{
    let retry_delay = Duration::from_millis(manager.config().reconnect_delay_ms);
    let retry = sleep(retry_delay);
    tokio::pin!(retry, interrupt);
    let mut retry_pending = false;

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupted");
                break;
            },
            _ = &mut retry, if retry_pending => {
                retry_pending = false;
                if let Err(err) = manager.retry() {
                    warn!("Could not retry: {}", err);
                }
            },
            event = events.next() => match event {
                None => break,
                Some(DeviceEvent::StateChange(SessionStatus::Connected)) => {
                    info!("Status: {}", SessionStatus::Connected);
                    if initial_data {
                        // failures are reported as alerts
                        let _ = manager.send_command(&Command::GetInitialData).await;
                    }
                },
                Some(DeviceEvent::StateChange(SessionStatus::Error)) => {
                    warn!("Status: {}", SessionStatus::Error);
                    retry.as_mut().reset(Instant::now() + retry_delay);
                    retry_pending = true;
                },
                Some(event) => report(manager, event),
            },
        }
    }
}

fn print_history(telemetry: &Telemetry) {
    for (left, right) in telemetry.history_rows() {
        println!("{:<24}{}", left, right);
    }
}

async fn monitor(config: Config, offset: UtcOffset, initial_data: bool) -> Result<(), AppRunError> {
    let radio = Arc::new(BtleRadio::init().await?);
    let manager = SessionManager::new(radio.clone(), config, offset);
    let mut events = manager.subscribe();
    manager.start_scan().map_err(SessionError::from)?;

    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Can not listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };
    watch(&manager, &mut events, ctrl_c, initial_data).await;

    print_history(&manager.telemetry());
    manager.shutdown().await;
    radio.shutdown().await?;
    Ok(())
}

async fn send_commands<T: BleTransport + 'static>(
    manager: &SessionManager<T>,
    events: &mut UnboundedReceiver<DeviceEvent>,
    commands: &[String],
    listen_ms: u64,
    connect_timeout_ms: u64,
) -> Result<(), AppRunError> {
    manager.start_scan().map_err(SessionError::from)?;

    match timeout(Duration::from_millis(connect_timeout_ms), wait_until_connected(manager, events)).await {
        Ok(result) => result?,
        Err(_) => return Err(AppRunError::ConnectTimeout(connect_timeout_ms)),
    }

    for command in commands {
        manager.send(command).await?;
    }

    let listen = sleep(Duration::from_millis(listen_ms));
    tokio::pin!(listen);

    loop {
        tokio::select! {
            _ = &mut listen => break,
            event = events.next() => match event {
                Some(event) => report(manager, event),
                None => break,
            },
        }
    }

    Ok(())
}

async fn send(
    config: Config,
    offset: UtcOffset,
    commands: &[String],
    listen_ms: u64,
    connect_timeout_ms: u64,
) -> Result<(), AppRunError> {
    // refuse typos before touching the radio
    for command in commands {
        command.parse::<Command>()?;
    }

    let radio = Arc::new(BtleRadio::init().await?);
    let manager = SessionManager::new(radio.clone(), config, offset);
    let mut events = manager.subscribe();

    let result = send_commands(&manager, &mut events, commands, listen_ms, connect_timeout_ms).await;

    manager.shutdown().await;
    radio.shutdown().await?;
    result
}

pub async fn execute(cli: Cli, offset: UtcOffset) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::new_sync(cli.config.clone())?;
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;

    let mut config = config_io.read().await?;
    cli.apply(&mut config);
    config.validate()?;

    match cli.action {
        Action::Config { save } => {
            let content = serde_json::to_string_pretty(&config).map_err(ConfigError::from)?;
            println!("{}", content);
            if save {
                config_io.save(&config).await?;
                info!("Saved to {}", config_io.path().to_string_lossy());
            }
            Ok(())
        },
        Action::Monitor { initial_data } => monitor(config, offset, initial_data).await,
        Action::Send { commands, listen_ms, connect_timeout_ms } => {
            send(config, offset, &commands, listen_ms, connect_timeout_ms).await
        },
    }
}
