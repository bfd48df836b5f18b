use std::io;
use std::string::FromUtf8Error;
use std::str::Utf8Error;
use thiserror::Error;
use uuid::Uuid;
use btleplug;
use serde_json;

use crate::device::types::SessionStatus;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to initialize logger: {source}")]
    Logging { #[from] source: log::SetLoggerError },

    #[error("Failed to open log file: {source}")]
    LogFile { source: io::Error },

    #[error("Failed to initialize bluetooth: {source}")]
    Transport { #[from] source: TransportError },

    #[error("Device session failed: {source}")]
    Session { #[from] source: SessionError },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: io::Error },

    #[error("{source}")]
    Command { #[from] source: CommandError },

    #[error("Failed to send command: {source}")]
    Write { #[from] source: WriteError },

    #[error("Could not connect to the device: {0}")]
    ConnectionFailed(String),

    #[error("No device found within {0} ms")]
    ConnectTimeout(u64),
}

/// Errors raised by a [`crate::device::transport::BleTransport`] implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {0} is not known to the adapter")]
    UnknownPeripheral(String),

    #[error("Characteristic {0} is not available on the peripheral")]
    UnknownCharacteristic(Uuid),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("A scan can not start while the session is {0}")]
    Busy(SessionStatus),

    #[error("Failed to scan for peripherals: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to connect to peripheral: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("The peripheral does not expose service {0}")]
    MissingService(Uuid),

    #[error("Service {service} has no characteristic {characteristic}")]
    MissingCharacteristic { service: Uuid, characteristic: Uuid },

    #[error("Failed to discover services: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("The device is not connected")]
    NotConnected,

    #[error("Invalid command: {source}")]
    InvalidCommand { #[from] source: CommandError },

    #[error("Writing to the command characteristic took longer than {0} ms")]
    Deadline(u64),

    #[error("The device rejected the write: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Payload is not valid base64: {source}")]
    Base64 { #[from] source: base64::DecodeError },

    #[error("Payload is not valid utf-8: {source}")]
    Utf8 { #[from] source: FromUtf8Error },

    #[error("Payload is empty")]
    Empty,

    #[error("Unknown reading key {0:?}")]
    UnknownKey(String),

    #[error("Invalid number {0:?}")]
    InvalidNumber(String),

    #[error("Timestamp {0} is out of range")]
    TimestampOutOfRange(i64),

    #[error("Failed to format timestamp: {source}")]
    Format { #[from] source: time::error::Format },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command is empty")]
    Empty,

    #[error("Unknown command {0:?}")]
    Unknown(String),

    #[error("Invalid argument {argument:?} for {command}")]
    InvalidArgument { command: &'static str, argument: String },

    #[error("Command {given:?} must be written as {canonical:?}")]
    NotCanonical { given: String, canonical: String },
}

/// Everything that can end or prevent a connection attempt.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Scan { #[from] source: ScanError },

    #[error(transparent)]
    Connect { #[from] source: ConnectError },

    #[error(transparent)]
    Discovery { #[from] source: DiscoveryError },

    #[error("Failed to subscribe to characteristic {characteristic}: {source}")]
    Subscribe { characteristic: Uuid, source: TransportError },

    #[error("The link to the device was lost")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Please fill in all required fields")]
    MissingField,

    #[error("Please enter a valid email address")]
    InvalidEmail,

    #[error("Password must have at least 8 characters, including at least one uppercase letter, one lowercase letter, and one number")]
    WeakPassword,

    #[error("Please make sure the passwords match")]
    PasswordMismatch,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("An account already exists for {0}")]
    AccountExists(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Authentication service error: {0}")]
    Service(String),
}
