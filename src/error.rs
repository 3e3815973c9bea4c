use std::io;
use thiserror::Error;
use std::str::Utf8Error;
use btleplug;
use serde_json;

use crate::device::types::{DeviceId, RadioState, SessionState};

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
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (session): {source}")]
    SessionError { #[from] source: SessionError },

    #[error("Failed to start async runtime: {source}")]
    Runtime { source: io::Error },

    #[error("Failed to initialize logger: {source}")]
    Logging { #[from] source: log::SetLoggerError },

    #[error("Failed to open LOG_FILE: {source}")]
    LogFile { source: io::Error },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Bluetooth is not available (radio {0})")]
    TransportUnavailable(RadioState),

    #[error("No bluetooth adapter found")]
    NoAdapter,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Peripheral {0} is not known to the adapter")]
    UnknownDevice(DeviceId),

    #[error("Malformed heading frame ({len} bytes)")]
    MalformedHeadingFrame { len: usize },

    #[error("Heading out of range: {tenths} tenths of a degree")]
    HeadingOutOfRange { tenths: u16 },
}

/// Request-level errors returned by the session state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth is not available (radio {0})")]
    TransportUnavailable(RadioState),

    #[error("A session is already active ({0})")]
    SessionActive(SessionState),

    #[error("No device selection is pending")]
    NotAwaitingSelection,

    #[error("Device {0} is not one of the discovered candidates")]
    UnknownCandidate(DeviceId),

    #[error("The session controller has stopped")]
    ControllerStopped,
}
