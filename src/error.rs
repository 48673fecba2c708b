use std::time::Duration;

use thiserror::Error;

/// Failure of the physical serial link. Never fatal once the pipeline runs.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port is not open")]
    NotConnected,
    #[error("write abandoned after its deadline")]
    Abandoned,
}

/// Outcome of a command that could not be carried out on the device.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device did not accept `{token}` within {after:?}")]
    CommandTimeout { token: String, after: Duration },
    #[error("command queue is full")]
    QueueFull,
    #[error("serial port is not open")]
    NotConnected,
    #[error("dispatcher has stopped")]
    Stopped,
    #[error(transparent)]
    Link(LinkError),
}

impl From<LinkError> for DispatchError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NotConnected => DispatchError::NotConnected,
            other => DispatchError::Link(other),
        }
    }
}

/// A single observer could not be reached.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("observer closed")]
    Closed,
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serial.device must not be empty")]
    EmptyDevicePath,
    #[error("invalid baud rate {0}")]
    InvalidBaudRate(u32),
    #[error("unsupported line terminator {0:?}, expected \"\\n\" or \"\\r\"")]
    InvalidTerminator(String),
    #[error("detection pair ({0}, {1}) must name two distinct units")]
    InvalidDetectionPair(u32, u32),
    #[error("invalid configuration: {0}")]
    InvalidValue(&'static str),
}
