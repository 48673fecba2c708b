use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::error::ConfigError;
use crate::messages::AlarmMode;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub alarm: Option<AlarmConfig>,
    pub dispatcher: Option<DispatcherConfig>,
    pub broadcast: Option<BroadcastConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub parity: Option<Parity>,
    pub stop_bits: Option<u8>,
    pub read_timeout_ms: Option<u64>,
    pub line_terminator: Option<String>,
    pub retry_max_delay_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AlarmConfig {
    pub mode: Option<AlarmMode>,
    pub reset_timeout_ms: Option<u64>,
    pub event_log_capacity: Option<usize>,
    /// Detector units forming the tripwire; also the arguments of `re`.
    pub detection_pair: Option<(u32, u32)>,
    pub default_threshold: Option<u32>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: Option<usize>,
    pub command_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct BroadcastConfig {
    pub capacity: Option<usize>,
    pub map_idle_ms: Option<u64>,
    pub tick_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Decodes the file without validating it, so CLI overrides can be applied first.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::de::from_str(contents)?)
    }

    /// Rejects values that would only fail once the pipeline is running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.device.trim().is_empty() {
            return Err(ConfigError::EmptyDevicePath);
        }
        if self.serial.baud_rate() == 0 {
            return Err(ConfigError::InvalidBaudRate(0));
        }
        if !matches!(self.serial.data_bits.unwrap_or(8), 5..=8) {
            return Err(ConfigError::InvalidValue("serial.data_bits must be 5-8"));
        }
        if !matches!(self.serial.stop_bits.unwrap_or(1), 1 | 2) {
            return Err(ConfigError::InvalidValue("serial.stop_bits must be 1 or 2"));
        }
        self.serial.terminator()?;

        let alarm = self.alarm();
        let (a, b) = alarm.detection_pair();
        if a == b {
            return Err(ConfigError::InvalidDetectionPair(a, b));
        }
        if alarm.event_log_capacity() == 0 {
            return Err(ConfigError::InvalidValue("alarm.event_log_capacity must be > 0"));
        }
        if self.dispatcher().queue_capacity() == 0 {
            return Err(ConfigError::InvalidValue("dispatcher.queue_capacity must be > 0"));
        }
        if self.broadcast().capacity() == 0 {
            return Err(ConfigError::InvalidValue("broadcast.capacity must be > 0"));
        }
        Ok(())
    }

    pub fn alarm(&self) -> AlarmConfig {
        self.alarm.clone().unwrap_or_default()
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        self.dispatcher.clone().unwrap_or_default()
    }

    pub fn broadcast(&self) -> BroadcastConfig {
        self.broadcast.clone().unwrap_or_default()
    }
}

impl SerialConfig {
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(57600)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(100))
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms.unwrap_or(10_000))
    }

    /// The single byte that ends a device line.
    pub fn terminator(&self) -> Result<u8, ConfigError> {
        let raw = self.line_terminator.as_deref().unwrap_or("\n");
        match raw {
            "\n" | "\\n" | "lf" | "LF" => Ok(b'\n'),
            "\r" | "\\r" | "cr" | "CR" => Ok(b'\r'),
            other => Err(ConfigError::InvalidTerminator(other.to_string())),
        }
    }

    pub fn data_bits(&self) -> serialport::DataBits {
        match self.data_bits.unwrap_or(8) {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    pub fn stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits.unwrap_or(1) {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }

    pub fn parity(&self) -> serialport::Parity {
        match self.parity.unwrap_or(Parity::None) {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl AlarmConfig {
    pub fn mode(&self) -> AlarmMode {
        self.mode.unwrap_or(AlarmMode::AutoReset)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms.unwrap_or(4000))
    }

    pub fn event_log_capacity(&self) -> usize {
        self.event_log_capacity.unwrap_or(50)
    }

    pub fn detection_pair(&self) -> (u32, u32) {
        self.detection_pair.unwrap_or((3, 4))
    }

    pub fn default_threshold(&self) -> u32 {
        self.default_threshold.unwrap_or(500)
    }
}

impl DispatcherConfig {
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(16)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.unwrap_or(2000))
    }
}

impl BroadcastConfig {
    pub fn capacity(&self) -> usize {
        self.capacity.unwrap_or(256)
    }

    pub fn map_idle(&self) -> Duration {
        Duration::from_millis(self.map_idle_ms.unwrap_or(1000))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.unwrap_or(250))
    }
}
