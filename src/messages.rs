use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::state::{LinkState, SensorUnit};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Clear,
    Intrusion,
    CommLoss,
    Disconnected,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmMode {
    #[serde(rename = "auto", alias = "auto_reset")]
    AutoReset,
    #[serde(rename = "manual", alias = "manual_ack")]
    ManualAck,
}

/// Everything observers receive on the live stream.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Detection(DetectionReport),
    CommLoss(CommLossReport),
    Connected(ConnectionReport),
    Map(MapReport),
    Status(StatusReport),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Detection(_) => "detection",
            Notification::CommLoss(_) => "comm_loss",
            Notification::Connected(_) => "connected",
            Notification::Map(_) => "map",
            Notification::Status(_) => "status",
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DetectionReport {
    pub unit_a: u32,
    pub unit_b: u32,
    pub id_a: String,
    pub id_b: String,
    pub threshold: u32,
    pub value: u32,
    pub count: u32,
    pub device_ts: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CommLossReport {
    pub unit_a: u32,
    pub unit_b: u32,
    pub id_a: String,
    pub id_b: String,
    pub value: u32,
    pub device_ts: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ConnectionReport {
    pub unit: u32,
    pub peer: u32,
    pub id_unit: String,
    pub id_peer: String,
    pub connected: bool,
    pub device_ts: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MapReport {
    pub units: Vec<SensorUnit>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub serial_connected: bool,
    pub alarm_state: AlarmState,
    pub alarm_mode: AlarmMode,
    pub detection_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

/// Readings carried by the most recent detection.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct LastDetection {
    pub at: DateTime<Utc>,
    pub threshold: u32,
    pub value: u32,
    pub count: u32,
}

/// Point-in-time copy of the model handed to a newly joined observer.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename = "snapshot")]
pub struct Snapshot {
    pub status: StatusReport,
    pub last_detection: Option<LastDetection>,
    pub units: Vec<SensorUnit>,
    pub links: Vec<LinkState>,
    /// Newest first.
    pub events: Vec<Notification>,
}

/// Commands issued by observers.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    SetThreshold { value: u32 },
    SetGain { value: u32 },
    #[serde(rename = "map")]
    RequestMap,
    Acknowledge,
    ToggleDetection,
    SetAlarmMode { mode: AlarmMode },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::SetThreshold { .. } => "set_threshold",
            ClientCommand::SetGain { .. } => "set_gain",
            ClientCommand::RequestMap => "map",
            ClientCommand::Acknowledge => "acknowledge",
            ClientCommand::ToggleDetection => "toggle_detection",
            ClientCommand::SetAlarmMode { .. } => "set_alarm_mode",
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub cmd: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_commands_decode() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"set_threshold","value":620}"#).unwrap();
        assert_eq!(cmd, ClientCommand::SetThreshold { value: 620 });

        let cmd: ClientCommand = serde_json::from_str(r#"{"cmd":"map"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::RequestMap);

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"cmd":"set_alarm_mode","mode":"manual"}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::SetAlarmMode {
                mode: AlarmMode::ManualAck
            }
        );

        assert!(serde_json::from_str::<ClientCommand>(r#"{"cmd":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"cmd":"set_gain"}"#).is_err());
    }

    #[test]
    fn test_status_encoding() {
        let status = Notification::Status(StatusReport {
            serial_connected: true,
            alarm_state: AlarmState::CommLoss,
            alarm_mode: AlarmMode::AutoReset,
            detection_enabled: false,
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["alarm_state"], "comm_loss");
        assert_eq!(json["alarm_mode"], "auto");
        assert_eq!(json["detection_enabled"], false);
    }
}
