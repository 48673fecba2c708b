//! Authoritative model of the sensor mesh and the alarm it drives.
//!
//! The effective alarm state is derived from the model rather than stored, so the
//! precedence DISCONNECTED > COMM_LOSS > INTRUSION > CLEAR always holds:
//!
//! * the serial link is down, or a link touching a detector was reported disconnected
//!   => `Disconnected`
//! * any other link is down (comm-loss report, or infrastructure disconnect)
//!   => `CommLoss`
//! * a detection is latched and not yet reset or acknowledged => `Intrusion`
//! * otherwise `Clear`

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, trace};
use serde_derive::Serialize;

use crate::config::AppConfig;
use crate::event_log::EventLog;
use crate::messages::{
    AlarmMode, AlarmState, CommLossReport, ConnectionReport, DetectionReport, LastDetection,
    MapReport, Notification, Snapshot, StatusReport,
};
use crate::parser::{CommLoss, Connection, Detection, MapPeer, MapRecord, ParsedEvent};

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SensorUnit {
    pub unit_id: u32,
    pub name: Option<String>,
    pub version: Option<String>,
    pub gain: Option<u32>,
    pub voltage: Option<u32>,
    pub peers: BTreeSet<u32>,
    pub peer_connected: BTreeMap<u32, bool>,
    /// Link quality per peer from the last map response.
    pub peer_quality: Vec<MapPeer>,
}

impl SensorUnit {
    fn new(unit_id: u32) -> Self {
        SensorUnit {
            unit_id,
            name: None,
            version: None,
            gain: None,
            voltage: None,
            peers: BTreeSet::new(),
            peer_connected: BTreeMap::new(),
            peer_quality: Vec::new(),
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkFault {
    CommLoss,
    Disconnected,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct LinkState {
    pub unit: u32,
    pub peer: u32,
    pub connected: bool,
    pub fault: Option<LinkFault>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: AlarmMode,
    pub reset_timeout: Duration,
    pub event_log_capacity: usize,
    pub detection_pair: (u32, u32),
    pub default_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            mode: AlarmMode::AutoReset,
            reset_timeout: Duration::from_secs(4),
            event_log_capacity: 50,
            detection_pair: (3, 4),
            default_threshold: 500,
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        let alarm = config.alarm();
        EngineSettings {
            mode: alarm.mode(),
            reset_timeout: alarm.reset_timeout(),
            event_log_capacity: alarm.event_log_capacity(),
            detection_pair: alarm.detection_pair(),
            default_threshold: alarm.default_threshold(),
        }
    }
}

type StatusKey = (AlarmState, AlarmMode, bool, bool);

pub struct StateEngine {
    units: BTreeMap<u32, SensorUnit>,
    links: BTreeMap<(u32, u32), LinkState>,
    log: EventLog<Notification>,
    mode: AlarmMode,
    reset_timeout: TimeDelta,
    detectors: (u32, u32),
    serial_connected: bool,
    intrusion_latched: bool,
    last_detection: Option<LastDetection>,
    detection_enabled: bool,
    saved_threshold: u32,
}

impl StateEngine {
    pub fn new(settings: EngineSettings) -> Self {
        StateEngine {
            units: BTreeMap::new(),
            links: BTreeMap::new(),
            log: EventLog::new(settings.event_log_capacity),
            mode: settings.mode,
            reset_timeout: TimeDelta::from_std(settings.reset_timeout)
                .unwrap_or(TimeDelta::MAX),
            detectors: settings.detection_pair,
            serial_connected: true,
            intrusion_latched: false,
            last_detection: None,
            detection_enabled: true,
            saved_threshold: settings.default_threshold,
        }
    }

    pub fn alarm_state(&self) -> AlarmState {
        let down = || self.links.values().filter(|l| !l.connected);

        if !self.serial_connected || down().any(|l| l.fault == Some(LinkFault::Disconnected)) {
            AlarmState::Disconnected
        } else if down().next().is_some() {
            AlarmState::CommLoss
        } else if self.intrusion_latched {
            AlarmState::Intrusion
        } else {
            AlarmState::Clear
        }
    }

    pub fn mode(&self) -> AlarmMode {
        self.mode
    }

    /// Applies one parsed event and returns the notifications it produced.
    pub fn apply(&mut self, event: ParsedEvent, now: DateTime<Utc>) -> Vec<Notification> {
        let before = self.status_key();
        let mut out = Vec::new();

        match event {
            ParsedEvent::Detection(detection) => out.push(self.on_detection(detection, now)),
            ParsedEvent::CommLoss(loss) => out.push(self.on_comm_loss(loss, now)),
            ParsedEvent::Connected(connection) => out.push(self.on_connected(connection, now)),
            ParsedEvent::MapResponse(records) => out.push(self.on_map(records, now)),
            ParsedEvent::Unrecognized => {}
        }

        self.push_status_if_changed(before, now, &mut out);
        out
    }

    /// Time-based expiry of a latched detection under auto reset.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let before = self.status_key();
        let mut out = Vec::new();

        if self.mode == AlarmMode::AutoReset && self.intrusion_latched {
            if let Some(last) = &self.last_detection {
                if now - last.at >= self.reset_timeout {
                    info!("Auto reset: no detection for {}s", self.reset_timeout.num_seconds());
                    self.intrusion_latched = false;
                }
            }
        }

        self.push_status_if_changed(before, now, &mut out);
        out
    }

    /// Clears an active intrusion under manual acknowledge. A no-op otherwise.
    pub fn acknowledge(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        if self.mode == AlarmMode::ManualAck && self.alarm_state() == AlarmState::Intrusion {
            info!("Intrusion acknowledged");
            self.intrusion_latched = false;
        } else {
            debug!("Acknowledge ignored in {:?}/{:?}", self.alarm_state(), self.mode);
        }
        vec![self.status(now)]
    }

    pub fn set_mode(&mut self, mode: AlarmMode, now: DateTime<Utc>) -> Vec<Notification> {
        if mode != self.mode {
            info!("Alarm mode changed to {:?}", mode);
        }
        self.mode = mode;
        vec![self.status(now)]
    }

    /// Records a new detection threshold; returns the value to write to the device.
    pub fn set_threshold(&mut self, value: u32, now: DateTime<Utc>) -> (u32, Vec<Notification>) {
        let before = self.status_key();
        self.saved_threshold = value;
        self.detection_enabled = true;
        let mut out = Vec::new();
        self.push_status_if_changed(before, now, &mut out);
        (value, out)
    }

    /// Flips detection on or off; returns the threshold to write (0 disables).
    pub fn toggle_detection(&mut self, now: DateTime<Utc>) -> (u32, Vec<Notification>) {
        self.detection_enabled = !self.detection_enabled;
        let threshold = if self.detection_enabled {
            self.saved_threshold
        } else {
            0
        };
        info!(
            "Detection {} (threshold {})",
            if self.detection_enabled { "enabled" } else { "disabled" },
            threshold
        );
        (threshold, vec![self.status(now)])
    }

    pub fn link_lost(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let before = self.status_key();
        self.serial_connected = false;
        let mut out = Vec::new();
        self.push_status_if_changed(before, now, &mut out);
        out
    }

    /// The device restarts its own view of the mesh on reconnect, so stale link
    /// faults are forgotten and re-learned from fresh reports.
    pub fn link_restored(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let before = self.status_key();
        self.serial_connected = true;

        let stale: Vec<(u32, u32)> = self
            .links
            .iter()
            .filter(|(_, l)| !l.connected)
            .map(|(k, _)| *k)
            .collect();
        for (unit, peer) in stale {
            self.links.remove(&(unit, peer));
            if let Some(u) = self.units.get_mut(&unit) {
                u.peer_connected.remove(&peer);
            }
        }

        let mut out = Vec::new();
        self.push_status_if_changed(before, now, &mut out);
        out
    }

    pub fn status(&self, now: DateTime<Utc>) -> Notification {
        Notification::Status(self.status_report(now))
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            status: self.status_report(now),
            last_detection: self.last_detection.clone(),
            units: self.units.values().cloned().collect(),
            links: self.links.values().cloned().collect(),
            events: self.log.newest_first(),
        }
    }

    fn status_report(&self, now: DateTime<Utc>) -> StatusReport {
        StatusReport {
            serial_connected: self.serial_connected,
            alarm_state: self.alarm_state(),
            alarm_mode: self.mode,
            detection_enabled: self.detection_enabled,
            timestamp: now,
        }
    }

    fn status_key(&self) -> StatusKey {
        (
            self.alarm_state(),
            self.mode,
            self.serial_connected,
            self.detection_enabled,
        )
    }

    fn push_status_if_changed(
        &self,
        before: StatusKey,
        now: DateTime<Utc>,
        out: &mut Vec<Notification>,
    ) {
        let after = self.status_key();
        if after != before {
            if after.0 != before.0 {
                info!("Alarm state {:?} -> {:?}", before.0, after.0);
            }
            out.push(self.status(now));
        }
    }

    fn record(&mut self, notification: Notification) -> Notification {
        self.log.push(notification.clone());
        trace!(
            "Logged {} ({}/{})",
            notification.kind(),
            self.log.len(),
            self.log.capacity()
        );
        notification
    }

    fn is_detector(&self, unit_id: u32) -> bool {
        unit_id == self.detectors.0 || unit_id == self.detectors.1
    }

    fn unit_mut(&mut self, unit_id: u32, name: Option<&str>) -> &mut SensorUnit {
        let unit = self
            .units
            .entry(unit_id)
            .or_insert_with(|| SensorUnit::new(unit_id));
        if let Some(name) = name {
            unit.name = Some(name.to_string());
        }
        unit
    }

    fn set_link(
        &mut self,
        unit: u32,
        peer: u32,
        connected: bool,
        fault: Option<LinkFault>,
        now: DateTime<Utc>,
    ) {
        self.links.insert(
            (unit, peer),
            LinkState {
                unit,
                peer,
                connected,
                fault,
                updated_at: now,
            },
        );
        let u = self.unit_mut(unit, None);
        u.peers.insert(peer);
        u.peer_connected.insert(peer, connected);
    }

    fn on_detection(&mut self, d: Detection, now: DateTime<Utc>) -> Notification {
        self.unit_mut(d.unit_a, Some(&d.name_a)).peers.insert(d.unit_b);
        self.unit_mut(d.unit_b, Some(&d.name_b)).peers.insert(d.unit_a);

        self.intrusion_latched = true;
        self.last_detection = Some(LastDetection {
            at: now,
            threshold: d.threshold,
            value: d.value,
            count: d.count,
        });

        let notification = Notification::Detection(DetectionReport {
            unit_a: d.unit_a,
            unit_b: d.unit_b,
            id_a: d.name_a,
            id_b: d.name_b,
            threshold: d.threshold,
            value: d.value,
            count: d.count,
            device_ts: d.device_ts,
            timestamp: now,
        });
        self.record(notification)
    }

    fn on_comm_loss(&mut self, c: CommLoss, now: DateTime<Utc>) -> Notification {
        self.unit_mut(c.unit_a, Some(&c.name_a));
        self.unit_mut(c.unit_b, Some(&c.name_b));
        self.set_link(c.unit_a, c.unit_b, false, Some(LinkFault::CommLoss), now);
        self.set_link(c.unit_b, c.unit_a, false, Some(LinkFault::CommLoss), now);

        let notification = Notification::CommLoss(CommLossReport {
            unit_a: c.unit_a,
            unit_b: c.unit_b,
            id_a: c.name_a,
            id_b: c.name_b,
            value: c.value,
            device_ts: c.device_ts,
            timestamp: now,
        });
        self.record(notification)
    }

    fn on_connected(&mut self, c: Connection, now: DateTime<Utc>) -> Notification {
        self.unit_mut(c.unit, Some(&c.name_unit));
        self.unit_mut(c.peer, Some(&c.name_peer));

        if c.connected {
            self.set_link(c.unit, c.peer, true, None, now);
            self.set_link(c.peer, c.unit, true, None, now);
        } else {
            let fault = if self.is_detector(c.unit) || self.is_detector(c.peer) {
                LinkFault::Disconnected
            } else {
                LinkFault::CommLoss
            };
            self.set_link(c.unit, c.peer, false, Some(fault), now);
        }

        let notification = Notification::Connected(ConnectionReport {
            unit: c.unit,
            peer: c.peer,
            id_unit: c.name_unit,
            id_peer: c.name_peer,
            connected: c.connected,
            device_ts: c.device_ts,
            timestamp: now,
        });
        self.record(notification)
    }

    fn on_map(&mut self, records: Vec<MapRecord>, now: DateTime<Utc>) -> Notification {
        for record in records {
            let unit = self.unit_mut(record.unit_id, None);
            unit.version = Some(record.version);
            unit.gain = Some(record.gain);
            unit.voltage = Some(record.voltage);
            unit.peers = record.peers.iter().map(|p| p.id).collect();
            let peers = &unit.peers;
            unit.peer_connected.retain(|peer, _| peers.contains(peer));
            unit.peer_quality = record.peers;
        }

        Notification::Map(MapReport {
            units: self.units.values().cloned().collect(),
            timestamp: now,
        })
    }
}

#[cfg(test)]
impl StateEngine {
    fn last_detection(&self) -> Option<&LastDetection> {
        self.last_detection.as_ref()
    }

    fn unit(&self, unit_id: u32) -> Option<&SensorUnit> {
        self.units.get(&unit_id)
    }

    fn link(&self, unit: u32, peer: u32) -> Option<&LinkState> {
        self.links.get(&(unit, peer))
    }

    fn events(&self) -> &EventLog<Notification> {
        &self.log
    }
}
