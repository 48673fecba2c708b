//! Classifies device log lines into typed events.
//!
//! The device prints lines of the form `[<ticks>] I <content>`, optionally wrapped in
//! ANSI colour codes. Only four contents are meaningful; anything else is
//! [`ParsedEvent::Unrecognized`].

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use log::{debug, trace};
use regex::Regex;
use serde_derive::Serialize;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d+)\]\s+I\s+(.*)$").unwrap());

static DETECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CMD:DETECTION\s+(\w+)\((\d+)\)-(\w+)\((\d+)\)\s+th:(\d+)\s+val:(\d+)\s+c:(\d+)")
        .unwrap()
});

static COMM_LOSS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CMD:DETECTION-COMM\s+(\w+)\((\d+)\)-(\w+)\((\d+)\)\s+(\d+)").unwrap()
});

static CONNECTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CMD:CONNECTED\s+(\w+)\((\d+)\)\s+connected:(\w+)\((\d+)\)\s+([01])\b").unwrap()
});

static MAP_RSP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"CMD:MAP_RSP\s+from\s+(\d+)\s+ver:(\S+)\s+gain:(\d+)\s+voltage:(\d+)\s+scan:(\d+)\s+adv:(\d+):\s*(.*)",
    )
    .unwrap()
});

static MAP_PEER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\s+th3:(\d+)\s+(-?\d+)dBm\s+dt:(\d+)\]").unwrap());

#[derive(Clone, Debug, PartialEq)]
pub enum ParsedEvent {
    Detection(Detection),
    CommLoss(CommLoss),
    Connected(Connection),
    MapResponse(Vec<MapRecord>),
    Unrecognized,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub unit_a: u32,
    pub name_a: String,
    pub unit_b: u32,
    pub name_b: String,
    pub threshold: u32,
    pub value: u32,
    pub count: u32,
    pub device_ts: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommLoss {
    pub unit_a: u32,
    pub name_a: String,
    pub unit_b: u32,
    pub name_b: String,
    pub value: u32,
    pub device_ts: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Connection {
    pub unit: u32,
    pub name_unit: String,
    pub peer: u32,
    pub name_peer: String,
    pub connected: bool,
    pub device_ts: u64,
}

/// One unit's entry in a map response.
#[derive(Clone, Debug, PartialEq)]
pub struct MapRecord {
    pub unit_id: u32,
    pub version: String,
    pub gain: u32,
    pub voltage: u32,
    pub scan: u32,
    pub adv: u32,
    pub peers: Vec<MapPeer>,
    pub device_ts: u64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MapPeer {
    pub id: u32,
    pub threshold: u32,
    pub rssi: i32,
    pub dt: u32,
}

/// Parses a single raw line. Never panics; malformed input is `Unrecognized`.
pub fn parse(raw_line: &str) -> ParsedEvent {
    let line = ANSI_RE.replace_all(raw_line, "");
    let line = line.trim();
    if line.is_empty() {
        return ParsedEvent::Unrecognized;
    }

    match classify(line) {
        Some(event) => event,
        None => {
            trace!("Unrecognized line: {:?}", line);
            ParsedEvent::Unrecognized
        }
    }
}

fn classify(line: &str) -> Option<ParsedEvent> {
    let prefix = PREFIX_RE.captures(line)?;
    let device_ts: u64 = prefix[1].parse().ok()?;
    let content = prefix.get(2)?.as_str();

    if let Some(m) = DETECTION_RE.captures(content) {
        return Some(ParsedEvent::Detection(Detection {
            name_a: m[1].to_string(),
            unit_a: m[2].parse().ok()?,
            name_b: m[3].to_string(),
            unit_b: m[4].parse().ok()?,
            threshold: m[5].parse().ok()?,
            value: m[6].parse().ok()?,
            count: m[7].parse().ok()?,
            device_ts,
        }));
    }

    if let Some(m) = COMM_LOSS_RE.captures(content) {
        return Some(ParsedEvent::CommLoss(CommLoss {
            name_a: m[1].to_string(),
            unit_a: m[2].parse().ok()?,
            name_b: m[3].to_string(),
            unit_b: m[4].parse().ok()?,
            value: m[5].parse().ok()?,
            device_ts,
        }));
    }

    if let Some(m) = CONNECTED_RE.captures(content) {
        return Some(ParsedEvent::Connected(Connection {
            name_unit: m[1].to_string(),
            unit: m[2].parse().ok()?,
            name_peer: m[3].to_string(),
            peer: m[4].parse().ok()?,
            connected: &m[5] == "1",
            device_ts,
        }));
    }

    if let Some(m) = MAP_RSP_RE.captures(content) {
        let peers = MAP_PEER_RE
            .captures_iter(&m[7])
            .map(|p| {
                Some(MapPeer {
                    id: p[1].parse().ok()?,
                    threshold: p[2].parse().ok()?,
                    rssi: p[3].parse().ok()?,
                    dt: p[4].parse().ok()?,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        return Some(ParsedEvent::MapResponse(vec![MapRecord {
            unit_id: m[1].parse().ok()?,
            version: m[2].to_string(),
            gain: m[3].parse().ok()?,
            voltage: m[4].parse().ok()?,
            scan: m[5].parse().ok()?,
            adv: m[6].parse().ok()?,
            peers,
            device_ts,
        }]));
    }

    None
}

/// Joins the one-line-per-unit `MAP_RSP` fragments into a single response.
///
/// A pending batch is complete when a recognized non-map event arrives, when a unit
/// already in the batch reports again, or when no fragment has arrived for `idle`.
/// Unrecognized lines neither complete nor extend a batch.
pub struct MapAssembler {
    pending: Vec<MapRecord>,
    last_fragment: Option<Instant>,
    idle: Duration,
}

impl MapAssembler {
    pub fn new(idle: Duration) -> Self {
        MapAssembler {
            pending: Vec::new(),
            last_fragment: None,
            idle,
        }
    }

    /// Feeds one parsed line; returns the events ready for the state engine, in order.
    pub fn push(&mut self, event: ParsedEvent, now: Instant) -> Vec<ParsedEvent> {
        let mut ready = Vec::new();
        match event {
            ParsedEvent::Unrecognized => {}
            ParsedEvent::MapResponse(records) => {
                for record in records {
                    if self.pending.iter().any(|r| r.unit_id == record.unit_id) {
                        ready.extend(self.flush());
                    }
                    self.pending.push(record);
                }
                self.last_fragment = Some(now);
            }
            other => {
                ready.extend(self.flush());
                ready.push(other);
            }
        }
        ready
    }

    /// Completes the pending batch if it has been quiet for the idle window.
    pub fn flush_stale(&mut self, now: Instant) -> Option<ParsedEvent> {
        match self.last_fragment {
            Some(last) if now.saturating_duration_since(last) >= self.idle => self.flush(),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<ParsedEvent> {
        self.last_fragment = None;
        if self.pending.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.pending);
        debug!("Assembled map response with {} units", records.len());
        Some(ParsedEvent::MapResponse(records))
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETECTION: &str = "[123456] I CMD:DETECTION nodeA(11)-nodeB(12) th:500 val:549 c:1";
    const MAP_3: &str = "[2000] I CMD:MAP_RSP from 3 ver:1.4.2 gain:12 voltage:3301 scan:5 adv:1: [4 th3:500 -61dBm dt:20] [7 th3:480 -75dBm dt:35]";
    const MAP_4: &str = "[2010] I CMD:MAP_RSP from 4 ver:1.4.2 gain:10 voltage:3288 scan:5 adv:1: [3 th3:500 -60dBm dt:22]";

    fn record(unit_id: u32) -> MapRecord {
        MapRecord {
            unit_id,
            version: "1.0".to_string(),
            gain: 1,
            voltage: 3300,
            scan: 0,
            adv: 0,
            peers: Vec::new(),
            device_ts: 0,
        }
    }

    #[test]
    fn test_parse_detection() {
        let event = parse(DETECTION);
        assert_eq!(
            event,
            ParsedEvent::Detection(Detection {
                unit_a: 11,
                name_a: "nodeA".to_string(),
                unit_b: 12,
                name_b: "nodeB".to_string(),
                threshold: 500,
                value: 549,
                count: 1,
                device_ts: 123456,
            })
        );
    }

    #[test]
    fn test_parse_strips_ansi_and_line_endings() {
        let colored = format!("\x1b[0;32m{}\x1b[0m\r\n", DETECTION);
        assert!(matches!(parse(&colored), ParsedEvent::Detection(d) if d.value == 549));
    }

    #[test]
    fn test_parse_comm_loss() {
        let event = parse("[99] I CMD:DETECTION-COMM nodeB(12)-nodeA(11) 3");
        match event {
            ParsedEvent::CommLoss(c) => {
                assert_eq!((c.unit_a, c.unit_b), (12, 11));
                assert_eq!(c.value, 3);
                assert_eq!(c.device_ts, 99);
            }
            other => panic!("expected comm loss, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_connected() {
        let up = parse("[5] I CMD:CONNECTED ctrl(1) connected:relay(2) 1");
        let down = parse("[6] I CMD:CONNECTED ctrl(1) connected:relay(2) 0");
        assert!(matches!(up, ParsedEvent::Connected(c) if c.connected && c.unit == 1 && c.peer == 2));
        assert!(matches!(down, ParsedEvent::Connected(c) if !c.connected && c.name_peer == "relay"));
    }

    #[test]
    fn test_parse_map_fragment() {
        match parse(MAP_3) {
            ParsedEvent::MapResponse(records) => {
                assert_eq!(records.len(), 1);
                let r = &records[0];
                assert_eq!(r.unit_id, 3);
                assert_eq!(r.version, "1.4.2");
                assert_eq!((r.gain, r.voltage), (12, 3301));
                assert_eq!(
                    r.peers,
                    vec![
                        MapPeer { id: 4, threshold: 500, rssi: -61, dt: 20 },
                        MapPeer { id: 7, threshold: 480, rssi: -75, dt: 35 },
                    ]
                );
            }
            other => panic!("expected map response, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines_are_unrecognized() {
        let lines = [
            "",
            "   ",
            "garbage",
            "CMD:DETECTION nodeA(11)-nodeB(12) th:500 val:549 c:1",
            "[12] I CMD:DETECTION nodeA(11)-nodeB(12) th:500 val:abc c:1",
            "[12] I CMD:DETECTION nodeA(99999999999)-nodeB(12) th:500 val:549 c:1",
            "[12] I CMD:CONNECTED ctrl(1) connected:relay(2) 7",
            "[12] W CMD:DETECTION-COMM a(1)-b(2) 0",
            "[99999999999999999999999] I CMD:DETECTION-COMM a(1)-b(2) 0",
            "[1] I CMD:MAP_RSP from 3 ver:1 gain:x voltage:1 scan:1 adv:1:",
            "\x1b[31m\u{fffd}\u{fffd}\x00",
        ];
        for line in lines {
            assert_eq!(parse(line), ParsedEvent::Unrecognized, "line {:?}", line);
        }
    }

    #[test]
    fn test_assembler_completes_on_next_event() {
        let now = Instant::now();
        let mut assembler = MapAssembler::new(Duration::from_secs(1));
        assert!(assembler.push(parse(MAP_3), now).is_empty());
        assert!(assembler.push(parse(MAP_4), now).is_empty());
        assert!(assembler.push(ParsedEvent::Unrecognized, now).is_empty());
        assert!(assembler.is_pending());

        let ready = assembler.push(parse(DETECTION), now);
        assert_eq!(ready.len(), 2);
        match &ready[0] {
            ParsedEvent::MapResponse(records) => {
                let ids: Vec<u32> = records.iter().map(|r| r.unit_id).collect();
                assert_eq!(ids, vec![3, 4]);
            }
            other => panic!("expected map response, got {:?}", other),
        }
        assert!(matches!(ready[1], ParsedEvent::Detection(_)));
        assert!(!assembler.is_pending());
    }

    #[test]
    fn test_assembler_splits_on_repeated_unit() {
        let now = Instant::now();
        let mut assembler = MapAssembler::new(Duration::from_secs(1));
        assembler.push(ParsedEvent::MapResponse(vec![record(3)]), now);
        assembler.push(ParsedEvent::MapResponse(vec![record(4)]), now);
        let ready = assembler.push(ParsedEvent::MapResponse(vec![record(3)]), now);
        assert_eq!(ready, vec![ParsedEvent::MapResponse(vec![record(3), record(4)])]);
        assert_eq!(assembler.flush(), Some(ParsedEvent::MapResponse(vec![record(3)])));
    }

    #[test]
    fn test_assembler_flushes_after_idle_window() {
        let start = Instant::now();
        let mut assembler = MapAssembler::new(Duration::from_millis(500));
        assembler.push(ParsedEvent::MapResponse(vec![record(3)]), start);

        assert_eq!(assembler.flush_stale(start + Duration::from_millis(499)), None);
        assert_eq!(
            assembler.flush_stale(start + Duration::from_millis(500)),
            Some(ParsedEvent::MapResponse(vec![record(3)]))
        );
        assert_eq!(assembler.flush_stale(start + Duration::from_secs(5)), None);
    }
}
