//! The single writer: owns the state engine and applies everything that mutates it,
//! one input at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::AppConfig;
use crate::dispatcher::{DeviceCommand, Dispatcher};
use crate::error::DispatchError;
use crate::hub::{BroadcastHub, Observer};
use crate::messages::{ClientCommand, Notification, Snapshot};
use crate::parser::{self, MapAssembler};
use crate::serial::ReaderEvent;
use crate::state::{EngineSettings, StateEngine};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub engine: EngineSettings,
    pub map_idle: Duration,
    pub tick_interval: Duration,
}

impl From<&AppConfig> for MonitorSettings {
    fn from(config: &AppConfig) -> Self {
        let broadcast = config.broadcast();
        MonitorSettings {
            engine: EngineSettings::from(config),
            map_idle: broadcast.map_idle(),
            tick_interval: broadcast.tick_interval(),
        }
    }
}

enum Control {
    Command {
        command: ClientCommand,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Subscribe {
        reply: oneshot::Sender<(Observer, Snapshot)>,
    },
}

/// Clonable entry point for everything outside the monitor task.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Control>,
}

impl MonitorHandle {
    /// Runs a client command. Device commands resolve once written to the device.
    pub async fn command(&self, command: ClientCommand) -> Result<(), DispatchError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Control::Command { command, reply })
            .await
            .map_err(|_| DispatchError::Stopped)?;
        done.await.unwrap_or(Err(DispatchError::Stopped))
    }

    /// Joins the live stream together with a snapshot taken at the same instant.
    pub async fn subscribe(&self) -> Option<(Observer, Snapshot)> {
        let (reply, done) = oneshot::channel();
        self.tx.send(Control::Subscribe { reply }).await.ok()?;
        done.await.ok()
    }
}

pub struct Monitor {
    engine: StateEngine,
    assembler: MapAssembler,
    hub: Arc<BroadcastHub>,
    dispatcher: Dispatcher,
    reader_rx: mpsc::Receiver<ReaderEvent>,
    control_rx: mpsc::Receiver<Control>,
    tick_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        hub: Arc<BroadcastHub>,
        dispatcher: Dispatcher,
        reader_rx: mpsc::Receiver<ReaderEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, MonitorHandle) {
        let (tx, control_rx) = mpsc::channel(32);
        let monitor = Monitor {
            engine: StateEngine::new(settings.engine),
            assembler: MapAssembler::new(settings.map_idle),
            hub,
            dispatcher,
            reader_rx,
            control_rx,
            tick_interval: settings.tick_interval,
            shutdown,
        };
        (monitor, MonitorHandle { tx })
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reader_open = true;

        info!("Monitor started in {:?} mode", self.engine.mode());
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                event = self.reader_rx.recv(), if reader_open => match event {
                    Some(event) => self.on_reader_event(event),
                    None => {
                        warn!("Serial reader has stopped");
                        reader_open = false;
                    }
                },
                control = self.control_rx.recv() => match control {
                    Some(control) => self.on_control(control),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }
        info!("Monitor stopped");
    }

    fn on_reader_event(&mut self, event: ReaderEvent) {
        let now = Utc::now();
        match event {
            ReaderEvent::Line(line) => {
                let parsed = parser::parse(&line);
                for event in self.assembler.push(parsed, Instant::now()) {
                    let out = self.engine.apply(event, now);
                    self.publish(out);
                }
            }
            ReaderEvent::LinkError(reason) => {
                warn!("Serial link down: {}", reason);
                if let Some(map) = self.assembler.flush() {
                    let out = self.engine.apply(map, now);
                    self.publish(out);
                }
                let out = self.engine.link_lost(now);
                self.publish(out);
            }
            ReaderEvent::LinkRestored => {
                let out = self.engine.link_restored(now);
                self.publish(out);
                self.send_to_device(DeviceCommand::EnableDetectionReport, None);
            }
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Subscribe { reply } => {
                // Both happen inside one step, so nothing published can fall between them.
                let observer = self.hub.subscribe();
                let snapshot = self.engine.snapshot(Utc::now());
                debug!(
                    "Observer {} joined ({} active)",
                    observer.id(),
                    self.hub.observer_count()
                );
                if let Err((observer, _)) = reply.send((observer, snapshot)) {
                    self.hub.unsubscribe(observer.id());
                }
            }
            Control::Command { command, reply } => self.on_command(command, reply),
        }
    }

    fn on_command(
        &mut self,
        command: ClientCommand,
        reply: oneshot::Sender<Result<(), DispatchError>>,
    ) {
        let now = Utc::now();
        debug!("Client command {:?}", command);
        let device_command = match command {
            ClientCommand::Acknowledge => {
                let out = self.engine.acknowledge(now);
                self.publish(out);
                let _ = reply.send(Ok(()));
                return;
            }
            ClientCommand::SetAlarmMode { mode } => {
                let out = self.engine.set_mode(mode, now);
                self.publish(out);
                let _ = reply.send(Ok(()));
                return;
            }
            ClientCommand::SetThreshold { value } => {
                let (threshold, out) = self.engine.set_threshold(value, now);
                self.publish(out);
                DeviceCommand::SetThreshold(threshold)
            }
            ClientCommand::ToggleDetection => {
                let (threshold, out) = self.engine.toggle_detection(now);
                self.publish(out);
                DeviceCommand::SetThreshold(threshold)
            }
            ClientCommand::SetGain { value } => DeviceCommand::SetGain(value),
            ClientCommand::RequestMap => DeviceCommand::RequestMap,
        };
        self.send_to_device(device_command, Some(reply));
    }

    /// Queues a device command without waiting for it; the script runs on the
    /// dispatcher while this task keeps applying events.
    fn send_to_device(
        &self,
        command: DeviceCommand,
        reply: Option<oneshot::Sender<Result<(), DispatchError>>>,
    ) {
        match self.dispatcher.submit(command.clone()) {
            Ok(done) => {
                tokio::spawn(async move {
                    let result = done.await.unwrap_or(Err(DispatchError::Stopped));
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                warn!("{:?} failed: {}", command, err);
                            }
                        }
                    }
                });
            }
            Err(err) => match reply {
                Some(reply) => {
                    let _ = reply.send(Err(err));
                }
                None => warn!("Could not queue {:?}: {}", command, err),
            },
        }
    }

    fn on_tick(&mut self) {
        let now = Utc::now();
        if let Some(map) = self.assembler.flush_stale(Instant::now()) {
            let out = self.engine.apply(map, now);
            self.publish(out);
        }
        let out = self.engine.tick(now);
        self.publish(out);
    }

    fn publish(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.hub.publish(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::timeout;

    use super::*;
    use crate::dispatcher::{DispatcherSettings, LineWriter};
    use crate::error::LinkError;
    use crate::messages::{AlarmMode, AlarmState};

    const DETECTION: &str = "[1000] I CMD:DETECTION nodeA(11)-nodeB(12) th:500 val:549 c:1";
    const COMM_LOSS: &str = "[1100] I CMD:DETECTION-COMM nodeB(12)-nodeA(11) 0";

    #[derive(Clone, Default)]
    struct RecordingWriter(Arc<Mutex<Vec<String>>>);

    impl LineWriter for RecordingWriter {
        async fn write_line(&self, line: &str) -> Result<(), LinkError> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    struct Harness {
        handle: MonitorHandle,
        reader_tx: mpsc::Sender<ReaderEvent>,
        writer: RecordingWriter,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn start(mode: AlarmMode) -> Harness {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = RecordingWriter::default();
        let (dispatcher, _worker) = Dispatcher::spawn(
            writer.clone(),
            DispatcherSettings {
                queue_capacity: 4,
                command_timeout: Duration::from_secs(2),
                detection_pair: (11, 12),
            },
            shutdown_rx.clone(),
        );
        let (reader_tx, reader_rx) = mpsc::channel(16);
        let settings = MonitorSettings {
            engine: EngineSettings {
                mode,
                detection_pair: (11, 12),
                ..EngineSettings::default()
            },
            map_idle: Duration::from_secs(60),
            tick_interval: Duration::from_millis(250),
        };
        let hub = Arc::new(BroadcastHub::new(64));
        let (monitor, handle) = Monitor::new(settings, hub, dispatcher, reader_rx, shutdown_rx);
        tokio::spawn(monitor.run());
        Harness {
            handle,
            reader_tx,
            writer,
            _shutdown_tx: shutdown_tx,
        }
    }

    async fn next(observer: &mut Observer) -> Notification {
        timeout(Duration::from_secs(5), observer.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("observer closed")
    }

    async fn line(harness: &Harness, line: &str) {
        harness
            .reader_tx
            .send(ReaderEvent::Line(line.to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_detection_reaches_every_observer() {
        let harness = start(AlarmMode::AutoReset);
        let (mut a, _) = harness.handle.subscribe().await.unwrap();
        let (mut b, _) = harness.handle.subscribe().await.unwrap();

        line(&harness, DETECTION).await;

        for observer in [&mut a, &mut b] {
            let json = serde_json::to_value(next(observer).await).unwrap();
            assert_eq!(json["type"], "detection");
            assert_eq!(json["unit_a"], 11);
            assert_eq!(json["unit_b"], 12);
            assert_eq!(json["threshold"], 500);
            assert_eq!(json["value"], 549);
            assert_eq!(json["count"], 1);

            match next(observer).await {
                Notification::Status(status) => {
                    assert_eq!(status.alarm_state, AlarmState::Intrusion)
                }
                other => panic!("expected status, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_comm_loss_reaches_observers() {
        let harness = start(AlarmMode::AutoReset);
        let (mut observer, _) = harness.handle.subscribe().await.unwrap();

        line(&harness, COMM_LOSS).await;

        let json = serde_json::to_value(next(&mut observer).await).unwrap();
        assert_eq!(json["type"], "comm_loss");
        assert_eq!(json["unit_a"], 12);
        assert_eq!(json["unit_b"], 11);
        match next(&mut observer).await {
            Notification::Status(status) => assert_eq!(status.alarm_state, AlarmState::CommLoss),
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_joiner_gets_current_state() {
        let harness = start(AlarmMode::ManualAck);
        let (mut early, snapshot) = harness.handle.subscribe().await.unwrap();
        assert_eq!(snapshot.status.alarm_state, AlarmState::Clear);
        assert!(snapshot.events.is_empty());

        line(&harness, DETECTION).await;
        line(&harness, COMM_LOSS).await;
        // detection, status, comm_loss, status
        for _ in 0..4 {
            next(&mut early).await;
        }

        let (mut late, snapshot) = harness.handle.subscribe().await.unwrap();
        assert_eq!(snapshot.status.alarm_state, AlarmState::CommLoss);
        assert_eq!(snapshot.status.alarm_mode, AlarmMode::ManualAck);
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(snapshot.events[0].kind(), "comm_loss");
        assert_eq!(snapshot.units.len(), 2);

        // Only what happens after joining arrives live.
        line(&harness, "[1200] I CMD:CONNECTED nodeA(11) connected:nodeB(12) 1").await;
        assert_eq!(next(&mut late).await.kind(), "connected");
    }

    #[tokio::test]
    async fn test_map_fragments_arrive_as_one_map() {
        let harness = start(AlarmMode::AutoReset);
        let (mut observer, _) = harness.handle.subscribe().await.unwrap();

        line(&harness, "[1] I CMD:MAP_RSP from 11 ver:1.2 gain:10 voltage:3300 scan:1 adv:1: [12 th3:500 -60dBm dt:10]").await;
        line(&harness, "[2] I CMD:MAP_RSP from 12 ver:1.2 gain:11 voltage:3310 scan:1 adv:1: [11 th3:500 -61dBm dt:12]").await;
        line(&harness, "ctrl>").await;
        line(&harness, DETECTION).await;

        match next(&mut observer).await {
            Notification::Map(map) => {
                let ids: Vec<u32> = map.units.iter().map(|u| u.unit_id).collect();
                assert_eq!(ids, vec![11, 12]);
            }
            other => panic!("expected map, got {:?}", other),
        }
        assert_eq!(next(&mut observer).await.kind(), "detection");
    }

    #[tokio::test]
    async fn test_local_commands_do_not_touch_device() {
        let harness = start(AlarmMode::AutoReset);
        let (mut observer, _) = harness.handle.subscribe().await.unwrap();

        harness
            .handle
            .command(ClientCommand::SetAlarmMode {
                mode: AlarmMode::ManualAck,
            })
            .await
            .unwrap();
        match next(&mut observer).await {
            Notification::Status(status) => assert_eq!(status.alarm_mode, AlarmMode::ManualAck),
            other => panic!("expected status, got {:?}", other),
        }

        line(&harness, DETECTION).await;
        next(&mut observer).await;
        next(&mut observer).await;

        harness.handle.command(ClientCommand::Acknowledge).await.unwrap();
        match next(&mut observer).await {
            Notification::Status(status) => assert_eq!(status.alarm_state, AlarmState::Clear),
            other => panic!("expected status, got {:?}", other),
        }
        assert!(harness.writer.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_commands_are_written() {
        let harness = start(AlarmMode::AutoReset);

        harness.handle.command(ClientCommand::RequestMap).await.unwrap();
        harness
            .handle
            .command(ClientCommand::ToggleDetection)
            .await
            .unwrap();

        let written = harness.writer.0.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![
                "/", "cmd", "map", "/", "mpedT", "threshold 0", "/", "cmd", "re 11 12"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_signals() {
        let harness = start(AlarmMode::AutoReset);
        let (mut observer, _) = harness.handle.subscribe().await.unwrap();

        harness
            .reader_tx
            .send(ReaderEvent::LinkError("unplugged".to_string()))
            .await
            .unwrap();
        match next(&mut observer).await {
            Notification::Status(status) => {
                assert!(!status.serial_connected);
                assert_eq!(status.alarm_state, AlarmState::Disconnected);
            }
            other => panic!("expected status, got {:?}", other),
        }

        harness.reader_tx.send(ReaderEvent::LinkRestored).await.unwrap();
        match next(&mut observer).await {
            Notification::Status(status) => assert_eq!(status.alarm_state, AlarmState::Clear),
            other => panic!("expected status, got {:?}", other),
        }

        // The detection report is re-enabled on every reconnect.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            harness.writer.0.lock().unwrap().clone(),
            vec!["/", "cmd", "re 11 12"]
        );
    }
}
