//! Paced command writes to the device's menu-driven CLI.
//!
//! The device drops input that arrives while it is still redrawing a menu, so every
//! token is followed by a fixed pause. Commands are queued FIFO (bounded) and run one
//! at a time; a submission against a full queue is rejected with `QueueFull` rather
//! than waiting.

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::{DispatchError, LinkError};

/// Write side of the serial channel.
pub trait LineWriter: Send + Sync + 'static {
    fn write_line(&self, line: &str) -> impl Future<Output = Result<(), LinkError>> + Send;
}

const NAV_DELAY: Duration = Duration::from_millis(200);
const APPLY_DELAY: Duration = Duration::from_millis(500);
const INIT_DELAY: Duration = Duration::from_millis(300);

/// Commands that reach the device. Acknowledge and alarm mode never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    SetThreshold(u32),
    SetGain(u32),
    RequestMap,
    /// Re-enables detection output from the `cmd` menu; sent after every reconnect.
    EnableDetectionReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub token: String,
    pub delay_after: Duration,
}

fn step(token: impl Into<String>, delay_after: Duration) -> Step {
    Step {
        token: token.into(),
        delay_after,
    }
}

impl DeviceCommand {
    pub fn script(&self, (a, b): (u32, u32)) -> Vec<Step> {
        let reset_detection = format!("re {} {}", a, b);
        match self {
            DeviceCommand::SetThreshold(value) => vec![
                step("/", NAV_DELAY),
                step("mpedT", NAV_DELAY),
                step(format!("threshold {}", value), APPLY_DELAY),
                step("/", NAV_DELAY),
                step("cmd", NAV_DELAY),
                step(reset_detection, NAV_DELAY),
            ],
            DeviceCommand::SetGain(value) => vec![
                step("/", NAV_DELAY),
                step("mpedT", NAV_DELAY),
                step(format!("gain {}", value), APPLY_DELAY),
                step("/", NAV_DELAY),
                step("cmd", NAV_DELAY),
                step(reset_detection, NAV_DELAY),
            ],
            DeviceCommand::RequestMap => vec![
                step("/", NAV_DELAY),
                step("cmd", NAV_DELAY),
                step("map", NAV_DELAY),
            ],
            DeviceCommand::EnableDetectionReport => vec![
                step("/", INIT_DELAY),
                step("cmd", INIT_DELAY),
                step(reset_detection, INIT_DELAY),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
    pub command_timeout: Duration,
    pub detection_pair: (u32, u32),
}

impl From<&AppConfig> for DispatcherSettings {
    fn from(config: &AppConfig) -> Self {
        let dispatcher = config.dispatcher();
        DispatcherSettings {
            queue_capacity: dispatcher.queue_capacity(),
            command_timeout: dispatcher.command_timeout(),
            detection_pair: config.alarm().detection_pair(),
        }
    }
}

type Reply = oneshot::Sender<Result<(), DispatchError>>;

struct Job {
    command: DeviceCommand,
    reply: Reply,
}

/// Cheap handle for submitting commands to the single dispatch worker.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    pub fn spawn<W: LineWriter>(
        writer: W,
        settings: DispatcherSettings,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let worker = Worker {
            writer,
            settings,
            rx,
            shutdown,
        };
        (Dispatcher { tx }, tokio::spawn(worker.run()))
    }

    /// Queues a command. The receiver resolves once the whole script has run.
    pub fn submit(
        &self,
        command: DeviceCommand,
    ) -> Result<oneshot::Receiver<Result<(), DispatchError>>, DispatchError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .try_send(Job { command, reply })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(job) => {
                    warn!("Rejected {:?}: command queue full", job.command);
                    DispatchError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => DispatchError::Stopped,
            })?;
        Ok(done)
    }

    #[cfg(test)]
    pub async fn execute(&self, command: DeviceCommand) -> Result<(), DispatchError> {
        let done = self.submit(command)?;
        done.await.unwrap_or(Err(DispatchError::Stopped))
    }
}

struct Worker<W> {
    writer: W,
    settings: DispatcherSettings,
    rx: mpsc::Receiver<Job>,
    shutdown: watch::Receiver<bool>,
}

impl<W: LineWriter> Worker<W> {
    async fn run(mut self) {
        loop {
            let job = tokio::select! {
                _ = self.shutdown.changed() => break,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            debug!("Dispatching {:?}", job.command);
            let result = self.run_script(&job.command).await;
            match &result {
                Ok(()) => debug!("{:?} done", job.command),
                Err(err) => warn!("{:?} failed: {}", job.command, err),
            }
            // The submitter may have stopped waiting; that is fine.
            let _ = job.reply.send(result);
        }
        self.rx.close();
        info!("Command dispatcher stopped");
    }

    async fn run_script(&self, command: &DeviceCommand) -> Result<(), DispatchError> {
        for step in command.script(self.settings.detection_pair) {
            let timeout = self.settings.command_timeout;
            match tokio::time::timeout(timeout, self.writer.write_line(&step.token)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    return Err(DispatchError::CommandTimeout {
                        token: step.token,
                        after: timeout,
                    });
                }
            }
            if !step.delay_after.is_zero() {
                tokio::time::sleep(step.delay_after).await;
            }
        }
        Ok(())
    }
}
