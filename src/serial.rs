//! Serial link ownership and the line reader thread.

use std::io::{ErrorKind, Read as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use serialport::SerialPort;
use tokio::sync::mpsc;

use crate::config::SerialConfig;
use crate::dispatcher::LineWriter;
use crate::error::LinkError;

const MAX_LINE_LEN: usize = 4096;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// What the reader thread reports to the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Line(String),
    LinkError(String),
    LinkRestored,
}

/// The one physical channel shared by the reader and the dispatcher. Each side holds
/// the lock for a single timed read or a single write, never longer.
pub struct SerialLink {
    path: String,
    port: Mutex<Option<Box<dyn SerialPort>>>,
}

impl SerialLink {
    pub fn new(path: impl Into<String>) -> Self {
        SerialLink {
            path: path.into(),
            port: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn open(&self, config: &SerialConfig) -> Result<(), LinkError> {
        debug!("Opening serial port {} at {} baud", self.path, config.baud_rate());
        let port = serialport::new(self.path.as_str(), config.baud_rate())
            .data_bits(config.data_bits())
            .parity(config.parity())
            .stop_bits(config.stop_bits())
            .flow_control(serialport::FlowControl::None)
            .timeout(config.read_timeout())
            .open()
            .map_err(|source| LinkError::Open {
                path: self.path.clone(),
                source,
            })?;

        // Drop whatever the device printed while nobody was listening.
        if let Err(err) = port.clear(serialport::ClearBuffer::Input) {
            debug!("Could not clear input buffer: {}", err);
        }

        *self.lock() = Some(port);
        Ok(())
    }

    pub fn close(&self) {
        if self.lock().take().is_some() {
            debug!("Closed serial port {}", self.path);
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Reads whatever is available. A read timeout is idle time and yields `Ok(0)`.
    pub fn read_chunk(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let mut guard = self.lock();
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(err) => Err(LinkError::Io(err)),
        }
    }

    /// Writes one CR-terminated command token.
    #[cfg(test)]
    pub fn write_token(&self, token: &str) -> Result<(), LinkError> {
        self.write_token_unless(token, &AtomicBool::new(false))
    }

    /// Writes one CR-terminated command token, unless `abandoned` was set while
    /// waiting for the port lock.
    fn write_token_unless(&self, token: &str, abandoned: &AtomicBool) -> Result<(), LinkError> {
        let mut guard = self.lock();
        if abandoned.load(Ordering::Acquire) {
            debug!("Not writing {:?}: the command already timed out", token);
            return Err(LinkError::Abandoned);
        }
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(token.as_bytes())?;
        port.write_all(b"\r")?;
        port.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn install(&self, port: Box<dyn SerialPort>) {
        *self.lock() = Some(port);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn SerialPort>>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a write as abandoned when its future is dropped, e.g. by a timeout.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl LineWriter for Arc<SerialLink> {
    async fn write_line(&self, line: &str) -> Result<(), LinkError> {
        let link = Arc::clone(self);
        let line = line.to_string();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));
        tokio::task::spawn_blocking(move || link.write_token_unless(&line, &abandoned))
            .await
            .map_err(|err| LinkError::Io(std::io::Error::other(err)))?
    }
}

/// Splits a byte stream into lines on a single-byte terminator.
pub struct LineBuffer {
    buffer: Vec<u8>,
    terminator: u8,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new(terminator: u8) -> Self {
        LineBuffer {
            buffer: Vec::with_capacity(256),
            terminator,
            overflowed: false,
        }
    }

    /// Returns the lines completed by `bytes`, without terminators or stray CR/LF.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == self.terminator {
                if self.overflowed {
                    warn!("Discarded serial line longer than {} bytes", MAX_LINE_LEN);
                } else {
                    let text = String::from_utf8_lossy(&self.buffer);
                    lines.push(text.trim_matches(['\r', '\n']).to_string());
                }
                self.buffer.clear();
                self.overflowed = false;
            } else if self.buffer.len() < MAX_LINE_LEN {
                self.buffer.push(b);
            } else {
                self.overflowed = true;
            }
        }
        lines
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflowed = false;
    }
}

/// Capped exponential backoff between reopen attempts (1-based).
pub fn retry_delay(attempt: u32, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let shift = attempt.saturating_sub(1).min(20);
    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1 << shift));
    delay.min(max)
}

/// Owns the read side of the serial link on a dedicated thread, since reads block.
pub struct LineReader {
    link: Arc<SerialLink>,
    config: SerialConfig,
    events: mpsc::Sender<ReaderEvent>,
    shutdown: Arc<AtomicBool>,
}

impl LineReader {
    pub fn new(
        link: Arc<SerialLink>,
        config: SerialConfig,
        events: mpsc::Sender<ReaderEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        LineReader {
            link,
            config,
            events,
            shutdown,
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let terminator = self.config.terminator().unwrap_or(b'\n');
        let max_delay = self.config.retry_max_delay();
        let mut buffer = LineBuffer::new(terminator);
        let mut attempt = 0;
        let mut reported_down = false;

        while !self.stopping() {
            match self.link.open(&self.config) {
                Ok(()) => {
                    info!("Serial link up on {}", self.link.path());
                    attempt = 0;
                    buffer.reset();
                    if !self.report(ReaderEvent::LinkRestored) {
                        break;
                    }

                    match self.read_lines(&mut buffer) {
                        Ok(()) => break,
                        Err(err) => {
                            warn!("Serial link lost: {}", err);
                            self.link.close();
                            reported_down = true;
                            if !self.report(ReaderEvent::LinkError(err.to_string())) {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    if reported_down {
                        debug!("Reopen failed: {}", err);
                    } else {
                        error!("{}", err);
                        reported_down = true;
                        if !self.report(ReaderEvent::LinkError(err.to_string())) {
                            break;
                        }
                    }
                }
            }

            attempt += 1;
            let delay = retry_delay(attempt, max_delay);
            debug!("Retrying serial link in {:?}", delay);
            self.sleep(delay);
        }

        self.link.close();
        info!("Serial reader stopped");
    }

    /// Returns `Ok` only on shutdown; any link failure is returned as an error.
    fn read_lines(&self, buffer: &mut LineBuffer) -> Result<(), LinkError> {
        let mut chunk = [0u8; 512];
        while !self.stopping() {
            let n = self.link.read_chunk(&mut chunk)?;
            for line in buffer.push(&chunk[..n]) {
                trace!("RX {:?}", line);
                if !self.report(ReaderEvent::Line(line)) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// False once the monitor has gone away.
    fn report(&self, event: ReaderEvent) -> bool {
        self.events.blocking_send(event).is_ok()
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn sleep(&self, total: Duration) {
        let step = Duration::from_millis(50);
        let mut slept = Duration::ZERO;
        while slept < total && !self.stopping() {
            thread::sleep(step);
            slept += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Instant;

    use serialport::TTYPort;
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;

    #[test]
    fn test_lines_split_across_reads() {
        let mut buffer = LineBuffer::new(b'\n');
        assert!(buffer.push(b"[1] I CMD:DET").is_empty());
        assert_eq!(buffer.push(b"ECTION\r\n[2] I x\n[3"), vec!["[1] I CMD:DETECTION", "[2] I x"]);
        assert_eq!(buffer.push(b"]\n"), vec!["[3]"]);
    }

    #[test]
    fn test_carriage_return_terminator() {
        let mut buffer = LineBuffer::new(b'\r');
        assert_eq!(buffer.push(b"one\r\ntwo\r"), vec!["one", "two"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut buffer = LineBuffer::new(b'\n');
        let lines = buffer.push(b"ok \xff\xfe\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].contains('\u{fffd}'));
    }

    #[test]
    fn test_overlong_line_is_discarded() {
        let mut buffer = LineBuffer::new(b'\n');
        let long = vec![b'x'; MAX_LINE_LEN + 10];
        assert!(buffer.push(&long).is_empty());
        assert!(buffer.push(b"\n").is_empty());
        assert_eq!(buffer.push(b"next\n"), vec!["next"]);
    }

    #[test]
    fn test_retry_delay_backs_off_to_cap() {
        let max = Duration::from_secs(10);
        assert_eq!(retry_delay(0, max), Duration::ZERO);
        assert_eq!(retry_delay(1, max), Duration::from_millis(500));
        assert_eq!(retry_delay(2, max), Duration::from_millis(1000));
        assert_eq!(retry_delay(4, max), Duration::from_millis(4000));
        assert_eq!(retry_delay(5, max), Duration::from_millis(8000));
        assert_eq!(retry_delay(6, max), max);
        assert_eq!(retry_delay(u32::MAX, max), max);
    }

    #[test]
    fn test_closed_link_reports_not_connected() {
        let link = SerialLink::new("/dev/does-not-exist");
        assert!(!link.is_open());
        let mut buf = [0u8; 8];
        assert!(matches!(link.read_chunk(&mut buf), Err(LinkError::NotConnected)));
        assert!(matches!(link.write_token("map"), Err(LinkError::NotConnected)));
    }

    fn serial_config(device: &str) -> SerialConfig {
        SerialConfig {
            device: device.to_string(),
            baud_rate: None,
            data_bits: None,
            parity: None,
            stop_bits: None,
            read_timeout_ms: Some(50),
            line_terminator: None,
            retry_max_delay_ms: Some(200),
        }
    }

    fn next_event(
        rx: &mut mpsc::Receiver<ReaderEvent>,
        within: Duration,
    ) -> Option<ReaderEvent> {
        let deadline = Instant::now() + within;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) if Instant::now() >= deadline => return None,
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    #[test]
    fn test_open_missing_device_fails() {
        let config = serial_config("/dev/interlock-monitor-missing");
        let link = SerialLink::new(config.device.clone());
        assert!(matches!(link.open(&config), Err(LinkError::Open { .. })));
        assert!(!link.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn test_reader_reports_lines_and_one_error_per_outage() {
        let (mut device, host) = TTYPort::pair().expect("pty pair");
        let path = host.name().expect("pty path");

        let link = Arc::new(SerialLink::new(path.clone()));
        let (tx, mut rx) = mpsc::channel(16);
        let stop = Arc::new(AtomicBool::new(false));
        let reader = LineReader::new(link.clone(), serial_config(&path), tx, stop.clone())
            .spawn()
            .unwrap();

        let wait = Duration::from_secs(2);
        assert_eq!(next_event(&mut rx, wait), Some(ReaderEvent::LinkRestored));

        device.write_all(b"[1] I first\r\n[2] I sec").unwrap();
        device.write_all(b"ond\r\n").unwrap();
        device.flush().unwrap();
        assert_eq!(
            next_event(&mut rx, wait),
            Some(ReaderEvent::Line("[1] I first".to_string()))
        );
        assert_eq!(
            next_event(&mut rx, wait),
            Some(ReaderEvent::Line("[2] I second".to_string()))
        );

        drop(device);
        drop(host);
        assert!(matches!(next_event(&mut rx, wait), Some(ReaderEvent::LinkError(_))));

        // Reopening keeps failing; the outage is not reported again.
        let deadline = Instant::now() + Duration::from_millis(1500);
        while Instant::now() < deadline {
            if let Some(event) = next_event(&mut rx, Duration::from_millis(100)) {
                assert!(
                    !matches!(event, ReaderEvent::LinkError(_)),
                    "outage reported twice: {:?}",
                    event
                );
            }
        }

        stop.store(true, Ordering::Release);
        reader.join().unwrap();
        assert!(!link.is_open());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_write_never_reaches_device() {
        let (mut device, host) = TTYPort::pair().expect("pty pair");
        device.set_timeout(Duration::from_millis(200)).unwrap();
        let link = Arc::new(SerialLink::new("pty"));
        link.install(Box::new(host));

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = {
            let link = Arc::clone(&link);
            thread::spawn(move || {
                let _guard = link.lock();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(400));
            })
        };
        held_rx.recv().unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), link.write_line("/")).await;
        assert!(result.is_err());

        tokio::task::spawn_blocking(move || holder.join().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        link.write_line("map").await.unwrap();
        let written = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 64];
            let n = device.read(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        })
        .await
        .unwrap();
        assert!(written.starts_with("map"), "device saw {:?}", written);
        assert!(!written.contains('/'));
    }
}
