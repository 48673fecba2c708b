use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::DeliveryError;
use crate::hub::ObserverSink;
use crate::messages::{Notification, Snapshot};

/// Prints every notification as one JSON object per line.
pub struct ConsoleSink {
    out: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        ConsoleSink {
            out: Box::new(tokio::io::stdout()),
        }
    }

    async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let written = match self.out.write_all(line.as_bytes()).await {
            Ok(()) => self.out.flush().await,
            Err(err) => Err(err),
        };
        written.map_err(|err| match err.kind() {
            std::io::ErrorKind::BrokenPipe => DeliveryError::Closed,
            _ => DeliveryError::Io(err),
        })
    }
}

impl ObserverSink for ConsoleSink {
    fn name(&self) -> String {
        "console".to_string()
    }

    async fn deliver_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        self.write_json(snapshot).await
    }

    async fn deliver(&mut self, notification: &Notification) -> Result<(), DeliveryError> {
        self.write_json(notification).await
    }
}
