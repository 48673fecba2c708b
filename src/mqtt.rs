use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::watch;

use crate::config;
use crate::error::DeliveryError;
use crate::hub::ObserverSink;
use crate::messages::{ClientCommand, CommandResult, Notification, Snapshot};
use crate::monitor::MonitorHandle;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"interlock-monitor".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or("interlock".to_string()),
            },
            eventloop,
        )
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.topic_path, leaf)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(self.topic("command"), QoS::AtLeastOnce)
            .await
    }

    /// Drives the MQTT connection and forwards inbound commands to the monitor.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        monitor: MonitorHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let command_topic = self.topic("command");
        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(p))) => {
                    debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                    if p.topic != command_topic {
                        continue;
                    }
                    let Some(command) = decode_command(&p.payload) else {
                        continue;
                    };

                    // Device commands take seconds; keep polling while they run.
                    let client = self.clone();
                    let monitor = monitor.clone();
                    tokio::spawn(async move {
                        let name = command.name();
                        let result = match monitor.command(command).await {
                            Ok(()) => CommandResult {
                                cmd: name,
                                ok: true,
                                error: None,
                            },
                            Err(err) => CommandResult {
                                cmd: name,
                                ok: false,
                                error: Some(err.to_string()),
                            },
                        };
                        if let Err(err) = client.publish_result(&result).await {
                            error!("Error publishing command result: {:?}", err);
                        }
                    });
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_))) => {
                    debug!("Subscription acknowledged");
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    if let Err(err) = self.subscribe().await {
                        error!("Error subscribing to MQTT topics: {:?}", err);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    // rumqttc reconnects on the next poll
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        if let Err(err) = self.disconnect() {
            warn!("Error disconnecting MQTT client: {:?}", err);
        }
    }

    async fn publish_json<T: serde::Serialize>(
        &self,
        leaf: &str,
        retain: bool,
        value: &T,
    ) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string(value)?;
        self.client
            .publish(self.topic(leaf), QoS::AtMostOnce, retain, payload)
            .await?;
        Ok(())
    }

    pub async fn publish_result(&self, result: &CommandResult) -> Result<(), DeliveryError> {
        self.publish_json("command/result", false, result).await
    }

    /// Queues a disconnect without waiting; with the broker unreachable the request
    /// queue may already be full.
    pub fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client {}", self.publisher_id);
        self.client.try_disconnect()
    }
}

impl ObserverSink for MqttClient {
    fn name(&self) -> String {
        format!("mqtt:{}", self.publisher_id)
    }

    async fn deliver_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        self.publish_json("snapshot", true, snapshot).await?;
        self.publish_json("status", true, &Notification::Status(snapshot.status.clone()))
            .await
    }

    async fn deliver(&mut self, notification: &Notification) -> Result<(), DeliveryError> {
        if let Notification::Status(_) = notification {
            self.publish_json("status", true, notification).await?;
        }
        self.publish_json("events", false, notification).await
    }
}

fn decode_command(payload: &[u8]) -> Option<ClientCommand> {
    match serde_json::from_slice::<ClientCommand>(payload) {
        Ok(command) => Some(command),
        Err(err) => {
            warn!(
                "Ignoring malformed command {:?}: {}",
                String::from_utf8_lossy(payload),
                err
            );
            None
        }
    }
}
