use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use super::MqttConfig;
use crate::error::SourceError;

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker and return the stream of messages
    /// received on subscribed topics
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<MqttMessage>, SourceError>;

    /// Subscribe to an MQTT topic
    async fn subscribe(&self, topic: &str) -> Result<(), SourceError>;

    /// Queue a message for publishing without waiting for the broker
    fn try_publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SourceError>;

    /// Stop the connection; further publishes fail
    fn disconnect(&self);
}

/// Mock MQTT client for testing
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub incoming: Option<mpsc::UnboundedReceiver<MqttMessage>>,
    pub subscriptions: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>, bool)>>,
    pub is_connected: bool,
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a mock client and the sender feeding its message stream
    pub fn new() -> (Self, mpsc::UnboundedSender<MqttMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            incoming: Some(rx),
            ..Self::default()
        };
        (client, tx)
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.published.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<MqttMessage>, SourceError> {
        self.is_connected = true;
        self.incoming.take().ok_or(SourceError::NotConnected)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SourceError> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SourceError> {
        if !self.is_connected {
            return Err(SourceError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, retain));
        Ok(())
    }

    fn disconnect(&self) {}
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Background event loop task handle
    event_loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration
    pub fn new(config: &MqttConfig) -> anyhow::Result<Self> {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(30));

        // Device inventories carry full local strategies (2 MiB)
        mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Ok(Self {
            mqtt_options,
            client: None,
            event_loop_task: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<&AsyncClient, SourceError> {
        self.client.as_ref().ok_or(SourceError::NotConnected)
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<MqttMessage>, SourceError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };

                        // Receiver dropped: the source was unloaded
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        *self
            .event_loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(message_rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SourceError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SourceError> {
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| SourceError::Transport(e.to_string()))
    }

    fn disconnect(&self) {
        let task = self
            .event_loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
