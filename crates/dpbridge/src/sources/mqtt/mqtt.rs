use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;
use super::client::MqttClient;
use super::client::MqttMessage;
use crate::device::Device;
use crate::device::DeviceRecord;
use crate::device::Shared;
use crate::device::SharedDeviceMap;
use crate::error::SourceError;
use crate::source::Command;
use crate::source::SetupContext;
use crate::source::SourceAccount;
use crate::source::SourceMessage;
use crate::source::SourceMessageSender;

pub const TYPE_NAME: &str = "mqtt";

/// Inventory updates received since the last cache refresh. `None` marks a
/// removed device.
type StagedDevices = Shared<BTreeMap<String, Option<DeviceRecord>>>;

#[derive(Serialize)]
struct CommandPayload<'a> {
    commands: &'a [Command],
}

/// Kind of message, from the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Device,
    Event,
}

/// Split `{prefix}/{device_id}/{kind}`.
fn parse_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, TopicKind)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (device_id, kind) = rest.split_once('/')?;
    if device_id.is_empty() {
        return None;
    }
    match kind {
        "device" => Some((device_id, TopicKind::Device)),
        "event" => Some((device_id, TopicKind::Event)),
        _ => None,
    }
}

/// Process incoming MQTT messages in a background task until the
/// client or the manager goes away.
async fn process_messages(
    mut rx: mpsc::UnboundedReceiver<MqttMessage>,
    prefix: String,
    staged: StagedDevices,
    to_manager: SourceMessageSender,
) {
    while let Some(msg) = rx.recv().await {
        debug!("Received message on topic: {}", msg.topic);
        match parse_topic(&msg.topic, &prefix) {
            Some((device_id, TopicKind::Device)) => stage_device(&staged, device_id, &msg),
            Some((device_id, TopicKind::Event)) => {
                let payload: Value = match serde_json::from_slice(&msg.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Invalid event payload for {}: {}", device_id, e);
                        continue;
                    }
                };
                let message = SourceMessage {
                    source: TYPE_NAME.to_string(),
                    payload,
                };
                if to_manager.send(message).await.is_err() {
                    info!("Manager gone, stopping MQTT message processing");
                    break;
                }
            }
            None => debug!("Ignoring message on topic {}", msg.topic),
        }
    }
}

fn stage_device(staged: &StagedDevices, device_id: &str, msg: &MqttMessage) {
    if msg.payload.is_empty() {
        info!("Device {} removed", device_id);
        staged.lock().insert(device_id.to_string(), None);
        return;
    }
    match serde_json::from_slice::<DeviceRecord>(&msg.payload) {
        Ok(mut record) => {
            if record.id != device_id {
                warn!(
                    "Device record id {:?} does not match topic, using {}",
                    record.id, device_id
                );
                record.id = device_id.to_string();
            }
            staged.lock().insert(device_id.to_string(), Some(record));
        }
        Err(e) => warn!("Invalid device record for {}: {}", device_id, e),
    }
}

/// Source account fed by a local MQTT gateway.
///
/// The gateway publishes a retained device record on
/// `{prefix}/{device_id}/device` (an empty payload removes the device) and
/// push messages on `{prefix}/{device_id}/event`. Commands are published to
/// `{prefix}/{device_id}/command`.
pub struct MqttSource<C: MqttClient> {
    client: C,
    config: MqttConfig,
    devices: SharedDeviceMap,
    staged: StagedDevices,

    /// Handle to the background message processing task
    message_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MqttClient> MqttSource<C> {
    pub fn new(client: C, config: &MqttConfig) -> Self {
        Self {
            client,
            config: config.clone(),
            devices: SharedDeviceMap::default(),
            staged: StagedDevices::default(),
            message_task: Mutex::new(None),
        }
    }

    fn topic(&self, device_id: &str, kind: &str) -> String {
        format!("{}/{}/{}", self.config.topic_prefix, device_id, kind)
    }

    fn owns_device(&self, device_id: &str) -> bool {
        self.devices.lock().contains_key(device_id)
    }

    fn stop_message_task(&self) {
        let task = self
            .message_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl<C: MqttClient> SourceAccount for MqttSource<C> {
    fn get_type_name(&self) -> &str {
        TYPE_NAME
    }

    async fn setup_from_entry(&mut self, ctx: &SetupContext<'_>) -> Result<bool, SourceError> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.broker, self.config.port
        );
        let rx = self.client.connect().await?;

        for kind in ["device", "event"] {
            let topic = self.topic("+", kind);
            self.client.subscribe(&topic).await?;
            info!("Subscribed to {}", topic);
        }

        let task = tokio::spawn(process_messages(
            rx,
            self.config.topic_prefix.clone(),
            self.staged.clone(),
            ctx.messages.clone(),
        ));
        *self
            .message_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(true)
    }

    fn get_available_device_maps(&self) -> Vec<SharedDeviceMap> {
        vec![self.devices.clone()]
    }

    /// Swap staged inventory updates into the device map.
    fn update_device_cache(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return;
        }
        let mut devices = self.devices.lock();
        for (device_id, record) in staged {
            match record {
                Some(record) => {
                    devices.insert(device_id, Device::from_record(record));
                }
                None => {
                    devices.remove(&device_id);
                }
            }
        }
        debug!("MQTT inventory holds {} devices", devices.len());
    }

    fn unload(&self) {
        self.stop_message_task();
        self.client.disconnect();
    }

    fn refresh_mq(&self) {
        debug!("MQTT subscriptions are persistent, nothing to refresh");
    }

    fn remove_device_listeners(&self) {}

    fn send_commands(&self, device_id: &str, commands: &[Command]) -> Result<(), SourceError> {
        if !self.owns_device(device_id) {
            return Ok(());
        }
        let payload = serde_json::to_vec(&CommandPayload { commands })?;
        self.client
            .try_publish(&self.topic(device_id, "command"), payload, false)
    }

    fn on_message(&self, message: &Value) -> Result<(), SourceError> {
        debug!("MQTT message applied: {}", message);
        Ok(())
    }

    fn get_domain_identifiers_of_device(&self, device_id: &str) -> Vec<String> {
        if self.owns_device(device_id) {
            vec![format!("{}_{}", TYPE_NAME, device_id)]
        } else {
            Vec::new()
        }
    }
}
