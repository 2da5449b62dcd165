use async_trait::async_trait;
use linkme::distributed_slice;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::message::Command;
use crate::config::Config;
use crate::device::SharedDeviceMap;
use crate::error::SourceError;
use crate::virtual_handlers::DescriptorsByCategory;

/// A push message received by a source, tagged with the source's type name.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub source: String,
    pub payload: Value,
}

/// Channel types for messages FROM sources TO the manager.
/// Bounded (capacity 256) to provide backpressure.
pub type SourceMessageSender = mpsc::Sender<SourceMessage>;
pub type SourceMessageReceiver = mpsc::Receiver<SourceMessage>;

/// Result type for source factory functions
pub type SourceFactoryResult = anyhow::Result<Option<Box<dyn SourceAccount>>>;

pub struct FactoryContext<'a> {
    pub config: &'a Config,
}

/// Source plugins register a factory here. A factory returning `Ok(None)`
/// means the plugin is not configured and is skipped.
#[distributed_slice]
pub static SOURCE_REGISTRY: [fn(&FactoryContext) -> SourceFactoryResult];

pub struct SetupContext<'a> {
    pub config: &'a Config,

    /// Where the account pushes messages it receives.
    pub messages: SourceMessageSender,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StreamType {
    Rtsp,
    Hls,
    Flv,
    Rtmp,
}

/// One vendor account or local discovery channel.
#[async_trait]
pub trait SourceAccount: Send + Sync {
    /// Stable name the account is registered and addressed under.
    fn get_type_name(&self) -> &str;

    /// Connect the account. `Ok(false)` means the source is not usable in
    /// this environment and should not be registered.
    async fn setup_from_entry(&mut self, ctx: &SetupContext<'_>) -> Result<bool, SourceError>;

    /// Called once every account has been set up.
    fn on_post_setup(&self) {}

    /// Device maps owned by this account. The manager holds the same
    /// handles and writes merged devices back into them.
    fn get_available_device_maps(&self) -> Vec<SharedDeviceMap>;

    fn update_device_cache(&self);

    fn unload(&self);

    fn refresh_mq(&self);

    fn remove_device_listeners(&self);

    /// Send commands to a device. Accounts that do not own the device
    /// ignore the call.
    fn send_commands(&self, device_id: &str, commands: &[Command]) -> Result<(), SourceError>;

    /// Account-specific handling of a message the manager already applied.
    fn on_message(&self, message: &Value) -> Result<(), SourceError>;

    fn get_domain_identifiers_of_device(&self, _device_id: &str) -> Vec<String> {
        Vec::new()
    }

    fn get_platform_descriptors_to_merge(&self, _platform: &str) -> Option<DescriptorsByCategory> {
        None
    }

    fn query_scenes(&self) -> Vec<Scene> {
        Vec::new()
    }

    fn get_device_stream_allocate(&self, _device_id: &str, _stream_type: StreamType) -> Option<String> {
        None
    }
}
