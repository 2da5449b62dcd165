mod client;
mod config;
#[allow(clippy::module_inception)]
mod mqtt;

use anyhow::Context;
pub use config::Config as MqttConfig;
use linkme::distributed_slice;
pub use mqtt::MqttSource;

use crate::source;

#[distributed_slice(source::SOURCE_REGISTRY)]
fn init_mqtt(ctx: &source::FactoryContext) -> source::SourceFactoryResult {
    let mqtt_config = if let Some(c) = &ctx.config.sources.mqtt {
        c
    } else {
        return Ok(None);
    };

    let client = client::RumqttcClient::new(mqtt_config).context("Failed to create MQTT client")?;
    Ok(Some(Box::new(MqttSource::new(client, mqtt_config))))
}
