use serde::Deserialize;

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "dpbridge".to_string()
}

fn default_topic_prefix() -> String {
    "dpbridge".to_string()
}

/// Configuration for the MQTT source
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// MQTT broker hostname or IP address
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic prefix devices publish under (default: "dpbridge")
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Optional username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(default)]
    pub password: Option<String>,
}
