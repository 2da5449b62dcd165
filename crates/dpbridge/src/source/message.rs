//! Push message envelope shared by every source.
//!
//! Messages are kept as raw JSON: only the fields the manager acts on are
//! interpreted, everything else is forwarded to the owning account untouched.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;

/// Protocol number of a status report.
pub const PROTOCOL_DEVICE_REPORT: i64 = 4;

/// Protocol number of everything else (online/offline, bind, rename, ...).
pub const PROTOCOL_OTHER: i64 = 20;

/// A command addressed to a device data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub code: String,
    pub value: Value,
}

impl Command {
    pub fn new(code: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            code: code.into(),
            value: value.into(),
        }
    }
}

/// One entry of a status report.
///
/// Sources may identify the data point by code, by dpId, or only by a key
/// named after the dpId (`{"5": 10}`); the latter lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, rename = "dpId", skip_serializing_if = "Option::is_none")]
    pub dp_id: Option<u32>,

    #[serde(default)]
    pub value: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusEntry {
    pub fn new(code: impl Into<String>, dp_id: u32, value: impl Into<Value>) -> Self {
        Self {
            code: Some(code.into()),
            dp_id: Some(dp_id),
            value: value.into(),
            extra: Map::new(),
        }
    }

    /// Entry synthesized for a code without a dpId of its own.
    pub fn virtual_entry(code: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            code: Some(code.into()),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Keys of `extra` that name a dpId, with their values.
    pub fn dp_id_keyed_values(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.extra
            .iter()
            .filter_map(|(key, value)| key.parse::<u32>().ok().map(|dp_id| (dp_id, value)))
    }
}

pub fn protocol(message: &Value) -> Option<i64> {
    message.get("protocol").and_then(Value::as_i64)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Device id a message is about.
///
/// `data.devId` wins; `PROTOCOL_OTHER` messages may carry it in
/// `data.bizData.devId` instead.
pub fn device_id_from_message(message: &Value) -> Option<String> {
    let data = message.get("data")?;
    if let Some(id) = non_empty_str(data.get("devId")) {
        return Some(id.to_string());
    }
    if protocol(message) == Some(PROTOCOL_OTHER) {
        let biz_data = data.get("bizData")?;
        return non_empty_str(biz_data.get("devId")).map(str::to_string);
    }
    None
}

/// Copy a `bizData.devId` into `data.devId` so every account sees the
/// device id in the same place.
pub fn normalize_message(mut message: Value) -> Value {
    if protocol(&message) != Some(PROTOCOL_OTHER) {
        return message;
    }
    let Some(data) = message.get_mut("data").and_then(Value::as_object_mut) else {
        return message;
    };
    if non_empty_str(data.get("devId")).is_some() {
        return message;
    }
    let biz_id = data
        .get("bizData")
        .and_then(|biz_data| non_empty_str(biz_data.get("devId")))
        .map(str::to_string);
    if let Some(id) = biz_id {
        data.insert("devId".to_string(), Value::String(id));
    }
    message
}

/// Status entries of a `PROTOCOL_DEVICE_REPORT` message.
///
/// Entries that are not objects are dropped.
pub fn status_list_from_message(message: &Value) -> Option<Vec<StatusEntry>> {
    if protocol(message) != Some(PROTOCOL_DEVICE_REPORT) {
        return None;
    }
    let entries = message.get("data")?.get("status")?.as_array()?;
    let status_list = entries
        .iter()
        .filter_map(|entry| match StatusEntry::deserialize(entry) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Dropping malformed status entry {}: {}", entry, e);
                None
            }
        })
        .collect();
    Some(status_list)
}

/// Replace `data.status` with the given entries.
pub fn replace_status_list(message: &mut Value, status_list: &[StatusEntry]) -> serde_json::Result<()> {
    let encoded = serde_json::to_value(status_list)?;
    if let Some(data) = message.get_mut("data").and_then(Value::as_object_mut) {
        data.insert("status".to_string(), encoded);
    }
    Ok(())
}
