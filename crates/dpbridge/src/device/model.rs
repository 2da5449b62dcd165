use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::Shared;

/// Last known value of every data point, keyed by code.
pub type StatusMap = BTreeMap<String, Value>;

/// Value domains keyed by code. Used for both `status_range` and `function`.
pub type SpecMap = BTreeMap<String, DpSpec>;

/// Local control metadata keyed by the source-local dpId.
pub type LocalStrategyMap = BTreeMap<u32, LocalStrategy>;

/// Accept `values` either as an object or as a JSON-encoded object string.
///
/// The vendor cloud API ships `values` as a string, local discovery as an
/// object. A missing or null field is an empty map.
fn deserialize_values<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::String(s) if s.trim().is_empty() => Ok(Map::new()),
        Value::String(s) => serde_json::from_str(&s).map_err(de::Error::custom),
        other => Err(de::Error::custom(format!(
            "expected object or JSON string for values, got {}",
            other
        ))),
    }
}

/// Value domain of one data point, either for reporting or for writing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DpSpec {
    #[serde(default)]
    pub code: String,

    /// Vendor data type (`Boolean`, `Integer`, `Enum`, `Json`, ...)
    #[serde(default, rename = "type")]
    pub dp_type: String,

    #[serde(default, deserialize_with = "deserialize_values")]
    pub values: Map<String, Value>,
}

/// Nested configuration of a local strategy.
///
/// `statusFormat` and `valueDesc` are JSON objects encoded as strings by the
/// vendor and are kept encoded here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_desc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_mapping_map: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

/// How a single dpId is interpreted and controlled locally.
///
/// Optional fields model the vendor payload, where any of them may be
/// missing; merging relies on telling "absent" apart from "false".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,

    /// Every code this dpId was known under before a merge replaced it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_code_alias: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_convert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_item: Option<ConfigItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_update: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_open_api: Option<bool>,
}

impl LocalStrategy {
    pub fn with_code(code: impl Into<String>) -> Self {
        Self {
            status_code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn is_alias(&self, code: &str) -> bool {
        self.status_code_alias.iter().any(|alias| alias == code)
    }
}

/// Plain, serializable form of a device as delivered by a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub data_model: String,

    #[serde(default)]
    pub status: StatusMap,

    #[serde(default)]
    pub status_range: SpecMap,

    #[serde(default)]
    pub function: SpecMap,

    #[serde(default)]
    pub local_strategy: LocalStrategyMap,
}

/// One physical device as known to one source account.
///
/// Cloning a `Device` clones the handles, not the data: the clone observes
/// and performs the same mutations as the original.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub category: String,
    pub data_model: String,
    pub status: Shared<StatusMap>,
    pub status_range: Shared<SpecMap>,
    pub function: Shared<SpecMap>,
    pub local_strategy: Shared<LocalStrategyMap>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            data_model: String::new(),
            status: Shared::default(),
            status_range: Shared::default(),
            function: Shared::default(),
            local_strategy: Shared::default(),
        }
    }

    /// Build a device with private (unshared) cells from a plain record.
    pub fn from_record(record: DeviceRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            category: record.category,
            data_model: record.data_model,
            status: Shared::new(record.status),
            status_range: Shared::new(record.status_range),
            function: Shared::new(record.function),
            local_strategy: Shared::new(record.local_strategy),
        }
    }

    /// Snapshot the device into a plain record.
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            category: self.category.clone(),
            data_model: self.data_model.clone(),
            status: self.status.snapshot(),
            status_range: self.status_range.snapshot(),
            function: self.function.snapshot(),
            local_strategy: self.local_strategy.snapshot(),
        }
    }

    /// Whether all four mergeable cells are shared with `other`.
    pub fn shares_state_with(&self, other: &Device) -> bool {
        self.status.ptr_eq(&other.status)
            && self.status_range.ptr_eq(&other.status_range)
            && self.function.ptr_eq(&other.function)
            && self.local_strategy.ptr_eq(&other.local_strategy)
    }

    /// Resolve the dpId reporting `code`.
    ///
    /// The current `status_code` takes precedence over historical aliases.
    pub fn dp_id_for_code(&self, code: &str) -> Option<u32> {
        let strategies = self.local_strategy.lock();
        strategies
            .iter()
            .find(|(_, strategy)| strategy.status_code.as_deref() == Some(code))
            .or_else(|| strategies.iter().find(|(_, strategy)| strategy.is_alias(code)))
            .map(|(dp_id, _)| *dp_id)
    }

    pub fn code_for_dp_id(&self, dp_id: u32) -> Option<String> {
        self.local_strategy
            .lock()
            .get(&dp_id)
            .and_then(|strategy| strategy.status_code.clone())
    }

    pub fn status_value(&self, code: &str) -> Option<Value> {
        self.status.lock().get(code).cloned()
    }
}

impl From<DeviceRecord> for Device {
    fn from(record: DeviceRecord) -> Self {
        Self::from_record(record)
    }
}
