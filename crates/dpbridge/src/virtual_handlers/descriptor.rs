use std::collections::BTreeMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use serde::Deserialize;

/// Capability flags applied to reported values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VirtualState {
    /// Copy the reported value, and optionally its delta, to other codes.
    CopyToMultipleStateName,
    /// Reported values are increments to add to the stored value.
    SummedInReportingPayload,
}

/// Capability flags applied to outgoing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VirtualFunction {
    /// Zero the codes in `vf_reset_state` instead of sending anything.
    ResetState,
    /// Send the value to `vf_forward_to_code` as a regular command.
    ForwardToCode,
}

/// Set of [`VirtualState`] flags, written as a list of names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<VirtualState>")]
pub struct VirtualStates {
    pub copy_to_multiple_state_name: bool,
    pub summed_in_reporting_payload: bool,
}

impl VirtualStates {
    pub fn contains(&self, flag: VirtualState) -> bool {
        match flag {
            VirtualState::CopyToMultipleStateName => self.copy_to_multiple_state_name,
            VirtualState::SummedInReportingPayload => self.summed_in_reporting_payload,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.copy_to_multiple_state_name && !self.summed_in_reporting_payload
    }
}

impl From<Vec<VirtualState>> for VirtualStates {
    fn from(flags: Vec<VirtualState>) -> Self {
        Self {
            copy_to_multiple_state_name: flags.contains(&VirtualState::CopyToMultipleStateName),
            summed_in_reporting_payload: flags.contains(&VirtualState::SummedInReportingPayload),
        }
    }
}

/// Set of [`VirtualFunction`] flags, written as a list of names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<VirtualFunction>")]
pub struct VirtualFunctions {
    pub reset_state: bool,
    pub forward_to_code: bool,
}

impl VirtualFunctions {
    pub fn contains(&self, flag: VirtualFunction) -> bool {
        match flag {
            VirtualFunction::ResetState => self.reset_state,
            VirtualFunction::ForwardToCode => self.forward_to_code,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.reset_state && !self.forward_to_code
    }
}

impl From<Vec<VirtualFunction>> for VirtualFunctions {
    fn from(flags: Vec<VirtualFunction>) -> Self {
        Self {
            reset_state: flags.contains(&VirtualFunction::ResetState),
            forward_to_code: flags.contains(&VirtualFunction::ForwardToCode),
        }
    }
}

/// Description of one host-facing entity of a device category.
///
/// Only `key` is required; every capability defaults to off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EntityDescriptor {
    pub key: String,

    /// Code the entity reads, when it differs from `key`.
    #[serde(default)]
    pub dpcode: Option<String>,

    #[serde(default)]
    pub virtual_state: VirtualStates,

    #[serde(default)]
    pub vs_copy_to_state: Vec<String>,

    #[serde(default)]
    pub vs_copy_delta_to_state: Vec<String>,

    #[serde(default)]
    pub virtual_function: VirtualFunctions,

    #[serde(default)]
    pub vf_reset_state: Vec<String>,

    #[serde(default)]
    pub vf_forward_to_code: Option<String>,

    #[serde(default)]
    pub reset_daily: bool,

    #[serde(default)]
    pub reset_monthly: bool,

    #[serde(default)]
    pub reset_yearly: bool,

    /// Zero means never.
    #[serde(default)]
    pub reset_after_x_seconds: u64,
}

impl EntityDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn dpcode(&self) -> &str {
        self.dpcode.as_deref().unwrap_or(&self.key)
    }
}

/// Descriptors of one platform, keyed by device category.
pub type DescriptorsByCategory = BTreeMap<String, Vec<EntityDescriptor>>;

/// Descriptors registered by every platform, shared by both virtual
/// capability handlers.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    platforms: RwLock<BTreeMap<String, DescriptorsByCategory>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the descriptors of a platform.
    pub fn register(&self, platform: &str, descriptors: DescriptorsByCategory) {
        self.platforms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform.to_string(), descriptors);
    }

    pub fn platforms(&self) -> Vec<String> {
        self.platforms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Descriptors of `category` across all platforms matching `filter`,
    /// one per key, in platform order.
    pub fn category_descriptors(
        &self,
        category: &str,
        filter: impl Fn(&EntityDescriptor) -> bool,
    ) -> Vec<EntityDescriptor> {
        let platforms = self.platforms.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<EntityDescriptor> = Vec::new();
        for descriptors in platforms.values().filter_map(|by_category| by_category.get(category)) {
            for descriptor in descriptors.iter().filter(|d| filter(d)) {
                if !found.iter().any(|existing| existing.key == descriptor.key) {
                    found.push(descriptor.clone());
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_toml() {
        let descriptor: EntityDescriptor = toml::from_str(
            r#"
            key = "add_ele"
            virtual_state = ["copy_to_multiple_state_name"]
            vs_copy_to_state = ["add_ele_raw"]
            vs_copy_delta_to_state = ["add_ele_today"]
            reset_daily = true
            "#,
        )
        .unwrap();

        assert_eq!(descriptor.dpcode(), "add_ele");
        assert!(descriptor.virtual_state.copy_to_multiple_state_name);
        assert!(!descriptor.virtual_state.summed_in_reporting_payload);
        assert!(descriptor.virtual_function.is_empty());
        assert_eq!(descriptor.vs_copy_delta_to_state, vec!["add_ele_today"]);
        assert!(descriptor.reset_daily);
        assert_eq!(descriptor.reset_after_x_seconds, 0);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let result: Result<EntityDescriptor, _> = toml::from_str(
            r#"
            key = "x"
            virtual_state = ["teleport"]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_category_lookup_spans_platforms() {
        let registry = DescriptorRegistry::new();
        let mut summed = EntityDescriptor::new("add_ele");
        summed.virtual_state.summed_in_reporting_payload = true;
        registry.register(
            "sensor",
            DescriptorsByCategory::from([(
                "dlq".to_string(),
                vec![summed.clone(), EntityDescriptor::new("cur_power")],
            )]),
        );
        registry.register(
            "number",
            DescriptorsByCategory::from([("dlq".to_string(), vec![summed])]),
        );

        let found = registry.category_descriptors("dlq", |d| !d.virtual_state.is_empty());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "add_ele");
        assert!(registry.category_descriptors("cz", |_| true).is_empty());
        assert_eq!(registry.platforms(), vec!["number", "sensor"]);
    }
}
