use std::sync::Arc;

use serde_json::Number;
use serde_json::Value;
use tracing::debug;

use super::descriptor::DescriptorRegistry;
use super::descriptor::EntityDescriptor;
use super::descriptor::VirtualState;
use crate::device::Device;
use crate::source::StatusEntry;

/// Expands reported status lists with derived, virtual values.
pub struct VirtualStateHandler {
    registry: Arc<DescriptorRegistry>,
}

impl VirtualStateHandler {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self { registry }
    }

    pub fn get_category_virtual_states(&self, category: &str) -> Vec<EntityDescriptor> {
        self.registry
            .category_descriptors(category, |descriptor| !descriptor.virtual_state.is_empty())
    }

    /// Apply every virtual state of the device's category to a status list
    /// that has not been written to the device yet.
    ///
    /// Copies and deltas are appended as new entries. Summed codes have the
    /// stored value added to the reported increment. Everything is computed
    /// against the device's status before this report.
    pub fn apply_virtual_states_to_status_list(
        &self,
        device: &Device,
        mut status_list: Vec<StatusEntry>,
    ) -> Vec<StatusEntry> {
        let descriptors = self.get_category_virtual_states(&device.category);
        if descriptors.is_empty() {
            return status_list;
        }
        let previous = device.status.snapshot();

        for descriptor in descriptors
            .iter()
            .filter(|d| d.virtual_state.contains(VirtualState::CopyToMultipleStateName))
        {
            let reported: Vec<Value> = entries_for(&status_list, &descriptor.key)
                .map(|entry| entry.value.clone())
                .collect();
            for value in reported {
                for target in &descriptor.vs_copy_to_state {
                    status_list.push(StatusEntry::virtual_entry(target, value.clone()));
                }
                if descriptor.vs_copy_delta_to_state.is_empty() {
                    continue;
                }
                let Some(delta) = delta_since(&value, previous.get(&descriptor.key)) else {
                    debug!("{}: cannot compute delta of {}", descriptor.key, value);
                    continue;
                };
                for target in &descriptor.vs_copy_delta_to_state {
                    status_list.push(StatusEntry::virtual_entry(target, delta.clone()));
                }
            }
        }

        for descriptor in descriptors
            .iter()
            .filter(|d| d.virtual_state.contains(VirtualState::SummedInReportingPayload))
        {
            let mut total = previous
                .get(&descriptor.key)
                .filter(|value| value.is_number())
                .cloned()
                .unwrap_or(Value::from(0));
            for entry in status_list
                .iter_mut()
                .filter(|entry| entry.code.as_deref() == Some(descriptor.key.as_str()))
            {
                match add_numbers(&total, &entry.value) {
                    Some(sum) => {
                        total = sum.clone();
                        entry.value = sum;
                    }
                    None => debug!("{}: cannot sum {}", descriptor.key, entry.value),
                }
            }
        }

        status_list
    }
}

fn entries_for<'a>(status_list: &'a [StatusEntry], code: &'a str) -> impl Iterator<Item = &'a StatusEntry> {
    status_list
        .iter()
        .filter(move |entry| entry.code.as_deref() == Some(code))
}

/// Increase of `value` over `previous`, zero without a usable previous value.
/// A decrease (counter reset) also counts as zero.
fn delta_since(value: &Value, previous: Option<&Value>) -> Option<Value> {
    let current = value.as_number()?;
    let Some(previous) = previous.and_then(Value::as_number) else {
        return Some(zero_like(current));
    };
    if let (Some(current), Some(previous)) = (current.as_i64(), previous.as_i64()) {
        return Some(Value::from(current.saturating_sub(previous).max(0)));
    }
    let delta = (current.as_f64()? - previous.as_f64()?).max(0.0);
    Number::from_f64(delta).map(Value::Number)
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    let (a, b) = (a.as_number()?, b.as_number()?);
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a.checked_add(b).map(Value::from);
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?).map(Value::Number)
}

fn zero_like(number: &Number) -> Value {
    if number.is_f64() {
        Value::from(0.0)
    } else {
        Value::from(0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::virtual_handlers::DescriptorsByCategory;

    fn handler(descriptors: Vec<EntityDescriptor>) -> VirtualStateHandler {
        let registry = Arc::new(DescriptorRegistry::new());
        registry.register(
            "sensor",
            DescriptorsByCategory::from([("dlq".to_string(), descriptors)]),
        );
        VirtualStateHandler::new(registry)
    }

    fn copy_descriptor() -> EntityDescriptor {
        let mut descriptor = EntityDescriptor::new("add_ele");
        descriptor.virtual_state.copy_to_multiple_state_name = true;
        descriptor.vs_copy_to_state = vec!["add_ele_raw".to_string()];
        descriptor.vs_copy_delta_to_state = vec!["add_ele_today".to_string()];
        descriptor
    }

    fn meter(status: Value) -> Device {
        let device = Device::new("m1", "Meter", "dlq");
        if let Value::Object(status) = status {
            device.status.lock().extend(status);
        }
        device
    }

    fn values(status_list: &[StatusEntry]) -> Vec<(String, Value)> {
        status_list
            .iter()
            .map(|entry| (entry.code.clone().unwrap_or_default(), entry.value.clone()))
            .collect()
    }

    #[test]
    fn test_other_categories_pass_through() {
        let handler = handler(vec![copy_descriptor()]);
        let device = Device::new("p1", "Plug", "cz");
        let status_list = vec![StatusEntry::new("add_ele", 17, 5)];

        let result = handler.apply_virtual_states_to_status_list(&device, status_list.clone());

        assert_eq!(result, status_list);
    }

    #[test]
    fn test_copy_and_delta() {
        let handler = handler(vec![copy_descriptor()]);
        let device = meter(json!({"add_ele": 100}));

        let result = handler.apply_virtual_states_to_status_list(
            &device,
            vec![StatusEntry::new("add_ele", 17, 130)],
        );

        assert_eq!(
            values(&result),
            vec![
                ("add_ele".to_string(), json!(130)),
                ("add_ele_raw".to_string(), json!(130)),
                ("add_ele_today".to_string(), json!(30)),
            ]
        );
        assert_eq!(result[1].dp_id, None);
    }

    #[test]
    fn test_delta_without_previous_value_is_zero() {
        let handler = handler(vec![copy_descriptor()]);
        let device = meter(json!({}));

        let result = handler.apply_virtual_states_to_status_list(
            &device,
            vec![StatusEntry::new("add_ele", 17, 2.5)],
        );

        assert_eq!(result[2].value, json!(0.0));
    }

    #[test]
    fn test_counter_reset_delta_is_zero() {
        let handler = handler(vec![copy_descriptor()]);
        let device = meter(json!({"add_ele": 500}));

        let result = handler.apply_virtual_states_to_status_list(
            &device,
            vec![StatusEntry::new("add_ele", 17, 3)],
        );

        assert_eq!(result[2].value, json!(0));
    }

    #[test]
    fn test_summed_codes_accumulate() {
        let mut descriptor = EntityDescriptor::new("add_ele");
        descriptor.virtual_state.summed_in_reporting_payload = true;
        let handler = handler(vec![descriptor]);
        let device = meter(json!({"add_ele": 100}));

        let result = handler.apply_virtual_states_to_status_list(
            &device,
            vec![
                StatusEntry::new("add_ele", 17, 5),
                StatusEntry::new("switch", 1, true),
                StatusEntry::new("add_ele", 17, 7),
            ],
        );

        assert_eq!(result[0].value, json!(105));
        assert_eq!(result[1].value, json!(true));
        assert_eq!(result[2].value, json!(112));
    }

    #[test]
    fn test_copy_then_sum_targets() {
        let mut copy = EntityDescriptor::new("add_ele");
        copy.virtual_state.copy_to_multiple_state_name = true;
        copy.vs_copy_to_state = vec!["add_ele_total".to_string()];
        let mut total = EntityDescriptor::new("add_ele_total");
        total.virtual_state.summed_in_reporting_payload = true;
        let handler = handler(vec![copy, total]);
        let device = meter(json!({"add_ele_total": 1.5}));

        let result = handler.apply_virtual_states_to_status_list(
            &device,
            vec![StatusEntry::new("add_ele", 17, 0.25)],
        );

        assert_eq!(
            values(&result),
            vec![
                ("add_ele".to_string(), json!(0.25)),
                ("add_ele_total".to_string(), json!(1.75)),
            ]
        );
    }
}
