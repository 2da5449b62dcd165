//! Pairwise reconciliation of two records of the same physical device.
//!
//! Every merge step is a union: a key missing on one side is copied from
//! the other, a key present on both sides keeps each side's value. After the
//! field-level merge the second device's cells are re-pointed at the first
//! device's, so both handles observe the same structures from then on.

use std::collections::BTreeMap;

use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use crate::device::ConfigItem;
use crate::device::Device;
use crate::device::LocalStrategy;
use crate::device::LocalStrategyMap;
use crate::device::Shared;
use crate::device::SpecMap;
use crate::device::StatusMap;

#[cfg(test)]
mod tests;

/// Stored for JSON config fields that neither side provides.
const EMPTY_JSON_OBJECT: &str = "{}";

pub struct MergingManager;

impl MergingManager {
    /// Merge `device2` into `device1` and alias `device2`'s cells to
    /// `device1`'s.
    ///
    /// Merging never fails. Cells that are already shared are left alone, so
    /// merging the same pair twice is a no-op.
    pub fn merge(device1: &mut Device, device2: &mut Device) {
        debug!("Merging device {} ({})", device1.id, device1.name);

        with_both(&device1.status, &device2.status, Self::merge_status);
        with_both(&device1.function, &device2.function, Self::merge_function);
        with_both(
            &device1.status_range,
            &device2.status_range,
            Self::merge_status_range,
        );
        with_both(
            &device1.local_strategy,
            &device2.local_strategy,
            Self::merge_local_strategy,
        );
        Self::merge_data_model(device1, device2);

        device2.status_range = device1.status_range.clone();
        device2.function = device1.function.clone();
        device2.status = device1.status.clone();
        device2.local_strategy = device1.local_strategy.clone();
    }

    fn merge_status(status1: &mut StatusMap, status2: &mut StatusMap) {
        union_merge(status1, status2);
    }

    fn merge_status_range(range1: &mut SpecMap, range2: &mut SpecMap) {
        union_merge(range1, range2);
    }

    fn merge_function(function1: &mut SpecMap, function2: &mut SpecMap) {
        for (key, spec1) in function1.iter_mut() {
            match function2.get_mut(key) {
                Some(spec2) => union_merge_json(&mut spec1.values, &mut spec2.values),
                None => {
                    function2.insert(key.clone(), spec1.clone());
                }
            }
        }
        for (key, spec2) in function2.iter() {
            if !function1.contains_key(key) {
                function1.insert(key.clone(), spec2.clone());
            }
        }
    }

    fn merge_local_strategy(strategies1: &mut LocalStrategyMap, strategies2: &mut LocalStrategyMap) {
        for (dp_id, strategy1) in strategies1.iter_mut() {
            match strategies2.get_mut(dp_id) {
                Some(strategy2) => Self::merge_strategy_pair(*dp_id, strategy1, strategy2),
                None => {
                    strategies2.insert(*dp_id, strategy1.clone());
                }
            }
        }
        for (dp_id, strategy2) in strategies2.iter() {
            if !strategies1.contains_key(dp_id) {
                strategies1.insert(*dp_id, strategy2.clone());
            }
        }
    }

    /// Pick the authoritative strategy of a dpId known to both sides and
    /// reconcile the other one with it.
    ///
    /// A strategy that talks to the device directly beats one going through
    /// the open API; with equal transport, a status strategy beats a
    /// property-update strategy. Full ties keep the first device's strategy.
    fn merge_strategy_pair(dp_id: u32, strategy1: &mut LocalStrategy, strategy2: &mut LocalStrategy) {
        let open_api1 = strategy1.use_open_api.unwrap_or(false);
        let open_api2 = strategy2.use_open_api.unwrap_or(false);
        let property1 = strategy1.property_update.unwrap_or(false);
        let property2 = strategy2.property_update.unwrap_or(false);

        let second_is_primary = if open_api1 != open_api2 {
            !open_api2
        } else if property1 != property2 {
            !property2
        } else {
            false
        };

        let (primary, secondary) = if second_is_primary {
            (strategy2, strategy1)
        } else {
            (strategy1, strategy2)
        };
        debug!(
            "dpId {}: primary strategy {:?} over {:?}",
            dp_id, primary.status_code, secondary.status_code
        );

        copy_if_different(&mut primary.value_convert, &mut secondary.value_convert);
        Self::merge_status_code(dp_id, primary, secondary);

        match (&mut primary.config_item, &mut secondary.config_item) {
            (Some(item1), Some(item2)) => Self::merge_config_item(item1, item2),
            (Some(item1), item2 @ None) => *item2 = Some(item1.clone()),
            (item1 @ None, Some(item2)) => *item1 = Some(item2.clone()),
            (None, None) => {}
        }

        let property_update = primary.property_update.unwrap_or(false);
        primary.property_update = Some(property_update);
        secondary.property_update = Some(property_update);

        let use_open_api = primary.use_open_api.unwrap_or(false);
        primary.use_open_api = Some(use_open_api);
        secondary.use_open_api = Some(use_open_api);
    }

    /// Copy the primary's code onto the secondary and remember the code it
    /// replaced. Both sides end with the same alias history, which is never
    /// shortened.
    fn merge_status_code(dp_id: u32, primary: &mut LocalStrategy, secondary: &mut LocalStrategy) {
        let mut history = primary.status_code_alias.clone();
        for alias in &secondary.status_code_alias {
            push_unique(&mut history, alias);
        }

        match (&primary.status_code, &secondary.status_code) {
            (Some(code1), Some(code2)) if code1 != code2 => {
                debug!("dpId {}: code {} superseded by {}", dp_id, code2, code1);
                push_unique(&mut history, code2);
                secondary.status_code = Some(code1.clone());
            }
            (Some(code1), None) => secondary.status_code = Some(code1.clone()),
            (None, Some(code2)) => primary.status_code = Some(code2.clone()),
            _ => {}
        }

        primary.status_code_alias = history.clone();
        secondary.status_code_alias = history;
    }

    fn merge_config_item(primary: &mut ConfigItem, secondary: &mut ConfigItem) {
        merge_json_field(&mut primary.status_format, &mut secondary.status_format);
        merge_json_field(&mut primary.value_desc, &mut secondary.value_desc);
        copy_if_different(&mut primary.value_type, &mut secondary.value_type);

        match (&mut primary.enum_mapping_map, &mut secondary.enum_mapping_map) {
            (Some(map1), Some(map2)) => union_merge_json(map1, map2),
            (Some(map1), map2 @ None) => *map2 = Some(map1.clone()),
            (map1 @ None, Some(map2)) => *map1 = Some(map2.clone()),
            (None, None) => {}
        }

        copy_if_different(&mut primary.pid, &mut secondary.pid);
    }

    fn merge_data_model(device1: &mut Device, device2: &mut Device) {
        if device1.data_model.is_empty() && !device2.data_model.is_empty() {
            device1.data_model = device2.data_model.clone();
        }
        if device2.data_model.is_empty() && !device1.data_model.is_empty() {
            device2.data_model = device1.data_model.clone();
        }
    }
}

/// Run `merge` on the contents of two cells unless they are already one.
fn with_both<T>(cell1: &Shared<T>, cell2: &Shared<T>, merge: impl FnOnce(&mut T, &mut T)) {
    if cell1.ptr_eq(cell2) {
        return;
    }
    let mut inner1 = cell1.lock();
    let mut inner2 = cell2.lock();
    merge(&mut *inner1, &mut *inner2);
}

/// Symmetric union on keys; shared keys keep each side's own value.
pub fn union_merge<K, V>(map1: &mut BTreeMap<K, V>, map2: &mut BTreeMap<K, V>)
where
    K: Ord + Clone,
    V: Clone,
{
    for (key, value) in map1.iter() {
        if !map2.contains_key(key) {
            map2.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in map2.iter() {
        if !map1.contains_key(key) {
            map1.insert(key.clone(), value.clone());
        }
    }
}

/// [`union_merge`] for JSON objects.
pub fn union_merge_json(map1: &mut Map<String, Value>, map2: &mut Map<String, Value>) {
    for (key, value) in map1.iter() {
        if !map2.contains_key(key) {
            map2.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in map2.iter() {
        if !map1.contains_key(key) {
            map1.insert(key.clone(), value.clone());
        }
    }
}

/// Make the secondary equal to the primary. An absent primary value is
/// filled from the secondary rather than erasing it.
fn copy_if_different<T: Clone + PartialEq>(primary: &mut Option<T>, secondary: &mut Option<T>) {
    match primary {
        Some(value) => {
            if secondary.as_ref() != Some(&*value) {
                *secondary = Some(value.clone());
            }
        }
        None => *primary = secondary.clone(),
    }
}

/// Merge a JSON-encoded object field across the decode/merge/encode
/// boundary and store the same encoding on both sides.
fn merge_json_field(primary: &mut Option<String>, secondary: &mut Option<String>) {
    let merged = match (primary.as_deref(), secondary.as_deref()) {
        (None, None) => EMPTY_JSON_OBJECT.to_string(),
        (Some(encoded), None) | (None, Some(encoded)) => encoded.to_string(),
        (Some(encoded1), Some(encoded2)) => merge_encoded_objects(encoded1, encoded2),
    };
    *primary = Some(merged.clone());
    *secondary = Some(merged);
}

/// Shared keys keep the secondary's value. Anything that does not decode to
/// an object on both sides resolves to the primary's encoding.
fn merge_encoded_objects(primary: &str, secondary: &str) -> String {
    let decoded1 = serde_json::from_str::<Value>(primary);
    let decoded2 = serde_json::from_str::<Value>(secondary);
    match (decoded1, decoded2) {
        (Ok(Value::Object(mut object1)), Ok(Value::Object(mut object2))) => {
            union_merge_json(&mut object2, &mut object1);
            Value::Object(object2).to_string()
        }
        _ => {
            debug!(
                "Cannot merge JSON fields {:?} and {:?}, keeping the primary",
                primary, secondary
            );
            primary.to_string()
        }
    }
}

fn push_unique(list: &mut Vec<String>, code: &str) {
    if !list.iter().any(|existing| existing == code) {
        list.push(code.to_string());
    }
}
