use serde_json::Map;
use serde_json::json;

use super::*;
use crate::device::DeviceRecord;
use crate::device::DpSpec;

fn device(id: &str, status: Value) -> Device {
    let record: DeviceRecord = serde_json::from_value(json!({
        "id": id,
        "name": format!("Device {}", id),
        "category": "cz",
        "status": status,
    }))
    .unwrap();
    Device::from_record(record)
}

fn strategy(code: &str, use_open_api: Option<bool>, property_update: Option<bool>) -> LocalStrategy {
    LocalStrategy {
        status_code: Some(code.to_string()),
        use_open_api,
        property_update,
        ..LocalStrategy::default()
    }
}

fn spec(code: &str, values: Value) -> DpSpec {
    let values: Map<String, Value> = serde_json::from_value(values).unwrap();
    DpSpec {
        code: code.to_string(),
        dp_type: "Integer".to_string(),
        values,
    }
}

#[test]
fn test_merge_with_own_copy_is_unchanged() {
    let mut device1 = device("d", json!({"switch": true, "power": 12}));
    device1
        .status_range
        .lock()
        .insert("power".to_string(), spec("power", json!({"min": 0})));
    let before = device1.to_record();
    let mut device2 = Device::from_record(before.clone());

    MergingManager::merge(&mut device1, &mut device2);

    assert_eq!(device1.status.snapshot(), before.status);
    assert_eq!(device1.status_range.snapshot(), before.status_range);
}

#[test]
fn test_disjoint_keys_merge_independent_of_order() {
    let mut a1 = device("d", json!({"a": 1}));
    let mut b1 = device("d", json!({"b": 2}));
    MergingManager::merge(&mut a1, &mut b1);

    let mut b2 = device("d", json!({"b": 2}));
    let mut a2 = device("d", json!({"a": 1}));
    MergingManager::merge(&mut b2, &mut a2);

    assert_eq!(a1.status.snapshot(), b2.status.snapshot());
    assert_eq!(a1.status.snapshot().len(), 2);
}

#[test]
fn test_overlapping_keys_keep_first_device_value() {
    let mut device1 = device("d", json!({"temp": 21}));
    let mut device2 = device("d", json!({"temp": 25, "humidity": 40}));

    MergingManager::merge(&mut device1, &mut device2);

    assert_eq!(device1.status_value("temp"), Some(json!(21)));
    assert_eq!(device2.status_value("temp"), Some(json!(21)));
    assert_eq!(device1.status_value("humidity"), Some(json!(40)));
}

#[test]
fn test_cells_are_shared_after_merge() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));

    MergingManager::merge(&mut device1, &mut device2);
    device1
        .status
        .lock()
        .insert("switch_1".to_string(), json!(false));

    assert_eq!(device2.status_value("switch_1"), Some(json!(false)));
    assert!(device1.shares_state_with(&device2));
}

#[test]
fn test_merging_already_shared_devices_is_noop() {
    let mut device1 = device("d", json!({"a": 1}));
    let mut device2 = device("d", json!({"b": 2}));
    MergingManager::merge(&mut device1, &mut device2);

    // Would deadlock if shared cells were locked twice.
    MergingManager::merge(&mut device1, &mut device2);
    MergingManager::merge(&mut device2, &mut device1);

    assert_eq!(device1.status.snapshot().len(), 2);
    assert!(device1.shares_state_with(&device2));
}

#[test]
fn test_function_values_are_merged_per_key() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    device1.function.lock().extend([
        ("bright".to_string(), spec("bright", json!({"min": 10, "scale": 0}))),
        ("mode".to_string(), spec("mode", json!({"range": ["white"]}))),
    ]);
    device2.function.lock().extend([
        ("bright".to_string(), spec("bright", json!({"min": 25, "max": 1000}))),
        ("temp".to_string(), spec("temp", json!({}))),
    ]);

    MergingManager::merge(&mut device1, &mut device2);

    let functions = device2.function.snapshot();
    assert_eq!(functions.len(), 3);
    let bright = &functions["bright"].values;
    assert_eq!(bright["min"], json!(10));
    assert_eq!(bright["max"], json!(1000));
    assert_eq!(bright["scale"], json!(0));
}

#[test]
fn test_direct_strategy_wins_over_open_api() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    device1
        .local_strategy
        .lock()
        .insert(5, strategy("temp", Some(true), None));
    device2
        .local_strategy
        .lock()
        .insert(5, strategy("va_temperature", Some(false), None));

    MergingManager::merge(&mut device1, &mut device2);

    let merged = device1.local_strategy.snapshot();
    assert_eq!(merged[&5].status_code.as_deref(), Some("va_temperature"));
    assert_eq!(merged[&5].status_code_alias, vec!["temp".to_string()]);
    assert_eq!(merged[&5].use_open_api, Some(false));
    assert_eq!(device1.dp_id_for_code("temp"), Some(5));
}

#[test]
fn test_status_strategy_wins_over_property_update() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    device1
        .local_strategy
        .lock()
        .insert(3, strategy("mode_prop", None, Some(true)));
    device2
        .local_strategy
        .lock()
        .insert(3, strategy("mode", None, Some(false)));

    MergingManager::merge(&mut device1, &mut device2);

    let merged = &device2.local_strategy.snapshot()[&3];
    assert_eq!(merged.status_code.as_deref(), Some("mode"));
    assert_eq!(merged.status_code_alias, vec!["mode_prop".to_string()]);
    assert_eq!(merged.property_update, Some(false));
}

#[test]
fn test_full_tie_keeps_first_device_strategy() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    device1.local_strategy.lock().insert(1, strategy("a", None, None));
    device2.local_strategy.lock().insert(1, strategy("b", None, None));

    MergingManager::merge(&mut device1, &mut device2);

    let merged = &device1.local_strategy.snapshot()[&1];
    assert_eq!(merged.status_code.as_deref(), Some("a"));
    assert_eq!(merged.status_code_alias, vec!["b".to_string()]);
    assert_eq!(merged.property_update, Some(false));
    assert_eq!(merged.use_open_api, Some(false));
}

#[test]
fn test_alias_history_survives_repeated_merges() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    let mut device3 = device("d", json!({}));
    device1
        .local_strategy
        .lock()
        .insert(7, strategy("a", Some(true), None));
    device2
        .local_strategy
        .lock()
        .insert(7, strategy("b", Some(false), Some(true)));
    device3
        .local_strategy
        .lock()
        .insert(7, strategy("c", Some(false), Some(false)));

    MergingManager::merge(&mut device1, &mut device2);
    MergingManager::merge(&mut device1, &mut device3);

    let merged = &device3.local_strategy.snapshot()[&7];
    assert_eq!(merged.status_code.as_deref(), Some("c"));
    for code in ["a", "b"] {
        assert!(merged.is_alias(code), "missing alias {}", code);
    }
    for code in ["a", "b", "c"] {
        assert_eq!(device1.dp_id_for_code(code), Some(7));
    }
}

#[test]
fn test_one_sided_strategies_are_copied() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    device1.local_strategy.lock().insert(1, strategy("a", None, None));
    device2.local_strategy.lock().insert(2, strategy("b", Some(true), None));

    MergingManager::merge(&mut device1, &mut device2);

    let merged = device2.local_strategy.snapshot();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[&1].use_open_api, None);
    assert_eq!(merged[&2].use_open_api, Some(true));
}

#[test]
fn test_config_item_merge() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));

    let mut primary = strategy("va_temperature", Some(false), None);
    primary.config_item = Some(ConfigItem {
        status_format: Some(r#"{"va_temperature":"$"}"#.to_string()),
        value_type: Some("Integer".to_string()),
        ..ConfigItem::default()
    });
    let mut secondary = strategy("temp_current", Some(true), None);
    secondary.config_item = Some(ConfigItem {
        status_format: Some(r#"{"temp_current":"$"}"#.to_string()),
        pid: Some("p1".to_string()),
        ..ConfigItem::default()
    });
    device1.local_strategy.lock().insert(1, secondary);
    device2.local_strategy.lock().insert(1, primary);

    MergingManager::merge(&mut device1, &mut device2);

    let merged = &device1.local_strategy.snapshot()[&1];
    let rendered = serde_json::to_string_pretty(merged).unwrap();
    insta::assert_snapshot!(rendered, @r#"
    {
      "status_code": "va_temperature",
      "status_code_alias": [
        "temp_current"
      ],
      "config_item": {
        "statusFormat": "{\"temp_current\":\"$\",\"va_temperature\":\"$\"}",
        "valueDesc": "{}",
        "valueType": "Integer",
        "pid": "p1"
      },
      "property_update": false,
      "use_open_api": false
    }
    "#);
}

#[test]
fn test_json_fields_keep_secondary_value_on_shared_keys() {
    let mut primary = ConfigItem {
        value_desc: Some(r#"{"max":100,"unit":"C"}"#.to_string()),
        enum_mapping_map: Some(serde_json::from_value(json!({"0": "off"})).unwrap()),
        ..ConfigItem::default()
    };
    let mut secondary = ConfigItem {
        value_desc: Some(r#"{"max":50,"min":0}"#.to_string()),
        enum_mapping_map: Some(serde_json::from_value(json!({"1": "on"})).unwrap()),
        ..ConfigItem::default()
    };

    MergingManager::merge_config_item(&mut primary, &mut secondary);

    assert_eq!(primary.value_desc, secondary.value_desc);
    let decoded: Value = serde_json::from_str(primary.value_desc.as_deref().unwrap()).unwrap();
    assert_eq!(decoded, json!({"max": 50, "min": 0, "unit": "C"}));
    assert_eq!(primary.enum_mapping_map, secondary.enum_mapping_map);
    assert_eq!(primary.enum_mapping_map.as_ref().unwrap().len(), 2);
    assert_eq!(primary.status_format.as_deref(), Some(EMPTY_JSON_OBJECT));
}

#[test]
fn test_undecodable_json_field_keeps_primary() {
    let mut primary = Some(r#"{"a":1}"#.to_string());
    let mut secondary = Some("not json".to_string());

    merge_json_field(&mut primary, &mut secondary);

    assert_eq!(primary.as_deref(), Some(r#"{"a":1}"#));
    assert_eq!(secondary, primary);
}

#[test]
fn test_missing_config_item_is_copied_whole() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    let mut with_item = strategy("a", None, None);
    with_item.config_item = Some(ConfigItem {
        value_type: Some("Boolean".to_string()),
        ..ConfigItem::default()
    });
    device1.local_strategy.lock().insert(1, strategy("a", None, None));
    device2.local_strategy.lock().insert(1, with_item);

    MergingManager::merge(&mut device1, &mut device2);

    let merged = &device1.local_strategy.snapshot()[&1];
    let item = merged.config_item.as_ref().unwrap();
    assert_eq!(item.value_type.as_deref(), Some("Boolean"));
    assert_eq!(item.status_format, None);
}

#[test]
fn test_data_model_gap_is_filled() {
    let mut device1 = device("d", json!({}));
    let mut device2 = device("d", json!({}));
    device2.data_model = r#"{"services":[]}"#.to_string();

    MergingManager::merge(&mut device1, &mut device2);

    assert_eq!(device1.data_model, device2.data_model);
}
