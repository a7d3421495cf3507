//! Link address parsing and filter validation.

use std::collections::HashMap;

use ambridge::amqp::{
    AMQP_ERROR_NO_GROUPID, AMQP_ERROR_NO_PARTITION_FILTER, AMQP_ERROR_WRONG_FILTER,
    AMQP_ERROR_WRONG_OFFSET_FILTER, AMQP_ERROR_WRONG_PARTITION_FILTER, FILTER_OFFSET,
    FILTER_PARTITION,
};
use ambridge::sink::{format_address, parse_address, validate_filters};
use fe2o3_amqp_types::primitives::Value;

// ---- Address parsing ----

#[test]
fn parse_splits_topic_and_group() {
    let (topic, group) = parse_address("orders/group.id/g1").unwrap();
    assert_eq!(topic, "orders");
    assert_eq!(group, "g1");
}

#[test]
fn parse_format_round_trip() {
    for (topic, group) in [("orders", "g1"), ("a/b", "group-2"), ("t.x", "g.y")] {
        let (parsed_topic, parsed_group) = parse_address(&format_address(topic, group)).unwrap();
        assert_eq!(parsed_topic, topic);
        assert_eq!(parsed_group, group);
    }
}

#[test]
fn parse_rejects_missing_group_id() {
    let condition = parse_address("orders").unwrap_err();
    assert_eq!(condition.symbol, AMQP_ERROR_NO_GROUPID);
}

#[test]
fn parse_rejects_empty_topic_or_group() {
    assert_eq!(
        parse_address("/group.id/g1").unwrap_err().symbol,
        AMQP_ERROR_WRONG_FILTER
    );
    assert_eq!(
        parse_address("orders/group.id/").unwrap_err().symbol,
        AMQP_ERROR_WRONG_FILTER
    );
}

// ---- Filter validation ----

fn filters(entries: &[(&str, Value)]) -> HashMap<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn no_filters_is_valid() {
    assert_eq!(validate_filters(&HashMap::new()), None);
}

#[test]
fn partition_and_offset_filters_are_valid() {
    let set = filters(&[
        (FILTER_PARTITION, Value::Int(2)),
        (FILTER_OFFSET, Value::Long(42)),
    ]);
    assert_eq!(validate_filters(&set), None);
}

#[test]
fn partition_must_be_an_int() {
    for wrong in [Value::Long(2), Value::String("2".to_string())] {
        let set = filters(&[(FILTER_PARTITION, wrong)]);
        let condition = validate_filters(&set).unwrap();
        assert_eq!(condition.symbol, AMQP_ERROR_WRONG_PARTITION_FILTER);
    }
}

#[test]
fn offset_must_be_a_long() {
    let set = filters(&[
        (FILTER_PARTITION, Value::Int(0)),
        (FILTER_OFFSET, Value::Int(42)),
    ]);
    let condition = validate_filters(&set).unwrap();
    assert_eq!(condition.symbol, AMQP_ERROR_WRONG_OFFSET_FILTER);
}

#[test]
fn offset_requires_partition() {
    let set = filters(&[(FILTER_OFFSET, Value::Long(42))]);
    let condition = validate_filters(&set).unwrap();
    assert_eq!(condition.symbol, AMQP_ERROR_NO_PARTITION_FILTER);
}

#[test]
fn negative_values_are_rejected() {
    let set = filters(&[(FILTER_PARTITION, Value::Int(-1))]);
    assert_eq!(
        validate_filters(&set).unwrap().symbol,
        AMQP_ERROR_WRONG_FILTER
    );

    let set = filters(&[
        (FILTER_PARTITION, Value::Int(0)),
        (FILTER_OFFSET, Value::Long(-7)),
    ]);
    assert_eq!(
        validate_filters(&set).unwrap().symbol,
        AMQP_ERROR_WRONG_FILTER
    );
}

#[test]
fn type_errors_win_over_range_errors() {
    // A malformed partition is reported before the offset is looked at.
    let set = filters(&[
        (FILTER_PARTITION, Value::String("x".to_string())),
        (FILTER_OFFSET, Value::Long(-1)),
    ]);
    assert_eq!(
        validate_filters(&set).unwrap().symbol,
        AMQP_ERROR_WRONG_PARTITION_FILTER
    );
}
