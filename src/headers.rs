// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Headers
//!
//! Envelopes carry their headers as a JSON-valued map so they survive the generic
//! serialization untouched. This module converts between that map and the AMQP
//! field tables lapin puts on the wire.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongInt, LongLongInt, LongString, ShortString};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Wire discriminator header
pub const HEADER_MESSAGE_TYPE: &str = "X-Message-Type";
/// Event type name header, events only
pub const HEADER_EVENT_NAME: &str = "X-Event-Name";
/// Payload encoding header
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

/// Header map attached to an envelope.
pub type Headers = BTreeMap<String, Value>;

/// Merges header layers, later layers win on key collision.
pub fn merge<'h>(layers: impl IntoIterator<Item = &'h Headers>) -> Headers {
    let mut merged = Headers::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Reads a header as a string slice.
pub fn get_str<'h>(headers: &'h Headers, key: &str) -> Option<&'h str> {
    headers.get(key).and_then(Value::as_str)
}

/// Converts a header map into an AMQP field table.
pub fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

/// Converts an AMQP field table into a header map.
pub fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), from_amqp_value(value)))
        .collect()
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => match i32::try_from(i) {
                Ok(small) => AMQPValue::LongInt(LongInt::from(small)),
                Err(_) => AMQPValue::LongLongInt(LongLongInt::from(i)),
            },
            // timestamp is the only unsigned 64 bit field type
            None => match n.as_u64() {
                Some(u) => AMQPValue::Timestamp(u),
                None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            },
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), to_amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => Value::String(text.to_owned()),
            Err(_) => bytes(s.as_bytes()),
        },
        AMQPValue::ByteArray(b) => bytes(b.as_slice()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_owned(), from_amqp_value(value)))
                .collect::<Map<String, Value>>(),
        ),
        _ => Value::Null,
    }
}

/// Binary header values are kept byte for byte as an array of numbers.
fn bytes(raw: &[u8]) -> Value {
    Value::Array(raw.iter().map(|b| Value::from(*b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_layers_win() {
        let base = Headers::from([("a".to_owned(), json!(1)), ("b".to_owned(), json!(1))]);
        let over = Headers::from([("b".to_owned(), json!(2))]);

        let merged = merge([&base, &over]);

        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(2)));
    }

    #[test]
    fn field_table_keeps_nested_values() {
        let headers = Headers::from([
            (HEADER_MESSAGE_TYPE.to_owned(), json!("event")),
            ("x-count".to_owned(), json!(3)),
            ("big".to_owned(), json!(i64::MAX)),
            ("nested".to_owned(), json!({"list": [true, "x"]})),
        ]);

        let table = to_field_table(&headers);
        assert_eq!(
            table.inner().get(&ShortString::from("x-count")),
            Some(&AMQPValue::LongInt(3))
        );

        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn field_table_keeps_unsigned_and_binary_values() {
        let headers = Headers::from([("huge".to_owned(), json!(u64::MAX))]);
        assert_eq!(from_field_table(&to_field_table(&headers)), headers);

        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("raw"),
            AMQPValue::LongString(LongString::from(vec![0xff, 0x00, 0x41])),
        );

        let decoded = from_field_table(&table);
        assert_eq!(decoded.get("raw"), Some(&json!([255, 0, 65])));
        assert_eq!(from_field_table(&to_field_table(&decoded)), decoded);
    }
}
