//! JSON encoding of [`Value`].
//!
//! JSON has no byte-string type, so [`Value::Bytes`] travels as a JSON
//! string and must be UTF-8. Every JSON string decodes back to bytes.

use serde_json::{Map, Number};

use crate::{DecodeError, EncodeError, Value};

/// Encodes `value` as compact JSON.
pub(crate) fn to_vec(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let json = to_json(value)?;
    Ok(json.to_string().into_bytes())
}

/// Decodes a JSON document into a [`Value`].
pub(crate) fn from_slice(input: &[u8]) -> Result<Value, DecodeError> {
    let json: serde_json::Value =
        serde_json::from_slice(input).map_err(|e| DecodeError::Json(e.to_string()))?;
    Ok(from_json(json))
}

fn to_json(value: &Value) -> Result<serde_json::Value, EncodeError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => {
            serde_json::Value::Number(Number::from_f64(*f).ok_or(EncodeError::NonFiniteFloat)?)
        }
        Value::Bytes(b) => serde_json::Value::String(
            String::from_utf8(b.clone()).map_err(|_| EncodeError::NotUtf8)?,
        ),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<Result<_, _>>()?)
        }
        Value::Map(map) => {
            let mut obj = Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), to_json(v)?);
            }
            serde_json::Value::Object(obj)
        }
    })
}

fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map_or_else(|| Value::Float(n.as_f64().unwrap_or_default()), Value::Int),
        serde_json::Value::String(s) => Value::Bytes(s.into_bytes()),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(obj) => {
            Value::Map(obj.into_iter().map(|(k, v)| (k, from_json(v))).collect())
        }
    }
}
