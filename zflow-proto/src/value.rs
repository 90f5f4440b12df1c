//! Self-describing value model shared by both wire flavors.

use std::collections::BTreeMap;

/// A dynamically typed value, the common denominator of tnetstring and JSON.
///
/// Strings are kept as raw bytes because tnetstring does not distinguish
/// text from binary; [`Message`](crate::Message) decides which fields must
/// be UTF-8.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// Map with string keys.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a byte-string value from anything string-like.
    pub fn str(s: impl Into<String>) -> Self {
        Self::Bytes(s.into().into_bytes())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}
