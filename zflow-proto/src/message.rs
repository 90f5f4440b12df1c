//! Session message envelope.

use std::collections::BTreeMap;

use crate::{DecodeError, Value};

/// One header line: name and value, in the order they were sent.
pub type Header = (String, String);

/// Control type of a message. Data messages carry no type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// The sender failed the flow; `condition` says why.
    Error,
    /// The sender abandoned the flow.
    Cancel,
    /// Grants `credits` more body bytes to the receiver.
    Credit,
    /// Liveness signal, never accounted as data.
    KeepAlive,
    /// Starts or completes the close handshake of a duplex stream.
    Close,
}

impl MessageType {
    /// Wire name of this type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Cancel => "cancel",
            Self::Credit => "credit",
            Self::KeepAlive => "keep-alive",
            Self::Close => "close",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Self::Error),
            "cancel" => Some(Self::Cancel),
            "credit" => Some(Self::Credit),
            "keep-alive" => Some(Self::KeepAlive),
            "close" => Some(Self::Close),
            _ => None,
        }
    }

    /// Whether this type ends the flow on receipt.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Cancel)
    }
}

/// A protocol message: open, data, or control.
///
/// Which fields are meaningful depends on the role of the message:
///
/// - request open: `method`, `uri`, `headers`, `body`, `credits`, `stream`, `more`
/// - duplex open: `uri`, `credits`
/// - response/data: `seq`, `code`, `reason`, `headers`, `body`, `more`, `credits`
/// - control: `seq`, `type`, plus `credits` or `condition`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Routing hint naming the sender, for transports without symmetric addressing.
    pub from: Option<String>,
    /// Flow identifier.
    pub id: String,
    /// Direction-local sequence number.
    pub seq: Option<u64>,
    /// Control type; `None` for data.
    pub kind: Option<MessageType>,
    /// Error condition, with [`MessageType::Error`].
    pub condition: Option<String>,
    /// Body bytes granted to the receiver.
    pub credits: Option<u64>,
    /// More body segments follow.
    pub more: bool,
    /// The initiator wants a credit-paced, streamed response.
    pub stream: bool,
    /// Body segment.
    pub body: Option<Vec<u8>>,
    /// Header lines.
    pub headers: Option<Vec<Header>>,
    /// Request method.
    pub method: Option<String>,
    /// Request target.
    pub uri: Option<String>,
    /// Response status code.
    pub code: Option<u16>,
    /// Response reason phrase.
    pub reason: Option<String>,
    /// Largest response body the initiator will accept.
    pub max_size: Option<u64>,
    /// Opaque value the responder echoes on every reply.
    pub user_data: Option<Value>,
}

impl Message {
    /// An empty data message for flow `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A control message of the given type for flow `id`.
    pub fn typed(id: impl Into<String>, kind: MessageType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::new(id)
        }
    }

    /// Whether this message opens a flow rather than continuing one.
    pub const fn is_open(&self) -> bool {
        self.kind.is_none() && (self.method.is_some() || self.uri.is_some())
    }

    /// Converts to the self-describing record written on the wire.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        let mut put = |k: &str, v: Value| {
            map.insert(k.to_owned(), v);
        };

        if let Some(from) = &self.from {
            put("from", Value::str(from.as_str()));
        }
        put("id", Value::str(self.id.as_str()));
        if let Some(seq) = self.seq {
            put("seq", uint(seq));
        }
        if let Some(kind) = self.kind {
            put("type", Value::str(kind.as_str()));
        }
        if let Some(condition) = &self.condition {
            put("condition", Value::str(condition.as_str()));
        }
        if let Some(credits) = self.credits {
            put("credits", uint(credits));
        }
        if self.more {
            put("more", Value::Bool(true));
        }
        if self.stream {
            put("stream", Value::Bool(true));
        }
        if let Some(body) = &self.body {
            put("body", Value::Bytes(body.clone()));
        }
        if let Some(headers) = &self.headers {
            let list = headers
                .iter()
                .map(|(n, v)| Value::List(vec![Value::str(n.as_str()), Value::str(v.as_str())]))
                .collect();
            put("headers", Value::List(list));
        }
        if let Some(method) = &self.method {
            put("method", Value::str(method.as_str()));
        }
        if let Some(uri) = &self.uri {
            put("uri", Value::str(uri.as_str()));
        }
        if let Some(code) = self.code {
            put("code", Value::Int(i64::from(code)));
        }
        if let Some(reason) = &self.reason {
            put("reason", Value::str(reason.as_str()));
        }
        if let Some(max_size) = self.max_size {
            put("max-size", uint(max_size));
        }
        if let Some(user_data) = &self.user_data {
            put("user-data", user_data.clone());
        }

        Value::Map(map)
    }

    /// Parses the wire record. Unknown fields are ignored; known fields
    /// with the wrong type fail the whole message.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Map(mut map) = value else {
            return Err(DecodeError::FieldType {
                field: "message",
                expected: "a map",
            });
        };
        let m = &mut map;

        let kind = match take_str(m, "type")? {
            Some(t) => Some(MessageType::parse(&t).ok_or(DecodeError::UnknownType(t))?),
            None => None,
        };
        let uri = match take_str(m, "uri")? {
            Some(uri) => Some(uri),
            None => take_str(m, "url")?,
        };
        let reason = match take_str(m, "reason")? {
            Some(reason) => Some(reason),
            None => take_str(m, "status")?,
        };
        let code = take_uint(m, "code")?
            .map(|c| {
                u16::try_from(c).map_err(|_| DecodeError::FieldType {
                    field: "code",
                    expected: "a status code",
                })
            })
            .transpose()?;

        Ok(Self {
            from: take_str(m, "from")?,
            id: take_str(m, "id")?.ok_or(DecodeError::MissingField("id"))?,
            seq: take_uint(m, "seq")?,
            kind,
            condition: take_str(m, "condition")?,
            credits: take_uint(m, "credits")?,
            more: take_bool(m, "more")?.unwrap_or(false),
            stream: take_bool(m, "stream")?.unwrap_or(false),
            body: take_bytes(m, "body")?,
            headers: take_headers(m)?,
            method: take_str(m, "method")?,
            uri,
            code,
            reason,
            max_size: take_uint(m, "max-size")?,
            user_data: m.remove("user-data"),
        })
    }
}

#[allow(clippy::cast_possible_wrap)]
fn uint(n: u64) -> Value {
    Value::Int(n.min(i64::MAX as u64) as i64)
}

fn take_bytes(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<Option<Vec<u8>>, DecodeError> {
    match map.remove(field) {
        None => Ok(None),
        Some(Value::Bytes(b)) => Ok(Some(b)),
        Some(_) => Err(DecodeError::FieldType {
            field,
            expected: "a string",
        }),
    }
}

fn take_str(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<Option<String>, DecodeError> {
    take_bytes(map, field)?
        .map(|b| {
            String::from_utf8(b).map_err(|_| DecodeError::FieldType {
                field,
                expected: "a UTF-8 string",
            })
        })
        .transpose()
}

fn take_uint(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<Option<u64>, DecodeError> {
    match map.remove(field) {
        None => Ok(None),
        Some(Value::Int(i)) => u64::try_from(i).map(Some).map_err(|_| DecodeError::FieldType {
            field,
            expected: "a non-negative integer",
        }),
        Some(_) => Err(DecodeError::FieldType {
            field,
            expected: "an integer",
        }),
    }
}

fn take_bool(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<Option<bool>, DecodeError> {
    match map.remove(field) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(_) => Err(DecodeError::FieldType {
            field,
            expected: "a boolean",
        }),
    }
}

fn take_headers(map: &mut BTreeMap<String, Value>) -> Result<Option<Vec<Header>>, DecodeError> {
    const BAD: DecodeError = DecodeError::FieldType {
        field: "headers",
        expected: "a list of [name, value] pairs",
    };

    let Some(raw) = map.remove("headers") else {
        return Ok(None);
    };
    let Value::List(items) = raw else {
        return Err(BAD);
    };

    let mut headers = Vec::with_capacity(items.len());
    for item in items {
        let Value::List(pair) = item else {
            return Err(BAD);
        };
        let [Value::Bytes(name), Value::Bytes(value)] = <[Value; 2]>::try_from(pair).map_err(|_| BAD)?
        else {
            return Err(BAD);
        };
        let name = String::from_utf8(name).map_err(|_| BAD)?;
        let value = String::from_utf8(value).map_err(|_| BAD)?;
        headers.push((name, value));
    }
    Ok(Some(headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn parses_stream_response() {
        let msg = Message::from_value(map(&[
            ("id", Value::str("r1")),
            ("from", Value::str("zurl")),
            ("seq", Value::Int(0)),
            ("code", Value::Int(200)),
            ("reason", Value::str("OK")),
            (
                "headers",
                Value::List(vec![Value::List(vec![
                    Value::str("Content-Type"),
                    Value::str("text/plain"),
                ])]),
            ),
            ("body", Value::str("hi")),
            ("more", Value::Bool(true)),
        ]))
        .unwrap();

        assert_eq!(msg.id, "r1");
        assert_eq!(msg.from.as_deref(), Some("zurl"));
        assert_eq!(msg.seq, Some(0));
        assert_eq!(msg.code, Some(200));
        assert_eq!(msg.reason.as_deref(), Some("OK"));
        assert_eq!(
            msg.headers,
            Some(vec![("Content-Type".to_owned(), "text/plain".to_owned())])
        );
        assert_eq!(msg.body.as_deref(), Some(&b"hi"[..]));
        assert!(msg.more);
        assert!(msg.kind.is_none());
    }

    #[test]
    fn accepts_legacy_aliases() {
        let msg = Message::from_value(map(&[
            ("id", Value::str("r1")),
            ("method", Value::str("GET")),
            ("url", Value::str("http://example.com/")),
            ("status", Value::str("Not Found")),
        ]))
        .unwrap();
        assert_eq!(msg.uri.as_deref(), Some("http://example.com/"));
        assert_eq!(msg.reason.as_deref(), Some("Not Found"));
        assert!(msg.is_open());
    }

    #[test]
    fn parses_control_types() {
        for kind in [
            MessageType::Error,
            MessageType::Cancel,
            MessageType::Credit,
            MessageType::KeepAlive,
            MessageType::Close,
        ] {
            let msg = Message::from_value(map(&[
                ("id", Value::str("x")),
                ("type", Value::str(kind.as_str())),
            ]))
            .unwrap();
            assert_eq!(msg.kind, Some(kind));
            assert!(!msg.is_open());
        }
    }

    #[test]
    fn rejects_bad_fields() {
        let cases = [
            (map(&[("seq", Value::Int(0))]), DecodeError::MissingField("id")),
            (
                map(&[("id", Value::str("x")), ("type", Value::str("bogus"))]),
                DecodeError::UnknownType("bogus".into()),
            ),
            (
                map(&[("id", Value::str("x")), ("seq", Value::Int(-1))]),
                DecodeError::FieldType {
                    field: "seq",
                    expected: "a non-negative integer",
                },
            ),
            (
                map(&[("id", Value::str("x")), ("more", Value::Int(1))]),
                DecodeError::FieldType {
                    field: "more",
                    expected: "a boolean",
                },
            ),
            (
                map(&[("id", Value::str("x")), ("code", Value::Int(70000))]),
                DecodeError::FieldType {
                    field: "code",
                    expected: "a status code",
                },
            ),
        ];
        for (value, expected) in cases {
            assert_eq!(Message::from_value(value), Err(expected));
        }
    }

    #[test]
    fn rejects_malformed_headers() {
        let bad = [
            Value::str("nope"),
            Value::List(vec![Value::str("flat")]),
            Value::List(vec![Value::List(vec![Value::str("only-name")])]),
            Value::List(vec![Value::List(vec![Value::str("a"), Value::Int(1)])]),
        ];
        for headers in bad {
            let value = map(&[("id", Value::str("x")), ("headers", headers)]);
            assert!(matches!(
                Message::from_value(value),
                Err(DecodeError::FieldType { field: "headers", .. })
            ));
        }
    }

    #[test]
    fn omits_unset_fields() {
        let msg = Message::typed("abc", MessageType::Credit);
        let Value::Map(fields) = msg.to_value() else {
            panic!("expected map");
        };
        let keys: Vec<_> = fields.keys().map(String::as_str).collect();
        assert_eq!(keys, ["id", "type"]);
    }
}
