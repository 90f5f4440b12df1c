//! Codec error types.

/// A payload could not be turned into a [`Message`](crate::Message).
///
/// Decoding never yields a partially populated message: any of these
/// errors means the whole payload must be dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The payload was empty.
    #[error("empty message")]
    Empty,

    /// The first byte does not name a known wire format.
    #[error("unsupported format prefix {0:#04x}")]
    UnknownFormat(u8),

    /// The tnetstring body is malformed.
    #[error("tnetstring parse failed: {0}")]
    Tnetstring(&'static str),

    /// The JSON body is malformed.
    #[error("json parse failed: {0}")]
    Json(String),

    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A field is present but holds the wrong kind of value.
    #[error("field `{field}` must be {expected}")]
    FieldType {
        /// Field name.
        field: &'static str,
        /// Human readable description of the expected type.
        expected: &'static str,
    },

    /// The `type` field holds an unrecognized value.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

/// A [`Message`](crate::Message) could not be written in the requested format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// JSON carries byte fields as strings; this field was not UTF-8.
    #[error("field is not valid UTF-8 and cannot be carried as JSON")]
    NotUtf8,

    /// JSON has no representation for NaN or infinity.
    #[error("non-finite float cannot be carried as JSON")]
    NonFiniteFloat,
}
