//! Prefix-tagged envelope encoding.
//!
//! Each payload is `[format byte][body]`, where the format byte is `T`
//! (tnetstring) or `J` (JSON).

use serde::{Deserialize, Serialize};

use crate::{DecodeError, EncodeError, Message, json, tnetstring};

/// Wire flavor of an encoded message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Binary-safe tnetstring, prefix `T`.
    #[default]
    Tnetstring,
    /// Compact JSON, prefix `J`.
    Json,
}

impl Format {
    /// Leading byte identifying this format.
    pub const fn prefix(self) -> u8 {
        match self {
            Self::Tnetstring => b'T',
            Self::Json => b'J',
        }
    }

    /// Format named by a leading byte, if any.
    pub const fn from_prefix(b: u8) -> Option<Self> {
        match b {
            b'T' => Some(Self::Tnetstring),
            b'J' => Some(Self::Json),
            _ => None,
        }
    }
}

/// Encodes `msg` in the given format, prefix byte included.
pub fn encode(msg: &Message, format: Format) -> Result<Vec<u8>, EncodeError> {
    let value = msg.to_value();
    let mut out = vec![format.prefix()];
    match format {
        Format::Tnetstring => out.extend(tnetstring::to_vec(&value)),
        Format::Json => out.extend(json::to_vec(&value)?),
    }
    Ok(out)
}

/// Decodes a prefixed payload, reporting which format the peer used.
pub fn decode(input: &[u8]) -> Result<(Format, Message), DecodeError> {
    let (&first, body) = input.split_first().ok_or(DecodeError::Empty)?;
    let format = Format::from_prefix(first).ok_or(DecodeError::UnknownFormat(first))?;
    let value = match format {
        Format::Tnetstring => tnetstring::from_slice(body)?,
        Format::Json => json::from_slice(body)?,
    };
    Ok((format, Message::from_value(value)?))
}
