//! Envelope codec for the zflow streaming session protocol.
//!
//! A session message is a flat record of named fields (see [`Message`]).
//! On the wire it is carried as a single payload whose first byte selects
//! the encoding:
//!
//! - `T`: [tnetstring](https://tnetstrings.info), binary safe.
//! - `J`: compact JSON. Byte fields travel as strings, so only UTF-8
//!   payloads can be expressed.
//!
//! A listener can therefore accept either flavor and answer in kind. The
//! crate also provides the length-prefixed framing used by stream
//! transports.

mod codec;
mod error;
mod frame;
mod json;
mod message;
pub mod tnetstring;
mod value;

pub use codec::{Format, decode, encode};
pub use error::{DecodeError, EncodeError};
pub use frame::{MAX_FRAME, recv_frame, send_frame};
pub use message::{Header, Message, MessageType};
pub use value::Value;
