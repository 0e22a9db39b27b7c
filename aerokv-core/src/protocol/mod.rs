//! Message framing for the binary protocol.
//!
//! Every exchange is an 8-byte proto header (version, type, 48-bit
//! length) followed by a type-specific payload. Record messages carry a
//! 22-byte message header, a field table and an op table; info and admin
//! exchanges use the same proto header with their own payloads.

pub mod constants;
pub mod message;
pub mod proto;

pub use message::{Field, MessageBuilder, MessageHeader, ParsedMessage};
pub use proto::{ProtoCodec, ProtoFrame};
