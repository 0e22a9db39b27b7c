//! Wire protocol types and codecs for the aerokv client.
//!
//! This crate contains everything needed to build and parse protocol
//! messages without doing any I/O: the tagged value codec, key digests,
//! the operation encoders (including CDT list/map, HyperLogLog, bitwise
//! and expression payloads) and the message framer. The `aerokv-client`
//! crate drives these over pooled connections.

#![warn(missing_docs)]

pub mod error;
pub mod expression;
pub mod info;
pub mod key;
pub mod msgpack;
pub mod operations;
pub mod protocol;
pub mod record;
pub mod value;

pub use error::{AerokvError, Result, ResultCode};
pub use key::{Key, UserKey};
pub use record::Record;
pub use value::{MapOrder, ParticleType, Value};
