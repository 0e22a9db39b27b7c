//! Typed operation descriptors and their wire encodings.
//!
//! A user call produces [`Operation`] values; the command engine encodes
//! each into one op-table entry. CDT, HLL and bitwise operations wrap a
//! sub-op code and msgpack arguments inside the bin payload, with an
//! optional context path descending into nested collections.

pub mod bits;
pub mod hll;
pub mod lists;
pub mod maps;

use bytes::BytesMut;

use crate::error::{AerokvError, Result};
use crate::msgpack;
use crate::protocol::constants::op;
use crate::value::{ParticleType, SendBoolAs, Value};

/// One encoded op-table entry.
#[derive(Debug)]
pub struct EncodedOp {
    /// Operation code byte.
    pub op_code: u8,
    /// Particle type byte for the attached value.
    pub particle: u8,
    /// Bin name; `None` for bin-less ops such as touch.
    pub bin: Option<String>,
    /// Encoded value bytes.
    pub payload: BytesMut,
}

/// One step of a context path descending into a nested collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CdtContext {
    /// Positional descent into a list.
    ListIndex(i64),
    /// Rank-based descent into a list.
    ListRank(i64),
    /// Dynamic lookup of a list element by value.
    ListValue(Value),
    /// Positional descent into a map.
    MapIndex(i64),
    /// Rank-based descent into a map.
    MapRank(i64),
    /// Dynamic lookup by map key.
    MapKey(Value),
    /// Dynamic lookup by map value.
    MapValue(Value),
}

impl CdtContext {
    fn code(&self) -> i64 {
        match self {
            CdtContext::ListIndex(_) => 0x10,
            CdtContext::ListRank(_) => 0x11,
            CdtContext::ListValue(_) => 0x13,
            CdtContext::MapIndex(_) => 0x20,
            CdtContext::MapRank(_) => 0x21,
            CdtContext::MapKey(_) => 0x22,
            CdtContext::MapValue(_) => 0x23,
        }
    }

    fn arg(&self) -> Value {
        match self {
            CdtContext::ListIndex(i) | CdtContext::MapIndex(i) => Value::Int(*i),
            CdtContext::ListRank(r) | CdtContext::MapRank(r) => Value::Int(*r),
            CdtContext::ListValue(v) | CdtContext::MapKey(v) | CdtContext::MapValue(v) => {
                v.clone()
            }
        }
    }
}

/// Marker written before the sub-op when a context path is present.
const CTX_PREAMBLE: i64 = 0xff;

/// Which CDT family an operation belongs to; decides the op code and
/// the bin particle type that disambiguates list, map, HLL and bitwise
/// payloads on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdtKind {
    /// List read.
    ListRead,
    /// List modify.
    ListModify,
    /// Map read.
    MapRead,
    /// Map modify.
    MapModify,
    /// HyperLogLog read.
    HllRead,
    /// HyperLogLog modify.
    HllModify,
    /// Bitwise-on-blob read.
    BitRead,
    /// Bitwise-on-blob modify.
    BitModify,
}

impl CdtKind {
    fn op_code(self) -> u8 {
        match self {
            CdtKind::ListRead | CdtKind::MapRead | CdtKind::HllRead | CdtKind::BitRead => {
                op::CDT_READ
            }
            _ => op::CDT_MODIFY,
        }
    }

    fn particle(self) -> ParticleType {
        match self {
            CdtKind::ListRead | CdtKind::ListModify => ParticleType::List,
            CdtKind::MapRead | CdtKind::MapModify => ParticleType::Map,
            CdtKind::HllRead | CdtKind::HllModify => ParticleType::Hll,
            CdtKind::BitRead | CdtKind::BitModify => ParticleType::Blob,
        }
    }

    /// True for the modify variants.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            CdtKind::ListModify | CdtKind::MapModify | CdtKind::HllModify | CdtKind::BitModify
        )
    }
}

/// A CDT sub-operation: family, sub-op code, msgpack arguments and an
/// optional context path.
#[derive(Debug, Clone, PartialEq)]
pub struct CdtOperation {
    kind: CdtKind,
    bin: String,
    sub_op: u16,
    args: Vec<Value>,
    ctx: Vec<CdtContext>,
}

impl CdtOperation {
    pub(crate) fn new(
        kind: CdtKind,
        bin: impl Into<String>,
        sub_op: u16,
        args: Vec<Value>,
        ctx: &[CdtContext],
    ) -> Self {
        Self {
            kind,
            bin: bin.into(),
            sub_op,
            args,
            ctx: ctx.to_vec(),
        }
    }

    fn encode(&self) -> Result<EncodedOp> {
        let mut payload = BytesMut::new();
        if self.ctx.is_empty() {
            pack_sub_op(self.sub_op, &self.args, &mut payload)?;
        } else {
            // Context preamble: marker, flattened descent pairs, then
            // the operation itself.
            msgpack::pack_array_header(3, &mut payload)?;
            msgpack::pack_int(CTX_PREAMBLE, &mut payload);
            msgpack::pack_array_header(self.ctx.len() * 2, &mut payload)?;
            for step in &self.ctx {
                msgpack::pack_int(step.code(), &mut payload);
                msgpack::pack_value(&step.arg(), &mut payload)?;
            }
            pack_sub_op(self.sub_op, &self.args, &mut payload)?;
        }
        Ok(EncodedOp {
            op_code: self.kind.op_code(),
            particle: self.kind.particle() as u8,
            bin: Some(self.bin.clone()),
            payload,
        })
    }
}

fn pack_sub_op(sub_op: u16, args: &[Value], buf: &mut BytesMut) -> Result<()> {
    msgpack::pack_array_header(1 + args.len(), buf)?;
    msgpack::pack_int(i64::from(sub_op), buf);
    for arg in args {
        msgpack::pack_value(arg, buf)?;
    }
    Ok(())
}

/// A single operation against one record, as passed to `operate`.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Read one bin.
    Read(String),
    /// Read every bin (only meaningful alone).
    ReadAll,
    /// Read record metadata without bin data.
    ReadHeader,
    /// Write a bin value; `Value::Nil` deletes the bin.
    Put {
        /// Target bin.
        bin: String,
        /// Value to write.
        value: Value,
    },
    /// Append to a string or blob bin.
    Append {
        /// Target bin.
        bin: String,
        /// String or blob tail.
        value: Value,
    },
    /// Prepend to a string or blob bin.
    Prepend {
        /// Target bin.
        bin: String,
        /// String or blob head.
        value: Value,
    },
    /// Arithmetic increment of an integer or float bin.
    Add {
        /// Target bin.
        bin: String,
        /// Signed delta.
        value: Value,
    },
    /// Reset the record TTL and bump the generation.
    Touch,
    /// A CDT, HLL or bitwise sub-operation.
    Cdt(CdtOperation),
}

impl Operation {
    /// Read one bin.
    pub fn get(bin: impl Into<String>) -> Self {
        Operation::Read(bin.into())
    }

    /// Write a bin.
    pub fn put(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Put {
            bin: bin.into(),
            value: value.into(),
        }
    }

    /// Append a string/blob tail to a bin.
    pub fn append(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Append {
            bin: bin.into(),
            value: value.into(),
        }
    }

    /// Prepend a string/blob head to a bin.
    pub fn prepend(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Prepend {
            bin: bin.into(),
            value: value.into(),
        }
    }

    /// Add a signed delta to an integer or float bin.
    pub fn add(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Add {
            bin: bin.into(),
            value: value.into(),
        }
    }

    /// True if this operation writes.
    pub fn is_write(&self) -> bool {
        match self {
            Operation::Read(_) | Operation::ReadAll | Operation::ReadHeader => false,
            Operation::Cdt(op) => op.kind.is_write(),
            _ => true,
        }
    }

    /// True if this operation produces a result bin.
    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    /// Encodes into one op-table entry.
    pub fn encode(&self, send_bool_as: SendBoolAs) -> Result<EncodedOp> {
        match self {
            Operation::Read(bin) => Ok(EncodedOp {
                op_code: op::READ,
                particle: ParticleType::Null as u8,
                bin: Some(bin.clone()),
                payload: BytesMut::new(),
            }),
            Operation::ReadAll | Operation::ReadHeader => Ok(EncodedOp {
                op_code: op::READ,
                particle: ParticleType::Null as u8,
                bin: None,
                payload: BytesMut::new(),
            }),
            Operation::Put { bin, value } => encode_value_op(op::WRITE, bin, value, send_bool_as),
            Operation::Append { bin, value } => {
                require_sequence(value)?;
                encode_value_op(op::APPEND, bin, value, send_bool_as)
            }
            Operation::Prepend { bin, value } => {
                require_sequence(value)?;
                encode_value_op(op::PREPEND, bin, value, send_bool_as)
            }
            Operation::Add { bin, value } => {
                if !matches!(value, Value::Int(_) | Value::Float(_)) {
                    return Err(AerokvError::Param(format!(
                        "increment requires an integer or float delta, got {}",
                        value
                    )));
                }
                encode_value_op(op::INCR, bin, value, send_bool_as)
            }
            Operation::Touch => Ok(EncodedOp {
                op_code: op::TOUCH,
                particle: ParticleType::Null as u8,
                bin: None,
                payload: BytesMut::new(),
            }),
            Operation::Cdt(cdt) => cdt.encode(),
        }
    }
}

fn encode_value_op(
    op_code: u8,
    bin: &str,
    value: &Value,
    send_bool_as: SendBoolAs,
) -> Result<EncodedOp> {
    let mut payload = BytesMut::new();
    value.write_particle(&mut payload, send_bool_as)?;
    Ok(EncodedOp {
        op_code,
        particle: value.particle_type(send_bool_as) as u8,
        bin: Some(bin.to_string()),
        payload,
    })
}

fn require_sequence(value: &Value) -> Result<()> {
    match value {
        Value::String(_) | Value::Blob(_) => Ok(()),
        other => Err(AerokvError::Param(format!(
            "append/prepend requires a string or blob value, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_op_is_empty() {
        let op = Operation::get("name").encode(SendBoolAs::Bool).unwrap();
        assert_eq!(op.op_code, op::READ);
        assert_eq!(op.bin.as_deref(), Some("name"));
        assert!(op.payload.is_empty());
    }

    #[test]
    fn put_encodes_particle() {
        let op = Operation::put("age", 25i64).encode(SendBoolAs::Bool).unwrap();
        assert_eq!(op.op_code, op::WRITE);
        assert_eq!(op.particle, ParticleType::Integer as u8);
        assert_eq!(&op.payload[..], 25i64.to_be_bytes());
    }

    #[test]
    fn append_rejects_non_sequence() {
        let err = Operation::append("age", 1i64)
            .encode(SendBoolAs::Bool)
            .unwrap_err();
        assert!(matches!(err, AerokvError::Param(_)));

        assert!(Operation::append("name", "tail").encode(SendBoolAs::Bool).is_ok());
    }

    #[test]
    fn add_rejects_non_numeric() {
        let err = Operation::add("age", "oops")
            .encode(SendBoolAs::Bool)
            .unwrap_err();
        assert!(matches!(err, AerokvError::Param(_)));
        assert!(Operation::add("score", 0.5).encode(SendBoolAs::Bool).is_ok());
    }

    #[test]
    fn write_classification() {
        assert!(Operation::put("a", 1i64).is_write());
        assert!(Operation::Touch.is_write());
        assert!(!Operation::get("a").is_write());
        assert!(lists::size("l", &[]).is_read());
        assert!(lists::clear("l", &[]).is_write());
    }

    #[test]
    fn cdt_payload_without_context() {
        let op = lists::size("l", &[]).encode(SendBoolAs::Bool).unwrap();
        // [16]: single-element array with the SIZE sub-op.
        assert_eq!(&op.payload[..], [0x91, 0x10]);
        assert_eq!(op.op_code, op::CDT_READ);
        assert_eq!(op.particle, ParticleType::List as u8);
    }

    #[test]
    fn cdt_payload_with_context_has_preamble() {
        let ctx = [CdtContext::ListIndex(2)];
        let op = lists::size("l", &ctx).encode(SendBoolAs::Bool).unwrap();
        // [0xff, [0x10, 2], [16]]
        assert_eq!(
            &op.payload[..],
            [0x93, 0xcc, 0xff, 0x92, 0x10, 0x02, 0x91, 0x10]
        );
    }

    #[test]
    fn context_encoding_is_deterministic() {
        let ctx = [
            CdtContext::MapKey(Value::String("ratings".into())),
            CdtContext::ListRank(-1),
        ];
        let a = lists::size("l", &ctx).encode(SendBoolAs::Bool).unwrap();
        let b = lists::size("l", &ctx).encode(SendBoolAs::Bool).unwrap();
        assert_eq!(a.payload, b.payload);
    }
}
