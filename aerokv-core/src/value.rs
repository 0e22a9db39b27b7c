//! The tagged value types stored in record bins.

use std::cmp::Ordering;

use bytes::{BufMut, BytesMut};

use crate::error::{AerokvError, Result};
use crate::msgpack;

/// Default cap on encoded string and blob particles.
pub const MAX_STRING_SIZE: usize = 1024 * 1024;

/// Wire type tags for particles, the server's term for encoded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParticleType {
    /// Absent value; tag only.
    Null = 0,
    /// 64-bit signed integer, big-endian.
    Integer = 1,
    /// IEEE-754 double, big-endian.
    Double = 2,
    /// UTF-8 string, no terminator.
    String = 3,
    /// Opaque bytes.
    Blob = 4,
    /// Boolean, single byte.
    Bool = 17,
    /// HyperLogLog sketch; clients never interpret the payload.
    Hll = 18,
    /// Map, msgpack-encoded.
    Map = 19,
    /// List, msgpack-encoded.
    List = 20,
    /// GeoJSON document.
    GeoJson = 23,
}

impl ParticleType {
    /// Maps a raw particle-type byte from the wire.
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ParticleType::Null),
            1 => Ok(ParticleType::Integer),
            2 => Ok(ParticleType::Double),
            3 => Ok(ParticleType::String),
            4 => Ok(ParticleType::Blob),
            17 => Ok(ParticleType::Bool),
            18 => Ok(ParticleType::Hll),
            19 => Ok(ParticleType::Map),
            20 => Ok(ParticleType::List),
            23 => Ok(ParticleType::GeoJson),
            other => Err(AerokvError::Protocol(format!(
                "unknown particle type {}",
                other
            ))),
        }
    }
}

/// How boolean bin values are put on the wire.
///
/// Servers prior to boolean-particle support only accept integers, so the
/// encoding is a client-wide choice fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendBoolAs {
    /// Native boolean particle (default).
    #[default]
    Bool,
    /// 0/1 integer particle.
    Integer,
}

/// Order attribute carried by map values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapOrder {
    /// No ordering guarantee.
    #[default]
    Unordered,
    /// Keys kept in wire order; attribute flag 1.
    KeyOrdered,
    /// Keys and values ordered; attribute flag 3.
    KeyValueOrdered,
}

impl MapOrder {
    /// The attribute flag packed into the map's ext marker.
    pub fn attribute(self) -> u8 {
        match self {
            MapOrder::Unordered => 0,
            MapOrder::KeyOrdered => 1,
            MapOrder::KeyValueOrdered => 3,
        }
    }
}

/// A value stored in a bin or nested inside a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Opaque bytes.
    Blob(Vec<u8>),
    /// GeoJSON document.
    GeoJson(String),
    /// Opaque HyperLogLog sketch returned by the server.
    Hll(Vec<u8>),
    /// Unordered list.
    List(Vec<Value>),
    /// Server-side ordered list.
    OrderedList(Vec<Value>),
    /// Unordered map, entries in insertion order.
    Map(Vec<(Value, Value)>),
    /// Key-ordered map. Serialized in sorted key order so equality
    /// comparisons against server-stored ordered maps succeed.
    KeyOrderedMap(Vec<(Value, Value)>),
    /// Key-and-value ordered map.
    KeyValueOrderedMap(Vec<(Value, Value)>),
}

impl Value {
    /// The particle tag this value carries at the top level of a bin.
    pub fn particle_type(&self, send_bool_as: SendBoolAs) -> ParticleType {
        match self {
            Value::Nil => ParticleType::Null,
            Value::Bool(_) => match send_bool_as {
                SendBoolAs::Bool => ParticleType::Bool,
                SendBoolAs::Integer => ParticleType::Integer,
            },
            Value::Int(_) => ParticleType::Integer,
            Value::Float(_) => ParticleType::Double,
            Value::String(_) => ParticleType::String,
            Value::Blob(_) => ParticleType::Blob,
            Value::GeoJson(_) => ParticleType::GeoJson,
            Value::Hll(_) => ParticleType::Hll,
            Value::List(_) | Value::OrderedList(_) => ParticleType::List,
            Value::Map(_) | Value::KeyOrderedMap(_) | Value::KeyValueOrderedMap(_) => {
                ParticleType::Map
            }
        }
    }

    /// Rank used when comparing values of different types, matching the
    /// server's cross-type ordering so client-sorted maps line up with
    /// server-sorted ones.
    pub fn type_rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Blob(_) => 5,
            Value::List(_) | Value::OrderedList(_) => 6,
            Value::Map(_) | Value::KeyOrderedMap(_) | Value::KeyValueOrderedMap(_) => 7,
            Value::GeoJson(_) => 8,
            Value::Hll(_) => 9,
        }
    }

    /// Total order over values: type rank first, then a natural
    /// within-type comparison. Float NaN sorts last within floats.
    pub fn wire_cmp(&self, other: &Value) -> Ordering {
        let by_rank = self.type_rank().cmp(&other.type_rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Greater)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::GeoJson(a), Value::GeoJson(b)) => a.cmp(b),
            (Value::Hll(a), Value::Hll(b)) => a.cmp(b),
            (
                Value::List(a) | Value::OrderedList(a),
                Value::List(b) | Value::OrderedList(b),
            ) => cmp_lists(a, b),
            (a, b) => {
                let ea = map_entries(a);
                let eb = map_entries(b);
                cmp_entries(ea, eb)
            }
        }
    }

    /// Encodes this value as a bin particle body into `buf`, returning
    /// the number of bytes written.
    ///
    /// Collections are msgpack bodies; scalars use the flat encodings
    /// the particle tags imply.
    pub fn write_particle(&self, buf: &mut BytesMut, send_bool_as: SendBoolAs) -> Result<usize> {
        let start = buf.len();
        match self {
            Value::Nil => {}
            Value::Bool(v) => match send_bool_as {
                SendBoolAs::Bool => buf.put_u8(u8::from(*v)),
                SendBoolAs::Integer => buf.put_i64(i64::from(*v)),
            },
            Value::Int(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f64(*v),
            Value::String(v) => {
                check_particle_size(v.len())?;
                buf.put_slice(v.as_bytes());
            }
            Value::GeoJson(v) => {
                check_particle_size(v.len())?;
                buf.put_slice(v.as_bytes());
            }
            Value::Blob(v) | Value::Hll(v) => buf.put_slice(v),
            collection => msgpack::pack_value(collection, buf)?,
        }
        Ok(buf.len() - start)
    }

    /// Decodes a particle body with the given tag.
    pub fn read_particle(tag: ParticleType, body: &[u8]) -> Result<Value> {
        match tag {
            ParticleType::Null => Ok(Value::Nil),
            ParticleType::Bool => match body {
                [b] => Ok(Value::Bool(*b != 0)),
                _ => Err(AerokvError::Protocol(format!(
                    "boolean particle with {} bytes",
                    body.len()
                ))),
            },
            ParticleType::Integer => {
                let bytes: [u8; 8] = body.try_into().map_err(|_| {
                    AerokvError::Protocol(format!("integer particle with {} bytes", body.len()))
                })?;
                Ok(Value::Int(i64::from_be_bytes(bytes)))
            }
            ParticleType::Double => {
                let bytes: [u8; 8] = body.try_into().map_err(|_| {
                    AerokvError::Protocol(format!("double particle with {} bytes", body.len()))
                })?;
                Ok(Value::Float(f64::from_be_bytes(bytes)))
            }
            ParticleType::String => Ok(Value::String(utf8(body)?)),
            ParticleType::GeoJson => Ok(Value::GeoJson(utf8(body)?)),
            ParticleType::Blob => Ok(Value::Blob(body.to_vec())),
            ParticleType::Hll => Ok(Value::Hll(body.to_vec())),
            ParticleType::List | ParticleType::Map => {
                let mut slice = body;
                msgpack::unpack_value(&mut slice)
            }
        }
    }

    /// Converts a u64 caller value, rejecting anything above `i64::MAX`.
    pub fn from_u64(v: u64) -> Result<Value> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| AerokvError::Param(format!("integer value {} exceeds int64 range", v)))
    }
}

fn utf8(body: &[u8]) -> Result<String> {
    String::from_utf8(body.to_vec())
        .map_err(|e| AerokvError::Protocol(format!("invalid UTF-8 in string particle: {}", e)))
}

fn check_particle_size(len: usize) -> Result<()> {
    if len > MAX_STRING_SIZE {
        return Err(AerokvError::Param(format!(
            "string particle of {} bytes exceeds the {} byte limit",
            len, MAX_STRING_SIZE
        )));
    }
    Ok(())
}

fn cmp_lists(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.wire_cmp(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn map_entries(v: &Value) -> &[(Value, Value)] {
    match v {
        Value::Map(e) | Value::KeyOrderedMap(e) | Value::KeyValueOrderedMap(e) => e,
        _ => &[],
    }
}

fn cmp_entries(a: &[(Value, Value)], b: &[(Value, Value)]) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.wire_cmp(kb);
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = va.wire_cmp(vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Blob(v) => write!(f, "blob[{}]", v.len()),
            Value::GeoJson(v) => write!(f, "geo({})", v),
            Value::Hll(v) => write!(f, "hll[{}]", v.len()),
            Value::List(v) | Value::OrderedList(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(e) | Value::KeyOrderedMap(e) | Value::KeyValueOrderedMap(e) => {
                write!(f, "{{")?;
                for (i, (k, v)) in e.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_particle_roundtrip() {
        let mut buf = BytesMut::new();
        Value::Int(-42).write_particle(&mut buf, SendBoolAs::Bool).unwrap();
        assert_eq!(&buf[..], (-42i64).to_be_bytes());

        let decoded = Value::read_particle(ParticleType::Integer, &buf).unwrap();
        assert_eq!(decoded, Value::Int(-42));
    }

    #[test]
    fn float_particle_roundtrip() {
        let mut buf = BytesMut::new();
        Value::Float(1.5).write_particle(&mut buf, SendBoolAs::Bool).unwrap();
        let decoded = Value::read_particle(ParticleType::Double, &buf).unwrap();
        assert_eq!(decoded, Value::Float(1.5));
    }

    #[test]
    fn string_particle_has_no_terminator() {
        let mut buf = BytesMut::new();
        Value::String("abc".into())
            .write_particle(&mut buf, SendBoolAs::Bool)
            .unwrap();
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn bool_particle_respects_client_policy() {
        let mut buf = BytesMut::new();
        Value::Bool(true).write_particle(&mut buf, SendBoolAs::Bool).unwrap();
        assert_eq!(&buf[..], [1]);

        let mut buf = BytesMut::new();
        Value::Bool(true)
            .write_particle(&mut buf, SendBoolAs::Integer)
            .unwrap();
        assert_eq!(&buf[..], 1i64.to_be_bytes());
        assert_eq!(
            Value::Bool(true).particle_type(SendBoolAs::Integer),
            ParticleType::Integer
        );
    }

    #[test]
    fn oversized_string_rejected() {
        let big = "x".repeat(MAX_STRING_SIZE + 1);
        let mut buf = BytesMut::new();
        let err = Value::String(big)
            .write_particle(&mut buf, SendBoolAs::Bool)
            .unwrap_err();
        assert!(matches!(err, AerokvError::Param(_)));
    }

    #[test]
    fn u64_overflow_rejected() {
        assert!(Value::from_u64(u64::MAX).is_err());
        assert_eq!(Value::from_u64(7).unwrap(), Value::Int(7));
    }

    #[test]
    fn unknown_particle_tag_rejected() {
        let err = ParticleType::from_u8(99).unwrap_err();
        assert!(matches!(err, AerokvError::Protocol(_)));
    }

    #[test]
    fn cross_type_ordering_matches_rank_table() {
        let order = [
            Value::Nil,
            Value::Bool(true),
            Value::Int(5),
            Value::Float(0.1),
            Value::String("a".into()),
            Value::Blob(vec![1]),
            Value::List(vec![]),
            Value::Map(vec![]),
            Value::GeoJson("{}".into()),
            Value::Hll(vec![0]),
        ];
        for pair in order.windows(2) {
            assert_eq!(pair[0].wire_cmp(&pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn within_type_ordering_is_natural() {
        assert_eq!(Value::Int(-1).wire_cmp(&Value::Int(1)), Ordering::Less);
        assert_eq!(
            Value::String("abc".into()).wire_cmp(&Value::String("abd".into())),
            Ordering::Less
        );
        assert_eq!(
            Value::List(vec![Value::Int(1)]).wire_cmp(&Value::List(vec![Value::Int(1), Value::Int(0)])),
            Ordering::Less
        );
    }
}
