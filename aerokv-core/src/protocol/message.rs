//! Record message building and parsing: the 22-byte message header,
//! the field table and the op table.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use super::constants::{field_type, msg_type, MAX_BIN_NAME_LEN, MSG_HEADER_SIZE};
use super::proto::ProtoFrame;
use crate::error::{AerokvError, Result};
use crate::key::{Key, UserKey};
use crate::operations::EncodedOp;
use crate::value::{ParticleType, Value};

/// The fixed message header carried by every record request and response.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHeader {
    /// First info flag byte (read side).
    pub info1: u8,
    /// Second info flag byte (write side).
    pub info2: u8,
    /// Third info flag byte (stream control).
    pub info3: u8,
    /// Result code; zero on requests and successful responses.
    pub result_code: u8,
    /// Record generation.
    pub generation: u32,
    /// Record TTL or void-time seconds.
    pub expiration: u32,
    /// Total transaction deadline in milliseconds.
    pub transaction_ttl: u32,
    /// Number of entries in the field table.
    pub n_fields: u16,
    /// Number of entries in the op table.
    pub n_ops: u16,
}

impl MessageHeader {
    /// Parses the header from the front of a message payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < MSG_HEADER_SIZE {
            return Err(AerokvError::Protocol(format!(
                "message payload of {} bytes is shorter than the {} byte header",
                payload.len(),
                MSG_HEADER_SIZE
            )));
        }
        let header_size = payload[0] as usize;
        if header_size != MSG_HEADER_SIZE {
            return Err(AerokvError::Protocol(format!(
                "message header size {} does not match expected {}",
                header_size, MSG_HEADER_SIZE
            )));
        }
        Ok(MessageHeader {
            info1: payload[1],
            info2: payload[2],
            info3: payload[3],
            result_code: payload[5],
            generation: u32::from_be_bytes(payload[6..10].try_into().unwrap()),
            expiration: u32::from_be_bytes(payload[10..14].try_into().unwrap()),
            transaction_ttl: u32::from_be_bytes(payload[14..18].try_into().unwrap()),
            n_fields: u16::from_be_bytes(payload[18..20].try_into().unwrap()),
            n_ops: u16::from_be_bytes(payload[20..22].try_into().unwrap()),
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(MSG_HEADER_SIZE as u8);
        buf.put_u8(self.info1);
        buf.put_u8(self.info2);
        buf.put_u8(self.info3);
        buf.put_u8(0);
        buf.put_u8(self.result_code);
        buf.put_u32(self.generation);
        buf.put_u32(self.expiration);
        buf.put_u32(self.transaction_ttl);
        buf.put_u16(self.n_fields);
        buf.put_u16(self.n_ops);
    }
}

/// Builds a record message payload: header, then fields, then ops.
///
/// Field and op counts are declared up front; [`MessageBuilder::finish`]
/// verifies the declared counts were honored before handing back the
/// frame.
#[derive(Debug)]
pub struct MessageBuilder {
    buf: BytesMut,
    declared_fields: u16,
    declared_ops: u16,
    written_fields: u16,
    written_ops: u16,
}

impl MessageBuilder {
    /// Starts a message with the given header.
    pub fn new(header: MessageHeader) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        header.write_to(&mut buf);
        Self {
            buf,
            declared_fields: header.n_fields,
            declared_ops: header.n_ops,
            written_fields: 0,
            written_ops: 0,
        }
    }

    /// Writes a field with raw payload bytes.
    pub fn write_field(&mut self, ftype: u8, data: &[u8]) {
        self.buf.put_u32(data.len() as u32 + 1);
        self.buf.put_u8(ftype);
        self.buf.put_slice(data);
        self.written_fields += 1;
    }

    /// Writes a string-valued field.
    pub fn write_field_str(&mut self, ftype: u8, data: &str) {
        self.write_field(ftype, data.as_bytes());
    }

    /// Writes a big-endian u64 field (task ids).
    pub fn write_field_u64(&mut self, ftype: u8, v: u64) {
        self.write_field(ftype, &v.to_be_bytes());
    }

    /// Writes the routing fields for a key: namespace, set (when
    /// non-empty), digest, and optionally the user key itself.
    pub fn write_key(&mut self, key: &Key, send_key: bool) {
        self.write_field_str(field_type::NAMESPACE, &key.namespace);
        if !key.set_name.is_empty() {
            self.write_field_str(field_type::SET, &key.set_name);
        }
        self.write_field(field_type::DIGEST, &key.digest);
        if send_key {
            if let Some(user_key) = &key.user_key {
                let mut data = BytesMut::new();
                match user_key {
                    UserKey::Int(v) => {
                        data.put_u8(ParticleType::Integer as u8);
                        data.put_i64(*v);
                    }
                    UserKey::String(v) => {
                        data.put_u8(ParticleType::String as u8);
                        data.put_slice(v.as_bytes());
                    }
                    UserKey::Blob(v) => {
                        data.put_u8(ParticleType::Blob as u8);
                        data.put_slice(v);
                    }
                }
                self.write_field(field_type::KEY, &data);
            }
        }
    }

    /// Number of fields [`MessageBuilder::write_key`] will emit.
    pub fn key_field_count(key: &Key, send_key: bool) -> u16 {
        let mut n = 2;
        if !key.set_name.is_empty() {
            n += 1;
        }
        if send_key && key.user_key.is_some() {
            n += 1;
        }
        n
    }

    /// Writes one encoded operation into the op table.
    pub fn write_operation(&mut self, op: &EncodedOp) -> Result<()> {
        let name = op.bin.as_deref().unwrap_or("");
        if name.len() > MAX_BIN_NAME_LEN {
            return Err(AerokvError::Param(format!(
                "bin name {:?} exceeds {} bytes",
                name, MAX_BIN_NAME_LEN
            )));
        }
        let size = 4 + name.len() + op.payload.len();
        self.buf.put_u32(size as u32);
        self.buf.put_u8(op.op_code);
        self.buf.put_u8(op.particle);
        self.buf.put_u8(0);
        self.buf.put_u8(name.len() as u8);
        self.buf.put_slice(name.as_bytes());
        self.buf.put_slice(&op.payload);
        self.written_ops += 1;
        Ok(())
    }

    /// Finishes the message, checking the declared field and op counts.
    pub fn finish(self) -> Result<ProtoFrame> {
        if self.written_fields != self.declared_fields || self.written_ops != self.declared_ops {
            return Err(AerokvError::Param(format!(
                "declared {}/{} fields/ops but wrote {}/{}",
                self.declared_fields, self.declared_ops, self.written_fields, self.written_ops
            )));
        }
        Ok(ProtoFrame::new(msg_type::MESSAGE, self.buf))
    }
}

/// A raw field from a response's field table.
#[derive(Debug, Clone)]
pub struct Field {
    /// Field type byte.
    pub field_type: u8,
    /// Field payload.
    pub data: Vec<u8>,
}

/// A fully parsed response message.
#[derive(Debug)]
pub struct ParsedMessage {
    /// The fixed header.
    pub header: MessageHeader,
    /// Field table entries in wire order.
    pub fields: Vec<Field>,
    /// Op table entries in wire order; duplicate bin names preserved.
    pub bins: Vec<(String, Value)>,
}

impl ParsedMessage {
    /// Parses one record message payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut rest = payload;
        let parsed = Self::parse_next(&mut rest)?;
        if !rest.is_empty() {
            return Err(AerokvError::Protocol(format!(
                "{} trailing bytes after op table",
                rest.len()
            )));
        }
        Ok(parsed)
    }

    /// Parses one message from the front of a multi-message payload,
    /// advancing the slice past it. Scan, query and batch responses
    /// carry several messages per frame.
    pub fn parse_next(input: &mut &[u8]) -> Result<Self> {
        let payload = *input;
        let header = MessageHeader::parse(payload)?;
        let mut rest = &payload[MSG_HEADER_SIZE..];

        let mut fields = Vec::with_capacity(header.n_fields as usize);
        for _ in 0..header.n_fields {
            let len = read_u32(&mut rest)? as usize;
            if len == 0 {
                return Err(AerokvError::Protocol("zero-length field".to_string()));
            }
            let body = read_bytes(&mut rest, len)?;
            fields.push(Field {
                field_type: body[0],
                data: body[1..].to_vec(),
            });
        }

        let mut bins = Vec::with_capacity(header.n_ops as usize);
        for _ in 0..header.n_ops {
            let size = read_u32(&mut rest)? as usize;
            let body = read_bytes(&mut rest, size)?;
            if body.len() < 4 {
                return Err(AerokvError::Protocol(format!(
                    "op entry of {} bytes",
                    body.len()
                )));
            }
            let particle = ParticleType::from_u8(body[1])?;
            let name_len = body[3] as usize;
            if body.len() < 4 + name_len {
                return Err(AerokvError::Protocol("op entry shorter than bin name".to_string()));
            }
            let name = String::from_utf8(body[4..4 + name_len].to_vec())
                .map_err(|e| AerokvError::Protocol(format!("invalid bin name: {}", e)))?;
            let value = Value::read_particle(particle, &body[4 + name_len..])?;
            bins.push((name, value));
        }

        *input = rest;
        Ok(ParsedMessage {
            header,
            fields,
            bins,
        })
    }

    /// Returns the first field of the given type.
    pub fn field(&self, ftype: u8) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.field_type == ftype)
            .map(|f| f.data.as_slice())
    }

    /// Reassembles a key from the response's routing fields, if a
    /// digest was returned (scan and batch responses carry one).
    pub fn key(&self) -> Option<Key> {
        let digest: [u8; 20] = self.field(field_type::DIGEST)?.try_into().ok()?;
        let namespace = self
            .field(field_type::NAMESPACE)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let set_name = self
            .field(field_type::SET)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let mut key = Key::from_digest(namespace, set_name, digest);
        if let Some(data) = self.field(field_type::KEY) {
            if !data.is_empty() {
                key.user_key = match data[0] {
                    t if t == ParticleType::Integer as u8 && data.len() == 9 => {
                        Some(UserKey::Int(i64::from_be_bytes(data[1..9].try_into().unwrap())))
                    }
                    t if t == ParticleType::String as u8 => {
                        Some(UserKey::String(String::from_utf8_lossy(&data[1..]).into_owned()))
                    }
                    _ => Some(UserKey::Blob(data[1..].to_vec())),
                };
            }
        }
        Some(key)
    }

    /// Collapses the op table into a bin map; later entries win.
    pub fn into_bins(self) -> HashMap<String, Value> {
        self.bins.into_iter().collect()
    }
}

fn read_u32(input: &mut &[u8]) -> Result<u32> {
    let b = read_bytes(input, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if input.len() < len {
        return Err(AerokvError::Protocol(format!(
            "truncated message: wanted {} bytes, {} remain",
            len,
            input.len()
        )));
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::Operation;
    use crate::protocol::constants::{info1, info2};
    use crate::value::SendBoolAs;

    fn build_single_put() -> ProtoFrame {
        let key = Key::new("test", "demo", 1i64).unwrap();
        let mut builder = MessageBuilder::new(MessageHeader {
            info2: info2::WRITE,
            n_fields: MessageBuilder::key_field_count(&key, false),
            n_ops: 1,
            ..Default::default()
        });
        builder.write_key(&key, false);
        let op = Operation::put("age", Value::Int(25))
            .encode(SendBoolAs::Bool)
            .unwrap();
        builder.write_operation(&op).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn build_then_parse_roundtrip() {
        let frame = build_single_put();
        let parsed = ParsedMessage::parse(&frame.payload).unwrap();

        assert_eq!(parsed.header.info2, info2::WRITE);
        assert_eq!(parsed.header.n_fields, 3);
        assert_eq!(parsed.header.n_ops, 1);
        assert_eq!(parsed.bins, vec![("age".to_string(), Value::Int(25))]);

        let key = parsed.key().unwrap();
        assert_eq!(key.namespace, "test");
        assert_eq!(key.set_name, "demo");
    }

    #[test]
    fn declared_counts_enforced() {
        let key = Key::new("test", "demo", 1i64).unwrap();
        let mut builder = MessageBuilder::new(MessageHeader {
            info1: info1::READ,
            n_fields: 5,
            n_ops: 0,
            ..Default::default()
        });
        builder.write_key(&key, false);
        assert!(matches!(builder.finish(), Err(AerokvError::Param(_))));
    }

    #[test]
    fn oversized_bin_name_rejected() {
        let op = Operation::put("a-very-long-bin-name", Value::Int(1))
            .encode(SendBoolAs::Bool)
            .unwrap();
        let mut builder = MessageBuilder::new(MessageHeader {
            n_ops: 1,
            ..Default::default()
        });
        let err = builder.write_operation(&op).unwrap_err();
        assert!(matches!(err, AerokvError::Param(_)));
    }

    #[test]
    fn sent_key_survives_roundtrip() {
        let key = Key::new("test", "demo", "user-7").unwrap();
        let mut builder = MessageBuilder::new(MessageHeader {
            n_fields: MessageBuilder::key_field_count(&key, true),
            ..Default::default()
        });
        builder.write_key(&key, true);
        let frame = builder.finish().unwrap();

        let parsed = ParsedMessage::parse(&frame.payload).unwrap();
        let back = parsed.key().unwrap();
        assert_eq!(back.user_key, Some(UserKey::String("user-7".to_string())));
        assert_eq!(back.digest, key.digest);
    }

    #[test]
    fn parse_next_walks_concatenated_messages() {
        let a = build_single_put();
        let b = build_single_put();
        let mut joined = a.payload.to_vec();
        joined.extend_from_slice(&b.payload);

        let mut rest = joined.as_slice();
        let first = ParsedMessage::parse_next(&mut rest).unwrap();
        let second = ParsedMessage::parse_next(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(first.header.n_ops, 1);
        assert_eq!(second.header.n_ops, 1);
    }

    #[test]
    fn truncated_payload_rejected() {
        let frame = build_single_put();
        let cut = &frame.payload[..frame.payload.len() - 3];
        assert!(matches!(
            ParsedMessage::parse(cut),
            Err(AerokvError::Protocol(_))
        ));
    }

    #[test]
    fn header_size_mismatch_rejected() {
        let frame = build_single_put();
        let mut bad = frame.payload.to_vec();
        bad[0] = 30;
        assert!(matches!(
            ParsedMessage::parse(&bad),
            Err(AerokvError::Protocol(_))
        ));
    }
}
