//! Msgpack encoding for collection particles and CDT payloads.
//!
//! Strings, blobs and GeoJSON documents nested inside collections carry a
//! leading particle-type byte inside the msgpack raw body, and ordered
//! collections are marked with a fixext1 header element, matching the
//! server's extended msgpack dialect.

use bytes::{BufMut, BytesMut};

use crate::error::{AerokvError, Result};
use crate::value::{MapOrder, ParticleType, Value};

/// Packs a value into `buf` using the server's msgpack dialect.
///
/// The output is a deterministic function of the value: integers use the
/// smallest encoding that fits and ordered maps are serialized in sorted
/// key order.
pub fn pack_value(value: &Value, buf: &mut BytesMut) -> Result<()> {
    match value {
        Value::Nil => buf.put_u8(0xc0),
        Value::Bool(false) => buf.put_u8(0xc2),
        Value::Bool(true) => buf.put_u8(0xc3),
        Value::Int(v) => pack_int(*v, buf),
        Value::Float(v) => {
            buf.put_u8(0xcb);
            buf.put_f64(*v);
        }
        Value::String(s) => pack_raw(ParticleType::String, s.as_bytes(), buf)?,
        Value::GeoJson(s) => pack_raw(ParticleType::GeoJson, s.as_bytes(), buf)?,
        Value::Blob(b) => pack_raw(ParticleType::Blob, b, buf)?,
        Value::Hll(b) => pack_raw(ParticleType::Hll, b, buf)?,
        Value::List(items) => {
            pack_array_header(items.len(), buf)?;
            for item in items {
                pack_value(item, buf)?;
            }
        }
        Value::OrderedList(items) => {
            pack_array_header(items.len() + 1, buf)?;
            pack_ext_marker(1, buf);
            for item in items {
                pack_value(item, buf)?;
            }
        }
        Value::Map(entries) => pack_map(entries, MapOrder::Unordered, buf)?,
        Value::KeyOrderedMap(entries) => pack_map(entries, MapOrder::KeyOrdered, buf)?,
        Value::KeyValueOrderedMap(entries) => pack_map(entries, MapOrder::KeyValueOrdered, buf)?,
    }
    Ok(())
}

/// Packs a bare msgpack array header for CDT argument lists.
pub fn pack_array_header(len: usize, buf: &mut BytesMut) -> Result<()> {
    if len < 16 {
        buf.put_u8(0x90 | len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(0xdc);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(0xdd);
        buf.put_u32(len as u32);
    } else {
        return Err(AerokvError::Param(format!("list of {} elements", len)));
    }
    Ok(())
}

/// Packs an integer with the smallest msgpack encoding that fits.
pub fn pack_int(v: i64, buf: &mut BytesMut) {
    if (0..=0x7f).contains(&v) {
        buf.put_u8(v as u8);
    } else if (-32..0).contains(&v) {
        buf.put_i8(v as i8);
    } else if v >= 0 {
        if v <= u8::MAX as i64 {
            buf.put_u8(0xcc);
            buf.put_u8(v as u8);
        } else if v <= u16::MAX as i64 {
            buf.put_u8(0xcd);
            buf.put_u16(v as u16);
        } else if v <= u32::MAX as i64 {
            buf.put_u8(0xce);
            buf.put_u32(v as u32);
        } else {
            buf.put_u8(0xcf);
            buf.put_u64(v as u64);
        }
    } else if v >= i8::MIN as i64 {
        buf.put_u8(0xd0);
        buf.put_i8(v as i8);
    } else if v >= i16::MIN as i64 {
        buf.put_u8(0xd1);
        buf.put_i16(v as i16);
    } else if v >= i32::MIN as i64 {
        buf.put_u8(0xd2);
        buf.put_i32(v as i32);
    } else {
        buf.put_u8(0xd3);
        buf.put_i64(v);
    }
}

fn pack_raw(particle: ParticleType, body: &[u8], buf: &mut BytesMut) -> Result<()> {
    let len = body.len() + 1;
    if len < 32 {
        buf.put_u8(0xa0 | len as u8);
    } else if len <= u8::MAX as usize {
        buf.put_u8(0xd9);
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(0xda);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(0xdb);
        buf.put_u32(len as u32);
    } else {
        return Err(AerokvError::Param(format!("raw particle of {} bytes", len)));
    }
    buf.put_u8(particle as u8);
    buf.put_slice(body);
    Ok(())
}

fn pack_ext_marker(attribute: u8, buf: &mut BytesMut) {
    // fixext1 with the order attribute as the ext type byte.
    buf.put_u8(0xd4);
    buf.put_u8(attribute);
    buf.put_u8(0);
}

fn pack_map(entries: &[(Value, Value)], order: MapOrder, buf: &mut BytesMut) -> Result<()> {
    match order {
        MapOrder::Unordered => {
            pack_map_entries(entries.iter().map(|e| (&e.0, &e.1)), entries.len(), order, buf)
        }
        MapOrder::KeyOrdered | MapOrder::KeyValueOrdered => {
            let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.wire_cmp(&b.0).then_with(|| a.1.wire_cmp(&b.1)));
            pack_map_entries(sorted.into_iter().map(|e| (&e.0, &e.1)), entries.len(), order, buf)
        }
    }
}

fn pack_map_entries<'a>(
    entries: impl Iterator<Item = (&'a Value, &'a Value)>,
    len: usize,
    order: MapOrder,
    buf: &mut BytesMut,
) -> Result<()> {
    let header_len = if order == MapOrder::Unordered { len } else { len + 1 };
    if header_len < 16 {
        buf.put_u8(0x80 | header_len as u8);
    } else if header_len <= u16::MAX as usize {
        buf.put_u8(0xde);
        buf.put_u16(header_len as u16);
    } else if header_len <= u32::MAX as usize {
        buf.put_u8(0xdf);
        buf.put_u32(header_len as u32);
    } else {
        return Err(AerokvError::Param(format!("map of {} entries", header_len)));
    }
    if order != MapOrder::Unordered {
        pack_ext_marker(order.attribute(), buf);
        buf.put_u8(0xc0);
    }
    for (k, v) in entries {
        pack_value(k, buf)?;
        pack_value(v, buf)?;
    }
    Ok(())
}

/// Unpacks one value from the front of `input`, advancing the slice.
pub fn unpack_value(input: &mut &[u8]) -> Result<Value> {
    let tag = take_u8(input)?;
    match tag {
        0xc0 => Ok(Value::Nil),
        0xc2 => Ok(Value::Bool(false)),
        0xc3 => Ok(Value::Bool(true)),
        0x00..=0x7f => Ok(Value::Int(i64::from(tag))),
        0xe0..=0xff => Ok(Value::Int(i64::from(tag as i8))),
        0xcc => Ok(Value::Int(i64::from(take_u8(input)?))),
        0xcd => Ok(Value::Int(i64::from(take_u16(input)?))),
        0xce => Ok(Value::Int(i64::from(take_u32(input)?))),
        0xcf => {
            let v = take_u64(input)?;
            Value::from_u64(v)
                .map_err(|_| AerokvError::Protocol(format!("uint64 {} exceeds int64", v)))
        }
        0xd0 => Ok(Value::Int(i64::from(take_u8(input)? as i8))),
        0xd1 => Ok(Value::Int(i64::from(take_u16(input)? as i16))),
        0xd2 => Ok(Value::Int(i64::from(take_u32(input)? as i32))),
        0xd3 => Ok(Value::Int(take_u64(input)? as i64)),
        0xca => Ok(Value::Float(f64::from(f32::from_bits(take_u32(input)?)))),
        0xcb => Ok(Value::Float(f64::from_bits(take_u64(input)?))),
        0xa0..=0xbf => unpack_raw(usize::from(tag & 0x1f), input),
        0xd9 => {
            let len = usize::from(take_u8(input)?);
            unpack_raw(len, input)
        }
        0xda => {
            let len = usize::from(take_u16(input)?);
            unpack_raw(len, input)
        }
        0xdb => {
            let len = take_u32(input)? as usize;
            unpack_raw(len, input)
        }
        0xc4 => {
            let len = usize::from(take_u8(input)?);
            unpack_raw(len, input)
        }
        0xc5 => {
            let len = usize::from(take_u16(input)?);
            unpack_raw(len, input)
        }
        0xc6 => {
            let len = take_u32(input)? as usize;
            unpack_raw(len, input)
        }
        0x90..=0x9f => unpack_list(usize::from(tag & 0x0f), input),
        0xdc => {
            let len = usize::from(take_u16(input)?);
            unpack_list(len, input)
        }
        0xdd => {
            let len = take_u32(input)? as usize;
            unpack_list(len, input)
        }
        0x80..=0x8f => unpack_map(usize::from(tag & 0x0f), input),
        0xde => {
            let len = usize::from(take_u16(input)?);
            unpack_map(len, input)
        }
        0xdf => {
            let len = take_u32(input)? as usize;
            unpack_map(len, input)
        }
        other => Err(AerokvError::Protocol(format!(
            "unsupported msgpack tag 0x{:02x}",
            other
        ))),
    }
}

/// Peeks whether the next element is an order-attribute ext marker and
/// consumes it if so, returning the attribute byte.
fn take_ext_marker(input: &mut &[u8]) -> Result<Option<u8>> {
    match input.first() {
        Some(0xd4) => {
            take_u8(input)?;
            let attribute = take_u8(input)?;
            take_u8(input)?;
            Ok(Some(attribute))
        }
        Some(0xc7) => {
            take_u8(input)?;
            let len = usize::from(take_u8(input)?);
            let attribute = take_u8(input)?;
            take_bytes(input, len)?;
            Ok(Some(attribute))
        }
        _ => Ok(None),
    }
}

fn unpack_raw(len: usize, input: &mut &[u8]) -> Result<Value> {
    if len == 0 {
        return Ok(Value::String(String::new()));
    }
    let body = take_bytes(input, len)?;
    let (particle, rest) = (body[0], &body[1..]);
    match ParticleType::from_u8(particle)? {
        ParticleType::String => Ok(Value::String(
            String::from_utf8(rest.to_vec())
                .map_err(|e| AerokvError::Protocol(format!("invalid UTF-8 string: {}", e)))?,
        )),
        ParticleType::GeoJson => Ok(Value::GeoJson(
            String::from_utf8(rest.to_vec())
                .map_err(|e| AerokvError::Protocol(format!("invalid UTF-8 geojson: {}", e)))?,
        )),
        ParticleType::Hll => Ok(Value::Hll(rest.to_vec())),
        _ => Ok(Value::Blob(rest.to_vec())),
    }
}

fn unpack_list(len: usize, input: &mut &[u8]) -> Result<Value> {
    let mut remaining = len;
    let ordered = if remaining > 0 {
        match take_ext_marker(input)? {
            Some(_) => {
                remaining -= 1;
                true
            }
            None => false,
        }
    } else {
        false
    };

    let mut items = Vec::with_capacity(remaining);
    for _ in 0..remaining {
        items.push(unpack_value(input)?);
    }
    if ordered {
        Ok(Value::OrderedList(items))
    } else {
        Ok(Value::List(items))
    }
}

fn unpack_map(len: usize, input: &mut &[u8]) -> Result<Value> {
    let mut remaining = len;
    let mut attribute = 0;
    if remaining > 0 {
        if let Some(attr) = take_ext_marker(input)? {
            // The marker pair's value is a throwaway nil.
            unpack_value(input)?;
            attribute = attr;
            remaining -= 1;
        }
    }

    let mut entries = Vec::with_capacity(remaining);
    for _ in 0..remaining {
        let k = unpack_value(input)?;
        let v = unpack_value(input)?;
        entries.push((k, v));
    }
    match attribute {
        0 => Ok(Value::Map(entries)),
        1 => Ok(Value::KeyOrderedMap(entries)),
        3 => Ok(Value::KeyValueOrderedMap(entries)),
        other => Err(AerokvError::Protocol(format!(
            "unknown map order attribute {}",
            other
        ))),
    }
}

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    let b = take_bytes(input, 1)?;
    Ok(b[0])
}

fn take_u16(input: &mut &[u8]) -> Result<u16> {
    let b = take_bytes(input, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn take_u32(input: &mut &[u8]) -> Result<u32> {
    let b = take_bytes(input, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_u64(input: &mut &[u8]) -> Result<u64> {
    let b = take_bytes(input, 8)?;
    Ok(u64::from_be_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

fn take_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if input.len() < len {
        return Err(AerokvError::Protocol(format!(
            "truncated msgpack input: wanted {} bytes, {} remain",
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

    fn roundtrip(v: Value) {
        let mut buf = BytesMut::new();
        pack_value(&v, &mut buf).unwrap();
        let mut slice = &buf[..];
        let back = unpack_value(&mut slice).unwrap();
        assert_eq!(back, v);
        assert!(slice.is_empty(), "trailing bytes after {:?}", back);
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(Value::Nil);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(0));
        roundtrip(Value::Int(127));
        roundtrip(Value::Int(-32));
        roundtrip(Value::Int(300));
        roundtrip(Value::Int(-300));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Float(2.25));
        roundtrip(Value::String("hello".into()));
        roundtrip(Value::String(String::new()));
        roundtrip(Value::Blob(vec![0, 1, 2, 255]));
        roundtrip(Value::GeoJson("{\"type\":\"Point\"}".into()));
        roundtrip(Value::Hll(vec![9, 9, 9]));
    }

    #[test]
    fn string_payload_carries_particle_byte() {
        let mut buf = BytesMut::new();
        pack_value(&Value::String("a".into()), &mut buf).unwrap();
        // fixstr len 2: particle byte then the character.
        assert_eq!(&buf[..], [0xa2, 0x03, b'a']);
    }

    #[test]
    fn collection_roundtrips() {
        roundtrip(Value::List(vec![Value::Int(1), Value::String("x".into())]));
        roundtrip(Value::OrderedList(vec![Value::Int(3), Value::Int(1)]));
        roundtrip(Value::Map(vec![
            (Value::String("k".into()), Value::Int(1)),
            (Value::Int(2), Value::Bool(false)),
        ]));
        roundtrip(Value::List(vec![Value::Map(vec![(
            Value::String("nested".into()),
            Value::List(vec![Value::Nil]),
        )])]));
    }

    #[test]
    fn key_ordered_map_serializes_sorted() {
        let unsorted = Value::KeyOrderedMap(vec![
            (Value::String("b".into()), Value::Int(2)),
            (Value::String("a".into()), Value::Int(1)),
        ]);
        let sorted = Value::KeyOrderedMap(vec![
            (Value::String("a".into()), Value::Int(1)),
            (Value::String("b".into()), Value::Int(2)),
        ]);

        let mut lhs = BytesMut::new();
        let mut rhs = BytesMut::new();
        pack_value(&unsorted, &mut lhs).unwrap();
        pack_value(&sorted, &mut rhs).unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn ordered_map_has_ext_header() {
        let m = Value::KeyOrderedMap(vec![(Value::Int(1), Value::Int(2))]);
        let mut buf = BytesMut::new();
        pack_value(&m, &mut buf).unwrap();
        // 2-entry map header, then the fixext1 order marker pair.
        assert_eq!(&buf[..5], [0x82, 0xd4, 0x01, 0x00, 0xc0]);
    }

    #[test]
    fn mixed_key_types_sort_by_rank() {
        let m = Value::KeyOrderedMap(vec![
            (Value::String("s".into()), Value::Nil),
            (Value::Int(9), Value::Nil),
        ]);
        let mut buf = BytesMut::new();
        pack_value(&m, &mut buf).unwrap();
        let mut slice = &buf[..];
        match unpack_value(&mut slice).unwrap() {
            Value::KeyOrderedMap(entries) => {
                assert_eq!(entries[0].0, Value::Int(9));
                assert_eq!(entries[1].0, Value::String("s".into()));
            }
            other => panic!("expected ordered map, got {:?}", other),
        }
    }

    #[test]
    fn truncated_input_rejected() {
        let mut slice: &[u8] = &[0xcd, 0x01];
        assert!(matches!(
            unpack_value(&mut slice),
            Err(AerokvError::Protocol(_))
        ));
    }

    #[test]
    fn uint64_overflow_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xcf);
        buf.put_u64(u64::MAX);
        let mut slice = &buf[..];
        assert!(matches!(
            unpack_value(&mut slice),
            Err(AerokvError::Protocol(_))
        ));
    }
}
