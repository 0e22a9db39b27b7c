//! Map bin operations.
//!
//! Keys inside one map are unique; rank-based selectors order entries
//! by value using the canonical value ordering.

use super::{CdtContext, CdtKind, CdtOperation, Operation};
use crate::value::{MapOrder, Value};

mod sub_op {
    pub const SET_ORDER: u16 = 64;
    pub const PUT: u16 = 67;
    pub const PUT_ITEMS: u16 = 68;
    pub const INCREMENT: u16 = 73;
    pub const DECREMENT: u16 = 74;
    pub const CLEAR: u16 = 75;
    pub const REMOVE_BY_KEY: u16 = 76;
    pub const REMOVE_BY_INDEX: u16 = 77;
    pub const REMOVE_BY_RANK: u16 = 79;
    pub const REMOVE_BY_KEY_LIST: u16 = 81;
    pub const REMOVE_BY_VALUE: u16 = 82;
    pub const REMOVE_BY_VALUE_LIST: u16 = 83;
    pub const REMOVE_BY_KEY_INTERVAL: u16 = 84;
    pub const REMOVE_BY_INDEX_RANGE: u16 = 85;
    pub const REMOVE_BY_VALUE_INTERVAL: u16 = 86;
    pub const REMOVE_BY_RANK_RANGE: u16 = 87;
    pub const REMOVE_BY_KEY_REL_INDEX_RANGE: u16 = 88;
    pub const REMOVE_BY_VALUE_REL_RANK_RANGE: u16 = 89;
    pub const SIZE: u16 = 96;
    pub const GET_BY_KEY: u16 = 97;
    pub const GET_BY_INDEX: u16 = 98;
    pub const GET_BY_RANK: u16 = 100;
    pub const GET_BY_VALUE: u16 = 102;
    pub const GET_BY_KEY_INTERVAL: u16 = 103;
    pub const GET_BY_INDEX_RANGE: u16 = 104;
    pub const GET_BY_VALUE_INTERVAL: u16 = 105;
    pub const GET_BY_RANK_RANGE: u16 = 106;
    pub const GET_BY_KEY_LIST: u16 = 107;
    pub const GET_BY_VALUE_LIST: u16 = 108;
    pub const GET_BY_KEY_REL_INDEX_RANGE: u16 = 109;
    pub const GET_BY_VALUE_REL_RANK_RANGE: u16 = 110;
}

/// Write-mode flags for map modify operations; combine with `|`.
pub mod write_flags {
    /// Create or update entries freely.
    pub const DEFAULT: u8 = 0;
    /// Only create new keys; fail on existing ones.
    pub const CREATE_ONLY: u8 = 1;
    /// Only update existing keys; fail on missing ones.
    pub const UPDATE_ONLY: u8 = 2;
    /// Turn policy violations into no-ops instead of errors.
    pub const NO_FAIL: u8 = 4;
    /// With `NO_FAIL`, apply the acceptable subset of a multi-entry write.
    pub const PARTIAL: u8 = 8;
}

/// Order and write flags applied by map modify operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapPolicy {
    /// Order given to the map if the operation creates it.
    pub order: MapOrder,
    /// Combination of [`write_flags`] values.
    pub flags: u8,
}

impl MapPolicy {
    /// Policy with the given order and flags.
    pub fn new(order: MapOrder, flags: u8) -> Self {
        Self { order, flags }
    }
}

/// What a map read or remove operation returns per selected entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapReturnType(i64);

impl MapReturnType {
    /// No result.
    pub const NONE: Self = Self(0);
    /// Index from the front.
    pub const INDEX: Self = Self(1);
    /// Index from the back.
    pub const REVERSE_INDEX: Self = Self(2);
    /// Rank by value.
    pub const RANK: Self = Self(3);
    /// Rank from the largest value down.
    pub const REVERSE_RANK: Self = Self(4);
    /// Number of selected entries.
    pub const COUNT: Self = Self(5);
    /// The entry keys.
    pub const KEY: Self = Self(6);
    /// The entry values.
    pub const VALUE: Self = Self(7);
    /// Key-value pairs.
    pub const KEY_VALUE: Self = Self(8);
    /// Whether anything was selected.
    pub const EXISTS: Self = Self(13);

    const INVERTED_FLAG: i64 = 0x10000;

    /// Selects the complement of the match instead.
    pub fn inverted(self) -> Self {
        Self(self.0 | Self::INVERTED_FLAG)
    }

    fn wire(self) -> Value {
        Value::Int(self.0)
    }
}

fn read(bin: &str, sub_op: u16, args: Vec<Value>, ctx: &[CdtContext]) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::MapRead, bin, sub_op, args, ctx))
}

fn modify(bin: &str, sub_op: u16, args: Vec<Value>, ctx: &[CdtContext]) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::MapModify, bin, sub_op, args, ctx))
}

/// Sets the order of an existing map.
pub fn set_order(bin: &str, order: MapOrder, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::SET_ORDER, vec![Value::Int(i64::from(order.attribute()))], ctx)
}

/// Writes one entry; returns the new entry count.
pub fn put(policy: MapPolicy, bin: &str, key: Value, value: Value, ctx: &[CdtContext]) -> Operation {
    modify(
        bin,
        sub_op::PUT,
        vec![
            key,
            value,
            Value::Int(i64::from(policy.order.attribute())),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Writes several entries; returns the new entry count.
pub fn put_items(
    policy: MapPolicy,
    bin: &str,
    items: Vec<(Value, Value)>,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::PUT_ITEMS,
        vec![
            Value::Map(items),
            Value::Int(i64::from(policy.order.attribute())),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Adds `delta` to the numeric value under `key`, creating the entry as
/// zero first if absent; returns the new value.
pub fn increment(
    policy: MapPolicy,
    bin: &str,
    key: Value,
    delta: Value,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::INCREMENT,
        vec![key, delta, Value::Int(i64::from(policy.order.attribute()))],
        ctx,
    )
}

/// Subtracts `delta` from the numeric value under `key`.
pub fn decrement(
    policy: MapPolicy,
    bin: &str,
    key: Value,
    delta: Value,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::DECREMENT,
        vec![key, delta, Value::Int(i64::from(policy.order.attribute()))],
        ctx,
    )
}

/// Removes every entry, keeping the bin.
pub fn clear(bin: &str, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::CLEAR, vec![], ctx)
}

/// Returns the entry count.
pub fn size(bin: &str, ctx: &[CdtContext]) -> Operation {
    read(bin, sub_op::SIZE, vec![], ctx)
}

/// Selects the entry under `key`.
pub fn get_by_key(bin: &str, key: Value, return_type: MapReturnType, ctx: &[CdtContext]) -> Operation {
    read(bin, sub_op::GET_BY_KEY, vec![return_type.wire(), key], ctx)
}

/// Selects entries whose key falls in `[begin, end)`; `Value::Nil`
/// leaves an end open.
pub fn get_by_key_range(
    bin: &str,
    begin: Value,
    end: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_KEY_INTERVAL,
        vec![return_type.wire(), begin, end],
        ctx,
    )
}

/// Selects entries under any of `keys`.
pub fn get_by_key_list(
    bin: &str,
    keys: Vec<Value>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_KEY_LIST,
        vec![return_type.wire(), Value::List(keys)],
        ctx,
    )
}

/// Selects entries whose index relative to `key` falls in the range.
pub fn get_by_key_rel_index_range(
    bin: &str,
    key: Value,
    index: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), key, Value::Int(index)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_KEY_REL_INDEX_RANGE, args, ctx)
}

/// Selects entries with the given value.
pub fn get_by_value(
    bin: &str,
    value: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(bin, sub_op::GET_BY_VALUE, vec![return_type.wire(), value], ctx)
}

/// Selects entries whose value is one of `values`.
pub fn get_by_value_list(
    bin: &str,
    values: Vec<Value>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_VALUE_LIST,
        vec![return_type.wire(), Value::List(values)],
        ctx,
    )
}

/// Selects entries whose value falls in `[begin, end)`.
pub fn get_by_value_range(
    bin: &str,
    begin: Value,
    end: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_VALUE_INTERVAL,
        vec![return_type.wire(), begin, end],
        ctx,
    )
}

/// Selects entries whose rank relative to `value` falls in the range.
pub fn get_by_value_rel_rank_range(
    bin: &str,
    value: Value,
    rank: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), value, Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_VALUE_REL_RANK_RANGE, args, ctx)
}

/// Selects the entry at `index` in key order.
pub fn get_by_index(
    bin: &str,
    index: i64,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_INDEX,
        vec![return_type.wire(), Value::Int(index)],
        ctx,
    )
}

/// Selects `count` entries starting at `index` in key order.
pub fn get_by_index_range(
    bin: &str,
    index: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(index)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_INDEX_RANGE, args, ctx)
}

/// Selects the entry with the given value rank.
pub fn get_by_rank(
    bin: &str,
    rank: i64,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_RANK,
        vec![return_type.wire(), Value::Int(rank)],
        ctx,
    )
}

/// Selects `count` entries starting at the given value rank.
pub fn get_by_rank_range(
    bin: &str,
    rank: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_RANK_RANGE, args, ctx)
}

/// Removes the entry under `key`.
pub fn remove_by_key(
    bin: &str,
    key: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(bin, sub_op::REMOVE_BY_KEY, vec![return_type.wire(), key], ctx)
}

/// Removes entries under any of `keys`.
pub fn remove_by_key_list(
    bin: &str,
    keys: Vec<Value>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_KEY_LIST,
        vec![return_type.wire(), Value::List(keys)],
        ctx,
    )
}

/// Removes entries whose key falls in `[begin, end)`.
pub fn remove_by_key_range(
    bin: &str,
    begin: Value,
    end: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_KEY_INTERVAL,
        vec![return_type.wire(), begin, end],
        ctx,
    )
}

/// Removes entries whose index relative to `key` falls in the range.
pub fn remove_by_key_rel_index_range(
    bin: &str,
    key: Value,
    index: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), key, Value::Int(index)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_KEY_REL_INDEX_RANGE, args, ctx)
}

/// Removes entries with the given value.
pub fn remove_by_value(
    bin: &str,
    value: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(bin, sub_op::REMOVE_BY_VALUE, vec![return_type.wire(), value], ctx)
}

/// Removes entries whose value is one of `values`.
pub fn remove_by_value_list(
    bin: &str,
    values: Vec<Value>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_VALUE_LIST,
        vec![return_type.wire(), Value::List(values)],
        ctx,
    )
}

/// Removes entries whose value falls in `[begin, end)`.
pub fn remove_by_value_range(
    bin: &str,
    begin: Value,
    end: Value,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_VALUE_INTERVAL,
        vec![return_type.wire(), begin, end],
        ctx,
    )
}

/// Removes entries whose rank relative to `value` falls in the range.
pub fn remove_by_value_rel_rank_range(
    bin: &str,
    value: Value,
    rank: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), value, Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_VALUE_REL_RANK_RANGE, args, ctx)
}

/// Removes the entry at `index` in key order.
pub fn remove_by_index(
    bin: &str,
    index: i64,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_INDEX,
        vec![return_type.wire(), Value::Int(index)],
        ctx,
    )
}

/// Removes `count` entries starting at `index` in key order.
pub fn remove_by_index_range(
    bin: &str,
    index: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(index)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_INDEX_RANGE, args, ctx)
}

/// Removes the entry with the given value rank.
pub fn remove_by_rank(
    bin: &str,
    rank: i64,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_RANK,
        vec![return_type.wire(), Value::Int(rank)],
        ctx,
    )
}

/// Removes `count` entries starting at the given value rank.
pub fn remove_by_rank_range(
    bin: &str,
    rank: i64,
    count: Option<i64>,
    return_type: MapReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_RANK_RANGE, args, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SendBoolAs;

    fn payload(op: Operation) -> Vec<u8> {
        op.encode(SendBoolAs::Bool).unwrap().payload.to_vec()
    }

    #[test]
    fn put_args() {
        let op = put(MapPolicy::default(), "m", Value::Int(1), Value::Int(2), &[]);
        // [67, 1, 2, 0, 0]
        assert_eq!(payload(op), [0x95, 0x43, 0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn put_carries_order_attribute() {
        let policy = MapPolicy::new(MapOrder::KeyOrdered, write_flags::CREATE_ONLY);
        let op = put(policy, "m", Value::Int(1), Value::Int(2), &[]);
        assert_eq!(payload(op), [0x95, 0x43, 0x01, 0x02, 0x01, 0x01]);
    }

    #[test]
    fn get_by_key_is_read() {
        let op = get_by_key("m", Value::String("a".into()), MapReturnType::VALUE, &[]);
        assert!(op.is_read());
        // [97, 7, "a"] with the raw-string particle prefix.
        assert_eq!(payload(op), [0x93, 0x61, 0x07, 0xa2, 0x03, 0x61]);
    }

    #[test]
    fn rank_range_open_count() {
        let op = remove_by_rank_range("m", -2, None, MapReturnType::KEY_VALUE, &[]);
        assert_eq!(payload(op), [0x93, 0x57, 0x08, 0xfe]);
    }
}
