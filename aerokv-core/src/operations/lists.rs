//! List bin operations.
//!
//! Each constructor yields an [`Operation`] ready for `operate`. A
//! context path selects a nested list when the bin holds a collection
//! of collections.

use super::{CdtContext, CdtKind, CdtOperation, Operation};
use crate::value::Value;

mod sub_op {
    pub const SET_ORDER: u16 = 0;
    pub const APPEND: u16 = 1;
    pub const APPEND_ITEMS: u16 = 2;
    pub const INSERT: u16 = 3;
    pub const INSERT_ITEMS: u16 = 4;
    pub const POP: u16 = 5;
    pub const POP_RANGE: u16 = 6;
    pub const REMOVE: u16 = 7;
    pub const REMOVE_RANGE: u16 = 8;
    pub const SET: u16 = 9;
    pub const TRIM: u16 = 10;
    pub const CLEAR: u16 = 11;
    pub const INCREMENT: u16 = 12;
    pub const SORT: u16 = 13;
    pub const SIZE: u16 = 16;
    pub const GET: u16 = 17;
    pub const GET_RANGE: u16 = 18;
    pub const GET_BY_INDEX: u16 = 19;
    pub const GET_BY_RANK: u16 = 21;
    pub const GET_BY_VALUE: u16 = 22;
    pub const GET_BY_VALUE_LIST: u16 = 23;
    pub const GET_BY_INDEX_RANGE: u16 = 24;
    pub const GET_BY_VALUE_INTERVAL: u16 = 25;
    pub const GET_BY_RANK_RANGE: u16 = 26;
    pub const GET_BY_VALUE_REL_RANK_RANGE: u16 = 27;
    pub const REMOVE_BY_INDEX: u16 = 32;
    pub const REMOVE_BY_RANK: u16 = 34;
    pub const REMOVE_BY_VALUE: u16 = 35;
    pub const REMOVE_BY_VALUE_LIST: u16 = 36;
    pub const REMOVE_BY_INDEX_RANGE: u16 = 37;
    pub const REMOVE_BY_VALUE_INTERVAL: u16 = 38;
    pub const REMOVE_BY_RANK_RANGE: u16 = 39;
    pub const REMOVE_BY_VALUE_REL_RANK_RANGE: u16 = 40;
}

/// Storage order of a list bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    /// Elements keep insertion order.
    #[default]
    Unordered,
    /// Elements are kept sorted by the canonical value ordering.
    Ordered,
}

impl ListOrder {
    fn attribute(self) -> i64 {
        match self {
            ListOrder::Unordered => 0,
            ListOrder::Ordered => 1,
        }
    }
}

/// Modify-operation behavior flags; combine with `|`.
pub mod write_flags {
    /// Default behavior.
    pub const DEFAULT: u8 = 0;
    /// Only add values not already present.
    pub const ADD_UNIQUE: u8 = 1;
    /// Refuse inserts past the end of the list.
    pub const INSERT_BOUNDED: u8 = 2;
    /// Turn policy violations into no-ops instead of errors.
    pub const NO_FAIL: u8 = 4;
    /// With `NO_FAIL`, apply the acceptable subset of a multi-value write.
    pub const PARTIAL: u8 = 8;
}

/// Order and write flags applied by list modify operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListPolicy {
    /// Order given to the list if the operation creates it.
    pub order: ListOrder,
    /// Combination of [`write_flags`] values.
    pub flags: u8,
}

impl ListPolicy {
    /// Policy with the given order and flags.
    pub fn new(order: ListOrder, flags: u8) -> Self {
        Self { order, flags }
    }
}

/// What a list read or remove operation returns per selected element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListReturnType(i64);

impl ListReturnType {
    /// No result.
    pub const NONE: Self = Self(0);
    /// Index from the front.
    pub const INDEX: Self = Self(1);
    /// Index from the back.
    pub const REVERSE_INDEX: Self = Self(2);
    /// Rank in the canonical ordering.
    pub const RANK: Self = Self(3);
    /// Rank from the largest value down.
    pub const REVERSE_RANK: Self = Self(4);
    /// Number of selected elements.
    pub const COUNT: Self = Self(5);
    /// The element values.
    pub const VALUE: Self = Self(7);
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
    Operation::Cdt(CdtOperation::new(CdtKind::ListRead, bin, sub_op, args, ctx))
}

fn modify(bin: &str, sub_op: u16, args: Vec<Value>, ctx: &[CdtContext]) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::ListModify, bin, sub_op, args, ctx))
}

/// Sets the order of an existing list.
pub fn set_order(bin: &str, order: ListOrder, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::SET_ORDER, vec![Value::Int(order.attribute())], ctx)
}

/// Appends one value; returns the new length.
pub fn append(policy: ListPolicy, bin: &str, value: Value, ctx: &[CdtContext]) -> Operation {
    modify(
        bin,
        sub_op::APPEND,
        vec![
            value,
            Value::Int(policy.order.attribute()),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Appends several values; returns the new length.
pub fn append_items(
    policy: ListPolicy,
    bin: &str,
    values: Vec<Value>,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::APPEND_ITEMS,
        vec![
            Value::List(values),
            Value::Int(policy.order.attribute()),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Inserts one value at `index`; returns the new length.
pub fn insert(
    policy: ListPolicy,
    bin: &str,
    index: i64,
    value: Value,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::INSERT,
        vec![Value::Int(index), value, Value::Int(i64::from(policy.flags))],
        ctx,
    )
}

/// Inserts several values starting at `index`; returns the new length.
pub fn insert_items(
    policy: ListPolicy,
    bin: &str,
    index: i64,
    values: Vec<Value>,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::INSERT_ITEMS,
        vec![
            Value::Int(index),
            Value::List(values),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Removes and returns the element at `index`.
pub fn pop(bin: &str, index: i64, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::POP, vec![Value::Int(index)], ctx)
}

/// Removes and returns `count` elements starting at `index`.
pub fn pop_range(bin: &str, index: i64, count: i64, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::POP_RANGE, vec![Value::Int(index), Value::Int(count)], ctx)
}

/// Removes and returns every element from `index` to the end.
pub fn pop_range_from(bin: &str, index: i64, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::POP_RANGE, vec![Value::Int(index)], ctx)
}

/// Removes the element at `index`; returns the removal count.
pub fn remove(bin: &str, index: i64, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::REMOVE, vec![Value::Int(index)], ctx)
}

/// Removes `count` elements starting at `index`; returns the removal count.
pub fn remove_range(bin: &str, index: i64, count: i64, ctx: &[CdtContext]) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_RANGE,
        vec![Value::Int(index), Value::Int(count)],
        ctx,
    )
}

/// Removes every element from `index` to the end.
pub fn remove_range_from(bin: &str, index: i64, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::REMOVE_RANGE, vec![Value::Int(index)], ctx)
}

/// Replaces the element at `index`.
pub fn set(policy: ListPolicy, bin: &str, index: i64, value: Value, ctx: &[CdtContext]) -> Operation {
    modify(
        bin,
        sub_op::SET,
        vec![Value::Int(index), value, Value::Int(i64::from(policy.flags))],
        ctx,
    )
}

/// Removes everything outside `[index, index + count)`.
pub fn trim(bin: &str, index: i64, count: i64, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::TRIM, vec![Value::Int(index), Value::Int(count)], ctx)
}

/// Removes every element, keeping the bin.
pub fn clear(bin: &str, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::CLEAR, vec![], ctx)
}

/// Adds `delta` to the numeric element at `index`, creating it as zero
/// first if absent; returns the new value.
pub fn increment(
    policy: ListPolicy,
    bin: &str,
    index: i64,
    delta: Value,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::INCREMENT,
        vec![
            Value::Int(index),
            delta,
            Value::Int(policy.order.attribute()),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Flags for [`sort`].
pub mod sort_flags {
    /// Ascending sort keeping duplicates.
    pub const DEFAULT: u8 = 0;
    /// Sort descending.
    pub const DESCENDING: u8 = 1;
    /// Drop duplicate values while sorting.
    pub const DROP_DUPLICATES: u8 = 2;
}

/// Sorts the list in place.
pub fn sort(bin: &str, flags: u8, ctx: &[CdtContext]) -> Operation {
    modify(bin, sub_op::SORT, vec![Value::Int(i64::from(flags))], ctx)
}

/// Returns the element count.
pub fn size(bin: &str, ctx: &[CdtContext]) -> Operation {
    read(bin, sub_op::SIZE, vec![], ctx)
}

/// Returns the element at `index`.
pub fn get(bin: &str, index: i64, ctx: &[CdtContext]) -> Operation {
    read(bin, sub_op::GET, vec![Value::Int(index)], ctx)
}

/// Returns `count` elements starting at `index`.
pub fn get_range(bin: &str, index: i64, count: i64, ctx: &[CdtContext]) -> Operation {
    read(bin, sub_op::GET_RANGE, vec![Value::Int(index), Value::Int(count)], ctx)
}

/// Returns every element from `index` to the end.
pub fn get_range_from(bin: &str, index: i64, ctx: &[CdtContext]) -> Operation {
    read(bin, sub_op::GET_RANGE, vec![Value::Int(index)], ctx)
}

/// Selects the element at `index`.
pub fn get_by_index(
    bin: &str,
    index: i64,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_INDEX,
        vec![return_type.wire(), Value::Int(index)],
        ctx,
    )
}

/// Selects `count` elements starting at `index`.
pub fn get_by_index_range(
    bin: &str,
    index: i64,
    count: Option<i64>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(index)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_INDEX_RANGE, args, ctx)
}

/// Selects the element with the given rank.
pub fn get_by_rank(
    bin: &str,
    rank: i64,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_RANK,
        vec![return_type.wire(), Value::Int(rank)],
        ctx,
    )
}

/// Selects `count` elements starting at the given rank.
pub fn get_by_rank_range(
    bin: &str,
    rank: i64,
    count: Option<i64>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_RANK_RANGE, args, ctx)
}

/// Selects every element equal to `value`.
pub fn get_by_value(
    bin: &str,
    value: Value,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(bin, sub_op::GET_BY_VALUE, vec![return_type.wire(), value], ctx)
}

/// Selects every element equal to one of `values`.
pub fn get_by_value_list(
    bin: &str,
    values: Vec<Value>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_VALUE_LIST,
        vec![return_type.wire(), Value::List(values)],
        ctx,
    )
}

/// Selects elements in `[begin, end)` by value; `Value::Nil` leaves an
/// end open.
pub fn get_by_value_range(
    bin: &str,
    begin: Value,
    end: Value,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    read(
        bin,
        sub_op::GET_BY_VALUE_INTERVAL,
        vec![return_type.wire(), begin, end],
        ctx,
    )
}

/// Selects elements whose rank relative to `value` falls in the range.
pub fn get_by_value_rel_rank_range(
    bin: &str,
    value: Value,
    rank: i64,
    count: Option<i64>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), value, Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    read(bin, sub_op::GET_BY_VALUE_REL_RANK_RANGE, args, ctx)
}

/// Removes the element at `index`.
pub fn remove_by_index(
    bin: &str,
    index: i64,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_INDEX,
        vec![return_type.wire(), Value::Int(index)],
        ctx,
    )
}

/// Removes `count` elements starting at `index`.
pub fn remove_by_index_range(
    bin: &str,
    index: i64,
    count: Option<i64>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(index)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_INDEX_RANGE, args, ctx)
}

/// Removes the element with the given rank.
pub fn remove_by_rank(
    bin: &str,
    rank: i64,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_RANK,
        vec![return_type.wire(), Value::Int(rank)],
        ctx,
    )
}

/// Removes `count` elements starting at the given rank.
pub fn remove_by_rank_range(
    bin: &str,
    rank: i64,
    count: Option<i64>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_RANK_RANGE, args, ctx)
}

/// Removes every element equal to `value`.
pub fn remove_by_value(
    bin: &str,
    value: Value,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(bin, sub_op::REMOVE_BY_VALUE, vec![return_type.wire(), value], ctx)
}

/// Removes every element equal to one of `values`.
pub fn remove_by_value_list(
    bin: &str,
    values: Vec<Value>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_VALUE_LIST,
        vec![return_type.wire(), Value::List(values)],
        ctx,
    )
}

/// Removes elements in `[begin, end)` by value; `Value::Nil` leaves an
/// end open.
pub fn remove_by_value_range(
    bin: &str,
    begin: Value,
    end: Value,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE_BY_VALUE_INTERVAL,
        vec![return_type.wire(), begin, end],
        ctx,
    )
}

/// Removes elements whose rank relative to `value` falls in the range.
pub fn remove_by_value_rel_rank_range(
    bin: &str,
    value: Value,
    rank: i64,
    count: Option<i64>,
    return_type: ListReturnType,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![return_type.wire(), value, Value::Int(rank)];
    if let Some(count) = count {
        args.push(Value::Int(count));
    }
    modify(bin, sub_op::REMOVE_BY_VALUE_REL_RANK_RANGE, args, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SendBoolAs;

    fn payload(op: Operation) -> Vec<u8> {
        op.encode(SendBoolAs::Bool).unwrap().payload.to_vec()
    }

    #[test]
    fn append_args() {
        let op = append(ListPolicy::default(), "l", Value::Int(7), &[]);
        // [1, 7, 0, 0]
        assert_eq!(payload(op), [0x94, 0x01, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn append_carries_policy() {
        let policy = ListPolicy::new(ListOrder::Ordered, write_flags::ADD_UNIQUE);
        let op = append(policy, "l", Value::Int(7), &[]);
        assert_eq!(payload(op), [0x94, 0x01, 0x07, 0x01, 0x01]);
    }

    #[test]
    fn get_by_index_range_omits_open_count() {
        let bounded = get_by_index_range("l", 1, Some(3), ListReturnType::VALUE, &[]);
        assert_eq!(payload(bounded), [0x94, 0x18, 0x07, 0x01, 0x03]);

        let open = get_by_index_range("l", 1, None, ListReturnType::VALUE, &[]);
        assert_eq!(payload(open), [0x93, 0x18, 0x07, 0x01]);
    }

    #[test]
    fn value_interval_uses_nil_for_open_end() {
        let op = get_by_value_range("l", Value::Int(5), Value::Nil, ListReturnType::COUNT, &[]);
        assert_eq!(payload(op), [0x94, 0x19, 0x05, 0x05, 0xc0]);
    }

    #[test]
    fn inverted_return_type_sets_flag() {
        let rt = ListReturnType::COUNT.inverted();
        assert_eq!(rt.wire(), Value::Int(0x10005));
    }
}
