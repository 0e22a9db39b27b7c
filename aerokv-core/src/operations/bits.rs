//! Bitwise operations on blob bins.
//!
//! Offsets and sizes are in bits unless a constructor says otherwise;
//! negative offsets count back from the end of the blob.

use super::{CdtContext, CdtKind, CdtOperation, Operation};
use crate::value::Value;

mod sub_op {
    pub const RESIZE: u16 = 0;
    pub const INSERT: u16 = 1;
    pub const REMOVE: u16 = 2;
    pub const SET: u16 = 3;
    pub const OR: u16 = 4;
    pub const XOR: u16 = 5;
    pub const AND: u16 = 6;
    pub const NOT: u16 = 7;
    pub const LSHIFT: u16 = 8;
    pub const RSHIFT: u16 = 9;
    pub const ADD: u16 = 10;
    pub const SUBTRACT: u16 = 11;
    pub const SET_INT: u16 = 12;
    pub const GET: u16 = 50;
    pub const COUNT: u16 = 51;
    pub const LSCAN: u16 = 52;
    pub const RSCAN: u16 = 53;
    pub const GET_INT: u16 = 54;
}

/// Write-mode flags for bitwise modify operations; combine with `|`.
pub mod write_flags {
    /// Create or update the blob freely.
    pub const DEFAULT: u8 = 0;
    /// Only create a new blob; fail if the bin exists.
    pub const CREATE_ONLY: u8 = 1;
    /// Only update an existing blob; fail if the bin is missing.
    pub const UPDATE_ONLY: u8 = 2;
    /// Refuse writes that would grow the blob.
    pub const NO_FAIL: u8 = 4;
    /// With `NO_FAIL`, apply the acceptable part of a partial write.
    pub const PARTIAL: u8 = 8;
}

/// Flags for [`resize`].
pub mod resize_flags {
    /// Grow or shrink at the end.
    pub const DEFAULT: u8 = 0;
    /// Grow or shrink at the front instead.
    pub const FROM_FRONT: u8 = 1;
    /// Only allow growing.
    pub const GROW_ONLY: u8 = 2;
    /// Only allow shrinking.
    pub const SHRINK_ONLY: u8 = 4;
}

/// Overflow behavior for [`add`] and [`subtract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowAction {
    /// Fail the operation on overflow.
    #[default]
    Fail,
    /// Saturate at the representable extreme.
    Saturate,
    /// Wrap around.
    Wrap,
}

impl OverflowAction {
    fn wire(self) -> i64 {
        match self {
            OverflowAction::Fail => 0,
            OverflowAction::Saturate => 2,
            OverflowAction::Wrap => 4,
        }
    }
}

/// Flags applied by bitwise modify operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitPolicy {
    /// Combination of [`write_flags`] values.
    pub flags: u8,
}

impl BitPolicy {
    /// Policy with the given flags.
    pub fn new(flags: u8) -> Self {
        Self { flags }
    }
}

fn read(bin: &str, sub_op: u16, args: Vec<Value>, ctx: &[CdtContext]) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::BitRead, bin, sub_op, args, ctx))
}

fn modify(bin: &str, sub_op: u16, args: Vec<Value>, ctx: &[CdtContext]) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::BitModify, bin, sub_op, args, ctx))
}

/// Resizes the blob to `byte_size` bytes.
pub fn resize(
    policy: BitPolicy,
    bin: &str,
    byte_size: i64,
    resize_flags: u8,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::RESIZE,
        vec![
            Value::Int(byte_size),
            Value::Int(i64::from(policy.flags)),
            Value::Int(i64::from(resize_flags)),
        ],
        ctx,
    )
}

/// Inserts `value` at `byte_offset`.
pub fn insert(
    policy: BitPolicy,
    bin: &str,
    byte_offset: i64,
    value: Vec<u8>,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::INSERT,
        vec![
            Value::Int(byte_offset),
            Value::Blob(value),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Removes `byte_size` bytes starting at `byte_offset`.
pub fn remove(
    policy: BitPolicy,
    bin: &str,
    byte_offset: i64,
    byte_size: i64,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::REMOVE,
        vec![
            Value::Int(byte_offset),
            Value::Int(byte_size),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Overwrites `bit_size` bits at `bit_offset` with `value`.
pub fn set(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: Vec<u8>,
    ctx: &[CdtContext],
) -> Operation {
    bitwise(policy, bin, sub_op::SET, bit_offset, bit_size, value, ctx)
}

/// ORs `value` into `bit_size` bits at `bit_offset`.
pub fn or(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: Vec<u8>,
    ctx: &[CdtContext],
) -> Operation {
    bitwise(policy, bin, sub_op::OR, bit_offset, bit_size, value, ctx)
}

/// XORs `value` into `bit_size` bits at `bit_offset`.
pub fn xor(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: Vec<u8>,
    ctx: &[CdtContext],
) -> Operation {
    bitwise(policy, bin, sub_op::XOR, bit_offset, bit_size, value, ctx)
}

/// ANDs `value` into `bit_size` bits at `bit_offset`.
pub fn and(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: Vec<u8>,
    ctx: &[CdtContext],
) -> Operation {
    bitwise(policy, bin, sub_op::AND, bit_offset, bit_size, value, ctx)
}

fn bitwise(
    policy: BitPolicy,
    bin: &str,
    sub: u16,
    bit_offset: i64,
    bit_size: i64,
    value: Vec<u8>,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub,
        vec![
            Value::Int(bit_offset),
            Value::Int(bit_size),
            Value::Blob(value),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Inverts `bit_size` bits at `bit_offset`.
pub fn not(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::NOT,
        vec![
            Value::Int(bit_offset),
            Value::Int(bit_size),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Shifts `bit_size` bits at `bit_offset` left by `shift`.
pub fn lshift(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    shift: i64,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::LSHIFT,
        vec![
            Value::Int(bit_offset),
            Value::Int(bit_size),
            Value::Int(shift),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Shifts `bit_size` bits at `bit_offset` right by `shift`.
pub fn rshift(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    shift: i64,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::RSHIFT,
        vec![
            Value::Int(bit_offset),
            Value::Int(bit_size),
            Value::Int(shift),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Adds `value` to the integer held in `bit_size` bits at `bit_offset`.
#[allow(clippy::too_many_arguments)]
pub fn add(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: i64,
    signed: bool,
    action: OverflowAction,
    ctx: &[CdtContext],
) -> Operation {
    arithmetic(policy, bin, sub_op::ADD, bit_offset, bit_size, value, signed, action, ctx)
}

/// Subtracts `value` from the integer held in `bit_size` bits at
/// `bit_offset`.
#[allow(clippy::too_many_arguments)]
pub fn subtract(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: i64,
    signed: bool,
    action: OverflowAction,
    ctx: &[CdtContext],
) -> Operation {
    arithmetic(
        policy,
        bin,
        sub_op::SUBTRACT,
        bit_offset,
        bit_size,
        value,
        signed,
        action,
        ctx,
    )
}

#[allow(clippy::too_many_arguments)]
fn arithmetic(
    policy: BitPolicy,
    bin: &str,
    sub: u16,
    bit_offset: i64,
    bit_size: i64,
    value: i64,
    signed: bool,
    action: OverflowAction,
    ctx: &[CdtContext],
) -> Operation {
    // The sign bit rides in the action flags.
    let mut action_flags = action.wire();
    if signed {
        action_flags |= 1;
    }
    modify(
        bin,
        sub,
        vec![
            Value::Int(bit_offset),
            Value::Int(bit_size),
            Value::Int(value),
            Value::Int(i64::from(policy.flags)),
            Value::Int(action_flags),
        ],
        ctx,
    )
}

/// Stores `value` as an integer in `bit_size` bits at `bit_offset`.
pub fn set_int(
    policy: BitPolicy,
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    value: i64,
    ctx: &[CdtContext],
) -> Operation {
    modify(
        bin,
        sub_op::SET_INT,
        vec![
            Value::Int(bit_offset),
            Value::Int(bit_size),
            Value::Int(value),
            Value::Int(i64::from(policy.flags)),
        ],
        ctx,
    )
}

/// Returns `bit_size` bits at `bit_offset` as a blob.
pub fn get(bin: &str, bit_offset: i64, bit_size: i64, ctx: &[CdtContext]) -> Operation {
    read(
        bin,
        sub_op::GET,
        vec![Value::Int(bit_offset), Value::Int(bit_size)],
        ctx,
    )
}

/// Counts set bits in `bit_size` bits at `bit_offset`.
pub fn count(bin: &str, bit_offset: i64, bit_size: i64, ctx: &[CdtContext]) -> Operation {
    read(
        bin,
        sub_op::COUNT,
        vec![Value::Int(bit_offset), Value::Int(bit_size)],
        ctx,
    )
}

/// Finds the first bit equal to `value`, scanning from the left.
pub fn lscan(bin: &str, bit_offset: i64, bit_size: i64, value: bool, ctx: &[CdtContext]) -> Operation {
    read(
        bin,
        sub_op::LSCAN,
        vec![Value::Int(bit_offset), Value::Int(bit_size), Value::Bool(value)],
        ctx,
    )
}

/// Finds the first bit equal to `value`, scanning from the right.
pub fn rscan(bin: &str, bit_offset: i64, bit_size: i64, value: bool, ctx: &[CdtContext]) -> Operation {
    read(
        bin,
        sub_op::RSCAN,
        vec![Value::Int(bit_offset), Value::Int(bit_size), Value::Bool(value)],
        ctx,
    )
}

/// Returns `bit_size` bits at `bit_offset` as an integer.
pub fn get_int(
    bin: &str,
    bit_offset: i64,
    bit_size: i64,
    signed: bool,
    ctx: &[CdtContext],
) -> Operation {
    let mut args = vec![Value::Int(bit_offset), Value::Int(bit_size)];
    if signed {
        args.push(Value::Int(1));
    }
    read(bin, sub_op::GET_INT, args, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ParticleType, SendBoolAs};

    fn encoded(op: Operation) -> crate::operations::EncodedOp {
        op.encode(SendBoolAs::Bool).unwrap()
    }

    #[test]
    fn bit_ops_use_blob_particle() {
        let op = encoded(count("b", 0, 8, &[]));
        assert_eq!(op.particle, ParticleType::Blob as u8);
        // [51, 0, 8]
        assert_eq!(&op.payload[..], [0x93, 0x33, 0x00, 0x08]);
    }

    #[test]
    fn set_packs_value_as_blob() {
        let op = encoded(set(BitPolicy::default(), "b", 8, 8, vec![0xff], &[]));
        // [3, 8, 8, blob{ff}, 0]; blobs carry the particle prefix byte.
        assert_eq!(
            &op.payload[..],
            [0x95, 0x03, 0x08, 0x08, 0xa2, 0x04, 0xff, 0x00]
        );
    }

    #[test]
    fn arithmetic_folds_sign_into_action() {
        let op = encoded(add(
            BitPolicy::default(),
            "b",
            0,
            8,
            1,
            true,
            OverflowAction::Wrap,
            &[],
        ));
        // [10, 0, 8, 1, 0, 5]
        assert_eq!(&op.payload[..], [0x96, 0x0a, 0x00, 0x08, 0x01, 0x00, 0x05]);
    }

    #[test]
    fn get_int_signed_flag_is_optional() {
        let signed = encoded(get_int("b", 0, 16, true, &[]));
        assert_eq!(&signed.payload[..], [0x94, 0x36, 0x00, 0x10, 0x01]);

        let unsigned = encoded(get_int("b", 0, 16, false, &[]));
        assert_eq!(&unsigned.payload[..], [0x93, 0x36, 0x00, 0x10]);
    }
}
