//! HyperLogLog bin operations.
//!
//! Sketch geometry is fixed at creation: `index_bits` in `[4, 16]` and
//! `minhash_bits` either zero or in `[4, 58]`, with the sum capped at
//! 64. Constructors taking geometry validate it up front and return a
//! parameter error instead of a malformed request.

use super::{CdtKind, CdtOperation, Operation};
use crate::error::{AerokvError, Result};
use crate::value::Value;

mod sub_op {
    pub const INIT: u16 = 0;
    pub const ADD: u16 = 1;
    pub const SET_UNION: u16 = 4;
    pub const REFRESH_COUNT: u16 = 5;
    pub const FOLD: u16 = 6;
    pub const COUNT: u16 = 50;
    pub const GET_UNION: u16 = 51;
    pub const UNION_COUNT: u16 = 52;
    pub const INTERSECT_COUNT: u16 = 53;
    pub const SIMILARITY: u16 = 54;
    pub const DESCRIBE: u16 = 55;
    pub const MAY_CONTAIN: u16 = 56;
}

/// Write-mode flags for HLL modify operations; combine with `|`.
pub mod write_flags {
    /// Create or update the sketch freely.
    pub const DEFAULT: u8 = 0;
    /// Only create a new sketch; fail if the bin exists.
    pub const CREATE_ONLY: u8 = 1;
    /// Only update an existing sketch; fail if the bin is missing.
    pub const UPDATE_ONLY: u8 = 2;
    /// Turn policy violations into no-ops instead of errors.
    pub const NO_FAIL: u8 = 4;
    /// Allow a union to fold to the smallest input geometry.
    pub const ALLOW_FOLD: u8 = 8;
}

/// Flags applied by HLL modify operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct HllPolicy {
    /// Combination of [`write_flags`] values.
    pub flags: u8,
}

impl HllPolicy {
    /// Policy with the given flags.
    pub fn new(flags: u8) -> Self {
        Self { flags }
    }
}

fn check_geometry(index_bits: i64, minhash_bits: i64) -> Result<()> {
    if !(4..=16).contains(&index_bits) {
        return Err(AerokvError::Param(format!(
            "hll index bits must be in [4, 16], got {index_bits}"
        )));
    }
    if minhash_bits != 0 && !(4..=58).contains(&minhash_bits) {
        return Err(AerokvError::Param(format!(
            "hll minhash bits must be 0 or in [4, 58], got {minhash_bits}"
        )));
    }
    if index_bits + minhash_bits > 64 {
        return Err(AerokvError::Param(format!(
            "hll index bits + minhash bits must not exceed 64, got {}",
            index_bits + minhash_bits
        )));
    }
    Ok(())
}

fn read(bin: &str, sub_op: u16, args: Vec<Value>) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::HllRead, bin, sub_op, args, &[]))
}

fn modify(bin: &str, sub_op: u16, args: Vec<Value>) -> Operation {
    Operation::Cdt(CdtOperation::new(CdtKind::HllModify, bin, sub_op, args, &[]))
}

/// Creates an empty sketch with the given geometry.
pub fn init(policy: HllPolicy, bin: &str, index_bits: i64, minhash_bits: i64) -> Result<Operation> {
    check_geometry(index_bits, minhash_bits)?;
    Ok(modify(
        bin,
        sub_op::INIT,
        vec![
            Value::Int(index_bits),
            Value::Int(minhash_bits),
            Value::Int(i64::from(policy.flags)),
        ],
    ))
}

/// Adds values to the sketch, creating it with the given geometry if
/// absent; returns the number of registers that changed.
pub fn add(
    policy: HllPolicy,
    bin: &str,
    values: Vec<Value>,
    index_bits: i64,
    minhash_bits: i64,
) -> Result<Operation> {
    check_geometry(index_bits, minhash_bits)?;
    Ok(modify(
        bin,
        sub_op::ADD,
        vec![
            Value::List(values),
            Value::Int(index_bits),
            Value::Int(minhash_bits),
            Value::Int(i64::from(policy.flags)),
        ],
    ))
}

/// Folds the sketch down to fewer index bits. The sketch must not
/// carry minhash state.
pub fn fold(bin: &str, index_bits: i64) -> Result<Operation> {
    check_geometry(index_bits, 0)?;
    Ok(modify(bin, sub_op::FOLD, vec![Value::Int(index_bits)]))
}

/// Recomputes and stores the cached cardinality; returns the count.
pub fn refresh_count(bin: &str) -> Operation {
    modify(bin, sub_op::REFRESH_COUNT, vec![])
}

/// Merges the given serialized sketches into the bin.
pub fn set_union(policy: HllPolicy, bin: &str, sketches: Vec<Value>) -> Operation {
    modify(
        bin,
        sub_op::SET_UNION,
        vec![Value::List(sketches), Value::Int(i64::from(policy.flags))],
    )
}

/// Returns the estimated cardinality.
pub fn get_count(bin: &str) -> Operation {
    read(bin, sub_op::COUNT, vec![])
}

/// Returns the union of the bin with the given sketches as a new sketch.
pub fn get_union(bin: &str, sketches: Vec<Value>) -> Operation {
    read(bin, sub_op::GET_UNION, vec![Value::List(sketches)])
}

/// Returns the estimated cardinality of the union.
pub fn get_union_count(bin: &str, sketches: Vec<Value>) -> Operation {
    read(bin, sub_op::UNION_COUNT, vec![Value::List(sketches)])
}

/// Returns the estimated cardinality of the intersection. Requires
/// minhash state when intersecting more than two sketches.
pub fn get_intersect_count(bin: &str, sketches: Vec<Value>) -> Operation {
    read(bin, sub_op::INTERSECT_COUNT, vec![Value::List(sketches)])
}

/// Returns the estimated Jaccard similarity in `[0, 1]`.
pub fn get_similarity(bin: &str, sketches: Vec<Value>) -> Operation {
    read(bin, sub_op::SIMILARITY, vec![Value::List(sketches)])
}

/// Returns the sketch geometry as `[index_bits, minhash_bits]`.
pub fn describe(bin: &str) -> Operation {
    read(bin, sub_op::DESCRIBE, vec![])
}

/// Returns, per value, whether the sketch may contain it.
pub fn may_contain(bin: &str, values: Vec<Value>) -> Operation {
    read(bin, sub_op::MAY_CONTAIN, vec![Value::List(values)])
}
