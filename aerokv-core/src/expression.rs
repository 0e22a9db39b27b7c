//! Server-side filter expressions.
//!
//! An [`Exp`] tree is built from typed bin references, record metadata
//! accessors, literals and operators, then compiled once into a
//! [`FilterExpression`] whose packed bytes ride in the request as a
//! filter field. Compilation is deterministic: the same tree always
//! yields the same bytes, so compiled filters are safe to cache and
//! reuse across requests.
//!
//! Commands serialize as msgpack arrays `[code, children...]`; scalar
//! literals serialize as plain values and literal collections are
//! quoted so they cannot be mistaken for a command.

use bytes::BytesMut;

use crate::error::{AerokvError, Result};
use crate::msgpack;
use crate::value::Value;

mod code {
    pub const EQ: i64 = 1;
    pub const NE: i64 = 2;
    pub const GT: i64 = 3;
    pub const GE: i64 = 4;
    pub const LT: i64 = 5;
    pub const LE: i64 = 6;
    pub const CMP_REGEX: i64 = 7;
    pub const CMP_GEO: i64 = 8;

    pub const AND: i64 = 16;
    pub const OR: i64 = 17;
    pub const NOT: i64 = 18;
    pub const EXCLUSIVE: i64 = 19;

    pub const ADD: i64 = 20;
    pub const SUB: i64 = 21;
    pub const MUL: i64 = 22;
    pub const DIV: i64 = 23;
    pub const POW: i64 = 24;
    pub const LOG: i64 = 25;
    pub const MOD: i64 = 26;
    pub const ABS: i64 = 27;
    pub const FLOOR: i64 = 28;
    pub const CEIL: i64 = 29;
    pub const TO_INT: i64 = 30;
    pub const TO_FLOAT: i64 = 31;
    pub const INT_AND: i64 = 32;
    pub const INT_OR: i64 = 33;
    pub const INT_XOR: i64 = 34;
    pub const INT_NOT: i64 = 35;
    pub const INT_LSHIFT: i64 = 36;
    pub const INT_RSHIFT: i64 = 37;
    pub const INT_ARSHIFT: i64 = 38;
    pub const INT_COUNT: i64 = 39;
    pub const INT_LSCAN: i64 = 40;
    pub const INT_RSCAN: i64 = 41;
    pub const MIN: i64 = 50;
    pub const MAX: i64 = 51;

    pub const DIGEST_MODULO: i64 = 64;
    pub const DEVICE_SIZE: i64 = 65;
    pub const LAST_UPDATE: i64 = 66;
    pub const VOID_TIME: i64 = 67;
    pub const TTL: i64 = 68;
    pub const SET_NAME: i64 = 69;
    pub const KEY_EXISTS: i64 = 70;
    pub const SINCE_UPDATE: i64 = 71;
    pub const IS_TOMBSTONE: i64 = 72;
    pub const MEMORY_SIZE: i64 = 73;

    pub const KEY: i64 = 80;
    pub const BIN: i64 = 81;
    pub const BIN_TYPE: i64 = 82;
    pub const BIN_EXISTS: i64 = 83;

    pub const COND: i64 = 123;
    pub const VAR: i64 = 124;
    pub const LET: i64 = 125;
    pub const DEF: i64 = 126;

    pub const CALL_READ: i64 = 127;
    pub const CALL_MODIFY: i64 = 139;

    /// Quote marker for literal collection values.
    pub const AS_VAL: i64 = 128;
}

/// Result type of an expression, packed where a command needs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpType {
    /// Nil.
    Nil,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// UTF-8 string.
    String,
    /// List.
    List,
    /// Map.
    Map,
    /// Byte blob.
    Blob,
    /// 64-bit float.
    Float,
    /// GeoJSON document.
    Geo,
    /// HyperLogLog sketch.
    Hll,
}

impl ExpType {
    fn wire(self) -> i64 {
        match self {
            ExpType::Nil => 0,
            ExpType::Bool => 1,
            ExpType::Int => 2,
            ExpType::String => 3,
            ExpType::List => 4,
            ExpType::Map => 5,
            ExpType::Blob => 6,
            ExpType::Float => 7,
            ExpType::Geo => 8,
            ExpType::Hll => 9,
        }
    }
}

/// Flags for [`Exp::regex_compare`]; combine with `|`.
pub mod regex_flags {
    /// POSIX basic regular expression syntax.
    pub const NONE: i64 = 0;
    /// POSIX extended syntax.
    pub const EXTENDED: i64 = 1;
    /// Case-insensitive matching.
    pub const ICASE: i64 = 2;
    /// Match/no-match only, no subexpression reporting.
    pub const NOSUB: i64 = 4;
    /// Newline-sensitive matching.
    pub const NEWLINE: i64 = 8;
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    /// Literal value.
    Value(Value),
    /// Command array; fixed arguments pack in place before children.
    Command { code: i64, args: Vec<Arg> },
    /// Named variable reference, resolved to an id at compile time.
    Var(String),
    /// Named variable definition.
    Def(String, Box<Exp>),
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    /// A child expression.
    Exp(Box<Exp>),
    /// A fixed argument packed as a bare value.
    Fixed(Value),
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Exp {
    node: Node,
}

/// A compiled expression, ready to attach to a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression {
    bytes: Vec<u8>,
}

impl FilterExpression {
    /// The packed expression bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn cmd(code: i64, args: Vec<Arg>) -> Exp {
    Exp {
        node: Node::Command { code, args },
    }
}

fn children(exps: Vec<Exp>) -> Vec<Arg> {
    exps.into_iter().map(|e| Arg::Exp(Box::new(e))).collect()
}

impl Exp {
    /// A literal value.
    pub fn val(value: impl Into<Value>) -> Exp {
        Exp {
            node: Node::Value(value.into()),
        }
    }

    /// The nil literal.
    pub fn nil() -> Exp {
        Exp::val(Value::Nil)
    }

    /// The record's user key, if stored.
    pub fn key(exp_type: ExpType) -> Exp {
        cmd(code::KEY, vec![Arg::Fixed(Value::Int(exp_type.wire()))])
    }

    /// Whether the record stores its user key.
    pub fn key_exists() -> Exp {
        cmd(code::KEY_EXISTS, vec![])
    }

    /// A bin of the given result type.
    pub fn bin(name: &str, exp_type: ExpType) -> Exp {
        cmd(
            code::BIN,
            vec![
                Arg::Fixed(Value::Int(exp_type.wire())),
                Arg::Fixed(Value::String(name.to_string())),
            ],
        )
    }

    /// An integer bin.
    pub fn int_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Int)
    }

    /// A string bin.
    pub fn string_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::String)
    }

    /// A float bin.
    pub fn float_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Float)
    }

    /// A blob bin.
    pub fn blob_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Blob)
    }

    /// A boolean bin.
    pub fn bool_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Bool)
    }

    /// A list bin.
    pub fn list_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::List)
    }

    /// A map bin.
    pub fn map_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Map)
    }

    /// A GeoJSON bin.
    pub fn geo_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Geo)
    }

    /// A HyperLogLog bin.
    pub fn hll_bin(name: &str) -> Exp {
        Exp::bin(name, ExpType::Hll)
    }

    /// Whether the bin exists.
    pub fn bin_exists(name: &str) -> Exp {
        cmd(
            code::BIN_EXISTS,
            vec![Arg::Fixed(Value::String(name.to_string()))],
        )
    }

    /// The bin's particle type as an integer.
    pub fn bin_type(name: &str) -> Exp {
        cmd(
            code::BIN_TYPE,
            vec![Arg::Fixed(Value::String(name.to_string()))],
        )
    }

    /// The record's set name.
    pub fn set_name() -> Exp {
        cmd(code::SET_NAME, vec![])
    }

    /// The record's storage size on device, in bytes.
    pub fn device_size() -> Exp {
        cmd(code::DEVICE_SIZE, vec![])
    }

    /// The record's memory footprint, in bytes.
    pub fn memory_size() -> Exp {
        cmd(code::MEMORY_SIZE, vec![])
    }

    /// Last-update time in nanoseconds since the epoch.
    pub fn last_update() -> Exp {
        cmd(code::LAST_UPDATE, vec![])
    }

    /// Seconds since the record was last updated.
    pub fn since_update() -> Exp {
        cmd(code::SINCE_UPDATE, vec![])
    }

    /// Expiration time in nanoseconds since the epoch.
    pub fn void_time() -> Exp {
        cmd(code::VOID_TIME, vec![])
    }

    /// Remaining time to live in seconds.
    pub fn ttl() -> Exp {
        cmd(code::TTL, vec![])
    }

    /// Whether the record is a tombstone.
    pub fn is_tombstone() -> Exp {
        cmd(code::IS_TOMBSTONE, vec![])
    }

    /// The record digest modulo `modulus`, for sampling.
    pub fn digest_modulo(modulus: i64) -> Exp {
        cmd(code::DIGEST_MODULO, vec![Arg::Fixed(Value::Int(modulus))])
    }

    /// `left == right`.
    pub fn eq(left: Exp, right: Exp) -> Exp {
        cmd(code::EQ, children(vec![left, right]))
    }

    /// `left != right`.
    pub fn ne(left: Exp, right: Exp) -> Exp {
        cmd(code::NE, children(vec![left, right]))
    }

    /// `left > right`.
    pub fn gt(left: Exp, right: Exp) -> Exp {
        cmd(code::GT, children(vec![left, right]))
    }

    /// `left >= right`.
    pub fn ge(left: Exp, right: Exp) -> Exp {
        cmd(code::GE, children(vec![left, right]))
    }

    /// `left < right`.
    pub fn lt(left: Exp, right: Exp) -> Exp {
        cmd(code::LT, children(vec![left, right]))
    }

    /// `left <= right`.
    pub fn le(left: Exp, right: Exp) -> Exp {
        cmd(code::LE, children(vec![left, right]))
    }

    /// Matches a string bin against a POSIX regular expression.
    pub fn regex_compare(regex: &str, flags: i64, bin: Exp) -> Exp {
        cmd(
            code::CMP_REGEX,
            vec![
                Arg::Fixed(Value::Int(flags)),
                Arg::Fixed(Value::String(regex.to_string())),
                Arg::Exp(Box::new(bin)),
            ],
        )
    }

    /// Whether two GeoJSON values intersect.
    pub fn geo_compare(left: Exp, right: Exp) -> Exp {
        cmd(code::CMP_GEO, children(vec![left, right]))
    }

    /// Logical AND over two or more expressions.
    pub fn and(exps: Vec<Exp>) -> Exp {
        cmd(code::AND, children(exps))
    }

    /// Logical OR over two or more expressions.
    pub fn or(exps: Vec<Exp>) -> Exp {
        cmd(code::OR, children(exps))
    }

    /// Logical NOT.
    pub fn not(exp: Exp) -> Exp {
        cmd(code::NOT, children(vec![exp]))
    }

    /// True when exactly zero or one of the expressions is true.
    pub fn exclusive(exps: Vec<Exp>) -> Exp {
        cmd(code::EXCLUSIVE, children(exps))
    }

    /// Numeric sum.
    pub fn num_add(exps: Vec<Exp>) -> Exp {
        cmd(code::ADD, children(exps))
    }

    /// Numeric difference, left to right.
    pub fn num_sub(exps: Vec<Exp>) -> Exp {
        cmd(code::SUB, children(exps))
    }

    /// Numeric product.
    pub fn num_mul(exps: Vec<Exp>) -> Exp {
        cmd(code::MUL, children(exps))
    }

    /// Numeric quotient, left to right.
    pub fn num_div(exps: Vec<Exp>) -> Exp {
        cmd(code::DIV, children(exps))
    }

    /// `base` raised to `exponent` (floats).
    pub fn num_pow(base: Exp, exponent: Exp) -> Exp {
        cmd(code::POW, children(vec![base, exponent]))
    }

    /// Logarithm of `num` in `base` (floats).
    pub fn num_log(num: Exp, base: Exp) -> Exp {
        cmd(code::LOG, children(vec![num, base]))
    }

    /// Integer remainder.
    pub fn num_mod(numerator: Exp, denominator: Exp) -> Exp {
        cmd(code::MOD, children(vec![numerator, denominator]))
    }

    /// Absolute value.
    pub fn num_abs(exp: Exp) -> Exp {
        cmd(code::ABS, children(vec![exp]))
    }

    /// Largest integral float not above the value.
    pub fn num_floor(exp: Exp) -> Exp {
        cmd(code::FLOOR, children(vec![exp]))
    }

    /// Smallest integral float not below the value.
    pub fn num_ceil(exp: Exp) -> Exp {
        cmd(code::CEIL, children(vec![exp]))
    }

    /// Converts a float to an integer.
    pub fn to_int(exp: Exp) -> Exp {
        cmd(code::TO_INT, children(vec![exp]))
    }

    /// Converts an integer to a float.
    pub fn to_float(exp: Exp) -> Exp {
        cmd(code::TO_FLOAT, children(vec![exp]))
    }

    /// Bitwise AND over integers.
    pub fn int_and(exps: Vec<Exp>) -> Exp {
        cmd(code::INT_AND, children(exps))
    }

    /// Bitwise OR over integers.
    pub fn int_or(exps: Vec<Exp>) -> Exp {
        cmd(code::INT_OR, children(exps))
    }

    /// Bitwise XOR over integers.
    pub fn int_xor(exps: Vec<Exp>) -> Exp {
        cmd(code::INT_XOR, children(exps))
    }

    /// Bitwise NOT of an integer.
    pub fn int_not(exp: Exp) -> Exp {
        cmd(code::INT_NOT, children(vec![exp]))
    }

    /// Logical left shift.
    pub fn int_lshift(value: Exp, shift: Exp) -> Exp {
        cmd(code::INT_LSHIFT, children(vec![value, shift]))
    }

    /// Logical right shift.
    pub fn int_rshift(value: Exp, shift: Exp) -> Exp {
        cmd(code::INT_RSHIFT, children(vec![value, shift]))
    }

    /// Arithmetic right shift.
    pub fn int_arshift(value: Exp, shift: Exp) -> Exp {
        cmd(code::INT_ARSHIFT, children(vec![value, shift]))
    }

    /// Count of set bits.
    pub fn int_count(exp: Exp) -> Exp {
        cmd(code::INT_COUNT, children(vec![exp]))
    }

    /// Index of the first bit equal to `search`, scanning left to right.
    pub fn int_lscan(value: Exp, search: Exp) -> Exp {
        cmd(code::INT_LSCAN, children(vec![value, search]))
    }

    /// Index of the first bit equal to `search`, scanning right to left.
    pub fn int_rscan(value: Exp, search: Exp) -> Exp {
        cmd(code::INT_RSCAN, children(vec![value, search]))
    }

    /// Smallest of the arguments.
    pub fn min(exps: Vec<Exp>) -> Exp {
        cmd(code::MIN, children(exps))
    }

    /// Largest of the arguments.
    pub fn max(exps: Vec<Exp>) -> Exp {
        cmd(code::MAX, children(exps))
    }

    /// Chooses the value paired with the first true condition, falling
    /// back to `default`.
    pub fn cond(cases: Vec<(Exp, Exp)>, default: Exp) -> Exp {
        let mut flat = Vec::with_capacity(cases.len() * 2 + 1);
        for (test, value) in cases {
            flat.push(test);
            flat.push(value);
        }
        flat.push(default);
        cmd(code::COND, children(flat))
    }

    /// Defines variables for use in `body` via [`Exp::var`].
    pub fn let_vars(defs: Vec<Exp>, body: Exp) -> Exp {
        let mut flat = defs;
        flat.push(body);
        cmd(code::LET, children(flat))
    }

    /// Binds `value` to `name` inside an enclosing [`Exp::let_vars`].
    pub fn def(name: &str, value: Exp) -> Exp {
        Exp {
            node: Node::Def(name.to_string(), Box::new(value)),
        }
    }

    /// References a variable bound by [`Exp::def`].
    pub fn var(name: &str) -> Exp {
        Exp {
            node: Node::Var(name.to_string()),
        }
    }

    pub(crate) fn cdt_call(
        modify: bool,
        exp_type: ExpType,
        op_payload: Value,
        bin: Exp,
    ) -> Exp {
        let call_code = if modify { code::CALL_MODIFY } else { code::CALL_READ };
        cmd(
            call_code,
            vec![
                Arg::Fixed(Value::Int(exp_type.wire())),
                Arg::Fixed(op_payload),
                Arg::Exp(Box::new(bin)),
            ],
        )
    }

    /// Number of elements in a list bin expression.
    pub fn list_size(bin: Exp) -> Exp {
        Exp::cdt_call(false, ExpType::Int, Value::List(vec![Value::Int(16)]), bin)
    }

    /// Count of list elements equal to `value`.
    pub fn list_count_by_value(value: Value, bin: Exp) -> Exp {
        Exp::cdt_call(
            false,
            ExpType::Int,
            Value::List(vec![Value::Int(22), Value::Int(5), value]),
            bin,
        )
    }

    /// Number of entries in a map bin expression.
    pub fn map_size(bin: Exp) -> Exp {
        Exp::cdt_call(false, ExpType::Int, Value::List(vec![Value::Int(96)]), bin)
    }

    /// Value stored under `key` in a map bin expression.
    pub fn map_get_by_key(exp_type: ExpType, key: Value, bin: Exp) -> Exp {
        Exp::cdt_call(
            false,
            exp_type,
            Value::List(vec![Value::Int(97), Value::Int(7), key]),
            bin,
        )
    }

    /// Estimated cardinality of an HLL bin expression.
    pub fn hll_get_count(bin: Exp) -> Exp {
        Exp::cdt_call(false, ExpType::Int, Value::List(vec![Value::Int(50)]), bin)
    }

    /// Compiles the tree into its packed wire form.
    ///
    /// Variable names introduced by [`Exp::def`] are assigned numeric
    /// ids per enclosing `let` scope, in definition order; a scope's
    /// ids are released when its `let` closes, so an inner `let` may
    /// shadow an outer name. Referencing a variable that is undefined
    /// or out of scope is a parameter error.
    pub fn compile(&self) -> Result<FilterExpression> {
        let mut vars = VarScopes::default();
        let mut buf = BytesMut::new();
        self.pack(&mut vars, &mut buf)?;
        Ok(FilterExpression {
            bytes: buf.to_vec(),
        })
    }

    fn pack(&self, vars: &mut VarScopes, buf: &mut BytesMut) -> Result<()> {
        match &self.node {
            Node::Value(value) => pack_literal(value, buf),
            Node::Command { code, args } => {
                let scoped = *code == code::LET;
                if scoped {
                    vars.open();
                }
                msgpack::pack_array_header(1 + args.len(), buf)?;
                msgpack::pack_int(*code, buf);
                let mut result = Ok(());
                for arg in args {
                    result = match arg {
                        Arg::Fixed(value) => msgpack::pack_value(value, buf),
                        Arg::Exp(exp) => exp.pack(vars, buf),
                    };
                    if result.is_err() {
                        break;
                    }
                }
                if scoped {
                    vars.close();
                }
                result
            }
            Node::Def(name, value) => {
                let id = vars.define(name)?;
                msgpack::pack_array_header(3, buf)?;
                msgpack::pack_int(code::DEF, buf);
                msgpack::pack_int(id, buf);
                value.pack(vars, buf)
            }
            Node::Var(name) => {
                let id = vars.resolve(name).ok_or_else(|| {
                    AerokvError::Param(format!("undefined expression variable '{name}'"))
                })?;
                msgpack::pack_array_header(2, buf)?;
                msgpack::pack_int(code::VAR, buf);
                msgpack::pack_int(id, buf);
                Ok(())
            }
        }
    }
}

/// Lexical variable scopes for [`Exp::let_vars`]: each `let` opens a
/// scope, and its ids are reclaimed when the `let` closes.
#[derive(Default)]
struct VarScopes {
    scopes: Vec<Vec<(String, i64)>>,
    next_id: i64,
}

impl VarScopes {
    fn open(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn close(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            self.next_id -= scope.len() as i64;
        }
    }

    fn define(&mut self, name: &str) -> Result<i64> {
        let next_id = self.next_id;
        let scope = self.scopes.last_mut().ok_or_else(|| {
            AerokvError::Param(format!(
                "variable '{name}' defined outside a let expression"
            ))
        })?;
        if let Some((_, id)) = scope.iter().find(|(n, _)| n == name) {
            return Ok(*id);
        }
        self.next_id += 1;
        scope.push((name.to_string(), next_id));
        Ok(next_id)
    }

    fn resolve(&self, name: &str) -> Option<i64> {
        self.scopes.iter().rev().find_map(|scope| {
            scope.iter().rev().find(|(n, _)| n == name).map(|(_, id)| *id)
        })
    }
}

/// Packs a literal, quoting collections so they cannot read as commands.
fn pack_literal(value: &Value, buf: &mut BytesMut) -> Result<()> {
    match value {
        Value::List(_)
        | Value::OrderedList(_)
        | Value::Map(_)
        | Value::KeyOrderedMap(_)
        | Value::KeyValueOrderedMap(_) => {
            msgpack::pack_array_header(2, buf)?;
            msgpack::pack_int(code::AS_VAL, buf);
            msgpack::pack_value(value, buf)
        }
        other => msgpack::pack_value(other, buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_comparison_bytes() {
        let exp = Exp::eq(Exp::int_bin("age"), Exp::val(30i64));
        let compiled = exp.compile().unwrap();
        // [1, [81, 2, "age"], 30]
        assert_eq!(
            compiled.as_bytes(),
            [
                0x93, 0x01, // eq, 2 children
                0x93, 0x51, 0x02, 0xa4, 0x03, b'a', b'g', b'e', // bin ref
                0x1e, // literal 30
            ]
        );
    }

    #[test]
    fn compile_is_deterministic() {
        let build = || {
            Exp::and(vec![
                Exp::gt(Exp::int_bin("a"), Exp::val(1i64)),
                Exp::regex_compare("^x", regex_flags::ICASE, Exp::string_bin("b")),
            ])
        };
        assert_eq!(build().compile().unwrap(), build().compile().unwrap());
    }

    #[test]
    fn literal_lists_are_quoted() {
        let exp = Exp::val(Value::List(vec![Value::Int(1)]));
        let compiled = exp.compile().unwrap();
        // [128, [1]]
        assert_eq!(compiled.as_bytes(), [0x92, 0xcc, 0x80, 0x91, 0x01]);
    }

    #[test]
    fn variables_get_numeric_ids() {
        let exp = Exp::let_vars(
            vec![
                Exp::def("x", Exp::int_bin("a")),
                Exp::def("y", Exp::val(2i64)),
            ],
            Exp::num_add(vec![Exp::var("x"), Exp::var("y")]),
        );
        let bytes = exp.compile().unwrap();
        let again = exp.compile().unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn undefined_variable_is_param_error() {
        let exp = Exp::var("missing");
        assert!(matches!(exp.compile(), Err(AerokvError::Param(_))));
    }

    #[test]
    fn def_outside_let_is_param_error() {
        let exp = Exp::def("x", Exp::val(1i64));
        assert!(matches!(exp.compile(), Err(AerokvError::Param(_))));
    }

    #[test]
    fn nested_let_shadows_then_restores_outer_binding() {
        let inner = Exp::let_vars(vec![Exp::def("x", Exp::val(2i64))], Exp::var("x"));
        let exp = Exp::let_vars(
            vec![Exp::def("x", Exp::val(1i64))],
            Exp::num_add(vec![inner, Exp::var("x")]),
        );
        let compiled = exp.compile().unwrap();
        let bytes = compiled.as_bytes();

        // A var reference packs as [124, id]. The shadowing inner `x`
        // gets a fresh id 1; once its let closes, `x` resolves back to
        // the outer id 0.
        let position = |needle: &[u8]| {
            bytes
                .windows(needle.len())
                .position(|window| window == needle)
        };
        let inner_ref = position(&[0x92, 0x7c, 0x01]).unwrap();
        let outer_ref = position(&[0x92, 0x7c, 0x00]).unwrap();
        assert!(inner_ref < outer_ref);
    }

    #[test]
    fn variable_out_of_scope_after_let_closes() {
        let exp = Exp::num_add(vec![
            Exp::let_vars(vec![Exp::def("x", Exp::val(1i64))], Exp::var("x")),
            Exp::var("x"),
        ]);
        assert!(matches!(exp.compile(), Err(AerokvError::Param(_))));
    }

    #[test]
    fn metadata_accessors_compile() {
        for exp in [
            Exp::ttl(),
            Exp::set_name(),
            Exp::key_exists(),
            Exp::last_update(),
            Exp::is_tombstone(),
        ] {
            assert!(!exp.compile().unwrap().as_bytes().is_empty());
        }
    }

    #[test]
    fn cdt_call_wraps_op_array() {
        let exp = Exp::list_size(Exp::list_bin("scores"));
        let compiled = exp.compile().unwrap();
        // [127, 2, [16], [81, 4, "scores"]]
        assert_eq!(compiled.as_bytes()[..4], [0x94, 0x7f, 0x02, 0x91]);
    }
}
