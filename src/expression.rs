use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::error::EngineError;
use crate::vars::{with_active, with_active_mut};

// Handles are 64-bit values: the two most significant bits select the kind,
// the low 62 bits are the payload.
//
//   00 — index of a node in the session's expression store;
//   01 — a variable, addressed by its insertion-order leaf index `q`;
//   10 — an inline immediate double (see `from_immediate` for encodability);
//   11 — λ, the scalar argument of the 1-D line function.
//
// Variables, inline immediates, and λ never occupy store slots.
const TAG_SHIFT: u32 = 62;
const PAYLOAD_MASK: u64 = (1u64 << TAG_SHIFT) - 1;

const TAG_NODE: u64 = 0b00;
const TAG_VAR: u64 = 0b01;
const TAG_IMMEDIATE: u64 = 0b10;
const TAG_LAMBDA: u64 = 0b11;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ExpressionNodeIndex(u64);

/// The decoded form of a handle.
#[derive(Clone, Copy, Debug)]
pub(crate) enum IndexKind {
    Node(usize),
    Var(usize),
    Immediate(f64),
    Lambda,
}

impl ExpressionNodeIndex {
    pub(crate) fn from_node(index: usize) -> Self {
        Self((TAG_NODE << TAG_SHIFT) | (index as u64 & PAYLOAD_MASK))
    }

    pub(crate) fn from_var(q: usize) -> Self {
        Self((TAG_VAR << TAG_SHIFT) | (q as u64 & PAYLOAD_MASK))
    }

    /// Encodes a double inline when its two low-order mantissa bits are zero,
    /// which covers every value the differentiator mass-produces (0.0, ±1.0,
    /// small integers, halves, ...). Other values need an immediate store node.
    pub(crate) fn from_immediate(value: f64) -> Option<Self> {
        let bits = value.to_bits();
        if bits & 0b11 == 0 {
            Some(Self((TAG_IMMEDIATE << TAG_SHIFT) | (bits >> 2)))
        } else {
            None
        }
    }

    /// The inline handle of 0.0, whose bit pattern is all zeroes.
    pub(crate) const fn zero_immediate() -> Self {
        Self(TAG_IMMEDIATE << TAG_SHIFT)
    }

    pub(crate) fn lambda() -> Self {
        Self(TAG_LAMBDA << TAG_SHIFT)
    }

    pub(crate) fn kind(self) -> IndexKind {
        let payload = self.0 & PAYLOAD_MASK;
        match self.0 >> TAG_SHIFT {
            TAG_NODE => IndexKind::Node(payload as usize),
            TAG_VAR => IndexKind::Var(payload as usize),
            TAG_IMMEDIATE => IndexKind::Immediate(f64::from_bits(payload << 2)),
            _ => IndexKind::Lambda,
        }
    }
}

/// Binary operations over two child handles.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

/// The built-in unary math functions. The discriminant doubles as the index
/// into the runtime helper table the JIT calls through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum MathFn {
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Sqr,
    Sqrt,
    Asin,
    Acos,
    Atan,
    UnitStep,
    Ramp,
    Sigmoid,
    LogSigmoid,
}

pub(crate) const MATH_FN_COUNT: usize = 14;

impl MathFn {
    pub(crate) fn name(self) -> &'static str {
        match self {
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Tan => "tan",
            MathFn::Sqr => "sqr",
            MathFn::Sqrt => "sqrt",
            MathFn::Asin => "asin",
            MathFn::Acos => "acos",
            MathFn::Atan => "atan",
            MathFn::UnitStep => "unit_step",
            MathFn::Ramp => "ramp",
            MathFn::Sigmoid => "sigmoid",
            MathFn::LogSigmoid => "log_sigmoid",
        }
    }

    pub(crate) fn call_index(self) -> usize {
        self as usize
    }
}

/// A node of the append-only expression store. Children always reference
/// earlier handles, so the store is cycle-free by construction. Structurally
/// equal nodes are not deduplicated; the JIT reuses computed slots instead.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ExpressionNode {
    /// The fallback form for immediates that do not fit into a handle.
    Immediate(f64),
    Op {
        op: BinaryOp,
        lhs: ExpressionNodeIndex,
        rhs: ExpressionNodeIndex,
    },
    Fn {
        fun: MathFn,
        arg: ExpressionNodeIndex,
    },
    /// λ as a stored node; builders hand out the handle form instead.
    Lambda,
}

pub(crate) fn append_node(node: ExpressionNode) -> ExpressionNodeIndex {
    let appended = with_active_mut(|session| {
        let index = session.nodes.len();
        session.nodes.push(node);
        Ok(ExpressionNodeIndex::from_node(index))
    });
    match appended {
        Ok(index) => index,
        Err(_) => panic!("expression built without an active variables session on this thread"),
    }
}

pub(crate) fn node_at(index: usize) -> Result<ExpressionNode, EngineError> {
    with_active(|session| {
        session
            .nodes
            .get(index)
            .copied()
            .ok_or_else(|| EngineError::Management(format!("no expression node {index}")))
    })
}

/// A value of the expression DAG: a `Copy` handle supporting arithmetic with
/// other values and plain `f64`-s, plus the built-in math functions.
///
/// Operator impls cannot return `Result`, so they panic if the thread's
/// variables session has been dropped while handles to it are still used.
/// Every other way to misuse the engine surfaces as an [`EngineError`].
///
/// # Examples
///
/// ```
/// let _context = descent::VarsContext::new()?;
/// let x = descent::x();
/// x.at("a").set(2.0)?;
/// let f = (x.at("a").val()? - 3.0).sqr();
/// # drop(f);
/// # Ok::<(), descent::EngineError>(())
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Value(pub(crate) ExpressionNodeIndex);

impl Value {
    pub(crate) fn from_index(index: ExpressionNodeIndex) -> Self {
        Self(index)
    }

    pub(crate) fn from_var(q: usize) -> Self {
        Self(ExpressionNodeIndex::from_var(q))
    }

    /// The λ handle, the scalar argument of line-search functions.
    pub(crate) fn lambda() -> Self {
        Self(ExpressionNodeIndex::lambda())
    }

    pub(crate) fn index(self) -> ExpressionNodeIndex {
        self.0
    }

    pub(crate) fn from_f64(value: f64) -> Self {
        match ExpressionNodeIndex::from_immediate(value) {
            Some(index) => Self(index),
            None => Self(append_node(ExpressionNode::Immediate(value))),
        }
    }

    fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        // The only folding the builder does: both operands inline, result
        // inline-encodable. Anything else appends a node verbatim.
        if let (IndexKind::Immediate(a), IndexKind::Immediate(b)) = (lhs.0.kind(), rhs.0.kind()) {
            if let Some(folded) = ExpressionNodeIndex::from_immediate(op.apply(a, b)) {
                return Value(folded);
            }
        }
        Value(append_node(ExpressionNode::Op {
            op,
            lhs: lhs.0,
            rhs: rhs.0,
        }))
    }

    fn function(fun: MathFn, arg: Value) -> Value {
        Value(append_node(ExpressionNode::Fn { fun, arg: arg.0 }))
    }

    pub fn exp(self) -> Value {
        Value::function(MathFn::Exp, self)
    }
    pub fn log(self) -> Value {
        Value::function(MathFn::Log, self)
    }
    pub fn sin(self) -> Value {
        Value::function(MathFn::Sin, self)
    }
    pub fn cos(self) -> Value {
        Value::function(MathFn::Cos, self)
    }
    pub fn tan(self) -> Value {
        Value::function(MathFn::Tan, self)
    }
    pub fn sqr(self) -> Value {
        Value::function(MathFn::Sqr, self)
    }
    pub fn sqrt(self) -> Value {
        Value::function(MathFn::Sqrt, self)
    }
    pub fn asin(self) -> Value {
        Value::function(MathFn::Asin, self)
    }
    pub fn acos(self) -> Value {
        Value::function(MathFn::Acos, self)
    }
    pub fn atan(self) -> Value {
        Value::function(MathFn::Atan, self)
    }
    /// 1 for nonnegative arguments, 0 otherwise. Not differentiable by design.
    pub fn unit_step(self) -> Value {
        Value::function(MathFn::UnitStep, self)
    }
    /// `max(x, 0)`, the differentiable counterpart of `unit_step`.
    pub fn ramp(self) -> Value {
        Value::function(MathFn::Ramp, self)
    }
    /// `1 / (1 + exp(-x))`. Not differentiable by design.
    pub fn sigmoid(self) -> Value {
        Value::function(MathFn::Sigmoid, self)
    }
    /// `log(sigmoid(x))`, the differentiable counterpart of `sigmoid`.
    pub fn log_sigmoid(self) -> Value {
        Value::function(MathFn::LogSigmoid, self)
    }
}

impl From<f64> for Value {
    /// Wraps a plain double. Values with two zero low-order mantissa bits
    /// stay inline in the handle; others are appended to the store (and thus
    /// need an active session).
    fn from(value: f64) -> Self {
        Value::from_f64(value)
    }
}

impl Add for Value {
    type Output = Value;
    fn add(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Add, self, rhs)
    }
}

impl Sub for Value {
    type Output = Value;
    fn sub(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Sub, self, rhs)
    }
}

impl Mul for Value {
    type Output = Value;
    fn mul(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Mul, self, rhs)
    }
}

impl Div for Value {
    type Output = Value;
    fn div(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Div, self, rhs)
    }
}

impl Add<f64> for Value {
    type Output = Value;
    fn add(self, rhs: f64) -> Value {
        Value::binary(BinaryOp::Add, self, Value::from_f64(rhs))
    }
}

impl Sub<f64> for Value {
    type Output = Value;
    fn sub(self, rhs: f64) -> Value {
        Value::binary(BinaryOp::Sub, self, Value::from_f64(rhs))
    }
}

impl Mul<f64> for Value {
    type Output = Value;
    fn mul(self, rhs: f64) -> Value {
        Value::binary(BinaryOp::Mul, self, Value::from_f64(rhs))
    }
}

impl Div<f64> for Value {
    type Output = Value;
    fn div(self, rhs: f64) -> Value {
        Value::binary(BinaryOp::Div, self, Value::from_f64(rhs))
    }
}

impl Add<Value> for f64 {
    type Output = Value;
    fn add(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Add, Value::from_f64(self), rhs)
    }
}

impl Sub<Value> for f64 {
    type Output = Value;
    fn sub(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Sub, Value::from_f64(self), rhs)
    }
}

impl Mul<Value> for f64 {
    type Output = Value;
    fn mul(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Mul, Value::from_f64(self), rhs)
    }
}

impl Div<Value> for f64 {
    type Output = Value;
    fn div(self, rhs: Value) -> Value {
        Value::binary(BinaryOp::Div, Value::from_f64(self), rhs)
    }
}

impl Neg for Value {
    type Output = Value;
    fn neg(self) -> Value {
        // Unary minus is `0 - x`; there is no dedicated negation node.
        Value::binary(BinaryOp::Sub, Value::from_f64(0.0), self)
    }
}
