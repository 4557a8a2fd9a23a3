use foldhash::{HashMap, HashMapExt};

use crate::error::EngineError;
use crate::expression::{
    node_at, BinaryOp, ExpressionNode, ExpressionNodeIndex, IndexKind, MathFn, Value,
};
use crate::vars::VarsConfig;

// The differentiator never recurses: realistic expressions are hundreds of
// thousands of nodes deep, and the machine stack would not survive them. The
// manual stack below keeps its allocation across pops (and across the N
// passes of a gradient computation).
//
// A frame carries the store index being visited, a phase flag (pushed for the
// second time once its children's derivatives are ready), a two-slot buffer
// the children write their results into, and the slot of the parent's buffer
// this frame reports to (frame position times two, plus the LHS/RHS bit).
#[derive(Clone, Copy)]
struct Frame {
    node_index: usize,
    ready: bool,
    ret: [ExpressionNodeIndex; 2],
    ret_slot: usize,
}

const EMPTY_FRAME: Frame = Frame {
    node_index: 0,
    ready: false,
    ret: [ExpressionNodeIndex::zero_immediate(); 2],
    ret_slot: 0,
};

struct ManualStack {
    frames: Vec<Frame>,
    len: usize,
}

impl ManualStack {
    fn new() -> Self {
        ManualStack {
            frames: vec![EMPTY_FRAME],
            len: 1,
        }
    }

    // Frame zero is never popped; the ultimate result lands in its first slot.
    fn reset(&mut self) {
        self.len = 1;
    }

    fn not_empty(&self) -> bool {
        self.len > 1
    }

    fn push(&mut self, node_index: usize, ready: bool, ret_slot: usize) -> usize {
        if self.len == self.frames.len() {
            let grown = (self.frames.len() * 2).max(256);
            self.frames.resize(grown, EMPTY_FRAME);
        }
        self.frames[self.len] = Frame {
            node_index,
            ready,
            ret: [ExpressionNodeIndex::zero_immediate(); 2],
            ret_slot,
        };
        self.len += 1;
        self.len - 1
    }

    fn pop(&mut self) -> Frame {
        self.len -= 1;
        self.frames[self.len]
    }

    fn write(&mut self, ret_slot: usize, value: ExpressionNodeIndex) {
        self.frames[ret_slot >> 1].ret[ret_slot & 1] = value;
    }

    fn result(&self) -> ExpressionNodeIndex {
        self.frames[0].ret[0]
    }
}

enum Mode<'a> {
    ByVar { config: &'a VarsConfig, wrt: usize },
    ByLambda,
}

struct Differentiator<'a> {
    mode: Mode<'a>,
    stack: &'a mut ManualStack,
}

impl Differentiator<'_> {
    fn leaf_derivative(&self, q: usize) -> Result<ExpressionNodeIndex, EngineError> {
        match &self.mode {
            Mode::ByVar { config, wrt } => {
                let dense = *config.dense_by_q.get(q).ok_or_else(|| {
                    EngineError::Management(format!(
                        "leaf {q} is not covered by the supplied configuration"
                    ))
                })?;
                let one = dense == *wrt && !config.is_constant[dense];
                Ok(Value::from_f64(if one { 1.0 } else { 0.0 }).index())
            }
            // By λ, every variable is held fixed.
            Mode::ByLambda => Ok(ExpressionNodeIndex::zero_immediate()),
        }
    }

    fn push_operand(
        &mut self,
        operand: ExpressionNodeIndex,
        ret_slot: usize,
    ) -> Result<(), EngineError> {
        match operand.kind() {
            IndexKind::Node(index) => {
                self.stack.push(index, false, ret_slot);
            }
            IndexKind::Var(q) => {
                let derivative = self.leaf_derivative(q)?;
                self.stack.write(ret_slot, derivative);
            }
            IndexKind::Immediate(_) => {
                self.stack.write(ret_slot, ExpressionNodeIndex::zero_immediate());
            }
            IndexKind::Lambda => match self.mode {
                Mode::ByVar { .. } => return Err(EngineError::UnexpectedLambda),
                Mode::ByLambda => {
                    self.stack
                        .write(ret_slot, Value::from_f64(1.0).index());
                }
            },
        }
        Ok(())
    }

    fn differentiate(&mut self, f: Value) -> Result<Value, EngineError> {
        self.stack.reset();
        self.push_operand(f.index(), 0)?;

        while self.stack.not_empty() {
            let frame = self.stack.pop();
            let node = node_at(frame.node_index)?;
            match node {
                ExpressionNode::Immediate(_) => {
                    self.stack
                        .write(frame.ret_slot, ExpressionNodeIndex::zero_immediate());
                }
                ExpressionNode::Op { op, lhs, rhs } => {
                    if !frame.ready {
                        let position = self.stack.push(frame.node_index, true, frame.ret_slot);
                        // RHS goes first so that the LHS derivative is built first.
                        self.push_operand(rhs, position * 2 + 1)?;
                        self.push_operand(lhs, position * 2)?;
                    } else {
                        let a = Value::from_index(lhs);
                        let b = Value::from_index(rhs);
                        let da = Value::from_index(frame.ret[0]);
                        let db = Value::from_index(frame.ret[1]);
                        let df = match op {
                            BinaryOp::Add => da + db,
                            BinaryOp::Sub => da - db,
                            BinaryOp::Mul => a * db + b * da,
                            BinaryOp::Div => (b * da - a * db) / (b * b),
                        };
                        self.stack.write(frame.ret_slot, df.index());
                    }
                }
                ExpressionNode::Fn { fun, arg } => {
                    if !frame.ready {
                        let position = self.stack.push(frame.node_index, true, frame.ret_slot);
                        self.push_operand(arg, position * 2)?;
                    } else {
                        // `exp` and `sqrt` reuse the function's own node; it
                        // precedes its derivative in the store, so the JIT
                        // will already have its slot cached.
                        let f = Value::from_index(ExpressionNodeIndex::from_node(frame.node_index));
                        let x = Value::from_index(arg);
                        let dx = Value::from_index(frame.ret[0]);
                        let df = match fun {
                            MathFn::Exp => dx * f,
                            MathFn::Log => dx / x,
                            MathFn::Sin => dx * x.cos(),
                            MathFn::Cos => -dx * x.sin(),
                            MathFn::Tan => dx / x.cos().sqr(),
                            MathFn::Sqr => dx * 2.0 * x,
                            MathFn::Sqrt => dx / (2.0 * f),
                            MathFn::Asin => dx / (1.0 - x.sqr()).sqrt(),
                            MathFn::Acos => -dx / (1.0 - x.sqr()).sqrt(),
                            MathFn::Atan => dx / (1.0 + x.sqr()),
                            MathFn::UnitStep | MathFn::Sigmoid => {
                                return Err(EngineError::DifferentiationRefused(fun.name()))
                            }
                            MathFn::Ramp => dx * x.unit_step(),
                            MathFn::LogSigmoid => dx * (-x).sigmoid(),
                        };
                        self.stack.write(frame.ret_slot, df.index());
                    }
                }
                ExpressionNode::Lambda => match self.mode {
                    Mode::ByVar { .. } => return Err(EngineError::UnexpectedLambda),
                    Mode::ByLambda => {
                        self.stack
                            .write(frame.ret_slot, Value::from_f64(1.0).index());
                    }
                },
            }
        }
        Ok(Value::from_index(self.stack.result()))
    }
}

/// The partial derivative of `f` by the variable with dense index `wrt`.
pub fn differentiate(f: Value, config: &VarsConfig, wrt: usize) -> Result<Value, EngineError> {
    let mut stack = ManualStack::new();
    Differentiator {
        mode: Mode::ByVar { config, wrt },
        stack: &mut stack,
    }
    .differentiate(f)
}

/// The gradient of `f`: one derivative handle per dense variable. Empty for a
/// configuration with no variables.
pub fn gradient(f: Value, config: &VarsConfig) -> Result<Vec<Value>, EngineError> {
    let mut stack = ManualStack::new();
    let mut result = Vec::with_capacity(config.number_of_vars());
    for wrt in 0..config.number_of_vars() {
        result.push(
            Differentiator {
                mode: Mode::ByVar { config, wrt },
                stack: &mut stack,
            }
            .differentiate(f)?,
        );
    }
    Ok(result)
}

/// The derivative of a line-search function by its λ argument.
pub fn differentiate_by_lambda(f: Value) -> Result<Value, EngineError> {
    let mut stack = ManualStack::new();
    Differentiator {
        mode: Mode::ByLambda,
        stack: &mut stack,
    }
    .differentiate(f)
}

/// Builds the 1-D line function `l(λ) = f(x0 + λ·g)`: emits the substitution
/// `xᵢ + λ·gᵢ` per variable, then rewrites `f` over the substitutions.
pub fn build_line_function(
    f: Value,
    g: &[Value],
    config: &VarsConfig,
) -> Result<Value, EngineError> {
    if g.len() != config.number_of_vars() {
        return Err(EngineError::GradientDimMismatch {
            expected: config.number_of_vars(),
            got: g.len(),
        });
    }

    let lambda = Value::lambda();
    let mut substitute = Vec::with_capacity(g.len());
    for (i, gi) in g.iter().enumerate() {
        let xi = Value::from_var(config.q_by_dense[i]);
        substitute.push(xi + lambda * *gi);
    }

    rewrite_over_substitutions(f, &substitute, config)
}

// Rewrites the DAG under `f`, replacing variable handles with their
// substitutions. Nodes whose children are untouched keep their original
// handle, so the λ-free parts of `f` stay shared with the line function (and
// with the JIT slots already computed for them). Memoized by store index;
// iterative for the same depth reasons as the differentiator.
fn rewrite_over_substitutions(
    f: Value,
    substitute: &[Value],
    config: &VarsConfig,
) -> Result<Value, EngineError> {
    let resolve_simple = |operand: ExpressionNodeIndex,
                          memo: &HashMap<usize, ExpressionNodeIndex>|
     -> Result<Option<ExpressionNodeIndex>, EngineError> {
        match operand.kind() {
            IndexKind::Node(index) => Ok(memo.get(&index).copied()),
            IndexKind::Var(q) => {
                let dense = *config.dense_by_q.get(q).ok_or_else(|| {
                    EngineError::Management(format!(
                        "leaf {q} is not covered by the supplied configuration"
                    ))
                })?;
                Ok(Some(substitute[dense].index()))
            }
            IndexKind::Immediate(_) | IndexKind::Lambda => Ok(Some(operand)),
        }
    };

    let root = match f.index().kind() {
        IndexKind::Node(index) => index,
        _ => {
            return resolve_simple(f.index(), &HashMap::new())
                .map(|resolved| Value::from_index(resolved.unwrap_or_else(|| f.index())))
        }
    };

    let mut memo: HashMap<usize, ExpressionNodeIndex> = HashMap::new();
    let mut stack: Vec<(usize, bool)> = vec![(root, false)];

    while let Some((index, ready)) = stack.pop() {
        if memo.contains_key(&index) {
            continue;
        }
        let node = node_at(index)?;
        if !ready {
            stack.push((index, true));
            match node {
                ExpressionNode::Op { lhs, rhs, .. } => {
                    for child in [lhs, rhs] {
                        if let IndexKind::Node(child_index) = child.kind() {
                            if !memo.contains_key(&child_index) {
                                stack.push((child_index, false));
                            }
                        }
                    }
                }
                ExpressionNode::Fn { arg, .. } => {
                    if let IndexKind::Node(child_index) = arg.kind() {
                        if !memo.contains_key(&child_index) {
                            stack.push((child_index, false));
                        }
                    }
                }
                ExpressionNode::Immediate(_) | ExpressionNode::Lambda => {}
            }
        } else {
            let rewritten = match node {
                ExpressionNode::Immediate(_) | ExpressionNode::Lambda => {
                    ExpressionNodeIndex::from_node(index)
                }
                ExpressionNode::Op { op, lhs, rhs } => {
                    let new_lhs = resolve_simple(lhs, &memo)?.unwrap_or(lhs);
                    let new_rhs = resolve_simple(rhs, &memo)?.unwrap_or(rhs);
                    if new_lhs == lhs && new_rhs == rhs {
                        ExpressionNodeIndex::from_node(index)
                    } else {
                        crate::expression::append_node(ExpressionNode::Op {
                            op,
                            lhs: new_lhs,
                            rhs: new_rhs,
                        })
                    }
                }
                ExpressionNode::Fn { fun, arg } => {
                    let new_arg = resolve_simple(arg, &memo)?.unwrap_or(arg);
                    if new_arg == arg {
                        ExpressionNodeIndex::from_node(index)
                    } else {
                        crate::expression::append_node(ExpressionNode::Fn { fun, arg: new_arg })
                    }
                }
            };
            memo.insert(index, rewritten);
        }
    }

    memo.get(&root)
        .copied()
        .map(Value::from_index)
        .ok_or_else(|| EngineError::Management("line-function rewrite lost its root".to_string()))
}
