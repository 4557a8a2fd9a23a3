use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::error::EngineError;
use crate::expression::{
    node_at, ExpressionNode, ExpressionNodeIndex, IndexKind, Value, MATH_FN_COUNT,
};
use crate::memory::ExecutableMemory;
use crate::opcodes;
use crate::vars::{freeze_active, unfreeze_active_if_frozen, with_active, VarsConfig, VarsMapper};

// The compiled leaf functions follow System V AMD64: the input vector arrives
// in rdi, the scratch RAM base in rsi (copied to rbx for addressing that
// survives helper calls), the helper-pointer array in rdx, and the scalar
// result leaves in xmm0.
type MathHelper = extern "C" fn(f64) -> f64;
type JitFn = unsafe extern "C" fn(*const f64, *mut f64, *const MathHelper) -> f64;

extern "C" fn helper_exp(x: f64) -> f64 {
    x.exp()
}
extern "C" fn helper_log(x: f64) -> f64 {
    x.ln()
}
extern "C" fn helper_sin(x: f64) -> f64 {
    x.sin()
}
extern "C" fn helper_cos(x: f64) -> f64 {
    x.cos()
}
extern "C" fn helper_tan(x: f64) -> f64 {
    x.tan()
}
extern "C" fn helper_sqr(x: f64) -> f64 {
    x * x
}
extern "C" fn helper_sqrt(x: f64) -> f64 {
    x.sqrt()
}
extern "C" fn helper_asin(x: f64) -> f64 {
    x.asin()
}
extern "C" fn helper_acos(x: f64) -> f64 {
    x.acos()
}
extern "C" fn helper_atan(x: f64) -> f64 {
    x.atan()
}
extern "C" fn helper_unit_step(x: f64) -> f64 {
    if x >= 0.0 {
        1.0
    } else {
        0.0
    }
}
extern "C" fn helper_ramp(x: f64) -> f64 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}
extern "C" fn helper_sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
extern "C" fn helper_log_sigmoid(x: f64) -> f64 {
    -(1.0 + (-x).exp()).ln()
}

// Indexed by `MathFn` discriminants; the JIT calls through this table via rdx.
static MATH_HELPERS: [MathHelper; MATH_FN_COUNT] = [
    helper_exp,
    helper_log,
    helper_sin,
    helper_cos,
    helper_tan,
    helper_sqr,
    helper_sqrt,
    helper_asin,
    helper_acos,
    helper_atan,
    helper_unit_step,
    helper_ramp,
    helper_sigmoid,
    helper_log_sigmoid,
];

/// Extra vector-output slots allocated beyond the λ slot when no explicit
/// count is given: one per variable plus a small reserve, so a gradient
/// always fits.
fn default_extras(config: &VarsConfig) -> usize {
    config.number_of_vars() + 4
}

pub(crate) struct CallContextInner {
    config: VarsConfig,
    /// The scratch slot count for node results; slot `number_of_nodes` holds λ.
    number_of_nodes: usize,
    /// Vector-output capacity beyond the λ slot.
    extras: usize,
    ram: RefCell<Vec<f64>>,
    functions_declared: Cell<usize>,
    next_legal_function_index: Cell<usize>,
}

impl CallContextInner {
    fn lambda_slot(&self) -> usize {
        self.number_of_nodes
    }

    // Callers climb the ladder of functions one at a time per input point;
    // re-calling an already climbed function is always legal.
    fn check_and_mark_computed(&self, function_index: usize) -> Result<(), EngineError> {
        if function_index > self.next_legal_function_index.get() {
            return Err(EngineError::PrerequisiteNotMet);
        }
        self.next_legal_function_index
            .set(self.next_legal_function_index.get().max(function_index + 1));
        Ok(())
    }

    fn check_input_and_order(
        &self,
        values_len: usize,
        function_index: usize,
    ) -> Result<(), EngineError> {
        let needed = self.config.number_of_vars();
        if values_len < needed {
            return Err(EngineError::ValuesLen {
                expected: needed,
                got: values_len,
            });
        }
        self.check_and_mark_computed(function_index)
    }
}

/// The holder of the scratch RAM the compiled functions run against.
///
/// Creating a call context freezes the session (and fails if it is already
/// frozen); dropping it unfreezes the session again. Functions compiled
/// against one context refuse to run against another.
pub struct JitCallContext {
    pub(crate) inner: Rc<CallContextInner>,
}

impl JitCallContext {
    /// Freezes the active session and allocates scratch RAM for it, with the
    /// default vector-output capacity.
    pub fn new() -> Result<Self, EngineError> {
        let config = freeze_active()?;
        let extras = default_extras(&config);
        Ok(Self::build(config, extras))
    }

    /// Like [`JitCallContext::new`] with an explicit vector-output capacity.
    pub fn with_extras(extras: usize) -> Result<Self, EngineError> {
        let config = freeze_active()?;
        Ok(Self::build(config, extras))
    }

    /// Adopts a configuration snapshot produced by an explicit freeze.
    pub fn from_config(config: VarsConfig) -> Self {
        let extras = default_extras(&config);
        Self::build(config, extras)
    }

    pub fn from_config_with_extras(config: VarsConfig, extras: usize) -> Self {
        Self::build(config, extras)
    }

    fn build(config: VarsConfig, extras: usize) -> Self {
        let number_of_nodes = config.number_of_nodes;
        let ram = vec![0.0; number_of_nodes + 1 + extras];
        JitCallContext {
            inner: Rc::new(CallContextInner {
                config,
                number_of_nodes,
                extras,
                ram: RefCell::new(ram),
                functions_declared: Cell::new(0),
                next_legal_function_index: Cell::new(0),
            }),
        }
    }

    pub fn config(&self) -> &VarsConfig {
        &self.inner.config
    }

    /// Resets the emission-order ladder; call before evaluating the compiled
    /// functions on a different input point.
    pub fn mark_new_point(&self) {
        self.inner.next_legal_function_index.set(0);
    }
}

impl Drop for JitCallContext {
    fn drop(&mut self) {
        unfreeze_active_if_frozen();
    }
}

/// Emits machine code for expression roots into per-function executable
/// buffers. One compiler instance is a reuse scope: a node computed by an
/// earlier function is loaded from its scratch slot by later ones instead of
/// being recomputed, which is why callers must invoke the functions in
/// emission order on each new input point.
pub struct JitCompiler {
    inner: Rc<CallContextInner>,
    node_computed: Vec<bool>,
    stack: Vec<(usize, bool)>,
}

impl JitCompiler {
    pub fn new(context: &JitCallContext) -> Result<Self, EngineError> {
        // Emission reads the expression store, so the session must be alive.
        with_active(|_| Ok(()))?;
        Ok(JitCompiler {
            inner: Rc::clone(&context.inner),
            node_computed: vec![false; context.inner.number_of_nodes],
            stack: Vec::new(),
        })
    }

    fn dense_index_of(&self, q: usize) -> Result<usize, EngineError> {
        self.inner.config.dense_by_q.get(q).copied().ok_or_else(|| {
            EngineError::Management(format!(
                "leaf {q} is not covered by this call context's configuration"
            ))
        })
    }

    fn check_node_bounds(&self, index: usize) -> Result<(), EngineError> {
        if index >= self.inner.number_of_nodes {
            return Err(EngineError::Management(format!(
                "expression node {index} was created after this call context; \
                 build every expression before allocating the context"
            )));
        }
        Ok(())
    }

    fn push_if_needed(&mut self, operand: ExpressionNodeIndex) -> Result<(), EngineError> {
        if let IndexKind::Node(index) = operand.kind() {
            self.check_node_bounds(index)?;
            if !self.node_computed[index] {
                self.stack.push((index, false));
            }
        }
        Ok(())
    }

    fn emit_load_to_xmm0(
        &self,
        code: &mut Vec<u8>,
        operand: ExpressionNodeIndex,
    ) -> Result<(), EngineError> {
        match operand.kind() {
            IndexKind::Node(index) => opcodes::load_from_rbx_offset_to_xmm0(code, index),
            IndexKind::Var(q) => {
                opcodes::load_from_rdi_offset_to_xmm0(code, self.dense_index_of(q)?)
            }
            IndexKind::Immediate(value) => opcodes::load_immediate_to_xmm0(code, value),
            IndexKind::Lambda => {
                opcodes::load_from_rbx_offset_to_xmm0(code, self.inner.lambda_slot())
            }
        }
        Ok(())
    }

    // The body of the emitter: computes every not-yet-computed node under
    // `requested` into its scratch slot, children before parents, sharing
    // respected via `node_computed`. Iterative for depth reasons.
    fn emit_subtree(
        &mut self,
        code: &mut Vec<u8>,
        requested: ExpressionNodeIndex,
    ) -> Result<(), EngineError> {
        self.push_if_needed(requested)?;

        while let Some((index, ready)) = self.stack.pop() {
            if self.node_computed[index] {
                continue;
            }
            let node = node_at(index)?;
            match node {
                ExpressionNode::Immediate(value) => {
                    // A stored immediate has no children; materialize its slot.
                    opcodes::load_immediate_to_xmm0(code, value);
                    opcodes::store_xmm0_to_rbx_offset(code, index);
                    self.node_computed[index] = true;
                }
                ExpressionNode::Lambda => {
                    opcodes::load_from_rbx_offset_to_xmm0(code, self.inner.lambda_slot());
                    opcodes::store_xmm0_to_rbx_offset(code, index);
                    self.node_computed[index] = true;
                }
                ExpressionNode::Op { op, lhs, rhs } => {
                    if !ready {
                        self.stack.push((index, true));
                        self.push_if_needed(rhs)?;
                        self.push_if_needed(lhs)?;
                    } else {
                        self.emit_load_to_xmm0(code, lhs)?;
                        match rhs.kind() {
                            IndexKind::Node(rhs_index) => {
                                opcodes::op_from_rbx_offset_to_xmm0(code, op, rhs_index)
                            }
                            IndexKind::Var(q) => opcodes::op_from_rdi_offset_to_xmm0(
                                code,
                                op,
                                self.dense_index_of(q)?,
                            ),
                            IndexKind::Immediate(value) => {
                                opcodes::load_immediate_to_xmm1(code, value);
                                opcodes::op_xmm1_to_xmm0(code, op);
                            }
                            IndexKind::Lambda => opcodes::op_from_rbx_offset_to_xmm0(
                                code,
                                op,
                                self.inner.lambda_slot(),
                            ),
                        }
                        opcodes::store_xmm0_to_rbx_offset(code, index);
                        self.node_computed[index] = true;
                    }
                }
                ExpressionNode::Fn { fun, arg } => {
                    if !ready {
                        self.stack.push((index, true));
                        self.push_if_needed(arg)?;
                    } else {
                        self.emit_load_to_xmm0(code, arg)?;
                        // rdi and rdx are caller-saved from our perspective;
                        // the two pushes also keep rsp 16-byte aligned at the
                        // call (entry misalignment + rbx push + these two).
                        opcodes::push_rdi(code);
                        opcodes::push_rdx(code);
                        opcodes::call_function_from_rdx_array(code, fun.call_index());
                        opcodes::pop_rdx(code);
                        opcodes::pop_rdi(code);
                        opcodes::store_xmm0_to_rbx_offset(code, index);
                        self.node_computed[index] = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_scalar_body(&mut self, f: Value) -> Result<Vec<u8>, EngineError> {
        let mut code = Vec::new();
        match f.index().kind() {
            IndexKind::Node(node_index) => {
                self.check_node_bounds(node_index)?;
                opcodes::push_rbx(&mut code);
                opcodes::mov_rsi_to_rbx(&mut code);
                self.emit_subtree(&mut code, f.index())?;
                opcodes::load_from_rbx_offset_to_xmm0(&mut code, node_index);
                opcodes::pop_rbx(&mut code);
            }
            IndexKind::Var(q) => {
                opcodes::load_from_rdi_offset_to_xmm0(&mut code, self.dense_index_of(q)?);
            }
            IndexKind::Immediate(value) => {
                opcodes::load_immediate_to_xmm0(&mut code, value);
            }
            IndexKind::Lambda => {
                opcodes::load_from_rsi_offset_to_xmm0(&mut code, self.inner.lambda_slot());
            }
        }
        opcodes::ret(&mut code);
        Ok(code)
    }

    fn declare_function(&self) -> usize {
        let index = self.inner.functions_declared.get();
        self.inner.functions_declared.set(index + 1);
        index
    }

    /// Compiles a scalar-returning function of the input vector.
    pub fn compile(&mut self, f: Value) -> Result<CompiledFunction, EngineError> {
        let code = self.emit_scalar_body(f)?;
        let function_index = self.declare_function();
        debug!("JIT function {function_index}: {} bytes", code.len());
        Ok(CompiledFunction {
            inner: Rc::clone(&self.inner),
            memory: ExecutableMemory::new(&code)?,
            code_size: code.len(),
            function_index,
        })
    }

    /// Compiles a function storing one output per supplied root into the
    /// context's extra scratch slots.
    pub fn compile_vector(
        &mut self,
        values: &[Value],
    ) -> Result<CompiledVectorFunction, EngineError> {
        if values.len() > self.inner.extras {
            return Err(EngineError::NotEnoughExtras {
                required: values.len(),
                available: self.inner.extras,
            });
        }
        let mut code = Vec::new();
        opcodes::push_rbx(&mut code);
        opcodes::mov_rsi_to_rbx(&mut code);
        for value in values {
            if let IndexKind::Node(index) = value.index().kind() {
                self.check_node_bounds(index)?;
            }
            self.emit_subtree(&mut code, value.index())?;
        }
        let lambda_slot = self.inner.lambda_slot();
        for (k, value) in values.iter().enumerate() {
            self.emit_load_to_xmm0(&mut code, value.index())?;
            opcodes::store_xmm0_to_rbx_offset(&mut code, lambda_slot + 1 + k);
        }
        opcodes::pop_rbx(&mut code);
        opcodes::ret(&mut code);

        let function_index = self.declare_function();
        debug!(
            "JIT vector function {function_index}: {} outputs, {} bytes",
            values.len(),
            code.len()
        );
        Ok(CompiledVectorFunction {
            inner: Rc::clone(&self.inner),
            memory: ExecutableMemory::new(&code)?,
            code_size: code.len(),
            function_index,
            outputs: values.len(),
        })
    }

    /// Compiles a function of the input vector and the scalar λ argument.
    pub fn compile_with_argument(
        &mut self,
        f: Value,
    ) -> Result<CompiledFunctionWithArgument, EngineError> {
        let code = self.emit_scalar_body(f)?;
        let function_index = self.declare_function();
        debug!("JIT λ-function {function_index}: {} bytes", code.len());
        Ok(CompiledFunctionWithArgument {
            inner: Rc::clone(&self.inner),
            memory: ExecutableMemory::new(&code)?,
            code_size: code.len(),
            function_index,
        })
    }
}

/// A compiled scalar function of the input vector.
pub struct CompiledFunction {
    inner: Rc<CallContextInner>,
    memory: ExecutableMemory,
    code_size: usize,
    function_index: usize,
}

impl CompiledFunction {
    pub fn call(&self, context: &JitCallContext, x: &[f64]) -> Result<f64, EngineError> {
        if !Rc::ptr_eq(&self.inner, &context.inner) {
            return Err(EngineError::ContextMismatch);
        }
        self.inner.check_input_and_order(x.len(), self.function_index)?;
        let mut ram = self.inner.ram.borrow_mut();
        let f: JitFn = unsafe { std::mem::transmute(self.memory.as_ptr()) };
        Ok(unsafe { f(x.as_ptr(), ram.as_mut_ptr(), MATH_HELPERS.as_ptr()) })
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }
}

/// A compiled function whose outputs land in the context's extra slots.
pub struct CompiledVectorFunction {
    inner: Rc<CallContextInner>,
    memory: ExecutableMemory,
    code_size: usize,
    function_index: usize,
    outputs: usize,
}

impl CompiledVectorFunction {
    pub fn call(&self, context: &JitCallContext, x: &[f64]) -> Result<Vec<f64>, EngineError> {
        if !Rc::ptr_eq(&self.inner, &context.inner) {
            return Err(EngineError::ContextMismatch);
        }
        self.inner.check_input_and_order(x.len(), self.function_index)?;
        let mut ram = self.inner.ram.borrow_mut();
        let f: JitFn = unsafe { std::mem::transmute(self.memory.as_ptr()) };
        unsafe {
            f(x.as_ptr(), ram.as_mut_ptr(), MATH_HELPERS.as_ptr());
        }
        let first = self.inner.lambda_slot() + 1;
        Ok(ram[first..first + self.outputs].to_vec())
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }
}

/// A compiled scalar function of the input vector and λ.
pub struct CompiledFunctionWithArgument {
    inner: Rc<CallContextInner>,
    memory: ExecutableMemory,
    code_size: usize,
    function_index: usize,
}

impl CompiledFunctionWithArgument {
    pub fn call(&self, context: &JitCallContext, x: &[f64], lambda: f64) -> Result<f64, EngineError> {
        if !Rc::ptr_eq(&self.inner, &context.inner) {
            return Err(EngineError::ContextMismatch);
        }
        self.inner.check_input_and_order(x.len(), self.function_index)?;
        let mut ram = self.inner.ram.borrow_mut();
        let slot = self.inner.lambda_slot();
        ram[slot] = lambda;
        let f: JitFn = unsafe { std::mem::transmute(self.memory.as_ptr()) };
        Ok(unsafe { f(x.as_ptr(), ram.as_mut_ptr(), MATH_HELPERS.as_ptr()) })
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }
}

impl VarsMapper {
    /// Moves the point along the gradient: `x[i] += step · g[i]` for every
    /// non-constant variable. Gradient handles are resolved against the
    /// context's scratch RAM (so the gradient must have been evaluated at the
    /// current point), the point itself, or their inline immediates.
    pub fn move_point(
        &mut self,
        context: &JitCallContext,
        g: &[Value],
        step: f64,
    ) -> Result<(), EngineError> {
        let n = self.config.number_of_vars();
        if g.len() != n {
            return Err(EngineError::GradientDimMismatch {
                expected: n,
                got: g.len(),
            });
        }
        let ram = context.inner.ram.borrow();
        for i in 0..n {
            if self.config.is_constant[i] {
                continue;
            }
            let gi = match g[i].index().kind() {
                IndexKind::Node(index) => *ram.get(index).ok_or_else(|| {
                    EngineError::Management(format!(
                        "gradient node {index} is outside this call context's scratch RAM"
                    ))
                })?,
                IndexKind::Var(q) => {
                    let dense = self.config.dense_by_q.get(q).copied().ok_or_else(|| {
                        EngineError::Management(format!(
                            "leaf {q} is not covered by this mapper's configuration"
                        ))
                    })?;
                    self.x[dense]
                }
                IndexKind::Immediate(value) => value,
                IndexKind::Lambda => return Err(EngineError::UnexpectedLambda),
            };
            self.x[i] += step * gi;
        }
        Ok(())
    }
}
