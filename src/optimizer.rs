use crate::differentiate::{build_line_function, differentiate_by_lambda, gradient};
use crate::error::EngineError;
use crate::expression::Value;
use crate::jit::{
    CompiledFunction, CompiledFunctionWithArgument, CompiledVectorFunction, JitCallContext,
    JitCompiler,
};
use crate::line_search::LineSearchContext;
use crate::vars::{VarsConfig, VarsContext, VarsMapper};

/// The working set of one optimization run: the objective function, its
/// gradient, the 1-D line function with two λ-derivatives, and all of them
/// JIT-compiled in a single scope so that later functions reuse the scratch
/// slots earlier ones computed.
///
/// The compilation order — f, g, l, l′, l″ — is the order the functions must
/// be invoked in on every new input point.
pub struct OptimizationContext {
    pub f: Value,
    pub g: Vec<Value>,
    pub l: Value,
    pub ds: Vec<Value>,
    pub config: VarsConfig,
    pub vars_mapper: VarsMapper,
    pub jit_call_context: JitCallContext,
    pub compiled_f: CompiledFunction,
    pub compiled_g: CompiledVectorFunction,
    pub compiled_l: CompiledFunctionWithArgument,
    pub compiled_ds: Vec<CompiledFunctionWithArgument>,
}

impl OptimizationContext {
    pub fn new(vars_context: &VarsContext, f: Value) -> Result<Self, EngineError> {
        // Derivatives need dense indices but append nodes themselves, so the
        // session is stamped without locking; the call context freezes it
        // once the store is complete.
        let preliminary = vars_context.reindex_vars()?;
        let g = gradient(f, &preliminary)?;
        let l = build_line_function(f, &g, &preliminary)?;
        let d1 = differentiate_by_lambda(l)?;
        let d2 = differentiate_by_lambda(d1)?;
        let ds = vec![d1, d2];

        let jit_call_context = JitCallContext::new()?;
        let config = jit_call_context.config().clone();
        let vars_mapper = VarsMapper::new(&config);

        let mut compiler = JitCompiler::new(&jit_call_context)?;
        let compiled_f = compiler.compile(f)?;
        let compiled_g = compiler.compile_vector(&g)?;
        let compiled_l = compiler.compile_with_argument(l)?;
        let mut compiled_ds = Vec::with_capacity(ds.len());
        for d in &ds {
            compiled_ds.push(compiler.compile_with_argument(*d)?);
        }

        Ok(OptimizationContext {
            f,
            g,
            l,
            ds,
            config,
            vars_mapper,
            jit_call_context,
            compiled_f,
            compiled_g,
            compiled_l,
            compiled_ds,
        })
    }

    pub fn current_point(&self) -> &[f64] {
        &self.vars_mapper.x
    }

    pub fn compute_current_objective_function_value(&self) -> Result<f64, EngineError> {
        self.compiled_f
            .call(&self.jit_call_context, &self.vars_mapper.x)
    }

    pub fn compute_current_gradient_value(&self) -> Result<Vec<f64>, EngineError> {
        self.compiled_g
            .call(&self.jit_call_context, &self.vars_mapper.x)
    }

    /// Applies `x[i] += step · g[i]` to the non-constant variables, reading
    /// the gradient values cached by the latest evaluation.
    pub fn move_point_along_gradient(&mut self, step: f64) -> Result<(), EngineError> {
        self.vars_mapper
            .move_point(&self.jit_call_context, &self.g, step)
    }

    pub fn mark_new_point(&self) {
        self.jit_call_context.mark_new_point();
    }

    pub fn line_search_context(&self) -> LineSearchContext<'_> {
        LineSearchContext {
            jit_call_context: &self.jit_call_context,
            vars_mapper: &self.vars_mapper,
            l: &self.compiled_l,
            d: &self.compiled_ds[0],
            more_ds: self.compiled_ds[1..].iter().collect(),
        }
    }
}
