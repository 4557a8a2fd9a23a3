#![doc = include_str!("../README.md")]

mod differentiate;
mod error;
mod expression;
mod vars;

#[cfg(all(target_arch = "x86_64", unix))]
mod jit;
#[cfg(all(target_arch = "x86_64", unix))]
mod line_search;
#[cfg(all(target_arch = "x86_64", unix))]
mod memory;
#[cfg(all(target_arch = "x86_64", unix))]
mod opcodes;
#[cfg(all(target_arch = "x86_64", unix))]
mod optimizer;

pub use differentiate::{build_line_function, differentiate, differentiate_by_lambda, gradient};
pub use error::EngineError;
pub use expression::Value;
pub use vars::{x, MapperSlot, Var, VarKey, VarsConfig, VarsContext, VarsMapper};

#[cfg(all(target_arch = "x86_64", unix))]
pub use jit::{
    CompiledFunction, CompiledFunctionWithArgument, CompiledVectorFunction, JitCallContext,
    JitCompiler,
};
#[cfg(all(target_arch = "x86_64", unix))]
pub use line_search::{line_search, IntermediatePoint, LineSearchContext, LineSearchResult};
#[cfg(all(target_arch = "x86_64", unix))]
pub use optimizer::OptimizationContext;
