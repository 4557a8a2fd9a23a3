use thiserror::Error;

/// The primary error type for the `descent` crate.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation touched the variables namespace while no session was active on this thread.
    #[error("no active variables session on this thread")]
    NoSession,
    /// An illegal lifecycle action: a nested session, a dense vector of an
    /// out-of-range length, an out-of-bounds subscript, and similar misuse.
    #[error("variables management error: {0}")]
    Management(String),
    /// A node in the namespace tree was accessed in a way that conflicts with
    /// the variant fixed by its first use.
    #[error("variable node type mismatch at '{0}'")]
    TypeMismatch(String),
    /// A committed leaf was assigned a value different from the one it holds.
    #[error("conflicting reassignment of variable '{0}'")]
    Reassignment(String),
    /// `freeze` was called on an already frozen session.
    #[error("variables session is already frozen")]
    AlreadyFrozen,
    /// `unfreeze` was called on a session that is not frozen.
    #[error("variables session is not frozen")]
    NotFrozen,
    /// A mutation was attempted after the session was frozen.
    #[error("variables session is frozen")]
    Frozen,
    /// A leaf-only operation was requested on an interior or unset node.
    #[error("variable path '{0}' is not a value leaf")]
    IsNotLeaf(String),
    /// A mapper path does not address any variable of the frozen configuration.
    #[error("no variable behind the path '{0}'")]
    WrongVar(String),
    /// Mutable access was requested on a leaf marked constant.
    #[error("variable '{0}' is a constant")]
    VarIsConstant(String),
    /// Differentiation of this function is deliberately not implemented.
    #[error("refusing to differentiate '{0}'; rewrite the expression via its smooth counterpart")]
    DifferentiationRefused(&'static str),
    /// A λ handle was encountered while differentiating by a variable.
    #[error("lambda encountered while differentiating by a variable")]
    UnexpectedLambda,
    /// A gradient vector of the wrong dimension was supplied.
    #[error("gradient dimension {got} disagrees with the variable count {expected}")]
    GradientDimMismatch { expected: usize, got: usize },
    /// A vector-returning function needs more output slots than the call context allocated.
    #[error("vector function with {required} outputs exceeds the {available} extra scratch slots")]
    NotEnoughExtras { required: usize, available: usize },
    /// A compiled function was invoked against a call context it was not compiled for.
    #[error("compiled function invoked against a foreign call context")]
    ContextMismatch,
    /// A compiled function was invoked out of emission order on a new input point.
    #[error("compiled function invoked before its prerequisites on a new input point")]
    PrerequisiteNotMet,
    /// The number of values provided for evaluation did not cover the variables of the configuration.
    #[error("values length mismatch: expected at least {expected}, got {got}")]
    ValuesLen { expected: usize, got: usize },
}
