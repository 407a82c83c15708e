use thiserror::Error;

/// Error type for invalid operations.
#[derive(Error, Debug)]
pub enum CoupledError {
    /// A supplied buffer is too small for the declared layout, or a user
    /// function returned a value whose flattened length differs from the
    /// declared outputs.
    #[error("size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// A variable name appears more than once within a single declaration tuple.
    #[error("variable '{variable}' is declared more than once in the same tuple")]
    DuplicateVariable { variable: String },

    /// An inner component's input is neither a system input nor produced by an
    /// earlier component.
    #[error(
        "input '{variable}' of component '{component}' is not provided by the \
         system inputs or by any earlier component"
    )]
    UnresolvedInput { component: String, variable: String },

    /// A declared system output is not produced by any inner component.
    #[error("system output '{variable}' is not produced by any component")]
    UnresolvedOutput { variable: String },

    /// An inner component's input is only available from the same or a later
    /// component. Explicit systems must be acyclic; a genuine feedback loop has
    /// to be closed through an implicit system instead.
    #[error("input '{variable}' of component '{component}' forms a forward reference: {detail}")]
    Cycle {
        component: String,
        variable: String,
        detail: String,
    },

    /// The requested Jacobian cannot be produced by any configured provider.
    #[error("no derivative provider can supply {operation}: {reason}")]
    ProviderUnavailable { operation: String, reason: String },

    /// Newton iteration failed to converge.
    #[error(
        "Newton solve diverged after {iterations} iterations \
         (residual inf-norm {residual_norm:.3e})"
    )]
    SolveDiverged {
        iterations: usize,
        residual_norm: f64,
    },

    /// The linear solve for the output sensitivities failed.
    #[error("residual output Jacobian is singular; cannot recover output sensitivities")]
    SingularJacobian,
}

/// Convenience type for `Result<T, CoupledError>`.
pub type CoupledResult<T> = Result<T, CoupledError>;
