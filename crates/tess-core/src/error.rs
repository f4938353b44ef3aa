//! Compilation error taxonomy.
//!
//! Every error unwinds out of the current compilation unit entirely;
//! there is no statement-level recovery and no retry anywhere.

use thiserror::Error;

/// Compilation error.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A named type was not found in any enclosing scope or the builtin
    /// registry.
    #[error("unresolved type: {0}")]
    UnresolvedType(String),

    /// The typed input violated an assumption the frontend is supposed
    /// to guarantee (e.g. a mistyped operand).
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Internal consistency error: a defect in the compiler itself,
    /// not user-actionable. Carries enough context to diagnose the
    /// offending node or id.
    #[error("internal compiler error: {0}")]
    Internal(String),

    /// A construct the frontend recognizes but this backend does not
    /// lower yet. Raised explicitly rather than silently mis-compiling.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// A construct disabled by configuration (e.g. `--no-any`).
    #[error("unsupported with current options: {0}")]
    Unsupported(String),

    /// Failure while encoding or rendering the output module.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The emitted module failed post-hoc validation.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the compiler.
pub type CompileResult<T> = Result<T, CompileError>;

impl CompileError {
    /// Shorthand for internal-consistency failures.
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CompileError::UnresolvedType("Point".to_string());
        assert_eq!(e.to_string(), "unresolved type: Point");

        let e = CompileError::internal("operand stack underflow in func#3");
        assert!(e.to_string().contains("operand stack underflow"));
    }
}
