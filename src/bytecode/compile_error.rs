/// A compile-time fault. Compilation stops at the first one; there is no
/// recovery and no partial output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// A token that doesn't fit where it appeared
    #[error("compiler {line}: unexpected token '{found}', expected {expected}")]
    UnexpectedToken {
        line: usize,
        found: String,
        expected: String,
    },

    /// A token that cannot start an expression
    #[error("compiler {line}: no prefix parse function for '{token}'")]
    NoPrefix { line: usize, token: String },

    /// Missing or misaligned indented block
    #[error("compiler {line}: no block, {reason}")]
    NoBlock { line: usize, reason: String },

    #[error("compiler {line}: '{keyword}' used outside of a loop")]
    LoopControlOutsideLoop { line: usize, keyword: String },

    #[error("compiler {line}: invalid generic: {reason}")]
    InvalidGeneric { line: usize, reason: String },

    #[error("compiler {line}: invalid assignment target")]
    InvalidAssignment { line: usize },

    #[error("compiler {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("compiler {line}: unexpected end of input, expected {expected}")]
    UnexpectedEof { line: usize, expected: String },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compiler: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn unexpected(line: usize, found: impl ToString, expected: impl Into<String>) -> Self {
        CompileError::UnexpectedToken {
            line,
            found: found.to_string(),
            expected: expected.into(),
        }
    }

    pub fn no_prefix(line: usize, token: impl ToString) -> Self {
        CompileError::NoPrefix {
            line,
            token: token.to_string(),
        }
    }

    pub fn no_block(line: usize, reason: impl Into<String>) -> Self {
        CompileError::NoBlock {
            line,
            reason: reason.into(),
        }
    }

    pub fn outside_loop(line: usize, keyword: impl Into<String>) -> Self {
        CompileError::LoopControlOutsideLoop {
            line,
            keyword: keyword.into(),
        }
    }

    pub fn invalid_generic(line: usize, reason: impl Into<String>) -> Self {
        CompileError::InvalidGeneric {
            line,
            reason: reason.into(),
        }
    }

    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        CompileError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub fn eof(line: usize, expected: impl Into<String>) -> Self {
        CompileError::UnexpectedEof {
            line,
            expected: expected.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// Source line of the fault, if it has one.
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::UnexpectedToken { line, .. }
            | CompileError::NoPrefix { line, .. }
            | CompileError::NoBlock { line, .. }
            | CompileError::LoopControlOutsideLoop { line, .. }
            | CompileError::InvalidGeneric { line, .. }
            | CompileError::InvalidAssignment { line }
            | CompileError::Syntax { line, .. }
            | CompileError::UnexpectedEof { line, .. } => Some(*line),
            CompileError::Internal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_token_display() {
        let err = CompileError::unexpected(3, ")", "'='");
        assert_eq!(
            err.to_string(),
            "compiler 3: unexpected token ')', expected '='"
        );
    }

    #[test]
    fn test_no_prefix_display() {
        let err = CompileError::no_prefix(7, "ef");
        assert_eq!(err.to_string(), "compiler 7: no prefix parse function for 'ef'");
    }

    #[test]
    fn test_no_block_display() {
        let err = CompileError::no_block(2, "body must be indented");
        let msg = err.to_string();
        assert!(msg.starts_with("compiler 2:"));
        assert!(msg.contains("no block"));
        assert!(msg.contains("indented"));
    }

    #[test]
    fn test_outside_loop_display() {
        let err = CompileError::outside_loop(4, "out");
        assert!(err.to_string().contains("'out' used outside of a loop"));
    }

    #[test]
    fn test_invalid_generic_display() {
        let err = CompileError::invalid_generic(1, "duplicate generic name 'T'");
        assert!(err.to_string().contains("invalid generic"));
        assert!(err.to_string().contains("'T'"));
    }

    #[test]
    fn test_line_accessor() {
        assert_eq!(CompileError::InvalidAssignment { line: 9 }.line(), Some(9));
        assert_eq!(CompileError::internal("x").line(), None);
    }

    #[test]
    fn test_internal_error_display() {
        let err = CompileError::internal("something went wrong");

        let msg = err.to_string();
        assert!(msg.contains("internal"));
        assert!(msg.contains("something went wrong"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::internal("test");
        let _: &dyn std::error::Error = &err;
    }
}
