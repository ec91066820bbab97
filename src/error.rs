use crate::bytecode::CompileError;
use crate::frontend::LexerError;
use crate::runtime::RuntimeError;

/// Any fault between source text and a finished run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lexer {0}")]
    Lex(#[from] LexerError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bytecode decode error: {0}")]
    Decode(#[from] postcard::Error),
}
