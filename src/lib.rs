//! # drift
//!
//! A small indentation-structured language: a single-pass compiler from
//! tokens straight to bytecode, and a stack VM that checks types as values
//! are stored.
//!
//! ```text
//! source ─► frontend::Lexer ─► bytecode::Compiler ─► CodeObject ─► runtime::Vm
//! ```

pub mod bytecode;
pub mod error;
pub mod frontend;
pub mod lang;
pub mod runtime;

pub use error::Error;

use crate::bytecode::{CodeObject, Compiler};
use crate::frontend::Lexer;
use crate::runtime::{FrameRef, Vm};

/// Lex and compile a program.
pub fn compile(source: &str) -> Result<CodeObject, Error> {
    let tokens = Lexer::new(source).tokenize()?;
    Ok(Compiler::new(tokens).compile()?)
}

/// Compile and run a program on a default VM, returning its program frame.
pub fn run(source: &str) -> Result<FrameRef, Error> {
    let code = compile(source)?;
    Ok(Vm::new().run(code)?)
}
