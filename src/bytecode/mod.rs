pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod verify;

pub use compile::Compiler;
pub use compile_error::CompileError;
pub use ir::{CodeObject, Constant};
pub use op::{BinOp, Op};
