pub mod builtins;
pub mod check;
pub mod frame;
pub mod module_loader;
pub mod native;
pub mod operators;
pub mod runtime_error;
pub mod session;
pub mod value;
pub mod vm;

pub use frame::{Frame, FrameRef};
pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use session::{Mode, Session};
pub use value::Value;
pub use vm::{Vm, VmConfig};
