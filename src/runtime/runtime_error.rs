/// What went wrong, without where.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeErrorKind {
    #[error("undefined name '{0}'")]
    UndefinedName(String),

    #[error("expect type {expected}, but found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("'{name}' expects {expected} arguments, but got {found}")]
    ArityMismatch {
        name: String,
        expected: String,
        found: usize,
    },

    #[error("unsupported operand: {0}")]
    UnsupportedOperand(String),

    #[error("index out of bounds: index {index}, length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("map has no key {0}")]
    KeyNotFound(String),

    #[error("nonexistent member '{member}' of {owner}")]
    UnknownMember { owner: String, member: String },

    #[error("{0} is not initialized")]
    Uninitialized(String),

    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    StackOverflow(usize),

    #[error("{0}")]
    LimitExceeded(String),

    #[error("{class} does not implement interface {interface}: {reason}")]
    InterfaceViolation {
        interface: String,
        class: String,
        reason: String,
    },

    #[error("generic {name} expects {expected}, but found {found}")]
    GenericMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("module '{0}' imports itself")]
    SelfImport(String),

    #[error("import cycle: {0}")]
    ImportCycle(String),

    #[error("in module '{module}': {message}")]
    ModuleCompile { module: String, message: String },

    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),

    #[error("{0}")]
    Other(String),
}

/// A runtime fault: the kind, the source line it happened on and the chain
/// of calls it unwound through.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: Option<usize>,
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "vm {}: {}", line, self.kind)?,
            None => write!(f, "vm: {}", self.kind)?,
        }

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl From<RuntimeErrorKind> for RuntimeError {
    fn from(kind: RuntimeErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        RuntimeError {
            kind,
            line: None,
            call_stack: Vec::new(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        RuntimeError::new(RuntimeErrorKind::Other(msg.into()))
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    /// Record the line of the innermost instruction; outer frames keep it.
    pub fn at_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}
