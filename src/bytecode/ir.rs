use crate::bytecode::Op;
use crate::lang::{Generic, Type};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::rc::Rc;

/// A compiled unit: one function body, class body or module.
///
/// Instructions reference the three side tables by index. Every index is
/// appended while compiling this same object, so a code object is
/// self-contained and immutable once the compiler pops it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodeObject {
    /// `main` for a program, otherwise the function/class name.
    pub name: String,
    pub ops: Vec<Op>,
    /// Source line of each instruction, parallel to `ops`.
    pub lines: Vec<usize>,
    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    pub types: Vec<Type>,
    /// Instruction indices some jump lands on.
    pub jump_targets: BTreeSet<usize>,
}

impl CodeObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append an instruction and return its index.
    pub fn emit(&mut self, op: Op, line: usize) -> usize {
        self.ops.push(op);
        self.lines.push(line);
        self.ops.len() - 1
    }

    pub fn add_constant(&mut self, constant: Constant) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Names are interned: a repeated name reuses its first index.
    pub fn add_name(&mut self, name: &str) -> usize {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return i;
        }
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    /// Types are interned the same way as names.
    pub fn add_type(&mut self, ty: Type) -> usize {
        if let Some(i) = self.types.iter().position(|t| *t == ty) {
            return i;
        }
        self.types.push(ty);
        self.types.len() - 1
    }

    /// Point the jump at `at` to `target` and record the target.
    pub fn patch_jump(&mut self, at: usize, target: usize) {
        match &mut self.ops[at] {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => *t = target,
            _ => return,
        }
        self.jump_targets.insert(target);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn line_at(&self, ip: usize) -> usize {
        self.lines.get(ip).copied().unwrap_or(0)
    }

    /// Nested code objects of function and class constants.
    pub fn children(&self) -> impl Iterator<Item = &CodeObject> {
        self.constants.iter().filter_map(|c| match c {
            Constant::Function(f) => Some(f.code.as_ref()),
            Constant::Class(c) => Some(c.code.as_ref()),
            _ => None,
        })
    }

    /// Serialize to the postcard wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Entry of a code object's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Bool(bool),
    Nil,
    Function(Rc<FunctionProto>),
    Class(Rc<ClassProto>),
    Interface(Rc<InterfaceProto>),
    Enum(Rc<EnumProto>),
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Int(n) => write!(f, "int {}", n),
            Constant::Float(n) => write!(f, "float {}", n),
            Constant::Char(c) => write!(f, "char '{}'", c),
            Constant::Str(s) => write!(f, "string \"{}\"", s),
            Constant::Bool(b) => write!(f, "bool {}", b),
            Constant::Nil => write!(f, "nil"),
            Constant::Function(p) => write!(f, "func \"{}\"", p.name),
            Constant::Class(p) => write!(f, "class \"{}\"", p.name),
            Constant::Interface(p) => write!(f, "interface \"{}\"", p.name),
            Constant::Enum(p) => write!(f, "enum \"{}\"", p.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// Compile-time half of a function value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    pub name: String,
    pub generics: Vec<Generic>,
    pub params: Vec<Param>,
    /// Trailing `...T` parameter collecting the remaining arguments.
    pub variadic: Option<Param>,
    pub ret: Option<Type>,
    pub code: Rc<CodeObject>,
}

impl FunctionProto {
    /// The function's type, used for structural checks against `|A| -> R` slots.
    pub fn signature(&self) -> Type {
        Type::Function {
            params: self.params.iter().map(|p| p.ty.clone()).collect(),
            variadic: self.variadic.as_ref().map(|p| Box::new(p.ty.clone())),
            ret: self.ret.clone().map(Box::new),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProto {
    pub name: String,
    pub generics: Vec<Generic>,
    /// The body; running it declares the fields and methods of an instance.
    pub code: Rc<CodeObject>,
}

/// One method line of an interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSig {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Option<Type>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceProto {
    pub name: String,
    pub methods: Vec<MethodSig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumProto {
    pub name: String,
    pub members: Vec<String>,
}
