use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::bytecode::CodeObject;
use crate::lang::{Generic, Type};
use crate::runtime::value::Value;

pub type FrameRef = Rc<RefCell<Frame>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Top level of a program or module.
    Program,
    Call,
    /// Fields and methods of a class instance.
    Instance,
}

/// State of a generic parameter inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeBinding {
    /// Not used yet; holds the permitted types (empty for any).
    Unbound(Vec<Type>),
    /// Fixed by the first concrete value.
    Bound(Type),
}

/// One activation record.
#[derive(Debug)]
pub struct Frame {
    pub code: Rc<CodeObject>,
    pub stack: Vec<Value>,
    pub bindings: HashMap<String, Value>,
    /// Declared type of every name stored with `Store`.
    pub declared: HashMap<String, Type>,
    pub types: HashMap<String, TypeBinding>,
    pub ret: Option<Value>,
    /// Instance frame of the method being run.
    pub receiver: Option<FrameRef>,
    /// Frame the running code was defined in.
    pub home: Option<Weak<RefCell<Frame>>>,
    pub kind: FrameKind,
}

impl Frame {
    pub fn new(code: Rc<CodeObject>, kind: FrameKind) -> Self {
        Frame {
            code,
            stack: Vec::new(),
            bindings: HashMap::new(),
            declared: HashMap::new(),
            types: HashMap::new(),
            ret: None,
            receiver: None,
            home: None,
            kind,
        }
    }

    pub fn program(code: Rc<CodeObject>) -> FrameRef {
        Rc::new(RefCell::new(Frame::new(code, FrameKind::Program)))
    }

    pub fn home_frame(&self) -> Option<FrameRef> {
        self.home.as_ref().and_then(Weak::upgrade)
    }

    /// Install generic parameters, all unbound.
    pub fn install_generics(&mut self, generics: &[Generic]) {
        for g in generics {
            self.types
                .insert(g.name.clone(), TypeBinding::Unbound(g.constraint.clone()));
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }
}
