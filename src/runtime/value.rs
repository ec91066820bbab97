use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::bytecode::ir::{ClassProto, EnumProto, FunctionProto, InterfaceProto};
use crate::lang::Type;
use crate::runtime::builtins::Builtin;
use crate::runtime::frame::{Frame, FrameRef};
use crate::runtime::native::{NativeMethod, NativeModule};

/// A runtime value.
///
/// Scalars are held inline. Arrays and maps are shared and mutable, tuples
/// are shared and immutable. Composite values remember the element types
/// of the slot they were last stored into, so later writes can be checked.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Bool(bool),
    Array(Rc<RefCell<Array>>),
    Tuple(Rc<Tuple>),
    Map(Rc<RefCell<Map>>),
    Function(Rc<Function>),
    /// A class definition, or an instance once `frame` is set.
    Class(Rc<Class>),
    /// An interface, bound to a class instance once assigned to a slot.
    Interface(Rc<InterfaceProto>, Option<Rc<Class>>),
    Enum(Rc<EnumProto>),
    Module(Rc<Module>),
    Builtin(Builtin),
    Native(NativeMethod),
}

#[derive(Debug, Clone, Default)]
pub struct Array {
    pub items: Vec<Value>,
    pub elem: Option<Type>,
}

#[derive(Debug, Clone, Default)]
pub struct Tuple {
    pub items: Vec<Value>,
    pub elem: Option<Type>,
}

/// Insertion-ordered map. Keys compare with `Value::key_eq`.
#[derive(Debug, Clone, Default)]
pub struct Map {
    pub entries: Vec<(Value, Value)>,
    pub key_ty: Option<Type>,
    pub val_ty: Option<Type>,
}

impl Map {
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.key_eq(key))
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| k.key_eq(&key)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }
}

/// A function value: prototype plus the frame it was defined in.
///
/// `home` is weak so a frame holding its own functions is not a cycle.
/// `receiver` is set for methods read off an instance.
#[derive(Debug, Clone)]
pub struct Function {
    pub proto: Rc<FunctionProto>,
    pub home: Weak<RefCell<Frame>>,
    pub receiver: Option<FrameRef>,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub proto: Rc<ClassProto>,
    pub home: Weak<RefCell<Frame>>,
    /// Instance frame holding fields and methods.
    pub frame: Option<FrameRef>,
    pub initialized: bool,
}

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub kind: ModuleKind,
}

#[derive(Debug)]
pub enum ModuleKind {
    /// Program frame of an executed source module.
    Source(FrameRef),
    Native(Rc<NativeModule>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(Array { items, elem: None })))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(Tuple { items, elem: None }))
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Value {
        let mut map = Map::default();
        for (k, v) in entries {
            map.insert(k, v);
        }
        Value::Map(Rc::new(RefCell::new(map)))
    }

    /// Kind name, as reported by `typeof`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Tuple(_) => "tuple",
            Value::Map(_) => "map",
            Value::Function(_) => "func",
            Value::Class(_) => "class",
            Value::Interface(..) => "interface",
            Value::Enum(_) => "enum",
            Value::Module(_) => "module",
            Value::Builtin(_) => "builtin",
            Value::Native(_) => "native",
        }
    }

    /// Name of a user-defined value's type, for matching `User` slots.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Value::Function(f) => Some(&f.proto.name),
            Value::Class(c) => Some(&c.proto.name),
            Value::Interface(def, _) => Some(&def.name),
            Value::Enum(e) => Some(&e.name),
            _ => None,
        }
    }

    /// The type a generic parameter is bound to on its first use.
    pub fn infer_type(&self) -> Type {
        self.infer_in(&mut Vec::new())
    }

    /// `infer_type`, treating a collection met again inside itself as `any`.
    fn infer_in(&self, open: &mut Vec<*const ()>) -> Type {
        match self {
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Char(_) => Type::Char,
            Value::Str(_) => Type::Str,
            Value::Bool(_) => Type::Bool,
            Value::Array(a) => {
                let id = identity(a);
                if open.contains(&id) {
                    return Type::Any;
                }
                open.push(id);
                let a = a.borrow();
                let elem = a
                    .elem
                    .clone()
                    .or_else(|| a.items.first().map(|v| v.infer_in(open)))
                    .unwrap_or(Type::Any);
                open.pop();
                Type::Array(Box::new(elem))
            }
            Value::Tuple(t) => {
                let elem = t
                    .elem
                    .clone()
                    .or_else(|| t.items.first().map(|v| v.infer_in(open)))
                    .unwrap_or(Type::Any);
                Type::Tuple(Box::new(elem))
            }
            Value::Map(m) => {
                let id = identity(m);
                if open.contains(&id) {
                    return Type::Any;
                }
                open.push(id);
                let m = m.borrow();
                let first = m.entries.first();
                let key = m
                    .key_ty
                    .clone()
                    .or_else(|| first.map(|(k, _)| k.infer_in(open)))
                    .unwrap_or(Type::Any);
                let val = m
                    .val_ty
                    .clone()
                    .or_else(|| first.map(|(_, v)| v.infer_in(open)))
                    .unwrap_or(Type::Any);
                open.pop();
                Type::Map(Box::new(key), Box::new(val))
            }
            Value::Function(f) => f.proto.signature(),
            other => match other.type_name() {
                Some(name) => Type::User(name.to_string()),
                None => Type::Any,
            },
        }
    }

    /// Same kind of value, used when rebinding a name with no declared type.
    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Key equality for maps: scalars by value, shared values by identity.
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.items.len() == b.items.len()
                    && a.items.iter().zip(&b.items).all(|(x, y)| x.key_eq(y))
            }
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Kind-tagged form used in diagnostics: `int 5`, `string "x"`.
    pub fn describe(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Str(s) => format!("string \"{}\"", s),
            Value::Char(c) => format!("char '{}'", c),
            Value::Class(c) if c.frame.is_some() => format!("instance of {}", c.proto.name),
            Value::Function(_)
            | Value::Class(_)
            | Value::Interface(..)
            | Value::Enum(_)
            | Value::Module(_)
            | Value::Builtin(_)
            | Value::Native(_) => self.to_string(),
            other => format!("{} {}", other.kind_name(), other),
        }
    }
}

/// Identity of a shared collection, for spotting one that contains itself.
fn identity<T>(rc: &Rc<T>) -> *const () {
    Rc::as_ptr(rc).cast()
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Value], open: &mut Vec<*const ()>) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write_raw(f, item, open)?;
    }
    Ok(())
}

/// Raw form of `value`. `open` holds the collections currently being
/// written; meeting one again prints `[...]` or `{...}`.
fn write_raw(f: &mut fmt::Formatter<'_>, value: &Value, open: &mut Vec<*const ()>) -> fmt::Result {
    match value {
        Value::Array(a) => {
            let id = identity(a);
            if open.contains(&id) {
                return write!(f, "[...]");
            }
            open.push(id);
            write!(f, "[")?;
            write_items(f, &a.borrow().items, open)?;
            open.pop();
            write!(f, "]")
        }
        Value::Tuple(t) => {
            write!(f, "(")?;
            write_items(f, &t.items, open)?;
            if t.items.len() == 1 {
                write!(f, ",")?;
            }
            write!(f, ")")
        }
        Value::Map(m) => {
            let id = identity(m);
            if open.contains(&id) {
                return write!(f, "{{...}}");
            }
            open.push(id);
            write!(f, "{{")?;
            for (i, (k, v)) in m.borrow().entries.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_raw(f, k, open)?;
                write!(f, ": ")?;
                write_raw(f, v, open)?;
            }
            open.pop();
            write!(f, "}}")
        }
        other => write!(f, "{}", other),
    }
}

/// Raw form, as written by `print`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Char(c) => write!(f, "{}", c),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(_) | Value::Tuple(_) | Value::Map(_) => write_raw(f, self, &mut Vec::new()),
            Value::Function(func) => write!(f, "<func {}>", func.proto.name),
            Value::Class(c) if c.frame.is_some() => write!(f, "<{} object>", c.proto.name),
            Value::Class(c) => write!(f, "<class {}>", c.proto.name),
            Value::Interface(def, _) => write!(f, "<interface {}>", def.name),
            Value::Enum(e) => write!(f, "<enum {}>", e.name),
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name()),
            Value::Native(n) => write!(f, "<native {}>", n.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_forms() {
        assert_eq!(Value::Int(5).to_string(), "5");
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Str("hi".to_string()).to_string(), "hi");
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "[1, 2]"
        );
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(
            Value::map(vec![(Value::Str("a".to_string()), Value::Int(1))]).to_string(),
            "{a: 1}"
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(Value::Int(5).describe(), "int 5");
        assert_eq!(Value::Str("x".to_string()).describe(), "string \"x\"");
        assert_eq!(Value::Char('c').describe(), "char 'c'");
        assert_eq!(Value::Nil.describe(), "nil");
        assert_eq!(
            Value::array(vec![Value::Int(1)]).describe(),
            "array [1]"
        );
    }

    #[test]
    fn test_map_insert_replaces() {
        let mut map = Map::default();
        map.insert(Value::Str("a".to_string()), Value::Int(1));
        map.insert(Value::Str("a".to_string()), Value::Int(2));
        assert_eq!(map.entries.len(), 1);
        assert!(matches!(map.get(&Value::Str("a".to_string())), Some(Value::Int(2))));
        assert!(map.get(&Value::Int(1)).is_none());
    }

    #[test]
    fn test_infer_type() {
        assert_eq!(Value::Int(1).infer_type(), Type::Int);
        assert_eq!(
            Value::array(vec![Value::Str("a".to_string())]).infer_type(),
            Type::Array(Box::new(Type::Str))
        );
        assert_eq!(
            Value::array(vec![]).infer_type(),
            Type::Array(Box::new(Type::Any))
        );
    }

    #[test]
    fn test_self_containing_collections() {
        let array = Value::array(vec![Value::Int(1)]);
        if let Value::Array(a) = &array {
            a.borrow_mut().items.push(array.clone());
        }
        assert_eq!(array.to_string(), "[1, [...]]");

        let map = Value::map(vec![]);
        if let Value::Map(m) = &map {
            m.borrow_mut().insert(Value::Str("me".to_string()), map.clone());
            m.borrow_mut().insert(Value::Str("xs".to_string()), array.clone());
        }
        assert_eq!(map.to_string(), "{me: {...}, xs: [1, [...]]}");

        let nested = Value::array(vec![]);
        if let Value::Array(a) = &nested {
            a.borrow_mut().items.push(nested.clone());
        }
        assert_eq!(nested.infer_type(), Type::Array(Box::new(Type::Any)));
    }

    #[test]
    fn test_same_kind() {
        assert!(Value::Int(1).same_kind(&Value::Int(9)));
        assert!(!Value::Int(1).same_kind(&Value::Float(1.0)));
    }
}
