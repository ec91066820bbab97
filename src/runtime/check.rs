//! Dynamic type checks.
//!
//! Every store, argument binding, field set and typed element write goes
//! through `Vm::coerce`. A successful check may rewrite the value: ints
//! widen to floats and class instances become interface values. A shared
//! array or map is never rewritten in place; when any element converts, or
//! the collection is tagged with other element types, the slot receives a
//! fresh copy.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::ir::InterfaceProto;
use crate::lang::Type;
use crate::runtime::frame::{FrameRef, TypeBinding};
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::value::{Array, Map, Tuple, Value};
use crate::runtime::vm::Vm;

fn mismatch(ty: &Type, value: &Value) -> RuntimeError {
    RuntimeErrorKind::TypeMismatch {
        expected: ty.to_string(),
        found: value.describe(),
    }
    .into()
}

fn type_list(types: &[Type]) -> String {
    types
        .iter()
        .map(Type::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn ret_name(ret: Option<&Type>) -> String {
    ret.map_or_else(|| "None".to_string(), Type::to_string)
}

impl Vm {
    /// Check `value` against `ty`, resolving user type names from `context`.
    pub(crate) fn coerce(&self, context: &FrameRef, ty: &Type, value: Value) -> Result<Value, RuntimeError> {
        match (ty, &value) {
            (Type::Any, _)
            | (Type::Int, Value::Int(_))
            | (Type::Float, Value::Float(_))
            | (Type::Char, Value::Char(_))
            | (Type::Str, Value::Str(_))
            | (Type::Bool, Value::Bool(_)) => Ok(value),

            (Type::Float, Value::Int(n)) => Ok(Value::Float(*n as f64)),

            (Type::Array(elem), Value::Array(array)) => {
                let (items, tagged) = {
                    let a = array.borrow();
                    (a.items.clone(), a.elem.clone())
                };
                let checked = self.coerce_all(context, elem, items.clone())?;
                let elem = self.concrete(context, elem);
                if tagged.is_none_or(|t| t == elem) && all_untouched(&items, &checked) {
                    return Ok(value);
                }
                Ok(Value::Array(Rc::new(RefCell::new(Array {
                    items: checked,
                    elem: Some(elem),
                }))))
            }
            (Type::Tuple(elem), Value::Tuple(tuple)) => {
                let items = self.coerce_all(context, elem, tuple.items.clone())?;
                Ok(Value::Tuple(Rc::new(Tuple {
                    items,
                    elem: Some(self.concrete(context, elem)),
                })))
            }
            (Type::Map(key_ty, val_ty), Value::Map(map)) => {
                let (entries, tagged) = {
                    let m = map.borrow();
                    (m.entries.clone(), (m.key_ty.clone(), m.val_ty.clone()))
                };
                let mut checked = Vec::with_capacity(entries.len());
                for (k, v) in &entries {
                    checked.push((
                        self.coerce(context, key_ty, k.clone())?,
                        self.coerce(context, val_ty, v.clone())?,
                    ));
                }
                let (key_ty, val_ty) = (self.concrete(context, key_ty), self.concrete(context, val_ty));
                let same_tags = match tagged {
                    (Some(k), Some(v)) => k == key_ty && v == val_ty,
                    _ => true,
                };
                let same_entries = entries
                    .iter()
                    .zip(&checked)
                    .all(|((k0, v0), (k1, v1))| untouched(k0, k1) && untouched(v0, v1));
                if same_tags && same_entries {
                    return Ok(value);
                }
                Ok(Value::Map(Rc::new(RefCell::new(Map {
                    entries: checked,
                    key_ty: Some(key_ty),
                    val_ty: Some(val_ty),
                }))))
            }
            (Type::Function { .. }, Value::Function(f)) => {
                if f.proto.signature() == *ty {
                    Ok(value)
                } else {
                    Err(mismatch(ty, &value))
                }
            }
            (Type::User(name), _) => self.coerce_user(context, name, value),

            _ => Err(mismatch(ty, &value)),
        }
    }

    fn coerce_all(&self, context: &FrameRef, ty: &Type, items: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        items
            .into_iter()
            .map(|item| self.coerce(context, ty, item))
            .collect()
    }

    fn coerce_user(&self, context: &FrameRef, name: &str, value: Value) -> Result<Value, RuntimeError> {
        if let Some((owner, binding)) = self.find_generic(context, name) {
            return self.coerce_generic(context, &owner, name, binding, value);
        }

        let ty = Type::User(name.to_string());
        match self.lookup(context, name)? {
            Value::Interface(def, _) => self.bind_interface(&def, value),
            Value::Class(class) => match &value {
                Value::Nil => Ok(value),
                Value::Class(instance)
                    if instance.frame.is_some() && instance.proto.name == class.proto.name =>
                {
                    Ok(value)
                }
                _ => Err(mismatch(&ty, &value)),
            },
            Value::Enum(def) => match &value {
                Value::Int(n) if usize::try_from(*n).is_ok_and(|n| n < def.members.len()) => Ok(value),
                Value::Enum(e) if e.name == def.name => Ok(value),
                _ => Err(mismatch(&ty, &value)),
            },
            other => Err(RuntimeError::other(format!(
                "'{}' is not a type, it is {}",
                name,
                other.describe()
            ))),
        }
    }

    fn coerce_generic(
        &self,
        context: &FrameRef,
        owner: &FrameRef,
        name: &str,
        binding: TypeBinding,
        value: Value,
    ) -> Result<Value, RuntimeError> {
        let found = value.describe();
        let generic_mismatch = |expected: String| -> RuntimeError {
            RuntimeErrorKind::GenericMismatch {
                name: name.to_string(),
                expected,
                found: found.clone(),
            }
            .into()
        };

        match binding {
            TypeBinding::Bound(bound) => self
                .coerce(context, &bound, value)
                .map_err(|_| generic_mismatch(bound.to_string())),
            TypeBinding::Unbound(_) if matches!(value, Value::Nil) => Ok(value),
            TypeBinding::Unbound(constraint) => {
                let inferred = value.infer_type();
                let (bound, value) = if constraint.is_empty() || constraint.contains(&inferred) {
                    (inferred, value)
                } else {
                    let accepted = constraint.iter().find_map(|t| {
                        self.coerce(context, t, value.clone())
                            .ok()
                            .map(|v| (t.clone(), v))
                    });
                    accepted.ok_or_else(|| {
                        generic_mismatch(
                            constraint
                                .iter()
                                .map(Type::to_string)
                                .collect::<Vec<_>>()
                                .join(" | "),
                        )
                    })?
                };
                owner
                    .borrow_mut()
                    .types
                    .insert(name.to_string(), TypeBinding::Bound(bound));
                Ok(value)
            }
        }
    }

    /// Generic parameter `name` visible from `context`, with the frame that
    /// holds it.
    fn find_generic(&self, context: &FrameRef, name: &str) -> Option<(FrameRef, TypeBinding)> {
        let mut scope = Some(context.clone());
        while let Some(frame) = scope {
            let (binding, receiver, home) = {
                let f = frame.borrow();
                (f.types.get(name).cloned(), f.receiver.clone(), f.home_frame())
            };
            if let Some(binding) = binding {
                return Some((frame, binding));
            }
            if let Some(receiver) = receiver {
                let binding = receiver.borrow().types.get(name).cloned();
                if let Some(binding) = binding {
                    return Some((receiver, binding));
                }
            }
            scope = home;
        }
        None
    }

    /// `ty` with every bound generic replaced by its binding.
    pub(crate) fn concrete(&self, context: &FrameRef, ty: &Type) -> Type {
        match ty {
            Type::User(name) => match self.find_generic(context, name) {
                Some((_, TypeBinding::Bound(bound))) => bound,
                _ => ty.clone(),
            },
            Type::Array(elem) => Type::Array(Box::new(self.concrete(context, elem))),
            Type::Tuple(elem) => Type::Tuple(Box::new(self.concrete(context, elem))),
            Type::Map(k, v) => Type::Map(
                Box::new(self.concrete(context, k)),
                Box::new(self.concrete(context, v)),
            ),
            other => other.clone(),
        }
    }

    /// Remember the element types of the slot a shared collection was stored
    /// in, so later element writes are checked too.
    pub(crate) fn annotate(&self, context: &FrameRef, ty: &Type, value: &Value) {
        match (ty, value) {
            (Type::Array(elem), Value::Array(array)) => {
                let elem = self.concrete(context, elem);
                annotate_array(array, elem);
            }
            (Type::Map(k, v), Value::Map(map)) => {
                let (k, v) = (self.concrete(context, k), self.concrete(context, v));
                annotate_map(map, k, v);
            }
            _ => {}
        }
    }

    /// Check that a class instance implements every method of `def`.
    pub(crate) fn bind_interface(&self, def: &Rc<InterfaceProto>, value: Value) -> Result<Value, RuntimeError> {
        let class = match value {
            Value::Nil => return Ok(Value::Interface(def.clone(), None)),
            Value::Interface(other, bound) if other.name == def.name => {
                return Ok(Value::Interface(other, bound));
            }
            Value::Interface(_, Some(class)) | Value::Class(class) => class,
            other => return Err(mismatch(&Type::User(def.name.clone()), &other)),
        };

        let frame = match &class.frame {
            Some(frame) if class.initialized => frame,
            _ => {
                return Err(
                    RuntimeErrorKind::Uninitialized(format!("class {}", class.proto.name)).into(),
                );
            }
        };

        let violation = |reason: String| -> RuntimeError {
            RuntimeErrorKind::InterfaceViolation {
                interface: def.name.clone(),
                class: class.proto.name.clone(),
                reason,
            }
            .into()
        };

        for sig in &def.methods {
            let method = frame.borrow().get(&sig.name);
            let Some(Value::Function(f)) = method else {
                return Err(violation(format!("missing method '{}'", sig.name)));
            };

            let params: Vec<Type> = f.proto.params.iter().map(|p| p.ty.clone()).collect();
            if f.proto.variadic.is_some() || params != sig.params {
                return Err(violation(format!(
                    "method '{}' takes ({}), expected ({})",
                    sig.name,
                    type_list(&params),
                    type_list(&sig.params)
                )));
            }
            if f.proto.ret != sig.ret {
                return Err(violation(format!(
                    "method '{}' returns {}, expected {}",
                    sig.name,
                    ret_name(f.proto.ret.as_ref()),
                    ret_name(sig.ret.as_ref())
                )));
            }
        }

        Ok(Value::Interface(def.clone(), Some(class)))
    }
}

/// Whether coercion handed back `before` itself rather than a converted value.
fn untouched(before: &Value, after: &Value) -> bool {
    match (before, after) {
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => all_untouched(&a.items, &b.items),
        (Value::Interface(a, _), Value::Interface(b, _)) => Rc::ptr_eq(a, b),
        (a, b) => a.same_kind(b),
    }
}

fn all_untouched(before: &[Value], after: &[Value]) -> bool {
    before.iter().zip(after).all(|(a, b)| untouched(a, b))
}

fn annotate_array(array: &Rc<RefCell<Array>>, elem: Type) {
    array.borrow_mut().elem = Some(elem);
}

fn annotate_map(map: &Rc<RefCell<Map>>, key: Type, val: Type) {
    let mut map = map.borrow_mut();
    map.key_ty = Some(key);
    map.val_ty = Some(val);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeObject;
    use crate::runtime::frame::Frame;

    fn context() -> FrameRef {
        Frame::program(Rc::new(CodeObject::new("main")))
    }

    #[test]
    fn test_primitives() {
        let vm = Vm::new();
        let ctx = context();
        assert!(vm.coerce(&ctx, &Type::Int, Value::Int(1)).is_ok());
        assert!(matches!(
            vm.coerce(&ctx, &Type::Float, Value::Int(2)),
            Ok(Value::Float(f)) if f == 2.0
        ));
        let err = vm.coerce(&ctx, &Type::Int, Value::Str("a".to_string())).unwrap_err();
        assert_eq!(err.to_string(), "vm: expect type <int>, but found string \"a\"");
        assert!(vm.coerce(&ctx, &Type::Int, Value::Nil).is_err());
    }

    #[test]
    fn test_collections_are_checked_element_wise() {
        let vm = Vm::new();
        let ctx = context();
        let ints = Type::Array(Box::new(Type::Int));
        assert!(vm.coerce(&ctx, &ints, Value::array(vec![Value::Int(1), Value::Int(2)])).is_ok());
        assert!(vm
            .coerce(&ctx, &ints, Value::array(vec![Value::Int(1), Value::Bool(true)]))
            .is_err());

        let map = Type::Map(Box::new(Type::Str), Box::new(Type::Float));
        let value = Value::map(vec![(Value::Str("a".to_string()), Value::Int(1))]);
        let Ok(Value::Map(m)) = vm.coerce(&ctx, &map, value) else {
            panic!("map rejected");
        };
        assert!(matches!(m.borrow().entries[0].1, Value::Float(_)));
    }

    #[test]
    fn test_unbound_generic_binds_on_first_use() {
        let vm = Vm::new();
        let ctx = context();
        ctx.borrow_mut()
            .types
            .insert("T".to_string(), TypeBinding::Unbound(vec![]));
        let t = Type::User("T".to_string());

        assert!(vm.coerce(&ctx, &t, Value::Int(1)).is_ok());
        assert_eq!(ctx.borrow().types.get("T"), Some(&TypeBinding::Bound(Type::Int)));

        let err = vm.coerce(&ctx, &t, Value::Str("x".to_string())).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::GenericMismatch { .. }));
    }

    #[test]
    fn test_constrained_generic() {
        let vm = Vm::new();
        let ctx = context();
        ctx.borrow_mut().types.insert(
            "N".to_string(),
            TypeBinding::Unbound(vec![Type::Int, Type::Float]),
        );
        let n = Type::User("N".to_string());
        let err = vm.coerce(&ctx, &n, Value::Str("x".to_string())).unwrap_err();
        assert_eq!(
            err.kind,
            RuntimeErrorKind::GenericMismatch {
                name: "N".to_string(),
                expected: "<int> | <float>".to_string(),
                found: "string \"x\"".to_string(),
            }
        );
        assert!(vm.coerce(&ctx, &n, Value::Float(1.5)).is_ok());
        assert_eq!(ctx.borrow().types.get("N"), Some(&TypeBinding::Bound(Type::Float)));
    }

    #[test]
    fn test_concrete_resolves_bound_generics() {
        let vm = Vm::new();
        let ctx = context();
        ctx.borrow_mut()
            .types
            .insert("T".to_string(), TypeBinding::Bound(Type::Str));
        let ty = Type::Array(Box::new(Type::User("T".to_string())));
        assert_eq!(vm.concrete(&ctx, &ty), Type::Array(Box::new(Type::Str)));
    }

    #[test]
    fn test_widening_copies_shared_collections() {
        let vm = Vm::new();
        let ctx = context();
        let ints = Type::Array(Box::new(Type::Int));
        let floats = Type::Array(Box::new(Type::Float));

        let a = vm.coerce(&ctx, &ints, Value::array(vec![Value::Int(1)])).unwrap();
        vm.annotate(&ctx, &ints, &a);
        let b = vm.coerce(&ctx, &floats, a.clone()).unwrap();

        let (Value::Array(a), Value::Array(b)) = (&a, &b) else {
            panic!("arrays expected");
        };
        assert!(!Rc::ptr_eq(a, b));
        assert!(matches!(a.borrow().items[0], Value::Int(1)));
        assert_eq!(a.borrow().elem, Some(Type::Int));
        assert!(matches!(b.borrow().items[0], Value::Float(f) if f == 1.0));
    }

    #[test]
    fn test_matching_slot_shares_collection() {
        let vm = Vm::new();
        let ctx = context();
        let ints = Type::Array(Box::new(Type::Int));
        let a = Value::array(vec![Value::Int(1)]);
        vm.annotate(&ctx, &ints, &a);
        let b = vm.coerce(&ctx, &ints, a.clone()).unwrap();
        assert!(matches!((&a, &b), (Value::Array(x), Value::Array(y)) if Rc::ptr_eq(x, y)));

        // tagged with other element types: the wider slot gets its own copy
        let any = Type::Array(Box::new(Type::Any));
        let c = vm.coerce(&ctx, &any, a.clone()).unwrap();
        assert!(matches!((&a, &c), (Value::Array(x), Value::Array(y)) if !Rc::ptr_eq(x, y)));
    }

    #[test]
    fn test_unknown_user_type() {
        let vm = Vm::new();
        let ctx = context();
        let err = vm
            .coerce(&ctx, &Type::User("Nope".to_string()), Value::Int(1))
            .unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::UndefinedName(_)));
    }
}
