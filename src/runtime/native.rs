//! Native extension modules.
//!
//! A native module is a descriptor: a name and a set of members, each a
//! zero-argument getter or a method taking the argument slice. Loaders hand
//! descriptors to the VM by module path.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::value::Value;

pub type NativeFn = fn(&[Value]) -> Result<Value, RuntimeError>;

#[derive(Debug, Clone, Copy)]
pub enum NativeMember {
    /// Read on every access.
    Variable(fn() -> Value),
    Method(NativeFn),
}

impl NativeMember {
    /// The value a lookup of this member yields.
    pub fn value(&self, name: &str) -> Value {
        match self {
            NativeMember::Variable(get) => get(),
            NativeMember::Method(func) => Value::Native(NativeMethod {
                name: name.to_string(),
                func: *func,
            }),
        }
    }
}

/// A callable native member.
#[derive(Debug, Clone)]
pub struct NativeMethod {
    pub name: String,
    pub func: NativeFn,
}

#[derive(Debug, Clone)]
pub struct NativeModule {
    pub name: String,
    pub members: BTreeMap<String, NativeMember>,
}

impl NativeModule {
    pub fn new(name: impl Into<String>) -> Self {
        NativeModule {
            name: name.into(),
            members: BTreeMap::new(),
        }
    }

    pub fn variable(mut self, name: &str, get: fn() -> Value) -> Self {
        self.members.insert(name.to_string(), NativeMember::Variable(get));
        self
    }

    pub fn method(mut self, name: &str, func: NativeFn) -> Self {
        self.members.insert(name.to_string(), NativeMember::Method(func));
        self
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.members.get(name).map(|m| m.value(name))
    }
}

/// Resolves a dotted module path to a native module descriptor.
pub trait NativeModuleLoader {
    /// `Ok(None)` when no native module has that path.
    fn load(&self, path: &str) -> Result<Option<NativeModule>, RuntimeError>;
}

/// Loader for hosts that forbid native modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNativeLoader;

impl NativeModuleLoader for DisabledNativeLoader {
    fn load(&self, _path: &str) -> Result<Option<NativeModule>, RuntimeError> {
        Ok(None)
    }
}

/// In-process registry of native module entry points.
#[derive(Debug, Clone, Default)]
pub struct StaticNativeLoader {
    entries: HashMap<String, fn() -> NativeModule>,
}

impl StaticNativeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shipped `sys`, `strconv`, `str`, `list` and `os`
    /// modules.
    pub fn with_stdlib() -> Self {
        Self::new()
            .register("sys", stdlib::sys)
            .register("strconv", stdlib::strconv)
            .register("str", stdlib::strings)
            .register("list", stdlib::list)
            .register("os", stdlib::os)
    }

    pub fn register(mut self, path: &str, entry: fn() -> NativeModule) -> Self {
        debug!(module = path, "registered native module");
        self.entries.insert(path.to_string(), entry);
        self
    }
}

impl NativeModuleLoader for StaticNativeLoader {
    fn load(&self, path: &str) -> Result<Option<NativeModule>, RuntimeError> {
        Ok(self.entries.get(path).map(|entry| entry()))
    }
}

fn expect_args(name: &str, args: &[Value], n: usize) -> Result<(), RuntimeError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(RuntimeErrorKind::ArityMismatch {
            name: name.to_string(),
            expected: n.to_string(),
            found: args.len(),
        }
        .into())
    }
}

mod stdlib {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::lang::Type;
    use crate::runtime::value::Array;

    pub fn sys() -> NativeModule {
        NativeModule::new("sys")
            .variable("argc", || Value::Int(std::env::args().count() as i64))
            .variable("argv", || {
                Value::array(std::env::args().map(Value::Str).collect())
            })
    }

    pub fn strconv() -> NativeModule {
        NativeModule::new("strconv")
            .method("to_int", to_int)
            .method("to_float", to_float)
            .method("to_string", to_string)
    }

    fn bad_conversion(target: &str, v: &Value) -> RuntimeError {
        RuntimeError::other(format!("cannot convert {} to {}", v.describe(), target))
    }

    fn to_int(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("to_int", args, 1)?;
        match &args[0] {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Char(c) => Ok(Value::Int(*c as i64)),
            Value::Str(s) => s
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| bad_conversion("int", &args[0])),
            other => Err(bad_conversion("int", other)),
        }
    }

    fn to_float(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("to_float", args, 1)?;
        match &args[0] {
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Str(s) => s
                .trim()
                .parse()
                .map(Value::Float)
                .map_err(|_| bad_conversion("float", &args[0])),
            other => Err(bad_conversion("float", other)),
        }
    }

    fn to_string(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("to_string", args, 1)?;
        Ok(Value::Str(args[0].to_string()))
    }

    pub fn strings() -> NativeModule {
        NativeModule::new("str")
            .method("end_with", end_with)
            .method("to_str", to_str)
    }

    fn string_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a str, RuntimeError> {
        match &args[i] {
            Value::Str(s) => Ok(s),
            other => Err(RuntimeError::other(format!(
                "{} expects a string, found {}",
                name,
                other.describe()
            ))),
        }
    }

    /// `end_with(s, suffix)`; a suffix longer than `s` is an error.
    fn end_with(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("end_with", args, 2)?;
        let s = string_arg("end_with", args, 0)?;
        let suffix = string_arg("end_with", args, 1)?;
        if suffix.chars().count() > s.chars().count() {
            return Err(RuntimeError::other(format!(
                "end_with: suffix \"{}\" is longer than \"{}\"",
                suffix, s
            )));
        }
        Ok(Value::Bool(s.ends_with(suffix)))
    }

    fn to_str(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("to_str", args, 1)?;
        Ok(Value::Str(args[0].to_string()))
    }

    pub fn list() -> NativeModule {
        NativeModule::new("list").method("to_string", join_items)
    }

    /// Raw form of every element, each followed by a space.
    fn join_items(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("to_string", args, 1)?;
        let Value::Array(array) = &args[0] else {
            return Err(RuntimeError::other(format!(
                "to_string expects an array, found {}",
                args[0].describe()
            )));
        };
        let out = array
            .borrow()
            .items
            .iter()
            .map(|item| format!("{} ", item))
            .collect();
        Ok(Value::Str(out))
    }

    pub fn os() -> NativeModule {
        NativeModule::new("os")
            .method("command", command)
            .method("listdir", listdir)
    }

    /// Run a shell command, returning its exit status (-1 if killed).
    fn command(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("command", args, 1)?;
        let line = string_arg("command", args, 0)?;
        debug!(command = line, "running shell command");

        let mut shell = if cfg!(windows) {
            let mut c = std::process::Command::new("cmd");
            c.arg("/C");
            c
        } else {
            let mut c = std::process::Command::new("sh");
            c.arg("-c");
            c
        };
        let status = shell
            .arg(line)
            .status()
            .map_err(|e| RuntimeError::other(format!("cannot run \"{}\": {}", line, e)))?;
        Ok(Value::Int(status.code().map_or(-1, i64::from)))
    }

    /// Names of the regular files in a directory, sorted, as `[string]`.
    fn listdir(args: &[Value]) -> Result<Value, RuntimeError> {
        expect_args("listdir", args, 1)?;
        let path = string_arg("listdir", args, 0)?;
        let cannot_open = |e: std::io::Error| RuntimeError::other(format!("cannot open dir '{}': {}", path, e));

        let mut names = Vec::new();
        for entry in std::fs::read_dir(path).map_err(cannot_open)? {
            let entry = entry.map_err(cannot_open)?;
            if entry.file_type().map_err(cannot_open)?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        Ok(Value::Array(Rc::new(RefCell::new(Array {
            items: names.into_iter().map(Value::Str).collect(),
            elem: Some(Type::Str),
        }))))
    }
}
