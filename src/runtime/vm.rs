use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::bytecode::ir::Constant;
use crate::bytecode::verify::check_code;
use crate::bytecode::{CodeObject, Compiler, Op};
use crate::frontend::Lexer;
use crate::lang::Type;
use crate::runtime::builtins::{self, Builtin};
use crate::runtime::frame::{Frame, FrameKind, FrameRef};
use crate::runtime::module_loader::{ModuleLoader, ModuleLoaderConfig};
use crate::runtime::native::{NativeMember, NativeModuleLoader};
use crate::runtime::operators::{binary, negate, not, truthy};
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::session::Mode;
use crate::runtime::value::{Class, Function, Module, ModuleKind, Value};

/// Headroom left on the native stack before a nested frame runs; below it
/// the frame runs on a freshly allocated segment.
const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
    pub mode: Mode,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
            mode: Mode::Batch,
        }
    }
}

impl VmConfig {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn with_max_stack_size(mut self, size: usize) -> Self {
        self.max_stack_size = size;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// What the loop does after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Return,
}

/// Stack-based interpreter.
///
/// Calls and instantiations run the callee's code object in a nested
/// invocation of the same loop; `frames` holds every active frame, the
/// first being the program frame.
pub struct Vm {
    config: VmConfig,
    frames: Vec<FrameRef>,
    call_stack: Vec<String>,
    steps: usize,
    out: Box<dyn Write>,
    loader: ModuleLoader,
    native_functions: HashMap<String, NativeMember>,
    native_modules: HashMap<String, Rc<Module>>,
    /// File the program was read from; imports resolve relative to it.
    origin: Option<PathBuf>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Vm {
            config,
            frames: Vec::new(),
            call_stack: Vec::new(),
            steps: 0,
            out: Box::new(io::stdout()),
            loader: ModuleLoader::new(ModuleLoaderConfig::default()),
            native_functions: HashMap::new(),
            native_modules: HashMap::new(),
            origin: None,
        }
    }

    pub fn with_loader(mut self, config: ModuleLoaderConfig) -> Self {
        self.loader = ModuleLoader::new(config);
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Redirect `print`.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn set_native_loader(&mut self, natives: Box<dyn NativeModuleLoader>) {
        self.loader.set_natives(natives);
    }

    pub fn set_origin(&mut self, file: impl AsRef<Path>) {
        let file = file.as_ref();
        self.origin = Some(file.canonicalize().unwrap_or_else(|_| file.to_path_buf()));
    }

    /// Run a program in a fresh program frame and return that frame.
    pub fn run(&mut self, code: CodeObject) -> Result<FrameRef, RuntimeError> {
        let frame = Frame::program(Rc::new(code));
        self.run_in(&frame)?;
        Ok(frame)
    }

    /// Run the frame's code against the bindings it already holds.
    pub fn run_in(&mut self, frame: &FrameRef) -> Result<(), RuntimeError> {
        check_code(&frame.borrow().code)
            .map_err(|e| RuntimeErrorKind::InvalidBytecode(e.message))?;

        self.steps = 0;
        self.call_stack.clear();
        {
            let mut f = frame.borrow_mut();
            f.stack.clear();
            f.ret = None;
        }
        self.run_frame(frame).map(|_| ())
    }

    fn check_limits(&mut self, frame: &FrameRef) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeErrorKind::LimitExceeded(format!(
                    "execution step limit exceeded ({})",
                    max
                ))
                .into());
            }
        }

        if frame.borrow().stack.len() > self.config.max_stack_size {
            return Err(RuntimeErrorKind::LimitExceeded(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            ))
            .into());
        }

        Ok(())
    }

    /// Push a frame, run its code and hand back its return slot.
    pub(crate) fn run_frame(&mut self, frame: &FrameRef) -> Result<Option<Value>, RuntimeError> {
        if self.frames.len() >= self.config.max_call_depth {
            let context = self.call_stack.last().cloned().unwrap_or_default();
            warn!(depth = self.frames.len(), function = %context, "call depth limit exceeded");
            return Err(RuntimeErrorKind::StackOverflow(self.config.max_call_depth).into());
        }

        self.frames.push(frame.clone());
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.execute(frame));
        self.frames.pop();
        result?;

        Ok(frame.borrow_mut().ret.take())
    }

    fn execute(&mut self, frame: &FrameRef) -> Result<(), RuntimeError> {
        let code = frame.borrow().code.clone();
        let mut ip = 0;

        while ip < code.ops.len() {
            self.check_limits(frame)?;

            let flow = self
                .step(frame, &code, &code.ops[ip])
                .map_err(|e| e.at_line(code.line_at(ip)))?;

            match flow {
                Flow::Next => ip += 1,
                Flow::Jump(target) => ip = target,
                Flow::Return => break,
            }
        }
        Ok(())
    }

    fn step(&mut self, frame: &FrameRef, code: &CodeObject, op: &Op) -> Result<Flow, RuntimeError> {
        let name = |idx: usize| code.names[idx].as_str();

        match op {
            Op::Const(idx) => push(frame, constant_value(frame, &code.constants[*idx])),

            // Names
            Op::Load(idx) => {
                let value = self.lookup(frame, name(*idx))?;
                push(frame, value);
            }
            Op::Store { name: n, ty } => {
                let value = pop(frame)?;
                self.store(frame, name(*n), &code.types[*ty], value)?;
            }
            Op::Assign(idx) => {
                let value = pop(frame)?;
                self.assign(frame, name(*idx), value)?;
            }
            Op::AssignOp(idx, op) => {
                let rhs = pop(frame)?;
                let current = self.lookup(frame, name(*idx))?;
                let value = binary(*op, &current, &rhs)?;
                self.assign(frame, name(*idx), value)?;
            }

            // Definitions
            Op::DefFunc(idx) => {
                if let Constant::Function(proto) = &code.constants[*idx] {
                    let value = Value::Function(Rc::new(Function {
                        proto: proto.clone(),
                        home: Rc::downgrade(frame),
                        receiver: None,
                    }));
                    frame.borrow_mut().bindings.insert(proto.name.clone(), value);
                }
            }
            Op::DefClass(idx) => {
                if let Constant::Class(proto) = &code.constants[*idx] {
                    let value = Value::Class(Rc::new(Class {
                        proto: proto.clone(),
                        home: Rc::downgrade(frame),
                        frame: None,
                        initialized: false,
                    }));
                    frame.borrow_mut().bindings.insert(proto.name.clone(), value);
                }
            }
            Op::DefInterface(idx) => {
                if let Constant::Interface(def) = &code.constants[*idx] {
                    let value = Value::Interface(def.clone(), None);
                    frame.borrow_mut().bindings.insert(def.name.clone(), value);
                }
            }
            Op::DefEnum(idx) => {
                if let Constant::Enum(def) = &code.constants[*idx] {
                    let value = Value::Enum(def.clone());
                    frame.borrow_mut().bindings.insert(def.name.clone(), value);
                }
            }

            // Collections
            Op::BuildArray(n) => {
                let items = pop_n(frame, *n)?;
                push(frame, Value::array(items));
            }
            Op::BuildTuple(n) => {
                let items = pop_n(frame, *n)?;
                push(frame, Value::tuple(items));
            }
            Op::BuildMap(n) => {
                let flat = pop_n(frame, 2 * n)?;
                let mut entries = Vec::with_capacity(*n);
                let mut flat = flat.into_iter();
                while let (Some(k), Some(v)) = (flat.next(), flat.next()) {
                    entries.push((k, v));
                }
                push(frame, Value::map(entries));
            }
            Op::Index => {
                let index = pop(frame)?;
                let container = pop(frame)?;
                push(frame, index_get(&container, &index)?);
            }
            Op::SetIndex => {
                let value = pop(frame)?;
                let index = pop(frame)?;
                let container = pop(frame)?;
                self.index_set(frame, &container, &index, value)?;
            }
            Op::IndexOp(op) => {
                let rhs = pop(frame)?;
                let index = pop(frame)?;
                let container = pop(frame)?;
                let current = index_get(&container, &index)?;
                let value = binary(*op, &current, &rhs)?;
                self.index_set(frame, &container, &index, value)?;
            }

            // Members
            Op::GetMember(idx) => {
                let object = pop(frame)?;
                push(frame, get_member(&object, name(*idx))?);
            }
            Op::SetMember(idx) => {
                let value = pop(frame)?;
                let object = pop(frame)?;
                self.set_member(&object, name(*idx), value)?;
            }
            Op::MemberOp(idx, op) => {
                let rhs = pop(frame)?;
                let object = pop(frame)?;
                let current = get_member(&object, name(*idx))?;
                let value = binary(*op, &current, &rhs)?;
                self.set_member(&object, name(*idx), value)?;
            }

            // Operators
            Op::Binary(op) => {
                let r = pop(frame)?;
                let l = pop(frame)?;
                push(frame, binary(*op, &l, &r)?);
            }
            Op::Neg => {
                let v = pop(frame)?;
                push(frame, negate(&v)?);
            }
            Op::Not => {
                let v = pop(frame)?;
                push(frame, not(&v));
            }

            // Calls
            Op::Call(argc) => {
                let args = pop_n(frame, *argc)?;
                let callee = pop(frame)?;
                let result = self.call_value(callee, args)?;
                push(frame, result);
            }
            Op::New(fields) => {
                let values = pop_n(frame, fields.len())?;
                let class = pop(frame)?;
                let fields: Vec<&str> = fields.iter().map(|idx| name(*idx)).collect();
                let instance = self.instantiate(class, &fields, values)?;
                push(frame, instance);
            }
            Op::Use { path, merge } => self.import(frame, name(*path), *merge)?,

            // Control flow
            Op::Jump(target) => return Ok(Flow::Jump(*target)),
            Op::JumpIfFalse(target) => {
                if !truthy(&pop(frame)?) {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::JumpIfTrue(target) => {
                if truthy(&pop(frame)?) {
                    return Ok(Flow::Jump(*target));
                }
            }
            Op::Pop => {
                pop(frame)?;
            }
            Op::Return => return Ok(Flow::Return),
            Op::ReturnValue => {
                let value = pop(frame)?;
                frame.borrow_mut().ret = Some(value);
                return Ok(Flow::Return);
            }
        }
        Ok(Flow::Next)
    }

    // =========================================================================
    // Names
    // =========================================================================

    /// Frames searched for a name after the current one: the receiver of a
    /// method, then the chain of defining frames.
    fn scope_chain(frame: &FrameRef) -> Vec<FrameRef> {
        let mut chain = vec![frame.clone()];
        let receiver = frame.borrow().receiver.clone();
        chain.extend(receiver);

        let mut home = frame.borrow().home_frame();
        while let Some(h) = home {
            home = h.borrow().home_frame();
            chain.push(h);
        }
        chain
    }

    pub(crate) fn lookup(&self, frame: &FrameRef, name: &str) -> Result<Value, RuntimeError> {
        for scope in Self::scope_chain(frame) {
            let found = scope.borrow().get(name);
            if let Some(value) = found {
                let is_instance = scope.borrow().kind == FrameKind::Instance;
                return Ok(if is_instance {
                    bind_receiver(value, &scope)
                } else {
                    value
                });
            }
        }

        if let Some(program) = self.frames.first() {
            if let Some(value) = program.borrow().get(name) {
                return Ok(value);
            }
        }
        if let Some(b) = Builtin::from_name(name) {
            return Ok(Value::Builtin(b));
        }
        if let Some(member) = self.native_functions.get(name) {
            return Ok(member.value(name));
        }
        if let Some(module) = self.native_modules.get(name) {
            return Ok(Value::Module(module.clone()));
        }
        Err(RuntimeErrorKind::UndefinedName(name.to_string()).into())
    }

    /// Frame whose bindings hold `name`, searched like `lookup`.
    fn find_owner(&self, frame: &FrameRef, name: &str) -> Option<FrameRef> {
        Self::scope_chain(frame)
            .into_iter()
            .chain(self.frames.first().cloned())
            .find(|scope| scope.borrow().bindings.contains_key(name))
    }

    fn store(&self, frame: &FrameRef, name: &str, ty: &Type, value: Value) -> Result<(), RuntimeError> {
        let value = self.coerce(frame, ty, value)?;
        self.annotate(frame, ty, &value);

        let mut f = frame.borrow_mut();
        f.bindings.insert(name.to_string(), value);
        f.declared.insert(name.to_string(), ty.clone());
        Ok(())
    }

    fn assign(&self, frame: &FrameRef, name: &str, value: Value) -> Result<(), RuntimeError> {
        let owner = self
            .find_owner(frame, name)
            .ok_or_else(|| RuntimeErrorKind::UndefinedName(name.to_string()))?;
        self.rebind(&owner, name, value)
    }

    /// Replace an existing binding. A declared slot checks its type, an
    /// undeclared one keeps its kind. Nothing changes when the check fails.
    fn rebind(&self, owner: &FrameRef, name: &str, value: Value) -> Result<(), RuntimeError> {
        let declared = owner.borrow().declared.get(name).cloned();
        let value = match declared {
            Some(ty) => {
                let value = self.coerce(owner, &ty, value)?;
                self.annotate(owner, &ty, &value);
                value
            }
            None => {
                let current = owner.borrow().get(name);
                match current {
                    Some(current)
                        if !matches!(current, Value::Nil) && !current.same_kind(&value) =>
                    {
                        return Err(RuntimeErrorKind::TypeMismatch {
                            expected: format!("<{}>", current.kind_name()),
                            found: value.describe(),
                        }
                        .into());
                    }
                    _ => value,
                }
            }
        };
        owner.borrow_mut().bindings.insert(name.to_string(), value);
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(f) => self.call_function(&f, args),
            Value::Builtin(b) => builtins::call(b, &args, &mut *self.out)
                .map_err(|e| e.with_context(&format!("in builtin '{}'", b.name()))),
            Value::Native(m) => {
                (m.func)(&args).map_err(|e| e.with_context(&format!("in native '{}'", m.name)))
            }
            Value::Interface(def, _) => Err(RuntimeErrorKind::UnsupportedOperand(format!(
                "call of interface {}",
                def.name
            ))
            .into()),
            other => Err(RuntimeErrorKind::UnsupportedOperand(format!(
                "call of {}",
                other.describe()
            ))
            .into()),
        }
    }

    pub(crate) fn call_function(&mut self, f: &Function, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let proto = &f.proto;
        let arity = proto.params.len();
        let accepted = match proto.variadic {
            Some(_) => args.len() >= arity,
            None => args.len() == arity,
        };
        if !accepted {
            return Err(RuntimeErrorKind::ArityMismatch {
                name: proto.name.clone(),
                expected: match proto.variadic {
                    Some(_) => format!("at least {}", arity),
                    None => arity.to_string(),
                },
                found: args.len(),
            }
            .into());
        }

        let home = f.home.upgrade().or_else(|| self.frames.first().cloned());
        let mut frame = Frame::new(proto.code.clone(), FrameKind::Call);
        frame.home = home.as_ref().map(Rc::downgrade);
        frame.receiver = f.receiver.clone();
        frame.install_generics(&proto.generics);
        let frame = Rc::new(RefCell::new(frame));

        self.invoke(&frame, f, args)
            .map_err(|e| e.with_context(&format!("in '{}'", proto.name)))
    }

    fn invoke(&mut self, frame: &FrameRef, f: &Function, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let proto = &f.proto;
        let mut args = args.into_iter();

        for (param, value) in proto.params.iter().zip(args.by_ref()) {
            self.store(frame, &param.name, &param.ty, value)?;
        }
        if let Some(rest) = &proto.variadic {
            let ty = Type::Array(Box::new(rest.ty.clone()));
            self.store(frame, &rest.name, &ty, Value::array(args.collect()))?;
        }

        self.call_stack.push(proto.name.clone());
        let ret = self.run_frame(frame);
        self.call_stack.pop();
        let ret = ret?;

        match &proto.ret {
            Some(ty) => {
                let value = ret.ok_or_else(|| {
                    RuntimeError::other(format!("function '{}' missing return value", proto.name))
                })?;
                self.coerce(frame, ty, value)
            }
            None => Ok(ret.unwrap_or(Value::Nil)),
        }
    }

    fn instantiate(&mut self, class: Value, fields: &[&str], values: Vec<Value>) -> Result<Value, RuntimeError> {
        let class = match class {
            Value::Class(c) if c.frame.is_none() => c,
            other => {
                return Err(RuntimeErrorKind::UnsupportedOperand(format!(
                    "new of {}",
                    other.describe()
                ))
                .into());
            }
        };
        let proto = &class.proto;

        let home = class.home.upgrade().or_else(|| self.frames.first().cloned());
        let mut frame = Frame::new(proto.code.clone(), FrameKind::Instance);
        frame.home = home.as_ref().map(Rc::downgrade);
        frame.install_generics(&proto.generics);
        let frame = Rc::new(RefCell::new(frame));

        let context = format!("new {}", proto.name);
        self.call_stack.push(context.clone());
        let ran = self.run_frame(&frame);
        self.call_stack.pop();
        ran.map_err(|e| e.with_context(&format!("in '{}'", context)))?;

        // Field values supplied by `new` bind the generics afresh.
        frame.borrow_mut().install_generics(&proto.generics);

        for (field, value) in fields.iter().zip(values) {
            let ty = frame.borrow().declared.get(*field).cloned();
            let Some(ty) = ty else {
                return Err(RuntimeErrorKind::UnknownMember {
                    owner: format!("class {}", proto.name),
                    member: field.to_string(),
                }
                .into());
            };
            self.store(&frame, field, &ty, value)?;
        }

        Ok(Value::Class(Rc::new(Class {
            proto: proto.clone(),
            home: class.home.clone(),
            frame: Some(frame),
            initialized: true,
        })))
    }

    // =========================================================================
    // Members and indexing
    // =========================================================================

    fn set_member(&self, object: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
        match object {
            Value::Class(c) => {
                let frame = instance_frame(c)?;
                if !frame.borrow().bindings.contains_key(name) {
                    return Err(RuntimeErrorKind::UnknownMember {
                        owner: format!("class {}", c.proto.name),
                        member: name.to_string(),
                    }
                    .into());
                }
                self.rebind(frame, name, value)
            }
            Value::Interface(def, Some(class)) => {
                if !def.methods.iter().any(|m| m.name == name) {
                    return Err(RuntimeErrorKind::UnknownMember {
                        owner: format!("interface {}", def.name),
                        member: name.to_string(),
                    }
                    .into());
                }
                self.set_member(&Value::Class(class.clone()), name, value)
            }
            Value::Tuple(_) => Err(RuntimeErrorKind::UnsupportedOperand(
                "assignment to a tuple element".to_string(),
            )
            .into()),
            other => Err(RuntimeErrorKind::UnsupportedOperand(format!(
                "member '{}' of {}",
                name,
                other.describe()
            ))
            .into()),
        }
    }

    fn index_set(&self, frame: &FrameRef, container: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match (container, index) {
            (Value::Array(a), Value::Int(i)) => {
                let elem = a.borrow().elem.clone();
                let value = match elem {
                    Some(ty) => self.coerce(frame, &ty, value)?,
                    None => value,
                };

                let mut a = a.borrow_mut();
                let len = a.items.len();
                match usize::try_from(*i) {
                    Ok(i) if i < len => a.items[i] = value,
                    Ok(i) if i == len => a.items.push(value),
                    _ => return Err(RuntimeErrorKind::IndexOutOfBounds { index: *i, len }.into()),
                }
                Ok(())
            }
            (Value::Map(m), key) => {
                let (key_ty, val_ty) = {
                    let m = m.borrow();
                    (m.key_ty.clone(), m.val_ty.clone())
                };
                let key = match key_ty {
                    Some(ty) => self.coerce(frame, &ty, key.clone())?,
                    None => key.clone(),
                };
                let value = match val_ty {
                    Some(ty) => self.coerce(frame, &ty, value)?,
                    None => value,
                };
                m.borrow_mut().insert(key, value);
                Ok(())
            }
            (Value::Tuple(_), _) => Err(RuntimeErrorKind::UnsupportedOperand(
                "assignment to a tuple element".to_string(),
            )
            .into()),
            (container, index) => Err(RuntimeErrorKind::UnsupportedOperand(format!(
                "{}[{}] = ...",
                container.describe(),
                index.describe()
            ))
            .into()),
        }
    }

    // =========================================================================
    // Modules
    // =========================================================================

    /// File whose `use` is running: the module being loaded, else the program.
    fn importer(&self) -> Option<PathBuf> {
        self.loader
            .current()
            .map(Path::to_path_buf)
            .or_else(|| self.origin.clone())
    }

    fn import(&mut self, frame: &FrameRef, path: &str, merge: bool) -> Result<(), RuntimeError> {
        let importer = self.importer();
        let short = path.rsplit('.').next().unwrap_or(path).to_string();

        match self.loader.resolve(path, importer.as_deref()) {
            Some(file) => {
                debug!(module = path, file = %file.display(), merge, "resolved module");
                let module = self.load_source(path, &short, file, importer.as_deref())?;
                let ModuleKind::Source(source) = &module.kind else {
                    return Ok(());
                };
                if merge {
                    let source = source.borrow();
                    let mut f = frame.borrow_mut();
                    for (name, value) in &source.bindings {
                        f.bindings.insert(name.clone(), value.clone());
                    }
                    for (name, ty) in &source.declared {
                        f.declared.insert(name.clone(), ty.clone());
                    }
                } else {
                    frame.borrow_mut().bindings.insert(short, Value::Module(module.clone()));
                }
                Ok(())
            }
            None => {
                let native = self
                    .loader
                    .load_native(path)?
                    .ok_or_else(|| self.loader.not_found(path))?;
                info!(module = path, members = native.members.len(), merge, "loaded native module");
                if merge {
                    for (name, member) in &native.members {
                        self.native_functions.insert(name.clone(), *member);
                    }
                } else {
                    let module = Rc::new(Module {
                        name: short.clone(),
                        kind: ModuleKind::Native(Rc::new(native)),
                    });
                    self.native_modules.insert(short, module);
                }
                Ok(())
            }
        }
    }

    fn load_source(
        &mut self,
        path: &str,
        name: &str,
        file: PathBuf,
        importer: Option<&Path>,
    ) -> Result<Rc<Module>, RuntimeError> {
        if importer == Some(file.as_path()) {
            return Err(RuntimeErrorKind::SelfImport(path.to_string()).into());
        }
        if let Some(module) = self.loader.cached(&file) {
            debug!(module = path, "module cache hit");
            return Ok(module);
        }
        if self.loader.is_loading(&file) || self.origin.as_deref() == Some(file.as_path()) {
            let chain = self.loader.chain_to(self.origin.as_deref(), &file);
            return Err(RuntimeErrorKind::ImportCycle(chain).into());
        }

        let source = std::fs::read_to_string(&file)
            .map_err(|e| RuntimeError::other(format!("cannot read module '{}': {}", path, e)))?;
        let compile_error = |message: String| RuntimeErrorKind::ModuleCompile {
            module: path.to_string(),
            message,
        };
        let tokens = Lexer::new(&source)
            .tokenize()
            .map_err(|e| compile_error(format!("lexer {}", e)))?;
        let code = Compiler::new(tokens)
            .compile_named(name)
            .map_err(|e| compile_error(e.to_string()))?;

        let module_frame = Frame::program(Rc::new(code));
        self.loader.begin(file.clone());
        let saved = std::mem::take(&mut self.frames);
        let result = self.run_in_module(&module_frame);
        self.frames = saved;
        self.loader.end();
        result.map_err(|e| e.with_context(&format!("in module '{}'", path)))?;

        let module = Rc::new(Module {
            name: name.to_string(),
            kind: ModuleKind::Source(module_frame),
        });
        info!(module = path, file = %file.display(), "loaded module");
        self.loader.finish(file, module.clone());
        Ok(module)
    }

    fn run_in_module(&mut self, frame: &FrameRef) -> Result<(), RuntimeError> {
        check_code(&frame.borrow().code)
            .map_err(|e| RuntimeErrorKind::InvalidBytecode(e.message))?;
        self.run_frame(frame).map(|_| ())
    }
}

fn push(frame: &FrameRef, value: Value) {
    frame.borrow_mut().stack.push(value);
}

fn pop(frame: &FrameRef) -> Result<Value, RuntimeError> {
    let value = frame.borrow_mut().stack.pop();
    value.ok_or_else(|| RuntimeError::other("stack underflow"))
}

/// Pop `n` values, returned in push order.
fn pop_n(frame: &FrameRef, n: usize) -> Result<Vec<Value>, RuntimeError> {
    let mut f = frame.borrow_mut();
    let len = f.stack.len();
    if n > len {
        return Err(RuntimeError::other("stack underflow"));
    }
    Ok(f.stack.split_off(len - n))
}

fn constant_value(frame: &FrameRef, constant: &Constant) -> Value {
    match constant {
        Constant::Int(n) => Value::Int(*n),
        Constant::Float(n) => Value::Float(*n),
        Constant::Char(c) => Value::Char(*c),
        Constant::Str(s) => Value::Str(s.clone()),
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Nil => Value::Nil,
        Constant::Function(proto) => Value::Function(Rc::new(Function {
            proto: proto.clone(),
            home: Rc::downgrade(frame),
            receiver: None,
        })),
        Constant::Class(proto) => Value::Class(Rc::new(Class {
            proto: proto.clone(),
            home: Rc::downgrade(frame),
            frame: None,
            initialized: false,
        })),
        Constant::Interface(def) => Value::Interface(def.clone(), None),
        Constant::Enum(def) => Value::Enum(def.clone()),
    }
}

/// Methods read off an instance run with that instance as receiver.
fn bind_receiver(value: Value, instance: &FrameRef) -> Value {
    match value {
        Value::Function(f) if f.receiver.is_none() => Value::Function(Rc::new(Function {
            proto: f.proto.clone(),
            home: f.home.clone(),
            receiver: Some(instance.clone()),
        })),
        other => other,
    }
}

fn instance_frame(class: &Class) -> Result<&FrameRef, RuntimeError> {
    match &class.frame {
        Some(frame) if class.initialized => Ok(frame),
        _ => Err(RuntimeErrorKind::Uninitialized(format!("class {}", class.proto.name)).into()),
    }
}

fn get_member(object: &Value, name: &str) -> Result<Value, RuntimeError> {
    let unknown = |owner: String| -> RuntimeError {
        RuntimeErrorKind::UnknownMember {
            owner,
            member: name.to_string(),
        }
        .into()
    };

    match object {
        Value::Enum(def) => def
            .members
            .iter()
            .position(|m| m == name)
            .map(|i| Value::Int(i as i64))
            .ok_or_else(|| unknown(format!("enum {}", def.name))),
        Value::Class(c) => {
            let frame = instance_frame(c)?;
            let value = frame.borrow().get(name);
            value
                .map(|v| bind_receiver(v, frame))
                .ok_or_else(|| unknown(format!("class {}", c.proto.name)))
        }
        Value::Tuple(t) => {
            let index: usize = name.parse().map_err(|_| unknown("tuple".to_string()))?;
            t.items.get(index).cloned().ok_or_else(|| {
                RuntimeErrorKind::IndexOutOfBounds {
                    index: index as i64,
                    len: t.items.len(),
                }
                .into()
            })
        }
        Value::Interface(def, bound) => {
            let Some(class) = bound else {
                return Err(RuntimeErrorKind::Uninitialized(format!("interface {}", def.name)).into());
            };
            if !def.methods.iter().any(|m| m.name == name) {
                return Err(unknown(format!("interface {}", def.name)));
            }
            get_member(&Value::Class(class.clone()), name)
        }
        Value::Module(m) => {
            let found = match &m.kind {
                ModuleKind::Source(frame) => frame.borrow().get(name),
                ModuleKind::Native(native) => native.get(name),
            };
            found.ok_or_else(|| unknown(format!("module {}", m.name)))
        }
        other => Err(RuntimeErrorKind::UnsupportedOperand(format!(
            "member '{}' of {}",
            name,
            other.describe()
        ))
        .into()),
    }
}

fn position(index: i64, len: usize) -> Result<usize, RuntimeError> {
    match usize::try_from(index) {
        Ok(i) if i < len => Ok(i),
        _ => Err(RuntimeErrorKind::IndexOutOfBounds { index, len }.into()),
    }
}

fn index_get(container: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match (container, index) {
        (Value::Array(a), Value::Int(i)) => {
            let a = a.borrow();
            Ok(a.items[position(*i, a.items.len())?].clone())
        }
        (Value::Tuple(t), Value::Int(i)) => Ok(t.items[position(*i, t.items.len())?].clone()),
        (Value::Str(s), Value::Int(i)) => {
            let len = s.chars().count();
            let i = position(*i, len)?;
            Ok(s.chars().nth(i).map_or(Value::Nil, Value::Char))
        }
        (Value::Map(m), key) => m
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeErrorKind::KeyNotFound(key.describe()).into()),
        (container, index) => Err(RuntimeErrorKind::UnsupportedOperand(format!(
            "{}[{}]",
            container.describe(),
            index.describe()
        ))
        .into()),
    }
}
