use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, info};

use crate::bytecode::{CodeObject, Compiler};
use crate::frontend::Lexer;
use crate::lang::Type;
use crate::runtime::frame::{Frame, FrameRef, TypeBinding};
use crate::runtime::value::Value;
use crate::runtime::vm::Vm;

/// How faults end an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// The first fault ends the program.
    #[default]
    Batch,
    /// A fault discards only the input that raised it.
    Interactive,
}

/// Bindings of the program frame before an input ran.
struct Snapshot {
    bindings: HashMap<String, Value>,
    declared: HashMap<String, Type>,
    types: HashMap<String, TypeBinding>,
}

/// A VM plus the program frame that successive inputs run against.
pub struct Session {
    vm: Vm,
    frame: FrameRef,
    mode: Mode,
}

impl Session {
    pub fn new(vm: Vm) -> Self {
        let mode = vm.config().mode;
        info!(?mode, "session started");
        Session {
            vm,
            frame: Frame::program(Rc::new(CodeObject::new("main"))),
            mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn frame(&self) -> &FrameRef {
        &self.frame
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Current value of a program-level name.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.frame.borrow().get(name)
    }

    /// Lex, compile and run one input.
    pub fn eval(&mut self, source: &str) -> Result<(), crate::Error> {
        let tokens = Lexer::new(source).tokenize()?;
        let code = Compiler::new(tokens).compile()?;
        self.execute(code)
    }

    /// Run compiled code against the session frame.
    pub fn execute(&mut self, code: CodeObject) -> Result<(), crate::Error> {
        let snapshot = match self.mode {
            Mode::Interactive => {
                let f = self.frame.borrow();
                Some(Snapshot {
                    bindings: f.bindings.clone(),
                    declared: f.declared.clone(),
                    types: f.types.clone(),
                })
            }
            Mode::Batch => None,
        };

        self.frame.borrow_mut().code = Rc::new(code);
        let result = self.vm.run_in(&self.frame);

        if result.is_err() {
            if let Some(snapshot) = snapshot {
                debug!("restoring bindings after failed input");
                let mut f = self.frame.borrow_mut();
                f.bindings = snapshot.bindings;
                f.declared = snapshot.declared;
                f.types = snapshot.types;
                f.stack.clear();
            }
        }
        result.map_err(crate::Error::from)
    }
}
