use crate::bytecode::{
    CodeObject, Op,
    ir::Constant,
};

/// A code object that the VM must not run.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyError {
    pub message: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verify error: {}", self.message)
    }
}

impl std::error::Error for VerifyError {}

impl VerifyError {
    fn at(code: &CodeObject, ip: usize, message: impl std::fmt::Display) -> Self {
        Self {
            message: format!("{}@{:04}: {}", code.name, ip, message),
        }
    }
}

/// Returns (pops, pushes) for an op.
fn effect(op: &Op) -> (usize, usize) {
    use Op::*;
    match op {
        Const(_) | Load(_) => (0, 1),
        Store { .. } | Assign(_) | AssignOp(..) => (1, 0),

        DefFunc(_) | DefClass(_) | DefInterface(_) | DefEnum(_) => (0, 0),

        BuildArray(n) | BuildTuple(n) => (*n, 1),
        BuildMap(n) => (2 * n, 1),
        Index => (2, 1),
        SetIndex | IndexOp(_) => (3, 0),

        GetMember(_) => (1, 1),
        SetMember(_) | MemberOp(..) => (2, 0),

        Binary(_) => (2, 1),
        Neg | Not => (1, 1),

        Call(argc) => (argc + 1, 1),
        New(fields) => (fields.len() + 1, 1),
        Use { .. } => (0, 0),

        Jump(_) => (0, 0),
        JumpIfFalse(_) | JumpIfTrue(_) => (1, 0),
        Pop => (1, 0),
        Return => (0, 0),
        ReturnValue => (1, 0),
    }
}

/// Check a code object and every code object nested in its constants.
///
/// Proves that every jump lands on an instruction of the same object, every
/// pool operand is in range, definitions point at the right kind of
/// constant, and a straight-line scan never pops an empty stack.
pub fn check_code(code: &CodeObject) -> Result<(), VerifyError> {
    if code.ops.len() != code.lines.len() {
        return Err(VerifyError {
            message: format!(
                "{}: {} ops but {} line entries",
                code.name,
                code.ops.len(),
                code.lines.len()
            ),
        });
    }

    check_operands(code)?;
    check_stack(code)?;

    for child in code.children() {
        check_code(child)?;
    }
    Ok(())
}

fn check_operands(code: &CodeObject) -> Result<(), VerifyError> {
    let name = |ip: usize, idx: usize| {
        if idx < code.names.len() {
            Ok(())
        } else {
            Err(VerifyError::at(code, ip, format!("name index {} out of range", idx)))
        }
    };
    let constant = |ip: usize, idx: usize| {
        code.constants
            .get(idx)
            .ok_or_else(|| VerifyError::at(code, ip, format!("constant index {} out of range", idx)))
    };

    for (ip, op) in code.ops.iter().enumerate() {
        match op {
            Op::Const(idx) => {
                constant(ip, *idx)?;
            }
            Op::Load(idx)
            | Op::Assign(idx)
            | Op::AssignOp(idx, _)
            | Op::GetMember(idx)
            | Op::SetMember(idx)
            | Op::MemberOp(idx, _)
            | Op::Use { path: idx, .. } => name(ip, *idx)?,
            Op::Store { name: n, ty } => {
                name(ip, *n)?;
                if *ty >= code.types.len() {
                    return Err(VerifyError::at(code, ip, format!("type index {} out of range", ty)));
                }
            }
            Op::New(fields) => {
                for idx in fields {
                    name(ip, *idx)?;
                }
            }
            Op::DefFunc(idx) => {
                if !matches!(constant(ip, *idx)?, Constant::Function(_)) {
                    return Err(VerifyError::at(code, ip, "DEF_FUNC operand is not a function"));
                }
            }
            Op::DefClass(idx) => {
                if !matches!(constant(ip, *idx)?, Constant::Class(_)) {
                    return Err(VerifyError::at(code, ip, "DEF_CLASS operand is not a class"));
                }
            }
            Op::DefInterface(idx) => {
                if !matches!(constant(ip, *idx)?, Constant::Interface(_)) {
                    return Err(VerifyError::at(code, ip, "DEF_INTERFACE operand is not an interface"));
                }
            }
            Op::DefEnum(idx) => {
                if !matches!(constant(ip, *idx)?, Constant::Enum(_)) {
                    return Err(VerifyError::at(code, ip, "DEF_ENUM operand is not an enum"));
                }
            }
            Op::Jump(target) | Op::JumpIfFalse(target) | Op::JumpIfTrue(target) => {
                if *target >= code.ops.len() {
                    return Err(VerifyError::at(
                        code,
                        ip,
                        format!("jump target {} outside 0..{}", target, code.ops.len()),
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Linear scan of stack heights. Compiled statements are stack-neutral and
/// jumps only happen between statements, so a scan that ignores jumps
/// still sees every height an execution can reach.
fn check_stack(code: &CodeObject) -> Result<(), VerifyError> {
    let mut height: usize = 0;

    for (ip, op) in code.ops.iter().enumerate() {
        let (pops, pushes) = effect(op);
        height = height.checked_sub(pops).ok_or_else(|| {
            VerifyError::at(
                code,
                ip,
                format!("stack underflow, {:?} needs {} items", op, pops),
            )
        })?;
        height += pushes;
    }
    Ok(())
}
