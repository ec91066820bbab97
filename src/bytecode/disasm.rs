use crate::bytecode::{CodeObject, Op};
use crate::runtime::frame::Frame;
use std::fmt;

/// Human-readable listing of a code object and, indented below it, every
/// code object nested in its constants.
pub fn disassemble(code: &CodeObject) -> String {
    Listing { code, indent: 0 }.to_string()
}

/// Bindings of a frame, sorted by name, with their declared types.
pub fn dump_frame(frame: &Frame) -> String {
    let mut names: Vec<&String> = frame.bindings.keys().collect();
    names.sort();

    let mut out = format!("frame {}: {} bindings\n", frame.code.name, names.len());
    for name in names {
        let value = &frame.bindings[name];
        match frame.declared.get(name) {
            Some(ty) => out.push_str(&format!("  {} {} = {}\n", name, ty, value.describe())),
            None => out.push_str(&format!("  {} = {}\n", name, value.describe())),
        }
    }
    out
}

struct Listing<'a> {
    code: &'a CodeObject,
    indent: usize,
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code;
        let prefix = "  ".repeat(self.indent);

        writeln!(f, "{}════════════════════════════════════════", prefix)?;
        writeln!(
            f,
            "{}<{}>: {} ops, {} names, {} types, {} constants",
            prefix,
            code.name,
            code.ops.len(),
            code.names.len(),
            code.types.len(),
            code.constants.len()
        )?;
        writeln!(f, "{}════════════════════════════════════════", prefix)?;

        for (ip, op) in code.ops.iter().enumerate() {
            let target = code.jump_targets.contains(&ip);
            if target {
                writeln!(f, "{}      ┌──────────────────────────────────", prefix)?;
            }
            write!(
                f,
                "{}L{:<4} {:04} {}",
                prefix,
                code.line_at(ip),
                ip,
                if target { "► " } else { "  " }
            )?;
            write_op(f, code, op, ip)?;
            writeln!(f)?;
        }

        for child in code.children() {
            writeln!(f)?;
            write!(
                f,
                "{}",
                Listing {
                    code: child,
                    indent: self.indent + 1
                }
            )?;
        }
        Ok(())
    }
}

fn name(code: &CodeObject, idx: usize) -> &str {
    code.names.get(idx).map_or("?", String::as_str)
}

fn write_op(f: &mut fmt::Formatter<'_>, code: &CodeObject, op: &Op, ip: usize) -> fmt::Result {
    match op {
        Op::Const(idx) => match code.constants.get(*idx) {
            Some(c) => write!(f, "CONST         {} ({})", idx, c),
            None => write!(f, "CONST         {} (?)", idx),
        },

        // Names
        Op::Load(idx) => write!(f, "LOAD          {}", name(code, *idx)),
        Op::Store { name: n, ty } => {
            let ty = code.types.get(*ty).map_or("?".to_string(), |t| t.to_string());
            write!(f, "STORE         {} {}", name(code, *n), ty)
        }
        Op::Assign(idx) => write!(f, "ASSIGN        {}", name(code, *idx)),
        Op::AssignOp(idx, op) => write!(f, "ASSIGN_OP     {} {}=", name(code, *idx), op.symbol()),

        // Definitions
        Op::DefFunc(idx) => write!(f, "DEF_FUNC      {}", idx),
        Op::DefClass(idx) => write!(f, "DEF_CLASS     {}", idx),
        Op::DefInterface(idx) => write!(f, "DEF_INTERFACE {}", idx),
        Op::DefEnum(idx) => write!(f, "DEF_ENUM      {}", idx),

        // Collections
        Op::BuildArray(n) => write!(f, "BUILD_ARRAY   {}", n),
        Op::BuildTuple(n) => write!(f, "BUILD_TUPLE   {}", n),
        Op::BuildMap(n) => write!(f, "BUILD_MAP     {}", n),
        Op::Index => write!(f, "INDEX         ; ( c i -- v )"),
        Op::SetIndex => write!(f, "SET_INDEX     ; ( c i v -- )"),
        Op::IndexOp(op) => write!(f, "INDEX_OP      {}=", op.symbol()),

        // Members
        Op::GetMember(idx) => write!(f, "GET_MEMBER    {}", name(code, *idx)),
        Op::SetMember(idx) => write!(f, "SET_MEMBER    {}", name(code, *idx)),
        Op::MemberOp(idx, op) => write!(f, "MEMBER_OP     {} {}=", name(code, *idx), op.symbol()),

        // Operators
        Op::Binary(op) => write!(f, "BINARY        {}", op.symbol()),
        Op::Neg => write!(f, "NEG"),
        Op::Not => write!(f, "NOT"),

        // Calls
        Op::Call(argc) => write!(f, "CALL          {}", argc),
        Op::New(fields) => {
            let fields: Vec<&str> = fields.iter().map(|idx| name(code, *idx)).collect();
            write!(f, "NEW           {{{}}}", fields.join(", "))
        }
        Op::Use { path, merge } => {
            let mnemonic = if *merge { "USE_MERGE" } else { "USE" };
            write!(f, "{:<13} {}", mnemonic, name(code, *path))
        }

        // Control flow
        Op::Jump(target) => write_jump(f, "JUMP", ip, *target),
        Op::JumpIfFalse(target) => write_jump(f, "JUMP_FALSE", ip, *target),
        Op::JumpIfTrue(target) => write_jump(f, "JUMP_TRUE", ip, *target),
        Op::Pop => write!(f, "POP"),
        Op::Return => write!(f, "RETURN"),
        Op::ReturnValue => write!(f, "RETURN_VALUE"),
    }
}

fn write_jump(f: &mut fmt::Formatter<'_>, mnemonic: &str, ip: usize, target: usize) -> fmt::Result {
    let direction = if target <= ip { "↑" } else { "↓" };
    write!(f, "{:<13} {} (→ {:04})", mnemonic, direction, target)
}
