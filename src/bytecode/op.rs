use serde::{Deserialize, Serialize};

// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// Every operand is embedded in the instruction itself: pool indices refer to
// the constants/names/types of the code object the op belongs to, and jump
// targets are absolute instruction indices in that same code object.

/// Binary operator shared by plain and compound-assignment instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Ge => ">=",
            BinOp::Le => "<=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&",
            BinOp::Or => "|",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // literals
    /// Push constant `constants[idx]`.
    Const(usize),

    // names
    /// Resolve `names[idx]` through the lookup chain and push it.
    Load(usize),
    /// Pop, check against `types[ty]`, declare `names[name]` in the current frame.
    Store { name: usize, ty: usize },
    /// Pop and rebind an existing name.
    Assign(usize),
    /// `name op= value`
    AssignOp(usize, BinOp),

    // definitions (bind a prototype constant by its own name, push nothing)
    DefFunc(usize),
    DefClass(usize),
    DefInterface(usize),
    DefEnum(usize),

    // collections
    BuildArray(usize),
    BuildTuple(usize),
    /// Operand is the number of key/value pairs.
    BuildMap(usize),
    /// ( container index -- value )
    Index,
    /// ( container index value -- )
    SetIndex,
    /// ( container index value -- ), container[index] op= value
    IndexOp(BinOp),

    // members
    /// ( object -- member )
    GetMember(usize),
    /// ( object value -- )
    SetMember(usize),
    /// ( object value -- ), object.name op= value
    MemberOp(usize, BinOp),

    // operators
    Binary(BinOp),
    /// `-x`
    Neg,
    /// `!x`
    Not,

    // calls
    /// ( callee arg1 .. argN -- result )
    Call(usize),
    /// ( class v1 .. vN -- instance ); operand lists the field name indices.
    New(Vec<usize>),
    /// Import `names[path]` (a dotted path), merged or as a module value.
    Use { path: usize, merge: bool },

    // ==========================================================================
    // Control flow: absolute jump targets
    // ==========================================================================
    Jump(usize),

    /// Pop value, jump if falsy. If truthy, continue to next instruction.
    JumpIfFalse(usize),

    /// Pop value, jump if truthy. If falsy, continue to next instruction.
    JumpIfTrue(usize),

    /// Discard the value left by an expression statement.
    Pop,

    /// Leave the current code object.
    Return,
    /// Pop into the frame's return slot and leave the current code object.
    ReturnValue,
}

impl Op {
    /// Jump target, for the three jump instructions.
    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => Some(*t),
            _ => None,
        }
    }

    /// True for instructions that consume their value instead of leaving one,
    /// so an expression statement ending in them needs no `Pop`.
    pub fn is_assignment(&self) -> bool {
        matches!(
            self,
            Op::Assign(_)
                | Op::AssignOp(..)
                | Op::SetIndex
                | Op::IndexOp(_)
                | Op::SetMember(_)
                | Op::MemberOp(..)
        )
    }
}
