//! XVM ops: typed registers and a linear op stream.

use serde::{Deserialize, Serialize};

use crate::types::Type;

/// A logical register id. Negative values are reserved sentinels.
pub type RegId = i32;

/// An op argument: a register, a sentinel or a constant reference.
pub type ArgId = i32;

// Reserved argument ids.
pub const A_STACK: ArgId = -1;
pub const A_IGNORE: ArgId = -2;
pub const A_DEFAULT: ArgId = -3;
pub const A_THIS: ArgId = -4;
pub const A_TARGET: ArgId = -5;
pub const A_PUBLIC: ArgId = -6;
pub const A_PROTECTED: ArgId = -7;
pub const A_PRIVATE: ArgId = -8;
pub const A_STRUCT: ArgId = -9;
pub const A_CLASS: ArgId = -10;
pub const A_SERVICE: ArgId = -11;
pub const A_SUPER: ArgId = -12;

/// Arguments at or below this id refer to method constants.
pub const CONSTANT_OFFSET: ArgId = -17;

/// Argument id of the method constant at `index`.
pub fn constant_arg(index: usize) -> ArgId {
    CONSTANT_OFFSET - index as ArgId
}

/// Method constant index of an argument id, if it refers to one.
pub fn constant_index(arg: ArgId) -> Option<usize> {
    if arg <= CONSTANT_OFFSET {
        Some((CONSTANT_OFFSET - arg) as usize)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// Logical (unsigned) right shift
    ShrAll,
}

impl BinaryOp {
    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrAll)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Compl,
}

/// Annotation on a reference variable, e.g. `@Inject("name")`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub class: String,
    #[serde(default)]
    pub params: Vec<ArgId>,
}

/// One XVM op. Jump targets are op addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Nop,
    /// Open a lexical scope
    Enter,
    /// Close the innermost lexical scope
    Exit,
    /// Declare a register
    Var {
        reg: RegId,
        ty: Type,
        #[serde(default)]
        name: Option<String>,
    },
    Move {
        from: ArgId,
        to: RegId,
    },
    Binary {
        kind: BinaryOp,
        lhs: ArgId,
        rhs: ArgId,
        ret: RegId,
    },
    Unary {
        kind: UnaryOp,
        arg: ArgId,
        ret: RegId,
    },
    Jump {
        target: usize,
    },
    /// Jump when a Boolean argument equals `when`
    JumpIf {
        cond: ArgId,
        when: bool,
        target: usize,
    },
    /// Jump when the register's nullness equals `when`
    JumpNull {
        arg: RegId,
        when: bool,
        target: usize,
    },
    /// Declare an annotated reference variable
    Ref {
        reg: RegId,
        ty: Type,
        name: String,
        annotation: Annotation,
    },
    Call {
        method: String,
        #[serde(default)]
        args: Vec<ArgId>,
        #[serde(default)]
        returns: Vec<RegId>,
    },
    Return {
        #[serde(default)]
        values: Vec<ArgId>,
    },
}

impl Op {
    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Op::Jump { target } | Op::JumpIf { target, .. } | Op::JumpNull { target, .. } => {
                Some(*target)
            }
            _ => None,
        }
    }

    /// Whether control can reach the next op.
    pub fn falls_through(&self) -> bool {
        !matches!(self, Op::Jump { .. } | Op::Return { .. })
    }
}
