//! Native instruction set emitted by the JIT.
//!
//! The instructions model a typed operand-stack machine with numbered
//! local slots, the shape the generated routines are handed to an emitter
//! in. `vm::Machine` executes them directly.

use serde::Serialize;

use crate::error::JitError;
use crate::ir::{Constant, ConstantId};
use crate::types::{Primitive, Type};

/// A native local-variable slot.
pub type Slot = usize;

/// Operand kinds of the native machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NativeKind {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Ref,
}

/// Native representation class of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum NativeClass {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    /// A reference to an object of the named class
    Object(String),
}

impl NativeClass {
    pub fn object(name: impl Into<String>) -> Self {
        NativeClass::Object(name.into())
    }

    /// The boxed class of a primitive.
    pub fn boxed(p: Primitive) -> Self {
        NativeClass::Object(p.name().to_string())
    }

    /// The single native word class of a primitive, `None` for wide ones.
    pub fn of_primitive(p: Primitive) -> Option<Self> {
        let class = match p {
            Primitive::Boolean => NativeClass::Boolean,
            Primitive::Char
            | Primitive::Int8
            | Primitive::Int16
            | Primitive::Int32
            | Primitive::UInt8
            | Primitive::UInt16
            | Primitive::UInt32 => NativeClass::Int,
            Primitive::Int64 | Primitive::UInt64 => NativeClass::Long,
            Primitive::Float32 => NativeClass::Float,
            Primitive::Float64 => NativeClass::Double,
            Primitive::Int128 | Primitive::UInt128 => return None,
        };
        Some(class)
    }

    /// Native word classes of a primitive, low word first.
    pub fn words(p: Primitive) -> Vec<Self> {
        match Self::of_primitive(p) {
            Some(class) => vec![class],
            None => vec![NativeClass::Long; p.word_count()],
        }
    }

    pub fn kind(&self) -> NativeKind {
        match self {
            NativeClass::Boolean => NativeKind::Boolean,
            NativeClass::Int => NativeKind::Int,
            NativeClass::Long => NativeKind::Long,
            NativeClass::Float => NativeKind::Float,
            NativeClass::Double => NativeKind::Double,
            NativeClass::Object(_) => NativeKind::Ref,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, NativeClass::Object(_))
    }
}

/// Immediate constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum NativeConst {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
}

impl NativeConst {
    /// The zero value of a native class.
    pub fn zero(class: &NativeClass) -> Self {
        match class {
            NativeClass::Boolean | NativeClass::Int => NativeConst::Int(0),
            NativeClass::Long => NativeConst::Long(0),
            NativeClass::Float => NativeConst::Float(0.0),
            NativeClass::Double => NativeConst::Double(0.0),
            NativeClass::Object(_) => NativeConst::Null,
        }
    }

    /// Unboxed native words of a primitive constant, low word first.
    pub fn words_of(constant: &Constant, p: Primitive) -> Result<Vec<NativeConst>, JitError> {
        let words = match (constant, p) {
            (Constant::Bool(b), Primitive::Boolean) => vec![NativeConst::Int(*b as i32)],
            (Constant::Char(c), Primitive::Char) => vec![NativeConst::Int(*c as i32)],
            (Constant::Int { value, .. }, p) if p.is_integer() => match p.word_count() {
                1 if NativeClass::of_primitive(p) == Some(NativeClass::Long) => {
                    vec![NativeConst::Long(*value as i64)]
                }
                1 => vec![NativeConst::Int(*value as i32)],
                _ => {
                    let bits = *value as u128;
                    vec![
                        NativeConst::Long(bits as u64 as i64),
                        NativeConst::Long((bits >> 64) as u64 as i64),
                    ]
                }
            },
            (Constant::Float { value, .. }, Primitive::Float32) => {
                vec![NativeConst::Float(value.0 as f32)]
            }
            (Constant::Float { value, .. }, Primitive::Float64) => {
                vec![NativeConst::Double(value.0)]
            }
            _ => {
                return Err(JitError::unsupported(format!(
                    "constant {constant} as {p}"
                )));
            }
        };
        Ok(words)
    }
}

/// Branch target inside one routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Label(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// Logical right shift
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Conversion {
    I2L,
    L2I,
    /// Sign-extend the low 8 bits
    I2B,
    /// Sign-extend the low 16 bits
    I2S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    pub fn test(self, a: i32, b: i32) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => a < b,
            Cond::Ge => a >= b,
            Cond::Gt => a > b,
            Cond::Le => a <= b,
        }
    }
}

/// Runtime support routines invoked by generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Builtin {
    DivideUnsigned(NativeKind),
    RemainderUnsigned(NativeKind),
    /// Signed modulo with the sign of the divisor
    FloorMod(NativeKind),
    /// High 64 bits of the unsigned 128-bit product of two longs
    UnsignedMultiplyHigh,
    /// `(l1, h1, l2, h2) -> (low, high)` paired-word division or remainder
    WideDivRem { signed: bool, remainder: bool },
    /// Validate a long as a code point, leaving it as an int
    CodePoint,
    CharToString,
    Concat,
    /// `(ctx, type, name, opts) -> resource`
    Inject,
}

/// One native instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Insn {
    // ========================================
    // Constants and locals
    // ========================================
    Const(NativeConst),
    /// Push a constant-pool entry as a reference
    Ldc(ConstantId),
    Load { kind: NativeKind, slot: Slot },
    Store { kind: NativeKind, slot: Slot },

    // ========================================
    // Operand stack
    // ========================================
    Pop,
    Dup,

    // ========================================
    // Arithmetic
    // ========================================
    /// Shifts take an int shift amount for every operand kind.
    Arith { op: ArithOp, kind: NativeKind },
    Neg(NativeKind),
    Convert(Conversion),
    /// Compare two longs, pushing -1, 0 or 1
    LCmp,

    // ========================================
    // Control flow
    // ========================================
    /// Compare an int with zero
    If { cond: Cond, target: Label },
    /// Compare two ints
    IfICmp { cond: Cond, target: Label },
    IfNull { target: Label },
    IfNonNull { target: Label },
    Goto(Label),

    // ========================================
    // Objects
    // ========================================
    /// Box the native word(s) of a primitive
    Box(Primitive),
    /// Unbox a reference into the native word(s) of a primitive
    Unbox(Primitive),
    CheckCast(Type),

    // ========================================
    // Calls
    // ========================================
    Invoke(Builtin),
    /// Call a compiled routine. The context is the first argument.
    Call { method: String, optimized: bool },
    /// Read a value from the context's return carrier
    LoadReturn { kind: NativeKind, index: usize },
    /// Write a value into the context's return carrier
    StoreReturn { kind: NativeKind, index: usize },
    Return(Option<NativeKind>),

    // ========================================
    // Markers
    // ========================================
    /// End of a lexical scope, for lifetime-tracking consumers
    ScopeEnd { depth: usize },
}

impl Insn {
    pub fn branch_target(&self) -> Option<Label> {
        match self {
            Insn::If { target, .. }
            | Insn::IfICmp { target, .. }
            | Insn::IfNull { target }
            | Insn::IfNonNull { target }
            | Insn::Goto(target) => Some(*target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_classes() {
        assert_eq!(NativeClass::of_primitive(Primitive::UInt16), Some(NativeClass::Int));
        assert_eq!(NativeClass::of_primitive(Primitive::UInt64), Some(NativeClass::Long));
        assert_eq!(NativeClass::of_primitive(Primitive::Int128), None);
        assert_eq!(
            NativeClass::words(Primitive::UInt128),
            vec![NativeClass::Long, NativeClass::Long]
        );
    }

    #[test]
    fn test_constant_words() {
        let c = Constant::int(Primitive::Int128, -2);
        let words = NativeConst::words_of(&c, Primitive::Int128).unwrap();
        assert_eq!(words, vec![NativeConst::Long(-2), NativeConst::Long(-1)]);

        let c = Constant::int(Primitive::UInt32, u32::MAX as i128);
        let words = NativeConst::words_of(&c, Primitive::UInt32).unwrap();
        assert_eq!(words, vec![NativeConst::Int(-1)]);

        assert!(NativeConst::words_of(&Constant::string("x"), Primitive::Int64).is_err());
    }
}
