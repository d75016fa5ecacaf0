//! Arithmetic on single-word primitives.
//!
//! Sub-word integers are computed in an int and narrowed back afterwards:
//! `Int8`/`Int16` sign-extend, `UInt8`/`UInt16` mask. Unsigned division
//! and modulo go through runtime helpers, as does signed (floored) modulo.

use super::context::BuildContext;
use super::flavor::{primitive_of, JitFlavor, StackShape};
use super::insn::{ArithOp, Builtin, Conversion, Insn, NativeClass, NativeConst, NativeKind};
use crate::error::JitError;
use crate::ir::{ArgId, BinaryOp, RegId, UnaryOp};
use crate::types::{Primitive, Type};

/// Result type of a binary op.
pub fn result_type(kind: BinaryOp, lhs: &Type, rhs: &Type) -> Result<Type, JitError> {
    let unsupported = || JitError::unsupported(format!("{kind:?} on {lhs} and {rhs}"));
    match lhs.as_primitive() {
        Some(Primitive::Char) if matches!(kind, BinaryOp::Add | BinaryOp::Sub) => {
            match rhs.as_primitive() {
                Some(Primitive::Char) if kind == BinaryOp::Add => Ok(Type::string()),
                Some(p) if p.is_integer() && !p.is_wide() && p != Primitive::Char => {
                    Ok(Type::Primitive(Primitive::Char))
                }
                None if *rhs == Type::string() && kind == BinaryOp::Add => Ok(Type::string()),
                _ => Err(unsupported()),
            }
        }
        Some(Primitive::Char) => Err(unsupported()),
        Some(_) => Ok(lhs.clone()),
        None => Err(unsupported()),
    }
}

/// The native kind arithmetic on `p` runs in.
fn arith_kind(p: Primitive) -> Result<NativeKind, JitError> {
    match NativeClass::of_primitive(p) {
        Some(NativeClass::Boolean) => Ok(NativeKind::Int),
        Some(class) => Ok(class.kind()),
        None => Err(JitError::unsupported(format!("{p} is not a single-word primitive"))),
    }
}

impl BuildContext<'_> {
    pub fn build_binary(&mut self, kind: BinaryOp, lhs: ArgId, rhs: ArgId, ret: RegId) -> Result<(), JitError> {
        let lhs_ty = self.get_argument_type(lhs)?;
        let rhs_ty = self.get_argument_type(rhs)?;
        let result = result_type(kind, &lhs_ty, &rhs_ty)?;
        let p = lhs_ty
            .as_primitive()
            .ok_or_else(|| JitError::unsupported(format!("{kind:?} on {lhs_ty}")))?;

        if p == Primitive::Char {
            return self.build_char_add(kind, lhs, rhs, &rhs_ty, ret, &result);
        }
        if p.is_wide() {
            return self.build_wide_binary(kind, p, lhs, rhs, ret);
        }

        self.load_primitive(lhs, p)?;
        match kind {
            BinaryOp::Add => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_add(p)?;
            }
            BinaryOp::Sub => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_sub(p)?;
            }
            BinaryOp::Mul => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_mul(p)?;
            }
            BinaryOp::Div => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_div(p)?;
            }
            BinaryOp::Mod => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_mod(p)?;
            }
            BinaryOp::And => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_and(p)?;
            }
            BinaryOp::Or => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_or(p)?;
            }
            BinaryOp::Xor => {
                self.load_primitive(rhs, p)?;
                self.build_primitive_xor(p)?;
            }
            BinaryOp::Shl => self.build_primitive_shl(p, rhs)?,
            BinaryOp::Shr => self.build_primitive_shr(p, rhs)?,
            BinaryOp::ShrAll => self.build_primitive_shr_all(p, rhs)?,
        }
        self.assign_result(ret, &result, JitFlavor::Primitive)
    }

    pub fn build_unary(&mut self, kind: UnaryOp, arg: ArgId, ret: RegId) -> Result<(), JitError> {
        let ty = self.get_argument_type(arg)?;
        let p = ty
            .as_primitive()
            .ok_or_else(|| JitError::unsupported(format!("{kind:?} on {ty}")))?;
        if p.is_wide() {
            return self.build_wide_unary(kind, p, arg, ret);
        }
        self.load_primitive(arg, p)?;
        match kind {
            UnaryOp::Neg => self.build_primitive_neg(p)?,
            UnaryOp::Compl => self.build_primitive_compl(p)?,
        }
        self.assign_result(ret, &ty, JitFlavor::Primitive)
    }

    /// Push an argument as the unboxed value of `p`.
    pub(crate) fn load_primitive(&mut self, arg: ArgId, p: Primitive) -> Result<(), JitError> {
        let reg = self.load_argument(arg)?;
        match reg.flavor().loaded_shape() {
            StackShape::Value | StackShape::Ref => {
                self.convert(reg.flavor(), reg.ty(), JitFlavor::Primitive, &Type::Primitive(p))
            }
            _ => Err(JitError::unsupported(format!("possibly null operand of type {}", reg.ty()))),
        }
    }

    /// Push an argument as an int shift amount.
    pub(crate) fn load_shift_amount(&mut self, arg: ArgId) -> Result<(), JitError> {
        let reg = self.load_argument(arg)?;
        let p = primitive_of(reg.ty())
            .filter(|p| p.is_integer())
            .ok_or_else(|| JitError::unsupported(format!("shift by {}", reg.ty())))?;
        match reg.flavor().loaded_shape() {
            StackShape::Value => {}
            StackShape::Ref => {
                self.code.emit(Insn::Unbox(p));
            }
            StackShape::Words => {
                // the high word never matters
                self.code.emit(Insn::Pop);
            }
            _ => return Err(JitError::unsupported(format!("possibly null shift amount {}", reg.ty()))),
        }
        if p.is_wide() || arith_kind(p)? == NativeKind::Long {
            self.code.emit(Insn::Convert(Conversion::L2I));
        }
        Ok(())
    }

    /// Narrow an int result back into the range of `p`.
    pub fn adjust_int_value(&mut self, p: Primitive) -> Result<(), JitError> {
        match p {
            Primitive::Int8 => {
                self.code.emit(Insn::Convert(Conversion::I2B));
            }
            Primitive::Int16 => {
                self.code.emit(Insn::Convert(Conversion::I2S));
            }
            Primitive::UInt8 => self.mask_int(0xFF),
            Primitive::UInt16 => self.mask_int(0xFFFF),
            Primitive::Int32 | Primitive::UInt32 | Primitive::Char | Primitive::Boolean => {}
            other => return Err(JitError::unsupported(format!("{other} is not an int-sized type"))),
        }
        Ok(())
    }

    fn mask_int(&mut self, mask: i32) {
        self.code
            .emit(Insn::Const(NativeConst::Int(mask)))
            .emit(Insn::Arith {
                op: ArithOp::And,
                kind: NativeKind::Int,
            });
    }

    fn adjust_after(&mut self, p: Primitive, kind: NativeKind) -> Result<(), JitError> {
        if kind == NativeKind::Int {
            self.adjust_int_value(p)?;
        }
        Ok(())
    }

    pub fn build_primitive_add(&mut self, p: Primitive) -> Result<(), JitError> {
        self.build_primitive_arith(ArithOp::Add, p)
    }

    pub fn build_primitive_sub(&mut self, p: Primitive) -> Result<(), JitError> {
        self.build_primitive_arith(ArithOp::Sub, p)
    }

    pub fn build_primitive_mul(&mut self, p: Primitive) -> Result<(), JitError> {
        self.build_primitive_arith(ArithOp::Mul, p)
    }

    fn build_primitive_arith(&mut self, op: ArithOp, p: Primitive) -> Result<(), JitError> {
        if p == Primitive::Boolean {
            return Err(JitError::unsupported(format!("{op:?} on Boolean")));
        }
        let kind = arith_kind(p)?;
        self.code.emit(Insn::Arith { op, kind });
        self.adjust_after(p, kind)
    }

    pub fn build_primitive_div(&mut self, p: Primitive) -> Result<(), JitError> {
        let kind = arith_kind(p)?;
        if p.is_unsigned() {
            self.code.emit(Insn::Invoke(Builtin::DivideUnsigned(kind)));
        } else if p == Primitive::Boolean {
            return Err(JitError::unsupported("Div on Boolean"));
        } else {
            self.code.emit(Insn::Arith {
                op: ArithOp::Div,
                kind,
            });
        }
        self.adjust_after(p, kind)
    }

    pub fn build_primitive_mod(&mut self, p: Primitive) -> Result<(), JitError> {
        let kind = arith_kind(p)?;
        if p.is_unsigned() {
            self.code.emit(Insn::Invoke(Builtin::RemainderUnsigned(kind)));
        } else if p.is_float() {
            self.code.emit(Insn::Arith {
                op: ArithOp::Rem,
                kind,
            });
        } else if p == Primitive::Boolean {
            return Err(JitError::unsupported("Mod on Boolean"));
        } else {
            self.code.emit(Insn::Invoke(Builtin::FloorMod(kind)));
        }
        self.adjust_after(p, kind)
    }

    pub fn build_primitive_and(&mut self, p: Primitive) -> Result<(), JitError> {
        self.build_primitive_bitwise(ArithOp::And, p)
    }

    pub fn build_primitive_or(&mut self, p: Primitive) -> Result<(), JitError> {
        self.build_primitive_bitwise(ArithOp::Or, p)
    }

    pub fn build_primitive_xor(&mut self, p: Primitive) -> Result<(), JitError> {
        self.build_primitive_bitwise(ArithOp::Xor, p)
    }

    fn build_primitive_bitwise(&mut self, op: ArithOp, p: Primitive) -> Result<(), JitError> {
        if p.is_float() {
            return Err(JitError::unsupported(format!("{op:?} on {p}")));
        }
        let kind = arith_kind(p)?;
        self.code.emit(Insn::Arith { op, kind });
        Ok(())
    }

    pub fn build_primitive_shl(&mut self, p: Primitive, rhs: ArgId) -> Result<(), JitError> {
        let kind = self.shift_kind(p)?;
        self.load_shift_amount(rhs)?;
        self.code.emit(Insn::Arith {
            op: ArithOp::Shl,
            kind,
        });
        self.adjust_after(p, kind)
    }

    pub fn build_primitive_shr(&mut self, p: Primitive, rhs: ArgId) -> Result<(), JitError> {
        let kind = self.shift_kind(p)?;
        self.load_shift_amount(rhs)?;
        let op = if p.is_unsigned() { ArithOp::Ushr } else { ArithOp::Shr };
        self.code.emit(Insn::Arith { op, kind });
        self.adjust_after(p, kind)
    }

    /// Logical shift right. Sub-word values are masked to their width first
    /// so the vacated bits come in as zeros.
    pub fn build_primitive_shr_all(&mut self, p: Primitive, rhs: ArgId) -> Result<(), JitError> {
        let kind = self.shift_kind(p)?;
        match p {
            Primitive::Int8 | Primitive::UInt8 => self.mask_int(0xFF),
            Primitive::Int16 | Primitive::UInt16 => self.mask_int(0xFFFF),
            _ => {}
        }
        self.load_shift_amount(rhs)?;
        self.code.emit(Insn::Arith {
            op: ArithOp::Ushr,
            kind,
        });
        self.adjust_after(p, kind)
    }

    fn shift_kind(&self, p: Primitive) -> Result<NativeKind, JitError> {
        if !p.is_integer() || p == Primitive::Char {
            return Err(JitError::unsupported(format!("shift of {p}")));
        }
        arith_kind(p)
    }

    pub fn build_primitive_neg(&mut self, p: Primitive) -> Result<(), JitError> {
        match p {
            Primitive::UInt8 | Primitive::UInt16 | Primitive::UInt32 | Primitive::Char | Primitive::Boolean => {
                Err(JitError::unsupported(format!("Neg on {p}")))
            }
            _ => {
                let kind = arith_kind(p)?;
                self.code.emit(Insn::Neg(kind));
                self.adjust_after(p, kind)
            }
        }
    }

    pub fn build_primitive_compl(&mut self, p: Primitive) -> Result<(), JitError> {
        if p.is_float() || p == Primitive::Char {
            return Err(JitError::unsupported(format!("Compl on {p}")));
        }
        let kind = arith_kind(p)?;
        let ones = match (p, kind) {
            (Primitive::Boolean, _) => NativeConst::Int(1),
            (_, NativeKind::Long) => NativeConst::Long(-1),
            _ => NativeConst::Int(-1),
        };
        self.code.emit(Insn::Const(ones)).emit(Insn::Arith {
            op: ArithOp::Xor,
            kind,
        });
        self.adjust_after(p, kind)
    }

    // ========================================
    // Char
    // ========================================

    /// `Char + Int`, `Char - Int`, `Char + Char` and `Char + String`.
    pub fn build_char_add(
        &mut self,
        kind: BinaryOp,
        lhs: ArgId,
        rhs: ArgId,
        rhs_ty: &Type,
        ret: RegId,
        result: &Type,
    ) -> Result<(), JitError> {
        self.load_primitive(lhs, Primitive::Char)?;
        if *result == Type::string() {
            self.code.emit(Insn::Invoke(Builtin::CharToString));
            if rhs_ty.as_primitive() == Some(Primitive::Char) {
                self.load_primitive(rhs, Primitive::Char)?;
                self.code.emit(Insn::Invoke(Builtin::CharToString));
            } else {
                self.load_argument(rhs)?;
            }
            self.code.emit(Insn::Invoke(Builtin::Concat));
            return self.assign_result(ret, result, JitFlavor::Specific);
        }

        let p = rhs_ty
            .as_primitive()
            .ok_or_else(|| JitError::unsupported(format!("Char {kind:?} {rhs_ty}")))?;
        self.code.emit(Insn::Convert(Conversion::I2L));
        self.load_primitive(rhs, p)?;
        self.emit_to_long(p);
        let op = if kind == BinaryOp::Add { ArithOp::Add } else { ArithOp::Sub };
        self.code
            .emit(Insn::Arith {
                op,
                kind: NativeKind::Long,
            })
            .emit(Insn::Invoke(Builtin::CodePoint));
        self.assign_result(ret, result, JitFlavor::Primitive)
    }
}
