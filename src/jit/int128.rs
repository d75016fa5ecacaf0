//! 128-bit integers as (low, high) pairs of longs.
//!
//! Every sequence leaves its result on the stack as `[low, high]`. Operands
//! are read from local slots; constants and non-resident values are first
//! spilled into temporaries. Division is delegated to the runtime through
//! [`Builtin::WideDivRem`], which is backed by [`wide_div_rem`].

use super::context::BuildContext;
use super::flavor::JitFlavor;
use super::insn::{ArithOp, Builtin, Cond, Insn, NativeClass, NativeConst, NativeKind, Slot};
use super::register::RegisterInfo;
use crate::error::JitError;
use crate::ir::{ArgId, BinaryOp, RegId, UnaryOp, A_STACK};
use crate::types::{Primitive, Type};

/// A word operand: a long local or an immediate.
#[derive(Debug, Clone, Copy)]
enum Word {
    Slot(Slot),
    Imm(i64),
}

const LONG: NativeKind = NativeKind::Long;

impl BuildContext<'_> {
    pub fn build_wide_binary(
        &mut self,
        kind: BinaryOp,
        p: Primitive,
        lhs: ArgId,
        rhs: ArgId,
        ret: RegId,
    ) -> Result<(), JitError> {
        let (l1, h1) = self.wide_operand(lhs, p)?;
        let signed = !p.is_unsigned();
        match kind {
            BinaryOp::Add | BinaryOp::Sub => match (self.wide_constant(rhs, p), kind) {
                (Some((lo, hi)), BinaryOp::Add) => self.build_long_long_add_const(l1, h1, lo, hi),
                (Some((lo, hi)), _) => self.build_long_long_sub_const(l1, h1, lo, hi),
                (None, _) => {
                    let (l2, h2) = self.wide_operand(rhs, p)?;
                    if kind == BinaryOp::Add {
                        self.build_long_long_add(l1, h1, l2, h2);
                    } else {
                        self.build_long_long_sub(l1, h1, l2, h2);
                    }
                }
            },
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                let (l2, h2) = self.wide_operand(rhs, p)?;
                match kind {
                    BinaryOp::Mul => self.build_long_long_mul(l1, h1, l2, h2),
                    BinaryOp::Div => self.build_long_long_div(l1, h1, l2, h2, signed),
                    BinaryOp::Mod => self.build_long_long_mod(l1, h1, l2, h2, signed),
                    BinaryOp::And => self.build_long_long_and(l1, h1, l2, h2),
                    BinaryOp::Or => self.build_long_long_or(l1, h1, l2, h2),
                    _ => self.build_long_long_xor(l1, h1, l2, h2),
                }
            }
            BinaryOp::Shl => self.build_long_long_shl(l1, h1, rhs)?,
            BinaryOp::Shr => self.build_long_long_shr(l1, h1, rhs, signed)?,
            BinaryOp::ShrAll => self.build_long_long_shr(l1, h1, rhs, false)?,
        }
        self.assign_result(ret, &Type::Primitive(p), JitFlavor::XvmPrimitive)
    }

    pub fn build_wide_unary(&mut self, kind: UnaryOp, p: Primitive, arg: ArgId, ret: RegId) -> Result<(), JitError> {
        let (lo, hi) = self.wide_operand(arg, p)?;
        match kind {
            UnaryOp::Neg => self.build_long_long_neg(lo, hi),
            UnaryOp::Compl => self.build_long_long_compl(lo, hi),
        }
        self.assign_result(ret, &Type::Primitive(p), JitFlavor::XvmPrimitive)
    }

    /// The (low, high) slots of a wide operand.
    fn wide_operand(&mut self, arg: ArgId, p: Primitive) -> Result<(Slot, Slot), JitError> {
        let reg = self.ensure_register(arg)?;
        let slots = reg.slots();
        if reg.flavor() == JitFlavor::XvmPrimitive && slots.len() == 2 {
            return Ok((slots[0], slots[1]));
        }
        let ty = Type::Primitive(p);
        reg.load(&mut self.code, self.ts.pool())?;
        self.convert(reg.flavor(), reg.ty(), JitFlavor::XvmPrimitive, &ty)?;
        let on_stack = RegisterInfo::words_on_stack(A_STACK, ty, NativeClass::boxed(p), NativeClass::words(p));
        let temp = self.store_temp_register(&on_stack)?;
        let slots = temp.slots();
        Ok((slots[0], slots[1]))
    }

    /// Immediate (low, high) words of a constant operand.
    fn wide_constant(&self, arg: ArgId, p: Primitive) -> Option<(i64, i64)> {
        let constant = self.method.constant(arg)?;
        match NativeConst::words_of(constant, p).ok()?.as_slice() {
            [NativeConst::Long(lo), NativeConst::Long(hi)] => Some((*lo, *hi)),
            _ => None,
        }
    }

    fn wide_temps(&mut self) -> (Slot, Slot) {
        let lo = self.scopes.allocate_synthetic(&mut self.code, "$lo", NativeClass::Long);
        let hi = self.scopes.allocate_synthetic(&mut self.code, "$hi", NativeClass::Long);
        (lo, hi)
    }

    fn load_long(&mut self, slot: Slot) {
        self.code.emit(Insn::Load { kind: LONG, slot });
    }

    fn store_long(&mut self, slot: Slot) {
        self.code.emit(Insn::Store { kind: LONG, slot });
    }

    fn load_word(&mut self, word: Word) {
        match word {
            Word::Slot(slot) => self.load_long(slot),
            Word::Imm(v) => {
                self.code.emit(Insn::Const(NativeConst::Long(v)));
            }
        }
    }

    fn arith_long(&mut self, op: ArithOp) {
        self.code.emit(Insn::Arith { op, kind: LONG });
    }

    fn const_long(&mut self, v: i64) {
        self.code.emit(Insn::Const(NativeConst::Long(v)));
    }

    fn const_int(&mut self, v: i32) {
        self.code.emit(Insn::Const(NativeConst::Int(v)));
    }

    pub fn build_long_long_add(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.add_words(l1, h1, Word::Slot(l2), Word::Slot(h2));
    }

    pub fn build_long_long_add_const(&mut self, l1: Slot, h1: Slot, lo: i64, hi: i64) {
        self.add_words(l1, h1, Word::Imm(lo), Word::Imm(hi));
    }

    /// Low words add; the carry out is the top bit of
    /// `(l1 & l2) | ((l1 | l2) & !low)`.
    fn add_words(&mut self, l1: Slot, h1: Slot, l2: Word, h2: Word) {
        let (lo, hi) = self.wide_temps();
        let done = self.code.new_label();

        self.load_long(l1);
        self.load_word(l2);
        self.arith_long(ArithOp::Add);
        self.store_long(lo);
        self.load_long(h1);
        self.load_word(h2);
        self.arith_long(ArithOp::Add);
        self.store_long(hi);

        self.load_long(l1);
        self.load_word(l2);
        self.arith_long(ArithOp::And);
        self.load_long(l1);
        self.load_word(l2);
        self.arith_long(ArithOp::Or);
        self.load_long(lo);
        self.const_long(-1);
        self.arith_long(ArithOp::Xor);
        self.arith_long(ArithOp::And);
        self.arith_long(ArithOp::Or);
        self.const_long(0);
        self.code.emit(Insn::LCmp).emit(Insn::If {
            cond: Cond::Ge,
            target: done,
        });
        self.load_long(hi);
        self.const_long(1);
        self.arith_long(ArithOp::Add);
        self.store_long(hi);
        self.code.bind(done);

        self.load_long(lo);
        self.load_long(hi);
    }

    pub fn build_long_long_sub(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.sub_words(l1, h1, Word::Slot(l2), Word::Slot(h2));
    }

    pub fn build_long_long_sub_const(&mut self, l1: Slot, h1: Slot, lo: i64, hi: i64) {
        self.sub_words(l1, h1, Word::Imm(lo), Word::Imm(hi));
    }

    /// Borrow when `l1 < l2` unsigned, compared by flipping the sign bits.
    fn sub_words(&mut self, l1: Slot, h1: Slot, l2: Word, h2: Word) {
        let (lo, hi) = self.wide_temps();
        let done = self.code.new_label();

        self.load_long(l1);
        self.load_word(l2);
        self.arith_long(ArithOp::Sub);
        self.store_long(lo);
        self.load_long(h1);
        self.load_word(h2);
        self.arith_long(ArithOp::Sub);
        self.store_long(hi);

        self.load_long(l1);
        self.const_long(i64::MIN);
        self.arith_long(ArithOp::Add);
        self.load_word(l2);
        self.const_long(i64::MIN);
        self.arith_long(ArithOp::Add);
        self.code.emit(Insn::LCmp).emit(Insn::If {
            cond: Cond::Ge,
            target: done,
        });
        self.load_long(hi);
        self.const_long(1);
        self.arith_long(ArithOp::Sub);
        self.store_long(hi);
        self.code.bind(done);

        self.load_long(lo);
        self.load_long(hi);
    }

    /// `low = l1*l2`, `high = umulhi(l1, l2) + l1*h2 + h1*l2`.
    pub fn build_long_long_mul(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.load_long(l1);
        self.load_long(l2);
        self.arith_long(ArithOp::Mul);

        self.load_long(l1);
        self.load_long(l2);
        self.code.emit(Insn::Invoke(Builtin::UnsignedMultiplyHigh));
        self.load_long(l1);
        self.load_long(h2);
        self.arith_long(ArithOp::Mul);
        self.arith_long(ArithOp::Add);
        self.load_long(h1);
        self.load_long(l2);
        self.arith_long(ArithOp::Mul);
        self.arith_long(ArithOp::Add);
    }

    pub fn build_long_long_div(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot, signed: bool) {
        self.build_long_long_div_rem(l1, h1, l2, h2, signed, false);
    }

    pub fn build_long_long_mod(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot, signed: bool) {
        self.build_long_long_div_rem(l1, h1, l2, h2, signed, true);
    }

    fn build_long_long_div_rem(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot, signed: bool, remainder: bool) {
        for slot in [l1, h1, l2, h2] {
            self.load_long(slot);
        }
        self.code
            .emit(Insn::Invoke(Builtin::WideDivRem { signed, remainder }));
    }

    pub fn build_long_long_and(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.build_long_long_bitwise(ArithOp::And, l1, h1, l2, h2);
    }

    pub fn build_long_long_or(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.build_long_long_bitwise(ArithOp::Or, l1, h1, l2, h2);
    }

    pub fn build_long_long_xor(&mut self, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.build_long_long_bitwise(ArithOp::Xor, l1, h1, l2, h2);
    }

    fn build_long_long_bitwise(&mut self, op: ArithOp, l1: Slot, h1: Slot, l2: Slot, h2: Slot) {
        self.load_long(l1);
        self.load_long(l2);
        self.arith_long(op);
        self.load_long(h1);
        self.load_long(h2);
        self.arith_long(op);
    }

    /// `-x`: the low word negates; the high word negates when the low word
    /// is zero and is complemented otherwise.
    pub fn build_long_long_neg(&mut self, lo: Slot, hi: Slot) {
        let not_zero = self.code.new_label();
        let done = self.code.new_label();

        self.load_long(lo);
        self.code.emit(Insn::Neg(LONG));
        self.load_long(lo);
        self.const_long(0);
        self.code.emit(Insn::LCmp).emit(Insn::If {
            cond: Cond::Ne,
            target: not_zero,
        });
        self.load_long(hi);
        self.code.emit(Insn::Neg(LONG)).emit(Insn::Goto(done));
        self.code.bind(not_zero);
        self.load_long(hi);
        self.const_long(-1);
        self.arith_long(ArithOp::Xor);
        self.code.bind(done);
    }

    pub fn build_long_long_compl(&mut self, lo: Slot, hi: Slot) {
        for slot in [lo, hi] {
            self.load_long(slot);
            self.const_long(-1);
            self.arith_long(ArithOp::Xor);
        }
    }

    /// Load the shift amount masked to `0..128` into the `$shift` temp.
    fn wide_shift_amount(&mut self, rhs: ArgId) -> Result<Slot, JitError> {
        self.load_shift_amount(rhs)?;
        self.const_int(0x7F);
        self.code.emit(Insn::Arith {
            op: ArithOp::And,
            kind: NativeKind::Int,
        });
        let slot = self
            .scopes
            .allocate_synthetic(&mut self.code, "$shift128", NativeClass::Int);
        self.code.emit(Insn::Store {
            kind: NativeKind::Int,
            slot,
        });
        Ok(slot)
    }

    fn load_int(&mut self, slot: Slot) {
        self.code.emit(Insn::Load {
            kind: NativeKind::Int,
            slot,
        });
    }

    /// Push `s - 64` or `64 - s`.
    fn push_shift_distance(&mut self, s: Slot, from_64: bool) {
        if from_64 {
            self.const_int(64);
            self.load_int(s);
        } else {
            self.load_int(s);
            self.const_int(64);
        }
        self.code.emit(Insn::Arith {
            op: ArithOp::Sub,
            kind: NativeKind::Int,
        });
    }

    pub fn build_long_long_shl(&mut self, lo: Slot, hi: Slot, rhs: ArgId) -> Result<(), JitError> {
        let s = self.wide_shift_amount(rhs)?;
        let zero = self.code.new_label();
        let below_64 = self.code.new_label();
        let done = self.code.new_label();

        self.load_int(s);
        self.code.emit(Insn::If {
            cond: Cond::Eq,
            target: zero,
        });
        self.load_int(s);
        self.const_int(64);
        self.code.emit(Insn::IfICmp {
            cond: Cond::Lt,
            target: below_64,
        });

        // s >= 64: the low word moves into the high word
        self.const_long(0);
        self.load_long(lo);
        self.push_shift_distance(s, false);
        self.arith_long(ArithOp::Shl);
        self.code.emit(Insn::Goto(done));

        self.code.bind(below_64);
        self.load_long(lo);
        self.load_int(s);
        self.arith_long(ArithOp::Shl);
        self.load_long(hi);
        self.load_int(s);
        self.arith_long(ArithOp::Shl);
        self.load_long(lo);
        self.push_shift_distance(s, true);
        self.arith_long(ArithOp::Ushr);
        self.arith_long(ArithOp::Or);
        self.code.emit(Insn::Goto(done));

        self.code.bind(zero);
        self.load_long(lo);
        self.load_long(hi);
        self.code.bind(done);
        Ok(())
    }

    pub fn build_long_long_shr(&mut self, lo: Slot, hi: Slot, rhs: ArgId, signed: bool) -> Result<(), JitError> {
        let s = self.wide_shift_amount(rhs)?;
        let zero = self.code.new_label();
        let below_64 = self.code.new_label();
        let done = self.code.new_label();
        let high_op = if signed { ArithOp::Shr } else { ArithOp::Ushr };

        self.load_int(s);
        self.code.emit(Insn::If {
            cond: Cond::Eq,
            target: zero,
        });
        self.load_int(s);
        self.const_int(64);
        self.code.emit(Insn::IfICmp {
            cond: Cond::Lt,
            target: below_64,
        });

        // s >= 64: the high word moves into the low word
        self.load_long(hi);
        self.push_shift_distance(s, false);
        self.arith_long(high_op);
        if signed {
            self.load_long(hi);
            self.const_int(63);
            self.arith_long(ArithOp::Shr);
        } else {
            self.const_long(0);
        }
        self.code.emit(Insn::Goto(done));

        self.code.bind(below_64);
        self.load_long(lo);
        self.load_int(s);
        self.arith_long(ArithOp::Ushr);
        self.load_long(hi);
        self.push_shift_distance(s, true);
        self.arith_long(ArithOp::Shl);
        self.arith_long(ArithOp::Or);
        self.load_long(hi);
        self.load_int(s);
        self.arith_long(high_op);
        self.code.emit(Insn::Goto(done));

        self.code.bind(zero);
        self.load_long(lo);
        self.load_long(hi);
        self.code.bind(done);
        Ok(())
    }
}

// ========================================
// Runtime division
// ========================================

/// Divide or take the remainder of two paired-word values.
///
/// Signed division truncates; signed remainder is floored, taking the sign
/// of the divisor. Returns `None` for a zero divisor.
pub fn wide_div_rem(dividend: (i64, i64), divisor: (i64, i64), signed: bool, remainder: bool) -> Option<(i64, i64)> {
    let join = |(lo, hi): (i64, i64)| ((hi as u64 as u128) << 64) | lo as u64 as u128;
    let split = |v: u128| (v as u64 as i64, (v >> 64) as u64 as i64);
    let (a, b) = (join(dividend), join(divisor));
    if b == 0 {
        return None;
    }
    if !signed {
        let (q, r) = divide_words(a, b)?;
        return Some(split(if remainder { r } else { q }));
    }

    let (a, b) = (a as i128, b as i128);
    let (q, r) = divide_words(a.unsigned_abs(), b.unsigned_abs())?;
    let negative = (a < 0) != (b < 0);
    if !remainder {
        let q = if negative { (q as i128).wrapping_neg() } else { q as i128 };
        return Some(split(q as u128));
    }
    let mut r = if a < 0 { (r as i128).wrapping_neg() } else { r as i128 };
    if r != 0 && negative {
        r = r.wrapping_add(b);
    }
    Some(split(r as u128))
}

/// Unsigned 128-bit division over 32-bit digits (Knuth algorithm D).
/// Returns `(quotient, remainder)`, or `None` for a zero divisor.
pub fn divide_words(dividend: u128, divisor: u128) -> Option<(u128, u128)> {
    if divisor == 0 {
        return None;
    }
    let u = digits(dividend);
    let v = digits(divisor);
    let m = significant(&u);
    let n = significant(&v);
    if m < n {
        return Some((0, dividend));
    }

    if n == 1 {
        let d = v[0] as u64;
        let mut q = [0u32; 4];
        let mut rem = 0u64;
        for j in (0..m).rev() {
            let cur = (rem << 32) | u[j] as u64;
            q[j] = (cur / d) as u32;
            rem = cur % d;
        }
        return Some((from_digits(&q), rem as u128));
    }

    // normalize so the divisor's top digit has its high bit set
    let shift = v[n - 1].leading_zeros();
    let mut vn = [0u32; 4];
    for i in (1..n).rev() {
        vn[i] = (v[i] << shift) | shr_or_zero(v[i - 1], 32 - shift);
    }
    vn[0] = v[0] << shift;
    let mut un = [0u32; 5];
    un[m] = shr_or_zero(u[m - 1], 32 - shift);
    for i in (1..m).rev() {
        un[i] = (u[i] << shift) | shr_or_zero(u[i - 1], 32 - shift);
    }
    un[0] = u[0] << shift;

    let base = 1u64 << 32;
    let mut q = [0u32; 4];
    for j in (0..=m - n).rev() {
        let num = ((un[j + n] as u64) << 32) | un[j + n - 1] as u64;
        let mut qhat = num / vn[n - 1] as u64;
        let mut rhat = num % vn[n - 1] as u64;
        while qhat >= base || qhat * vn[n - 2] as u64 > ((rhat << 32) | un[j + n - 2] as u64) {
            qhat -= 1;
            rhat += vn[n - 1] as u64;
            if rhat >= base {
                break;
            }
        }

        // multiply and subtract
        let mut borrow: i64 = 0;
        for i in 0..n {
            let p = qhat * vn[i] as u64;
            let t = un[i + j] as i64 - borrow - (p & 0xFFFF_FFFF) as i64;
            un[i + j] = t as u32;
            borrow = (p >> 32) as i64 - (t >> 32);
        }
        let t = un[j + n] as i64 - borrow;
        un[j + n] = t as u32;

        if t < 0 {
            // added back at most once
            qhat -= 1;
            let mut carry = 0u64;
            for i in 0..n {
                let s = un[i + j] as u64 + vn[i] as u64 + carry;
                un[i + j] = s as u32;
                carry = s >> 32;
            }
            un[j + n] = un[j + n].wrapping_add(carry as u32);
        }
        q[j] = qhat as u32;
    }

    let mut r = [0u32; 4];
    for i in 0..n - 1 {
        r[i] = (un[i] >> shift) | shl_or_zero(un[i + 1], 32 - shift);
    }
    r[n - 1] = un[n - 1] >> shift;
    Some((from_digits(&q), from_digits(&r)))
}

fn digits(v: u128) -> [u32; 4] {
    [v as u32, (v >> 32) as u32, (v >> 64) as u32, (v >> 96) as u32]
}

fn from_digits(d: &[u32; 4]) -> u128 {
    d.iter().rev().fold(0u128, |acc, &x| (acc << 32) | x as u128)
}

fn significant(d: &[u32; 4]) -> usize {
    d.iter().rposition(|&x| x != 0).map_or(0, |i| i + 1)
}

fn shr_or_zero(x: u32, by: u32) -> u32 {
    x.checked_shr(by).unwrap_or(0)
}

fn shl_or_zero(x: u32, by: u32) -> u32 {
    x.checked_shl(by).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(v: i128) -> (i64, i64) {
        (v as u64 as i64, (v as u128 >> 64) as u64 as i64)
    }

    fn join((lo, hi): (i64, i64)) -> i128 {
        (((hi as u64 as u128) << 64) | lo as u64 as u128) as i128
    }

    #[test]
    fn test_divide_words_small() {
        assert_eq!(divide_words(100, 7), Some((14, 2)));
        assert_eq!(divide_words(7, 100), Some((0, 7)));
        assert_eq!(divide_words(1, 0), None);
    }

    #[test]
    fn test_divide_words_matches_native() {
        let samples: [u128; 10] = [
            0,
            1,
            u64::MAX as u128,
            (u64::MAX as u128) + 1,
            u128::MAX,
            u128::MAX / 3,
            0x8000_0000_0000_0000_0000_0000_0000_0000,
            0x0000_0001_0000_0000_ffff_ffff_0000_0001,
            0x1234_5678_9abc_def0_0fed_cba9_8765_4321,
            0xffff_ffff_0000_0000_0000_0000_ffff_ffff,
        ];
        for &a in &samples {
            for &b in &samples {
                if b == 0 {
                    continue;
                }
                assert_eq!(divide_words(a, b), Some((a / b, a % b)), "{a:#x} / {b:#x}");
            }
        }
    }

    #[test]
    fn test_signed_division_truncates() {
        let cases = [(-7i128, 2i128), (7, -2), (-7, -2), (i128::MIN, 3), (i128::MAX, -1)];
        for (a, b) in cases {
            let q = wide_div_rem(split(a), split(b), true, false).unwrap();
            assert_eq!(join(q), a / b, "{a} / {b}");
        }
    }

    #[test]
    fn test_signed_remainder_is_floored() {
        let r = |a: i128, b: i128| join(wide_div_rem(split(a), split(b), true, true).unwrap());
        assert_eq!(r(-7, 2), 1);
        assert_eq!(r(7, -2), -1);
        assert_eq!(r(-7, -2), -1);
        assert_eq!(r(6, -3), 0);
        assert_eq!(r(i128::MIN, 7), i128::MIN.rem_euclid(7));
    }

    #[test]
    fn test_unsigned_division() {
        let a = u128::MAX - 5;
        let q = wide_div_rem(split(a as i128), split(10), false, false).unwrap();
        assert_eq!(join(q) as u128, a / 10);
        assert!(wide_div_rem(split(1), (0, 0), false, true).is_none());
    }
}
