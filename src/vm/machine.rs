//! Reference executor for generated routines.
//!
//! The machine runs `Routine`s the way a native emitter would lay them
//! out: one operand stack and one set of numbered locals per frame, the
//! context in local 0, and return carriers for every value past the first.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::container::Container;
use super::value::{Object, Value};
use crate::error::MachineError;
use crate::jit::codebuf::Routine;
use crate::jit::compiler::CompiledMethod;
use crate::jit::insn::{ArithOp, Builtin, Conversion, Insn, Label, NativeConst, NativeKind};
use crate::jit::int128::wide_div_rem;
use crate::types::{Primitive, Type};

/// Highest valid code point.
const MAX_CODE_POINT: i64 = 0x10_FFFF;

/// Compiled routines by name and entry.
#[derive(Debug, Default, Clone)]
pub struct RoutineTable {
    routines: HashMap<(String, bool), Arc<Routine>>,
}

impl RoutineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, routine: Routine, optimized: bool) {
        self.routines
            .insert((routine.name.clone(), optimized), Arc::new(routine));
    }

    /// Register both entries of a compiled method.
    pub fn add(&mut self, method: &CompiledMethod) {
        self.insert(method.standard.clone(), false);
        if let Some(optimized) = &method.optimized {
            self.insert(optimized.clone(), true);
        }
    }

    pub fn get(&self, name: &str, optimized: bool) -> Option<&Arc<Routine>> {
        self.routines.get(&(name.to_string(), optimized))
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}

impl FromIterator<CompiledMethod> for RoutineTable {
    fn from_iter<I: IntoIterator<Item = CompiledMethod>>(iter: I) -> Self {
        let mut table = RoutineTable::new();
        for method in iter {
            table.add(&method);
        }
        table
    }
}

/// A call frame.
#[derive(Debug)]
struct Frame {
    routine: Arc<Routine>,
    /// Program counter
    pc: usize,
    /// Unset locals read as the zero of their kind
    locals: Vec<Option<Value>>,
    stack: Vec<Value>,
}

impl Frame {
    fn new(routine: Arc<Routine>, args: Vec<Value>) -> Self {
        let mut locals = vec![None; routine.max_locals.max(args.len())];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = Some(arg);
        }
        Self {
            routine,
            pc: 0,
            locals,
            stack: Vec::new(),
        }
    }

    fn pop(&mut self) -> Result<Value, MachineError> {
        self.stack.pop().ok_or(MachineError::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i32, MachineError> {
        match self.pop()? {
            Value::Int(n) => Ok(n),
            other => Err(mismatch("int", &other)),
        }
    }

    fn pop_long(&mut self) -> Result<i64, MachineError> {
        match self.pop()? {
            Value::Long(n) => Ok(n),
            other => Err(mismatch("long", &other)),
        }
    }

    fn pop_ref(&mut self) -> Result<Option<Arc<Object>>, MachineError> {
        match self.pop()? {
            Value::Ref(r) => Ok(r),
            other => Err(mismatch("reference", &other)),
        }
    }

    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, MachineError> {
        if self.stack.len() < count {
            return Err(MachineError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn load(&self, kind: NativeKind, slot: usize) -> Result<Value, MachineError> {
        match self.locals.get(slot) {
            Some(Some(value)) if value.fits(kind) => Ok(value.clone()),
            Some(Some(value)) => Err(mismatch(kind_name(kind), value)),
            _ => Ok(Value::zero(kind)),
        }
    }

    fn store(&mut self, kind: NativeKind, slot: usize, value: Value) -> Result<(), MachineError> {
        if !value.fits(kind) {
            return Err(mismatch(kind_name(kind), &value));
        }
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, None);
        }
        self.locals[slot] = Some(value);
        Ok(())
    }
}

/// What a step asks the run loop to do next.
enum Flow {
    Next,
    Jump(Label),
    Call(Arc<Routine>, Vec<Value>),
    Return(Option<Value>),
}

/// Executes routines inside one container.
#[derive(Debug)]
pub struct Machine {
    routines: RoutineTable,
    container: Arc<Container>,
    ctx: Arc<Object>,
    long_carrier: Vec<Option<i64>>,
    object_carrier: Vec<Option<Option<Arc<Object>>>>,
    /// Instructions executed so far
    executed: u64,
}

impl Machine {
    pub fn new(routines: RoutineTable, container: Arc<Container>) -> Self {
        Self {
            routines,
            container,
            ctx: Arc::new(Object::Context),
            long_carrier: Vec::new(),
            object_carrier: Vec::new(),
            executed: 0,
        }
    }

    pub fn routines(&self) -> &RoutineTable {
        &self.routines
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// The context reference passed as every routine's first argument.
    pub fn context(&self) -> Value {
        Value::Ref(Some(Arc::clone(&self.ctx)))
    }

    /// A return-carrier slot left by the last call, as a value of `kind`.
    pub fn carrier(&self, kind: NativeKind, index: usize) -> Result<Value, MachineError> {
        if kind == NativeKind::Ref {
            return match self.object_carrier.get(index) {
                Some(Some(r)) => Ok(Value::Ref(r.clone())),
                _ => Err(MachineError::EmptyCarrier(index)),
            };
        }
        match self.long_carrier.get(index) {
            Some(Some(bits)) => Ok(from_bits(kind, *bits)),
            _ => Err(MachineError::EmptyCarrier(index)),
        }
    }

    /// Run a routine. The context is supplied as the first argument; `args`
    /// are the remaining native parameters in order.
    pub fn invoke(
        &mut self,
        name: &str,
        optimized: bool,
        args: Vec<Value>,
    ) -> Result<Option<Value>, MachineError> {
        let routine = self
            .routines
            .get(name, optimized)
            .cloned()
            .ok_or_else(|| MachineError::UnknownRoutine(name.to_string()))?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.context());
        full.extend(args);
        tracing::debug!(routine = name, optimized, "invoke");
        self.run(Frame::new(routine, full))
    }

    fn run(&mut self, entry: Frame) -> Result<Option<Value>, MachineError> {
        let mut frames = vec![entry];
        loop {
            let Some(frame) = frames.last_mut() else {
                return Ok(None);
            };
            let routine = Arc::clone(&frame.routine);
            let flow = match routine.insns.get(frame.pc) {
                Some(insn) => {
                    frame.pc += 1;
                    self.executed += 1;
                    self.step(frame, insn)?
                }
                // Falling off the end returns nothing.
                None => Flow::Return(None),
            };
            match flow {
                Flow::Next => {}
                Flow::Jump(label) => {
                    frame.pc = routine
                        .target(label)
                        .ok_or(MachineError::UnboundLabel(label.0))?;
                }
                Flow::Call(callee, args) => {
                    tracing::trace!(routine = %callee.name, "call");
                    frames.push(Frame::new(callee, args));
                }
                Flow::Return(value) => {
                    frames.pop();
                    match frames.last_mut() {
                        Some(caller) => {
                            if let Some(value) = value {
                                caller.stack.push(value);
                            }
                        }
                        None => return Ok(value),
                    }
                }
            }
        }
    }

    fn step(&mut self, frame: &mut Frame, insn: &Insn) -> Result<Flow, MachineError> {
        match insn {
            Insn::Const(c) => frame.stack.push(match c {
                NativeConst::Int(n) => Value::Int(*n),
                NativeConst::Long(n) => Value::Long(*n),
                NativeConst::Float(n) => Value::Float(*n),
                NativeConst::Double(n) => Value::Double(*n),
                NativeConst::Null => Value::null(),
            }),
            Insn::Ldc(id) => {
                let constant = self
                    .container
                    .type_system()
                    .pool()
                    .get(*id)
                    .ok_or(MachineError::UnknownConstant(*id))?;
                frame
                    .stack
                    .push(Value::Ref(Object::from_constant(&constant).map(Arc::new)));
            }
            Insn::Load { kind, slot } => {
                let value = frame.load(*kind, *slot)?;
                frame.stack.push(value);
            }
            Insn::Store { kind, slot } => {
                let value = frame.pop()?;
                frame.store(*kind, *slot, value)?;
            }
            Insn::Pop => {
                frame.pop()?;
            }
            Insn::Dup => {
                let top = frame.stack.last().cloned().ok_or(MachineError::StackUnderflow)?;
                frame.stack.push(top);
            }
            Insn::Arith { op, kind } => {
                let result = arith(frame, *op, *kind)?;
                frame.stack.push(result);
            }
            Insn::Neg(kind) => {
                let value = match (kind, frame.pop()?) {
                    (NativeKind::Int | NativeKind::Boolean, Value::Int(n)) => Value::Int(n.wrapping_neg()),
                    (NativeKind::Long, Value::Long(n)) => Value::Long(n.wrapping_neg()),
                    (NativeKind::Float, Value::Float(n)) => Value::Float(-n),
                    (NativeKind::Double, Value::Double(n)) => Value::Double(-n),
                    (kind, other) => return Err(mismatch(kind_name(*kind), &other)),
                };
                frame.stack.push(value);
            }
            Insn::Convert(conversion) => {
                let value = match conversion {
                    Conversion::I2L => Value::Long(frame.pop_int()? as i64),
                    Conversion::L2I => Value::Int(frame.pop_long()? as i32),
                    Conversion::I2B => Value::Int(frame.pop_int()? as i8 as i32),
                    Conversion::I2S => Value::Int(frame.pop_int()? as i16 as i32),
                };
                frame.stack.push(value);
            }
            Insn::LCmp => {
                let b = frame.pop_long()?;
                let a = frame.pop_long()?;
                let result = match a.cmp(&b) {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                };
                frame.stack.push(Value::Int(result));
            }
            Insn::If { cond, target } => {
                if cond.test(frame.pop_int()?, 0) {
                    return Ok(Flow::Jump(*target));
                }
            }
            Insn::IfICmp { cond, target } => {
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                if cond.test(a, b) {
                    return Ok(Flow::Jump(*target));
                }
            }
            Insn::IfNull { target } => {
                if frame.pop_ref()?.is_none() {
                    return Ok(Flow::Jump(*target));
                }
            }
            Insn::IfNonNull { target } => {
                if frame.pop_ref()?.is_some() {
                    return Ok(Flow::Jump(*target));
                }
            }
            Insn::Goto(target) => return Ok(Flow::Jump(*target)),
            Insn::Box(p) => {
                let object = box_words(frame, *p)?;
                frame.stack.push(Value::object(object));
            }
            Insn::Unbox(p) => {
                let object = frame.pop_ref()?.ok_or_else(|| MachineError::TypeMismatch {
                    expected: p.name().to_string(),
                    found: "Null".to_string(),
                })?;
                frame.stack.extend(unbox_words(&object, *p)?);
            }
            Insn::CheckCast(ty) => {
                if let Some(Some(object)) = frame.stack.last().map(Value::as_object) {
                    let found = object.ty();
                    if !found.is_a(ty) {
                        return Err(MachineError::TypeMismatch {
                            expected: ty.to_string(),
                            found: found.to_string(),
                        });
                    }
                }
            }
            Insn::Invoke(builtin) => self.invoke_builtin(frame, *builtin)?,
            Insn::Call { method, optimized } => {
                let callee = self
                    .routines
                    .get(method, *optimized)
                    .cloned()
                    .ok_or_else(|| MachineError::UnknownRoutine(method.clone()))?;
                let args = frame.pop_args(callee.signature.params.len())?;
                return Ok(Flow::Call(callee, args));
            }
            Insn::LoadReturn { kind, index } => {
                let value = self.carrier(*kind, *index)?;
                frame.stack.push(value);
            }
            Insn::StoreReturn { kind, index } => {
                let value = frame.pop()?;
                if *kind == NativeKind::Ref {
                    let r = match value {
                        Value::Ref(r) => r,
                        other => return Err(mismatch("reference", &other)),
                    };
                    put(&mut self.object_carrier, *index, r);
                } else {
                    if !value.fits(*kind) {
                        return Err(mismatch(kind_name(*kind), &value));
                    }
                    put(&mut self.long_carrier, *index, to_bits(&value));
                }
            }
            Insn::Return(kind) => {
                let value = match kind {
                    Some(_) => Some(frame.pop()?),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            Insn::ScopeEnd { .. } => {}
        }
        Ok(Flow::Next)
    }

    fn invoke_builtin(&mut self, frame: &mut Frame, builtin: Builtin) -> Result<(), MachineError> {
        let value = match builtin {
            Builtin::DivideUnsigned(kind) | Builtin::RemainderUnsigned(kind) | Builtin::FloorMod(kind) => {
                if kind == NativeKind::Long {
                    let b = frame.pop_long()?;
                    let a = frame.pop_long()?;
                    if b == 0 {
                        return Err(MachineError::DivisionByZero);
                    }
                    Value::Long(match builtin {
                        Builtin::DivideUnsigned(_) => ((a as u64) / (b as u64)) as i64,
                        Builtin::RemainderUnsigned(_) => ((a as u64) % (b as u64)) as i64,
                        _ => floor_mod_long(a, b),
                    })
                } else {
                    let b = frame.pop_int()?;
                    let a = frame.pop_int()?;
                    if b == 0 {
                        return Err(MachineError::DivisionByZero);
                    }
                    Value::Int(match builtin {
                        Builtin::DivideUnsigned(_) => ((a as u32) / (b as u32)) as i32,
                        Builtin::RemainderUnsigned(_) => ((a as u32) % (b as u32)) as i32,
                        _ => floor_mod_int(a, b),
                    })
                }
            }
            Builtin::UnsignedMultiplyHigh => {
                let b = frame.pop_long()? as u64 as u128;
                let a = frame.pop_long()? as u64 as u128;
                Value::Long(((a * b) >> 64) as u64 as i64)
            }
            Builtin::WideDivRem { signed, remainder } => {
                let h2 = frame.pop_long()?;
                let l2 = frame.pop_long()?;
                let h1 = frame.pop_long()?;
                let l1 = frame.pop_long()?;
                let (lo, hi) = wide_div_rem((l1, h1), (l2, h2), signed, remainder)
                    .ok_or(MachineError::DivisionByZero)?;
                frame.stack.push(Value::Long(lo));
                Value::Long(hi)
            }
            Builtin::CodePoint => {
                let n = frame.pop_long()?;
                if !(0..=MAX_CODE_POINT).contains(&n) {
                    return Err(MachineError::CodePointOutOfRange(n));
                }
                Value::Int(n as i32)
            }
            Builtin::CharToString => {
                let n = frame.pop_int()?;
                let c = char::from_u32(n as u32).ok_or(MachineError::CodePointOutOfRange(n as i64))?;
                Value::string(c.to_string())
            }
            Builtin::Concat => {
                let b = frame.pop_ref()?;
                let a = frame.pop_ref()?;
                let text = |r: Option<Arc<Object>>| r.map_or_else(|| "Null".to_string(), |o| o.to_string());
                Value::string(text(a) + &text(b))
            }
            Builtin::Inject => {
                let _opts = frame.pop_ref()?;
                let name = frame.pop_ref()?;
                let ty = frame.pop_ref()?;
                let _ctx = frame.pop_ref()?;
                let (Some(Object::Type(ty)), Some(Object::Str(name))) =
                    (ty.as_deref(), name.as_deref())
                else {
                    return Err(MachineError::TypeMismatch {
                        expected: "resource type and name".to_string(),
                        found: "other".to_string(),
                    });
                };
                Value::Ref(Some(self.container.inject(ty, name)?))
            }
        };
        frame.stack.push(value);
        Ok(())
    }
}

fn arith(frame: &mut Frame, op: ArithOp, kind: NativeKind) -> Result<Value, MachineError> {
    let shift = matches!(op, ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr);
    match kind {
        NativeKind::Int | NativeKind::Boolean => {
            let b = frame.pop_int()?;
            let a = frame.pop_int()?;
            let s = (b & 31) as u32;
            let n = match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div | ArithOp::Rem if b == 0 => return Err(MachineError::DivisionByZero),
                ArithOp::Div => a.wrapping_div(b),
                ArithOp::Rem => a.wrapping_rem(b),
                ArithOp::And => a & b,
                ArithOp::Or => a | b,
                ArithOp::Xor => a ^ b,
                ArithOp::Shl => a.wrapping_shl(s),
                ArithOp::Shr => a >> s,
                ArithOp::Ushr => ((a as u32) >> s) as i32,
            };
            Ok(Value::Int(n))
        }
        NativeKind::Long => {
            let (a, b) = if shift {
                let s = frame.pop_int()? as i64;
                (frame.pop_long()?, s)
            } else {
                let b = frame.pop_long()?;
                (frame.pop_long()?, b)
            };
            let s = (b & 63) as u32;
            let n = match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div | ArithOp::Rem if b == 0 => return Err(MachineError::DivisionByZero),
                ArithOp::Div => a.wrapping_div(b),
                ArithOp::Rem => a.wrapping_rem(b),
                ArithOp::And => a & b,
                ArithOp::Or => a | b,
                ArithOp::Xor => a ^ b,
                ArithOp::Shl => a.wrapping_shl(s),
                ArithOp::Shr => a >> s,
                ArithOp::Ushr => ((a as u64) >> s) as i64,
            };
            Ok(Value::Long(n))
        }
        NativeKind::Float => {
            let (b, a) = (frame.pop()?, frame.pop()?);
            match (a, b) {
                (Value::Float(a), Value::Float(b)) => float_arith(op, a as f64, b as f64).map(|n| Value::Float(n as f32)),
                (a, _) => Err(mismatch("float", &a)),
            }
        }
        NativeKind::Double => {
            let (b, a) = (frame.pop()?, frame.pop()?);
            match (a, b) {
                (Value::Double(a), Value::Double(b)) => float_arith(op, a, b).map(Value::Double),
                (a, _) => Err(mismatch("double", &a)),
            }
        }
        NativeKind::Ref => Err(MachineError::TypeMismatch {
            expected: "number".to_string(),
            found: "reference".to_string(),
        }),
    }
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> Result<f64, MachineError> {
    Ok(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
        _ => {
            return Err(MachineError::TypeMismatch {
                expected: "integer".to_string(),
                found: "floating point".to_string(),
            });
        }
    })
}

/// Modulo with the sign of the divisor.
fn floor_mod_int(a: i32, b: i32) -> i32 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 { r + b } else { r }
}

fn floor_mod_long(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 { r + b } else { r }
}

/// Pop the native words of `p` and box them.
fn box_words(frame: &mut Frame, p: Primitive) -> Result<Object, MachineError> {
    let object = match p {
        Primitive::Boolean => Object::Bool(frame.pop_int()? != 0),
        Primitive::Char => {
            let n = frame.pop_int()?;
            Object::Char(char::from_u32(n as u32).ok_or(MachineError::CodePointOutOfRange(n as i64))?)
        }
        Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::UInt8 | Primitive::UInt16 => {
            Object::Num {
                ty: p,
                value: frame.pop_int()? as i128,
            }
        }
        Primitive::UInt32 => Object::Num {
            ty: p,
            value: frame.pop_int()? as u32 as i128,
        },
        Primitive::Int64 => Object::Num {
            ty: p,
            value: frame.pop_long()? as i128,
        },
        Primitive::UInt64 => Object::Num {
            ty: p,
            value: frame.pop_long()? as u64 as i128,
        },
        Primitive::Int128 | Primitive::UInt128 => {
            let hi = frame.pop_long()?;
            let lo = frame.pop_long()?;
            Object::Num {
                ty: p,
                value: (((hi as u64 as u128) << 64) | lo as u64 as u128) as i128,
            }
        }
        Primitive::Float32 => match frame.pop()? {
            Value::Float(n) => Object::Float {
                ty: p,
                value: n as f64,
            },
            other => return Err(mismatch("float", &other)),
        },
        Primitive::Float64 => match frame.pop()? {
            Value::Double(n) => Object::Float { ty: p, value: n },
            other => return Err(mismatch("double", &other)),
        },
    };
    Ok(object)
}

/// The native words of a boxed `p`, low word first.
fn unbox_words(object: &Object, p: Primitive) -> Result<Vec<Value>, MachineError> {
    let words = match (object, p) {
        (Object::Bool(b), Primitive::Boolean) => vec![Value::bool(*b)],
        (Object::Char(c), Primitive::Char) => vec![Value::Int(*c as i32)],
        (Object::Num { value, .. }, p) if p.is_integer() => {
            if p.is_wide() {
                let (lo, hi) = Value::wide(*value);
                vec![lo, hi]
            } else if p.bit_width() == 64 {
                vec![Value::Long(*value as i64)]
            } else {
                vec![Value::Int(*value as i32)]
            }
        }
        (Object::Float { value, .. }, Primitive::Float32) => vec![Value::Float(*value as f32)],
        (Object::Float { value, .. }, Primitive::Float64) => vec![Value::Double(*value)],
        (other, p) => {
            return Err(MachineError::TypeMismatch {
                expected: p.name().to_string(),
                found: other.ty().to_string(),
            });
        }
    };
    Ok(words)
}

fn to_bits(value: &Value) -> i64 {
    match value {
        Value::Int(n) => *n as i64,
        Value::Long(n) => *n,
        Value::Float(n) => n.to_bits() as i64,
        Value::Double(n) => n.to_bits() as i64,
        Value::Ref(_) => 0,
    }
}

fn from_bits(kind: NativeKind, bits: i64) -> Value {
    match kind {
        NativeKind::Boolean | NativeKind::Int => Value::Int(bits as i32),
        NativeKind::Long => Value::Long(bits),
        NativeKind::Float => Value::Float(f32::from_bits(bits as u32)),
        NativeKind::Double => Value::Double(f64::from_bits(bits as u64)),
        NativeKind::Ref => Value::null(),
    }
}

fn put<T: Clone>(carrier: &mut Vec<Option<T>>, index: usize, value: T) {
    if index >= carrier.len() {
        carrier.resize(index + 1, None);
    }
    carrier[index] = Some(value);
}

fn kind_name(kind: NativeKind) -> &'static str {
    match kind {
        NativeKind::Boolean => "boolean",
        NativeKind::Int => "int",
        NativeKind::Long => "long",
        NativeKind::Float => "float",
        NativeKind::Double => "double",
        NativeKind::Ref => "reference",
    }
}

fn mismatch(expected: &str, found: &Value) -> MachineError {
    MachineError::TypeMismatch {
        expected: expected.to_string(),
        found: found.type_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Constant;
    use crate::jit::codebuf::{CodeBuffer, NativeSignature};
    use crate::jit::insn::{Cond, NativeClass};
    use crate::link::TypeSystem;
    use crate::vm::injector::{FailEverythingInjector, Injector, ResourceInjector};

    fn container(injector: Arc<dyn Injector>) -> Arc<Container> {
        Arc::new(Container::new(0, None, TypeSystem::standalone(Vec::new(), true), injector))
    }

    fn routine(name: &str, params: Vec<NativeClass>, ret: Option<NativeClass>, build: impl FnOnce(&mut CodeBuffer)) -> Routine {
        let mut all = vec![NativeClass::object("Ctx")];
        all.extend(params);
        let mut code = CodeBuffer::new(all.len());
        build(&mut code);
        code.finish(name, NativeSignature { params: all, ret }).unwrap()
    }

    fn machine(routines: Vec<Routine>) -> Machine {
        let mut table = RoutineTable::new();
        for r in routines {
            table.insert(r, false);
        }
        Machine::new(table, container(Arc::new(FailEverythingInjector)))
    }

    fn load(kind: NativeKind, slot: usize) -> Insn {
        Insn::Load { kind, slot }
    }

    #[test]
    fn test_int_arithmetic_wraps() {
        let add = routine("add", vec![NativeClass::Int, NativeClass::Int], Some(NativeClass::Int), |c| {
            c.emit(load(NativeKind::Int, 1))
                .emit(load(NativeKind::Int, 2))
                .emit(Insn::Arith { op: ArithOp::Add, kind: NativeKind::Int })
                .emit(Insn::Return(Some(NativeKind::Int)));
        });
        let mut m = machine(vec![add]);
        let r = m.invoke("add", false, vec![Value::Int(i32::MAX), Value::Int(1)]).unwrap();
        assert_eq!(r, Some(Value::Int(i32::MIN)));
    }

    #[test]
    fn test_shift_amount_masked() {
        let shl = routine("shl", vec![NativeClass::Long], Some(NativeClass::Long), |c| {
            c.emit(load(NativeKind::Long, 1))
                .emit(Insn::Const(NativeConst::Int(65)))
                .emit(Insn::Arith { op: ArithOp::Shl, kind: NativeKind::Long })
                .emit(Insn::Return(Some(NativeKind::Long)));
        });
        let mut m = machine(vec![shl]);
        assert_eq!(m.invoke("shl", false, vec![Value::Long(3)]).unwrap(), Some(Value::Long(6)));
    }

    #[test]
    fn test_branch_and_unset_locals() {
        // max(a, 0) with an uninitialized local read as zero
        let f = routine("max0", vec![NativeClass::Int], Some(NativeClass::Int), |c| {
            c.reserve_locals(3);
            let neg = c.new_label();
            c.emit(load(NativeKind::Int, 1)).emit(Insn::If { cond: Cond::Lt, target: neg });
            c.emit(load(NativeKind::Int, 1)).emit(Insn::Return(Some(NativeKind::Int)));
            c.bind(neg);
            c.emit(load(NativeKind::Int, 2)).emit(Insn::Return(Some(NativeKind::Int)));
        });
        let mut m = machine(vec![f]);
        assert_eq!(m.invoke("max0", false, vec![Value::Int(-5)]).unwrap(), Some(Value::Int(0)));
        assert_eq!(m.invoke("max0", false, vec![Value::Int(7)]).unwrap(), Some(Value::Int(7)));
    }

    #[test]
    fn test_call_and_carriers() {
        // pair() returns 1 natively and 2 through the long carrier
        let pair = routine("pair", vec![], Some(NativeClass::Long), |c| {
            c.emit(Insn::Const(NativeConst::Long(2)))
                .emit(Insn::StoreReturn { kind: NativeKind::Long, index: 0 })
                .emit(Insn::Const(NativeConst::Long(1)))
                .emit(Insn::Return(Some(NativeKind::Long)));
        });
        let sum = routine("sum", vec![], Some(NativeClass::Long), |c| {
            c.emit(load(NativeKind::Ref, 0))
                .emit(Insn::Call { method: "pair".into(), optimized: false })
                .emit(Insn::LoadReturn { kind: NativeKind::Long, index: 0 })
                .emit(Insn::Arith { op: ArithOp::Sub, kind: NativeKind::Long })
                .emit(Insn::Return(Some(NativeKind::Long)));
        });
        let mut m = machine(vec![pair, sum]);
        assert_eq!(m.invoke("sum", false, vec![]).unwrap(), Some(Value::Long(-1)));
        assert_eq!(m.carrier(NativeKind::Long, 0).unwrap(), Value::Long(2));
        assert!(matches!(m.carrier(NativeKind::Ref, 0), Err(MachineError::EmptyCarrier(0))));
    }

    #[test]
    fn test_faults() {
        let div = routine("div", vec![NativeClass::Int], Some(NativeClass::Int), |c| {
            c.emit(Insn::Const(NativeConst::Int(1)))
                .emit(load(NativeKind::Int, 1))
                .emit(Insn::Arith { op: ArithOp::Div, kind: NativeKind::Int })
                .emit(Insn::Return(Some(NativeKind::Int)));
        });
        let cp = routine("cp", vec![NativeClass::Long], Some(NativeClass::Int), |c| {
            c.emit(load(NativeKind::Long, 1))
                .emit(Insn::Invoke(Builtin::CodePoint))
                .emit(Insn::Return(Some(NativeKind::Int)));
        });
        let cast = routine("cast", vec![NativeClass::object("Object")], None, |c| {
            c.emit(load(NativeKind::Ref, 1))
                .emit(Insn::CheckCast(Type::string()))
                .emit(Insn::Pop)
                .emit(Insn::Return(None));
        });
        let mut m = machine(vec![div, cp, cast]);
        assert!(matches!(m.invoke("div", false, vec![Value::Int(0)]), Err(MachineError::DivisionByZero)));
        assert!(matches!(
            m.invoke("cp", false, vec![Value::Long(0x11_0000)]),
            Err(MachineError::CodePointOutOfRange(0x11_0000))
        ));
        assert_eq!(m.invoke("cp", false, vec![Value::Long(0x41)]).unwrap(), Some(Value::Int(0x41)));
        assert!(m.invoke("cast", false, vec![Value::null()]).is_ok());
        assert!(m.invoke("cast", false, vec![Value::string("s")]).is_ok());
        assert!(matches!(
            m.invoke("cast", false, vec![Value::boxed(Primitive::Int64, 1)]),
            Err(MachineError::TypeMismatch { .. })
        ));
        assert!(matches!(m.invoke("nope", false, vec![]), Err(MachineError::UnknownRoutine(_))));
    }

    #[test]
    fn test_box_round_trip_wide() {
        let f = routine("wide", vec![NativeClass::Long, NativeClass::Long], Some(NativeClass::object("Int128")), |c| {
            c.emit(load(NativeKind::Long, 1))
                .emit(load(NativeKind::Long, 2))
                .emit(Insn::Box(Primitive::Int128))
                .emit(Insn::Return(Some(NativeKind::Ref)));
        });
        let mut m = machine(vec![f]);
        let (lo, hi) = Value::wide(-3);
        let r = m.invoke("wide", false, vec![lo, hi]).unwrap();
        assert_eq!(r, Some(Value::boxed(Primitive::Int128, -3)));
    }

    #[test]
    fn test_floor_mod() {
        assert_eq!(floor_mod_int(-7, 3), 2);
        assert_eq!(floor_mod_int(7, -3), -2);
        assert_eq!(floor_mod_long(i64::MIN, -1), 0);
    }

    #[test]
    fn test_inject() {
        let console = Type::class("Console");
        let injector = ResourceInjector::new().with_resource(
            console.clone(),
            "console",
            Object::Resource { ty: console.clone(), name: "console".into() },
        );
        let c = container(Arc::new(injector));
        let pool = c.type_system().pool();
        let ty_id = pool.register(Constant::Type(console.clone()));
        let name_id = pool.register(Constant::string("console"));
        let missing_id = pool.register(Constant::string("clock"));
        let inject = |name| {
            routine(name, vec![], Some(NativeClass::object("Console")), |code| {
                code.emit(load(NativeKind::Ref, 0))
                    .emit(Insn::Ldc(ty_id))
                    .emit(Insn::Ldc(if name == "ok" { name_id } else { missing_id }))
                    .emit(Insn::Const(NativeConst::Null))
                    .emit(Insn::Invoke(Builtin::Inject))
                    .emit(Insn::Return(Some(NativeKind::Ref)));
            })
        };
        let mut table = RoutineTable::new();
        table.insert(inject("ok"), false);
        table.insert(inject("missing"), false);
        let mut m = Machine::new(table, c);
        let r = m.invoke("ok", false, vec![]).unwrap().unwrap();
        assert!(r.as_object().unwrap().ty().is_a(&console));
        assert!(matches!(m.invoke("missing", false, vec![]), Err(MachineError::Inject(_))));
    }
}
