//! Per-method compile state.
//!
//! A `BuildContext` owns everything one routine compile needs: the code
//! buffer, the scope tree, the register table and the precomputed type
//! matrix. Numeric codegen lives in `number.rs` and `int128.rs` as further
//! `impl BuildContext` blocks.

use std::collections::HashMap;
use std::sync::Arc;

use super::codebuf::{CodeBuffer, Routine};
use super::desc::{JitMethodDesc, JitParamDesc};
use super::flavor::{classify, primitive_of, JitFlavor, StackShape};
use super::insn::{
    ArithOp, Builtin, Cond, Conversion, Insn, Label, NativeClass, NativeConst, NativeKind, Slot,
};
use super::matrix::TypeMatrix;
use super::register::{ExtendedSlot, Location, MultipleSlot, RegisterInfo, SingleSlot};
use super::scope::ScopeTree;
use crate::config::JitConfig;
use crate::diagnostics::{ErrorList, JIT_UNRESOLVED_TYPE};
use crate::error::JitError;
use crate::ir::{
    Annotation, ArgId, Constant, ConstantPool, MethodBody, RegId, A_DEFAULT, A_IGNORE, A_STACK,
    A_THIS, CONSTANT_OFFSET,
};
use crate::link::TypeSystem;
use crate::types::{Primitive, Type, OBJECT};

pub struct BuildContext<'a> {
    pub ts: &'a TypeSystem,
    pub method: &'a MethodBody,
    pub config: &'a JitConfig,
    pub desc: Arc<JitMethodDesc>,
    /// Compiling the optimized entry
    pub optimized: bool,
    pub code: CodeBuffer,
    pub scopes: ScopeTree,
    pub matrix: TypeMatrix,
    pub diagnostics: ErrorList,
    registers: HashMap<RegId, RegisterInfo>,
    /// Temporaries standing in for `A_STACK` values
    temp_stack: Vec<RegisterInfo>,
    /// Start labels of variables not yet assigned
    unassigned: HashMap<RegId, Label>,
    /// Op address -> label
    labels: HashMap<usize, Label>,
    curr_addr: usize,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        ts: &'a TypeSystem,
        method: &'a MethodBody,
        config: &'a JitConfig,
        optimized: bool,
        matrix: TypeMatrix,
    ) -> Self {
        let desc = ts.method_desc(method);
        let optimized = optimized && desc.is_optimized();
        let mut code = CodeBuffer::new(desc.implicit_param_count() + desc.params(optimized).len());
        let scopes = ScopeTree::new(&mut code);
        Self {
            ts,
            method,
            config,
            desc,
            optimized,
            code,
            scopes,
            matrix,
            diagnostics: ErrorList::default(),
            registers: HashMap::new(),
            temp_stack: Vec::new(),
            unassigned: HashMap::new(),
            labels: HashMap::new(),
            curr_addr: 0,
        }
    }

    pub fn pool(&self) -> &'a ConstantPool {
        self.ts.pool()
    }

    /// Make `addr` the op being generated.
    pub fn at(&mut self, addr: usize) {
        self.curr_addr = addr;
        self.matrix.at(addr as i32);
    }

    pub fn curr_addr(&self) -> usize {
        self.curr_addr
    }

    pub fn register(&self, reg: RegId) -> Result<&RegisterInfo, JitError> {
        self.registers
            .get(&reg)
            .ok_or(JitError::UnregisteredRegister(reg))
    }

    /// The label of an op address, created on first use.
    pub fn ensure_label(&mut self, addr: usize) -> Label {
        *self
            .labels
            .entry(addr)
            .or_insert_with(|| self.code.new_label())
    }

    pub fn has_label(&self, addr: usize) -> bool {
        self.labels.contains_key(&addr)
    }

    /// Finish the routine.
    pub fn finish(self) -> Result<(Routine, ErrorList), JitError> {
        let signature = self.desc.signature(self.optimized).clone();
        let routine = self.code.finish(self.method.name.clone(), signature)?;
        Ok((routine, self.diagnostics))
    }

    // ========================================
    // Method and scope structure
    // ========================================

    /// Bind every native parameter slot to its logical register.
    pub fn enter_method(&mut self) -> Result<(), JitError> {
        let root = self.scopes.current();
        let (start, end) = (root.start, root.end);
        self.code
            .local_variable(0, "$ctx", NativeClass::object("Ctx"), start, end);

        if let Some(slot) = self.desc.this_slot() {
            let ty = self.method.this_type.clone().unwrap_or_else(Type::object);
            let class = NativeClass::object(ty.single_class().unwrap_or(OBJECT));
            self.code.local_variable(slot, "this", class.clone(), start, end);
            self.registers.insert(
                A_THIS,
                RegisterInfo::Single(SingleSlot {
                    reg: A_THIS,
                    location: Location::Local(slot),
                    flavor: JitFlavor::Specific,
                    ty,
                    class,
                    name: "this".to_string(),
                    default: None,
                }),
            );
        }

        let extra = self.desc.implicit_param_count();
        let params: Vec<JitParamDesc> = self.desc.params(self.optimized).to_vec();
        let mut i = 0;
        while i < params.len() {
            let pd = &params[i];
            let param = self
                .method
                .params
                .get(pd.index)
                .ok_or(JitError::InvalidIndex { what: "parameter", index: pd.index })?;
            let ty = self.resolve_type(&pd.ty);
            let name = param.name.clone();
            let reg = pd.index as RegId;
            let slot = self.code.parameter_slot(extra + i);
            let top_reg = &mut self.scopes.current_mut().top_reg;
            if reg >= *top_reg {
                *top_reg = reg + 1;
            }

            let info = match pd.flavor {
                JitFlavor::MultiSlotPrimitive | JitFlavor::PrimitiveWithDefault => {
                    let ext_slot = self.code.parameter_slot(extra + i + 1);
                    i += 2;
                    RegisterInfo::Extended(ExtendedSlot {
                        reg,
                        slot,
                        ext_slot,
                        flavor: pd.flavor,
                        ty,
                        class: pd.class.clone(),
                        name: name.clone(),
                        default: param.default.clone(),
                    })
                }
                JitFlavor::XvmPrimitive
                | JitFlavor::NullableXvmPrimitive
                | JitFlavor::XvmPrimitiveWithDefault => {
                    let entries: Vec<&JitParamDesc> =
                        params[i..].iter().take_while(|p| p.index == pd.index).collect();
                    let word_classes: Vec<NativeClass> = entries
                        .iter()
                        .filter(|e| !e.extension)
                        .map(|e| e.class.clone())
                        .collect();
                    let slots = (0..word_classes.len())
                        .map(|w| self.code.parameter_slot(extra + i + w))
                        .collect();
                    let ext_slot = entries
                        .iter()
                        .position(|e| e.extension)
                        .map(|p| self.code.parameter_slot(extra + i + p));
                    i += entries.len();
                    let class = primitive_of(&ty)
                        .map(NativeClass::boxed)
                        .unwrap_or_else(|| NativeClass::object(OBJECT));
                    RegisterInfo::Multiple(MultipleSlot {
                        reg,
                        slots,
                        ext_slot,
                        flavor: pd.flavor,
                        ty,
                        class,
                        word_classes,
                        name: name.clone(),
                        default: param.default.clone(),
                    })
                }
                _ => {
                    i += 1;
                    RegisterInfo::Single(SingleSlot {
                        reg,
                        location: Location::Local(slot),
                        flavor: pd.flavor,
                        ty,
                        class: pd.class.clone(),
                        name: name.clone(),
                        default: param.default.clone(),
                    })
                }
            };
            self.code
                .local_variable(slot, &name, info.class().clone(), start, end);
            self.registers.insert(reg, info);
        }
        Ok(())
    }

    pub fn exit_method(&mut self) {
        self.scopes.finish(&mut self.code);
    }

    pub fn enter_scope(&mut self) {
        self.scopes.enter(&mut self.code);
    }

    /// Close the current scope, forgetting the registers it introduced.
    pub fn exit_scope(&mut self) -> Result<(), JitError> {
        self.scopes.exit(&mut self.code)?;
        let threshold = self.scopes.current().top_reg;
        self.registers.retain(|reg, _| *reg < threshold);
        self.unassigned.retain(|reg, _| *reg < threshold);
        Ok(())
    }

    /// Resolve formal types, noting any that stay unresolved.
    fn resolve_type(&mut self, ty: &Type) -> Type {
        let resolved = if self.method.formals.is_empty() {
            ty.clone()
        } else {
            ty.resolve_formals(&self.method.formals)
        };
        if resolved.contains_formal() {
            self.diagnostics.warn(
                JIT_UNRESOLVED_TYPE,
                vec![self.method.name.clone(), resolved.to_string()],
            );
        }
        resolved
    }

    // ========================================
    // Arguments
    // ========================================

    /// Type of an argument at the current op.
    pub fn get_argument_type(&self, arg: ArgId) -> Result<Type, JitError> {
        if arg >= 0 {
            if let Some(ty) = self.matrix.get(arg, self.curr_addr as i32) {
                return Ok(ty.clone());
            }
            return self.register(arg).map(|r| r.ty().clone());
        }
        if let Some(constant) = self.method.constant(arg) {
            return Ok(constant.ty());
        }
        match arg {
            A_THIS => self.register(A_THIS).map(|r| r.ty().clone()),
            A_STACK => self
                .temp_stack
                .last()
                .map(|r| r.ty().clone())
                .ok_or_else(|| JitError::unsupported("empty temporary stack")),
            _ => Err(JitError::unsupported(format!("argument id {arg}"))),
        }
    }

    /// Push an argument's value and describe what was pushed.
    pub fn load_argument(&mut self, arg: ArgId) -> Result<RegisterInfo, JitError> {
        if arg >= 0 {
            let reg = self.register(arg)?.clone();
            let reg = self.adjust_register(reg);
            reg.load(&mut self.code, self.ts.pool())?;
            Ok(reg)
        } else if arg <= CONSTANT_OFFSET {
            self.load_constant(arg)
        } else {
            self.load_predefined_argument(arg)
        }
    }

    /// A resident register for an argument. Constants and predefined
    /// values are spilled to temporaries.
    pub fn ensure_register(&mut self, arg: ArgId) -> Result<RegisterInfo, JitError> {
        match arg {
            a if a >= 0 => {
                let reg = self.register(a)?.clone();
                Ok(self.adjust_register(reg))
            }
            A_THIS => self.register(A_THIS).cloned(),
            A_STACK => self
                .temp_stack
                .pop()
                .ok_or_else(|| JitError::unsupported("empty temporary stack")),
            a => {
                let loaded = if a <= CONSTANT_OFFSET {
                    self.load_constant(a)?
                } else {
                    self.load_predefined_argument(a)?
                };
                self.store_temp_register(&loaded)
            }
        }
    }

    pub fn load_constant(&mut self, arg: ArgId) -> Result<RegisterInfo, JitError> {
        let constant = self
            .method
            .constant(arg)
            .cloned()
            .ok_or(JitError::UnknownConstant(arg))?;
        self.load_constant_value(&constant)
    }

    /// Push a constant. Primitives are always pushed unboxed.
    pub fn load_constant_value(&mut self, constant: &Constant) -> Result<RegisterInfo, JitError> {
        let ty = constant.ty();
        match constant {
            Constant::Null => {
                self.code.emit(Insn::Const(NativeConst::Null));
                Ok(RegisterInfo::on_stack(
                    A_STACK,
                    ty,
                    JitFlavor::AlwaysNull,
                    NativeClass::object("Nullable"),
                ))
            }
            Constant::String(_) | Constant::Type(_) => {
                let id = self.ts.pool().register(constant.clone());
                self.code.emit(Insn::Ldc(id));
                let class = NativeClass::object(ty.single_class().unwrap_or(OBJECT));
                Ok(RegisterInfo::on_stack(A_STACK, ty, JitFlavor::Specific, class))
            }
            _ => {
                let p = ty
                    .as_primitive()
                    .ok_or_else(|| JitError::unsupported(format!("constant {constant}")))?;
                for word in NativeConst::words_of(constant, p)? {
                    self.code.emit(Insn::Const(word));
                }
                match NativeClass::of_primitive(p) {
                    Some(class) => Ok(RegisterInfo::on_stack(A_STACK, ty, JitFlavor::Primitive, class)),
                    None => Ok(RegisterInfo::words_on_stack(
                        A_STACK,
                        ty,
                        NativeClass::boxed(p),
                        NativeClass::words(p),
                    )),
                }
            }
        }
    }

    /// Load one of the reserved pseudo-registers.
    pub fn load_predefined_argument(&mut self, arg: ArgId) -> Result<RegisterInfo, JitError> {
        let reg = match arg {
            A_STACK => self
                .temp_stack
                .pop()
                .ok_or_else(|| JitError::unsupported("empty temporary stack"))?,
            A_THIS => self.register(A_THIS)?.clone(),
            _ => return Err(JitError::unsupported(format!("predefined argument {arg}"))),
        };
        reg.load(&mut self.code, self.ts.pool())?;
        Ok(reg)
    }

    /// Use the type matrix to pick a cheaper or more precise view.
    pub fn adjust_register(&self, reg: RegisterInfo) -> RegisterInfo {
        match self.matrix.get(reg.reg_id(), self.curr_addr as i32) {
            Some(known) => {
                let known = known.clone();
                self.narrow_register(reg, &known)
            }
            None => reg,
        }
    }

    /// A per-load view of `reg` known to hold a `ty`.
    ///
    /// A nullable primitive proven non-null reads only its value slots; a
    /// reference proven narrower is loaded with a checked cast.
    pub fn narrow_register(&self, reg: RegisterInfo, ty: &Type) -> RegisterInfo {
        use super::register::NarrowedSlot;

        if reg.ty() == ty || *ty == Type::Null {
            return reg;
        }
        match reg.flavor() {
            JitFlavor::MultiSlotPrimitive if !ty.is_nullable() => {
                let class = reg.class().clone();
                RegisterInfo::Narrowed(NarrowedSlot {
                    slots: reg.slots(),
                    word_classes: vec![class.clone()],
                    flavor: JitFlavor::Primitive,
                    ty: ty.clone(),
                    class,
                    checked: false,
                    original: Box::new(reg),
                })
            }
            JitFlavor::NullableXvmPrimitive if !ty.is_nullable() => {
                let slots = reg.slots();
                RegisterInfo::Narrowed(NarrowedSlot {
                    word_classes: vec![NativeClass::Long; slots.len()],
                    slots,
                    flavor: JitFlavor::XvmPrimitive,
                    ty: ty.clone(),
                    class: reg.class().clone(),
                    checked: false,
                    original: Box::new(reg),
                })
            }
            JitFlavor::Specific | JitFlavor::Widened
                if ty.is_a(reg.ty()) && !reg.ty().is_a(ty) && !reg.is_on_stack() =>
            {
                // narrow, but stay boxed for primitive types
                let desc = classify(ty, false);
                RegisterInfo::Narrowed(NarrowedSlot {
                    slots: reg.slots(),
                    word_classes: vec![desc.class.clone()],
                    flavor: desc.flavor,
                    ty: ty.clone(),
                    class: desc.class,
                    checked: true,
                    original: Box::new(reg),
                })
            }
            _ => reg,
        }
    }

    // ========================================
    // Registers and temporaries
    // ========================================

    /// Allocate storage for a register of the given type.
    fn allocate_register(&mut self, reg: RegId, ty: &Type, name: &str) -> Result<RegisterInfo, JitError> {
        let desc = self.ts.jit_type_desc(ty);
        let info = match desc.flavor {
            JitFlavor::Specific | JitFlavor::Widened | JitFlavor::Primitive | JitFlavor::AlwaysNull => {
                let slot = self.scopes.allocate_local(&mut self.code, reg, 1);
                RegisterInfo::Single(SingleSlot {
                    reg,
                    location: Location::Local(slot),
                    flavor: desc.flavor,
                    ty: ty.clone(),
                    class: desc.class,
                    name: name.to_string(),
                    default: None,
                })
            }
            JitFlavor::MultiSlotPrimitive => {
                let slot = self.scopes.allocate_local(&mut self.code, reg, 2);
                RegisterInfo::Extended(ExtendedSlot {
                    reg,
                    slot,
                    ext_slot: slot + 1,
                    flavor: desc.flavor,
                    ty: ty.clone(),
                    class: desc.class,
                    name: name.to_string(),
                    default: None,
                })
            }
            JitFlavor::XvmPrimitive | JitFlavor::NullableXvmPrimitive => {
                let total = desc.slots.len();
                let words = if desc.flavor == JitFlavor::NullableXvmPrimitive {
                    total - 1
                } else {
                    total
                };
                let base = self.scopes.allocate_local(&mut self.code, reg, total);
                RegisterInfo::Multiple(MultipleSlot {
                    reg,
                    slots: (base..base + words).collect(),
                    ext_slot: (words < total).then_some(base + words),
                    flavor: desc.flavor,
                    ty: ty.clone(),
                    class: desc.class,
                    word_classes: desc.slots[..words].to_vec(),
                    name: name.to_string(),
                    default: None,
                })
            }
            other => return Err(JitError::unsupported(format!("Not implemented: {other:?}"))),
        };
        Ok(info)
    }

    /// Declare a named variable.
    pub fn introduce_var(&mut self, reg: RegId, ty: &Type, name: Option<&str>) -> Result<RegisterInfo, JitError> {
        if reg < 0 {
            return Err(JitError::unsupported(format!("variable register {reg}")));
        }
        let ty = self.resolve_type(ty);
        let name = match name {
            Some(n) if !n.is_empty() => n.replace(['#', '.'], "$"),
            _ => format!("v${reg}"),
        };
        let info = self.allocate_register(reg, &ty, &name)?;
        self.record_local(&info);
        self.registers.insert(reg, info.clone());
        Ok(info)
    }

    /// Add debug-info entries; the variable starts at its first store.
    fn record_local(&mut self, info: &RegisterInfo) {
        let start = self.code.new_label();
        let end = self.scopes.current().end;
        let name = info.name().to_string();
        let classes: Vec<NativeClass> = match info {
            RegisterInfo::Multiple(m) => m.word_classes.clone(),
            other => vec![other.class().clone()],
        };
        for (slot, class) in info.slots().into_iter().zip(classes) {
            self.code.local_variable(slot, &name, class, start, end);
        }
        if let Some(ext) = info.ext_slot() {
            self.code
                .local_variable(ext, &format!("{name}$flag"), NativeClass::Boolean, start, end);
        }
        self.unassigned.insert(info.reg_id(), start);
    }

    /// The register an op result goes to, created on first use.
    pub fn ensure_reg_info(&mut self, reg: RegId, ty: &Type) -> Result<RegisterInfo, JitError> {
        match reg {
            A_IGNORE => {
                let desc = self.ts.jit_type_desc(ty);
                Ok(RegisterInfo::Single(SingleSlot {
                    reg,
                    location: Location::Discard,
                    flavor: desc.flavor,
                    ty: ty.clone(),
                    class: desc.class,
                    name: String::new(),
                    default: None,
                }))
            }
            A_STACK => self.push_temp_register(ty),
            r if r >= 0 => {
                if let Some(info) = self.registers.get(&r) {
                    return Ok(info.clone());
                }
                let info = self.allocate_register(r, ty, &format!("v${r}"))?;
                self.registers.insert(r, info.clone());
                Ok(info)
            }
            other => Err(JitError::unsupported(format!("result register {other}"))),
        }
    }

    /// A temporary standing in for the next `A_STACK` read.
    pub fn push_temp_register(&mut self, ty: &Type) -> Result<RegisterInfo, JitError> {
        let info = self.allocate_register(A_STACK, ty, "")?;
        self.temp_stack.push(info.clone());
        Ok(info)
    }

    /// Pop the top of the operand stack into a fresh slot.
    pub fn store_temp_value(&mut self, class: &NativeClass) -> Slot {
        let slot = self.scopes.allocate_slots(&mut self.code, 1);
        self.code.emit(Insn::Store {
            kind: class.kind(),
            slot,
        });
        slot
    }

    pub fn store_temp_register(&mut self, reg: &RegisterInfo) -> Result<RegisterInfo, JitError> {
        reg.store_temp_value(&mut self.code, &mut self.scopes)
    }

    /// Store the stack top into a register.
    pub fn store_value(&mut self, reg: &RegisterInfo) -> Result<(), JitError> {
        reg.store(&mut self.code)?;
        if let Some(start) = self.unassigned.remove(&reg.reg_id()) {
            self.code.bind(start);
        }
        Ok(())
    }

    /// Store a result of the given flavor into `ret`.
    pub fn assign_result(&mut self, ret: RegId, ty: &Type, flavor: JitFlavor) -> Result<(), JitError> {
        let dst = self.ensure_reg_info(ret, ty)?;
        self.convert(flavor, ty, dst.flavor(), &dst.ty().clone())?;
        self.store_value(&dst)
    }

    // ========================================
    // Moves and flavor conversion
    // ========================================

    pub fn move_var(&mut self, from: ArgId, to: RegId) -> Result<(), JitError> {
        let src = self.load_argument(from)?;
        let dst = self.ensure_reg_info(to, src.ty())?;
        self.convert(src.flavor(), src.ty(), dst.flavor(), dst.ty())?;
        self.store_value(&dst)
    }

    /// Convert the value on the stack from one flavor's loaded shape to
    /// another flavor's passed shape.
    pub fn convert(
        &mut self,
        from: JitFlavor,
        from_ty: &Type,
        to: JitFlavor,
        to_ty: &Type,
    ) -> Result<(), JitError> {
        use StackShape::*;

        let unsupported = || JitError::unsupported(format!("Not implemented: src={from:?}; dst={to:?}"));
        if matches!(to, JitFlavor::PrimitiveWithDefault | JitFlavor::XvmPrimitiveWithDefault)
            && from_ty.is_nullable()
        {
            return Err(JitError::unsupported(format!(
                "possibly null {from_ty} for a default-flagged {to_ty}"
            )));
        }
        let prim = |ty: &Type| primitive_of(ty).ok_or_else(unsupported);

        match (from.loaded_shape(), to.passed_shape()) {
            (Ref, Ref) => {
                if *from_ty != Type::Null && !from_ty.is_a(to_ty) {
                    self.code.emit(Insn::CheckCast(to_ty.clone()));
                }
            }
            (Value, Value) => {
                let (f, t) = (prim(from_ty)?, prim(to_ty)?);
                let fk = NativeClass::of_primitive(f).map(|c| c.kind());
                let tk = NativeClass::of_primitive(t).map(|c| c.kind());
                match (fk, tk) {
                    (Some(NativeKind::Int), Some(NativeKind::Long)) => {
                        self.emit_to_long(f);
                    }
                    (Some(NativeKind::Long), Some(NativeKind::Int)) => {
                        self.code.emit(Insn::Convert(Conversion::L2I));
                        self.adjust_int_value(t)?;
                    }
                    (a, b) if a == b => {}
                    _ => return Err(unsupported()),
                }
            }
            (Words, Words) | (FlaggedValue, FlaggedValue) | (FlaggedWords, FlaggedWords) => {}
            (Value, Ref) | (Words, Ref) => {
                self.code.emit(Insn::Box(prim(from_ty)?));
            }
            (Ref, Value) | (Ref, Words) => {
                self.code.emit(Insn::Unbox(prim(to_ty)?));
            }
            (Value, FlaggedValue) | (Words, FlaggedWords) => {
                self.code.emit(Insn::Const(NativeConst::Int(0)));
            }
            (FlaggedValue, Value) | (FlaggedWords, Words) => {
                self.code.emit(Insn::Pop);
            }
            (FlaggedValue, Ref) | (FlaggedWords, Ref) => {
                let p = prim(from_ty)?;
                let is_null = self.code.new_label();
                let done = self.code.new_label();
                self.code
                    .emit(Insn::If {
                        cond: Cond::Ne,
                        target: is_null,
                    })
                    .emit(Insn::Box(p))
                    .emit(Insn::Goto(done));
                self.code.bind(is_null);
                for _ in 0..p.word_count() {
                    self.code.emit(Insn::Pop);
                }
                self.code.emit(Insn::Const(NativeConst::Null));
                self.code.bind(done);
            }
            (Ref, FlaggedValue) | (Ref, FlaggedWords) => {
                let p = prim(to_ty)?;
                let is_null = self.code.new_label();
                let done = self.code.new_label();
                self.code
                    .emit(Insn::Dup)
                    .emit(Insn::IfNull { target: is_null })
                    .emit(Insn::Unbox(p))
                    .emit(Insn::Const(NativeConst::Int(0)))
                    .emit(Insn::Goto(done));
                self.code.bind(is_null);
                self.code.emit(Insn::Pop);
                for class in NativeClass::words(p) {
                    self.code.emit(Insn::Const(NativeConst::zero(&class)));
                }
                self.code.emit(Insn::Const(NativeConst::Int(1)));
                self.code.bind(done);
            }
            (Value, Words) => {
                let f = prim(from_ty)?;
                if !f.is_integer() {
                    return Err(unsupported());
                }
                self.emit_to_long(f);
                let temp = self.store_temp_value(&NativeClass::Long);
                self.code.emit(Insn::Load {
                    kind: NativeKind::Long,
                    slot: temp,
                });
                if f.is_unsigned() || f == Primitive::Char {
                    self.code.emit(Insn::Const(NativeConst::Long(0)));
                } else {
                    self.code
                        .emit(Insn::Load {
                            kind: NativeKind::Long,
                            slot: temp,
                        })
                        .emit(Insn::Const(NativeConst::Int(63)))
                        .emit(Insn::Arith {
                            op: ArithOp::Shr,
                            kind: NativeKind::Long,
                        });
                }
            }
            _ => return Err(unsupported()),
        }
        Ok(())
    }

    /// Widen a single-word integer on the stack to a long.
    pub(crate) fn emit_to_long(&mut self, p: Primitive) {
        if NativeClass::of_primitive(p).map(|c| c.kind()) == Some(NativeKind::Long) {
            return;
        }
        self.code.emit(Insn::Convert(Conversion::I2L));
        if p == Primitive::UInt32 {
            self.code
                .emit(Insn::Const(NativeConst::Long(0xFFFF_FFFF)))
                .emit(Insn::Arith {
                    op: ArithOp::And,
                    kind: NativeKind::Long,
                });
        }
    }

    // ========================================
    // Injection
    // ========================================

    /// Declare an injected reference and initialize it from the context.
    ///
    /// Only the `@Inject` and `@Inject(name)` forms are supported; passing
    /// injection options fails the compile.
    pub fn introduce_ref(
        &mut self,
        reg: RegId,
        name: &str,
        ty: &Type,
        annotation: &Annotation,
    ) -> Result<RegisterInfo, JitError> {
        if annotation.class != "Inject" {
            return Err(JitError::unsupported(format!("name={name}; type={ty}")));
        }
        if annotation.params.len() > 2 {
            return Err(JitError::unsupported(format!("injection arguments for '{name}'")));
        }
        let resource_name = match annotation.params.first() {
            Some(&arg) => match self.method.constant(arg) {
                Some(Constant::String(s)) => s.clone(),
                _ => name.to_string(),
            },
            None => name.to_string(),
        };
        if let Some(&opts) = annotation.params.get(1) {
            if opts != A_DEFAULT {
                return Err(JitError::unsupported(format!("retrieve opts for '{name}'")));
            }
        }

        let desc = classify(ty, false);
        let slot = self.scopes.allocate_local(&mut self.code, reg, 1);
        let info = RegisterInfo::Single(SingleSlot {
            reg,
            location: Location::Local(slot),
            flavor: desc.flavor,
            ty: ty.clone(),
            class: desc.class,
            name: name.to_string(),
            default: None,
        });
        self.record_local(&info);
        self.registers.insert(reg, info.clone());

        let type_id = self.ts.pool().register(Constant::Type(ty.clone()));
        let name_id = self.ts.pool().register(Constant::String(resource_name));
        self.code
            .emit(Insn::Load {
                kind: NativeKind::Ref,
                slot: 0,
            })
            .emit(Insn::Ldc(type_id))
            .emit(Insn::Ldc(name_id))
            .emit(Insn::Const(NativeConst::Null))
            .emit(Insn::Invoke(Builtin::Inject));
        self.store_value(&info)?;
        Ok(info)
    }

    // ========================================
    // Calls and returns
    // ========================================

    /// Whether every argument can take the callee's optimized entry.
    fn optimized_args_fit(&self, jmd: &JitMethodDesc, args: &[ArgId]) -> Result<bool, JitError> {
        for (i, &arg) in args.iter().enumerate() {
            if arg == A_DEFAULT {
                continue;
            }
            let pd = jmd.get_optimized_param(i)?;
            if pd.flavor.is_multi_slot()
                && pd.flavor.has_default()
                && self.get_argument_type(arg)?.is_nullable()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Push the arguments of a call in the chosen convention.
    pub fn load_call_arguments(
        &mut self,
        jmd: &JitMethodDesc,
        optimized: bool,
        args: &[ArgId],
    ) -> Result<(), JitError> {
        let params = jmd.params(optimized);
        for i in 0..jmd.standard_params.len() {
            let arg = args.get(i).copied().unwrap_or(A_DEFAULT);
            let entries: Vec<JitParamDesc> = if optimized {
                jmd.get_all_optimized_params(i)?
                    .into_iter()
                    .map(|ix| params[ix].clone())
                    .collect()
            } else {
                vec![jmd.standard_params[i].clone()]
            };
            let pd = &entries[0];

            if arg == A_DEFAULT {
                match pd.flavor {
                    JitFlavor::SpecificWithDefault | JitFlavor::WidenedWithDefault => {
                        self.code.emit(Insn::Const(NativeConst::Null));
                    }
                    JitFlavor::PrimitiveWithDefault | JitFlavor::XvmPrimitiveWithDefault => {
                        for e in entries.iter().filter(|e| !e.extension) {
                            self.code.emit(Insn::Const(NativeConst::zero(&e.class)));
                        }
                        self.code.emit(Insn::Const(NativeConst::Int(1)));
                    }
                    other => {
                        return Err(JitError::unsupported(format!(
                            "Unsupported default argument for: {other:?}"
                        )));
                    }
                }
                continue;
            }

            let src = self.load_argument(arg)?;
            self.convert(src.flavor(), src.ty(), pd.flavor, &pd.ty)?;
        }
        Ok(())
    }

    /// Store a call's results into the destination registers.
    pub fn assign_returns(
        &mut self,
        jmd: &JitMethodDesc,
        optimized: bool,
        returns: &[RegId],
    ) -> Result<(), JitError> {
        let callee_returns = jmd.standard_returns.len();
        if returns.is_empty() {
            if callee_returns > 0 {
                self.code.emit(Insn::Pop);
            }
            return Ok(());
        }
        let all = jmd.returns(optimized);
        for (i, &reg) in returns.iter().enumerate() {
            if i >= callee_returns {
                return Err(JitError::InvalidIndex { what: "return", index: i });
            }
            let entries: Vec<JitParamDesc> = if optimized {
                jmd.get_all_optimized_return_indexes(i)?
                    .into_iter()
                    .map(|ix| all[ix].clone())
                    .collect()
            } else {
                vec![jmd.standard_returns[i].clone()]
            };
            for e in &entries {
                if e.alt_index >= 0 {
                    self.code.emit(Insn::LoadReturn {
                        kind: e.class.kind(),
                        index: e.alt_index as usize,
                    });
                }
            }
            let ty = jmd.standard_returns[i].ty.clone();
            let dst = self.ensure_reg_info(reg, &ty)?;
            self.convert(entries[0].flavor, &ty, dst.flavor(), &dst.ty().clone())?;
            self.store_value(&dst)?;
        }
        Ok(())
    }

    /// Generate a call to another function of the type system.
    pub fn build_call(&mut self, method: &str, args: &[ArgId], returns: &[RegId]) -> Result<(), JitError> {
        let ts = self.ts;
        let callee = ts
            .find_method(method)
            .ok_or_else(|| JitError::UnknownMethod(method.to_string()))?;
        if !callee.is_function {
            return Err(JitError::unsupported(format!("call to '{method}' without a target")));
        }
        let jmd = ts.method_desc(callee);
        let optimized = self.config.optimize.is_on()
            && jmd.is_optimized()
            && self.optimized_args_fit(&jmd, args)?;

        self.code.emit(Insn::Load {
            kind: NativeKind::Ref,
            slot: 0,
        });
        self.load_call_arguments(&jmd, optimized, args)?;
        self.code.emit(Insn::Call {
            method: callee.name.clone(),
            optimized,
        });
        self.assign_returns(&jmd, optimized, returns)
    }

    /// Return values: carrier entries are stored first, the natural value
    /// is left on the stack.
    pub fn build_return(&mut self, values: &[ArgId]) -> Result<(), JitError> {
        let desc = Arc::clone(&self.desc);
        let returns = desc.returns(self.optimized);
        if values.len() != desc.standard_returns.len() {
            return Err(JitError::unsupported(format!(
                "{} return values for {} declared",
                values.len(),
                desc.standard_returns.len()
            )));
        }
        for i in (0..values.len()).rev() {
            let entries: Vec<&JitParamDesc> = returns.iter().filter(|r| r.index == i).collect();
            let ty = desc.standard_returns[i].ty.clone();
            let src = self.load_argument(values[i])?;
            self.convert(src.flavor(), &src.ty().clone(), entries[0].flavor, &ty)?;
            for e in entries.iter().rev() {
                if e.alt_index >= 0 {
                    self.code.emit(Insn::StoreReturn {
                        kind: e.class.kind(),
                        index: e.alt_index as usize,
                    });
                }
            }
        }
        let natural = returns.iter().find(|r| r.alt_index < 0).map(|r| r.class.kind());
        self.code.emit(Insn::Return(natural));
        Ok(())
    }

    // ========================================
    // Branches
    // ========================================

    pub fn build_jump(&mut self, target: usize) {
        let label = self.ensure_label(target);
        self.code.emit(Insn::Goto(label));
    }

    pub fn build_jump_if(&mut self, cond: ArgId, when: bool, target: usize) -> Result<(), JitError> {
        let reg = self.load_argument(cond)?;
        match reg.flavor().loaded_shape() {
            StackShape::Value => {}
            StackShape::Ref => {
                self.code.emit(Insn::Unbox(Primitive::Boolean));
            }
            _ => return Err(JitError::unsupported(format!("condition of type {}", reg.ty()))),
        }
        let label = self.ensure_label(target);
        let cond = if when { Cond::Ne } else { Cond::Eq };
        self.code.emit(Insn::If {
            cond,
            target: label,
        });
        Ok(())
    }

    pub fn build_jump_null(&mut self, arg: RegId, when: bool, target: usize) -> Result<(), JitError> {
        let reg = self.register(arg)?.clone();
        let label = self.ensure_label(target);
        match reg.flavor().loaded_shape() {
            StackShape::Ref => {
                reg.load(&mut self.code, self.ts.pool())?;
                let insn = if when {
                    Insn::IfNull { target: label }
                } else {
                    Insn::IfNonNull { target: label }
                };
                self.code.emit(insn);
            }
            StackShape::FlaggedValue | StackShape::FlaggedWords => {
                let ext = reg
                    .ext_slot()
                    .ok_or_else(|| JitError::unsupported(format!("null flag of {}", reg.name())))?;
                let cond = if when { Cond::Ne } else { Cond::Eq };
                self.code
                    .emit(Insn::Load {
                        kind: NativeKind::Boolean,
                        slot: ext,
                    })
                    .emit(Insn::If {
                        cond,
                        target: label,
                    });
            }
            StackShape::Value | StackShape::Words => {
                if !when {
                    self.code.emit(Insn::Goto(label));
                }
            }
        }
        Ok(())
    }
}
