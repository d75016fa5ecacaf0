//! Method compiler: type flow, then code generation.
//!
//! Compiling a method runs in two phases. A forward pass over the op stream
//! records the type of every live register at every reachable op in a
//! [`TypeMatrix`], repeating until no recorded type widens. The matrix then
//! drives a [`BuildContext`] that emits the standard entry and, when the
//! method's signature allows it, the optimized entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::codebuf::Routine;
use super::context::BuildContext;
use super::desc::JitMethodDesc;
use super::insn::Insn;
use super::matrix::TypeMatrix;
use super::number::result_type;
use crate::config::JitConfig;
use crate::diagnostics::ErrorList;
use crate::error::JitError;
use crate::ir::{ArgId, Constant, MethodBody, Op, RegId, A_DEFAULT, A_IGNORE, A_STACK, A_THIS};
use crate::link::{ModuleStructure, TypeSystem};
use crate::types::Type;

/// The routines generated for one method.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub name: String,
    pub desc: Arc<JitMethodDesc>,
    pub standard: Routine,
    /// Present when the calling convention has an optimized form
    pub optimized: Option<Routine>,
    pub diagnostics: ErrorList,
}

impl CompiledMethod {
    /// The entry callers should prefer.
    pub fn preferred(&self) -> &Routine {
        self.optimized.as_ref().unwrap_or(&self.standard)
    }
}

pub struct JitCompiler {
    ts: Arc<TypeSystem>,
    config: JitConfig,
}

impl JitCompiler {
    pub fn new(ts: Arc<TypeSystem>, config: JitConfig) -> Self {
        Self { ts, config }
    }

    pub fn type_system(&self) -> &Arc<TypeSystem> {
        &self.ts
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compile a method of the type system by name.
    pub fn compile_named(&self, name: &str) -> Result<CompiledMethod, JitError> {
        let method = self
            .ts
            .find_method(name)
            .ok_or_else(|| JitError::UnknownMethod(name.to_string()))?;
        self.compile(method)
    }

    /// Compile every method of one module.
    pub fn compile_module(&self, module: &ModuleStructure) -> Result<Vec<CompiledMethod>, JitError> {
        module.methods.iter().map(|m| self.compile(m)).collect()
    }

    /// Compile every method the type system owns.
    pub fn compile_all(&self) -> Result<Vec<CompiledMethod>, JitError> {
        let mut compiled = Vec::new();
        for loader in self.ts.owned() {
            compiled.extend(self.compile_module(&loader.module)?);
        }
        Ok(compiled)
    }

    pub fn compile(&self, method: &MethodBody) -> Result<CompiledMethod, JitError> {
        let desc = self.ts.method_desc(method);
        tracing::debug!(
            method = method.name.as_str(),
            ops = method.ops.len(),
            optimized = desc.is_optimized(),
            "compiling"
        );
        let matrix = self.compute_types(method)?;

        let (standard, mut diagnostics) = self.generate(method, matrix.clone(), false)?;
        let optimized = if self.config.optimize.is_on() && desc.is_optimized() {
            let (routine, extra) = self.generate(method, matrix, true)?;
            diagnostics.merge(&extra);
            Some(routine)
        } else {
            None
        };
        Ok(CompiledMethod {
            name: method.name.clone(),
            desc,
            standard,
            optimized,
            diagnostics,
        })
    }

    // ========================================
    // Type flow
    // ========================================

    /// Record the type of every live register at every reachable op.
    ///
    /// Fails with `NotConverged` if the recorded types are still widening
    /// after `max_type_passes` passes.
    pub fn compute_types(&self, method: &MethodBody) -> Result<TypeMatrix, JitError> {
        let targets = jump_targets(method)?;
        let mut matrix = TypeMatrix::new();

        for (index, param) in method.params.iter().enumerate() {
            let mut ty = resolve(method, &param.ty);
            if param.default.as_ref().is_some_and(|d| *d != Constant::Null) {
                ty = ty.remove_nullable();
            }
            matrix.declare(TypeMatrix::ENTRY, index as RegId, ty);
        }
        if !method.is_function {
            let this = method.this_type.clone().unwrap_or_else(Type::object);
            matrix.declare(TypeMatrix::ENTRY, A_THIS, this);
        }

        let max = self.config.max_type_passes;
        for pass in 1..=max {
            let reached = matrix.addresses().count();
            let mut widened = self.type_pass(method, &targets, &mut matrix)?;
            widened |= matrix.addresses().count() != reached;
            tracing::trace!(method = method.name.as_str(), pass, widened, "type pass");
            if !widened {
                return Ok(matrix);
            }
        }
        Err(JitError::NotConverged {
            method: method.name.clone(),
            passes: max,
        })
    }

    /// One forward pass. Returns whether any recorded type changed.
    fn type_pass(
        &self,
        method: &MethodBody,
        targets: &BTreeSet<usize>,
        matrix: &mut TypeMatrix,
    ) -> Result<bool, JitError> {
        let mut flow = TypeFlow {
            method,
            targets,
            stack: Vec::new(),
            scopes: Vec::new(),
            top_reg: method.params.len() as RegId,
            declared: HashMap::new(),
            changed: false,
        };
        matrix.at(TypeMatrix::ENTRY);
        flow.note(matrix.follow(0));

        for (addr, op) in method.ops.iter().enumerate() {
            if !matrix.is_reached(addr as i32) {
                // scope structure is lexical
                match op {
                    Op::Enter => flow.scopes.push(flow.top_reg),
                    Op::Exit => {
                        flow.top_reg = flow.scopes.pop().ok_or(JitError::ScopeUnderflow)?;
                    }
                    _ => {}
                }
                continue;
            }
            matrix.at(addr as i32);
            flow.step(&self.ts, matrix, addr, op)
                .map_err(|e| op_error(method, addr, e))?;
        }
        Ok(flow.changed)
    }

    // ========================================
    // Code generation
    // ========================================

    fn generate(
        &self,
        method: &MethodBody,
        matrix: TypeMatrix,
        optimized: bool,
    ) -> Result<(Routine, ErrorList), JitError> {
        let targets = jump_targets(method)?;
        let mut ctx = BuildContext::new(&self.ts, method, &self.config, optimized, matrix);
        ctx.enter_method()?;

        for (addr, op) in method.ops.iter().enumerate() {
            let reached = ctx.matrix.is_reached(addr as i32);
            if !reached && !matches!(op, Op::Enter | Op::Exit) {
                continue;
            }
            ctx.at(addr);
            if reached && targets.contains(&addr) {
                let label = ctx.ensure_label(addr);
                ctx.code.bind(label);
            }
            if self.config.trace_codegen {
                tracing::trace!(method = method.name.as_str(), addr, ?op, "generate");
            }
            build_op(&mut ctx, op).map_err(|e| op_error(method, addr, e))?;
        }

        let end = method.ops.len();
        if ctx.matrix.is_reached(end as i32) {
            ctx.at(end);
            if targets.contains(&end) {
                let label = ctx.ensure_label(end);
                ctx.code.bind(label);
            }
            if !method.returns.is_empty() {
                return Err(op_error(
                    method,
                    end,
                    JitError::unsupported("control reaches the end of a method with results"),
                ));
            }
            ctx.code.emit(Insn::Return(None));
        }
        ctx.exit_method();
        ctx.finish()
    }
}

fn build_op(ctx: &mut BuildContext<'_>, op: &Op) -> Result<(), JitError> {
    match op {
        Op::Nop => {}
        Op::Enter => ctx.enter_scope(),
        Op::Exit => ctx.exit_scope()?,
        Op::Var { reg, ty, name } => {
            ctx.introduce_var(*reg, ty, name.as_deref())?;
        }
        Op::Move { from, to } => ctx.move_var(*from, *to)?,
        Op::Binary { kind, lhs, rhs, ret } => ctx.build_binary(*kind, *lhs, *rhs, *ret)?,
        Op::Unary { kind, arg, ret } => ctx.build_unary(*kind, *arg, *ret)?,
        Op::Jump { target } => ctx.build_jump(*target),
        Op::JumpIf { cond, when, target } => ctx.build_jump_if(*cond, *when, *target)?,
        Op::JumpNull { arg, when, target } => ctx.build_jump_null(*arg, *when, *target)?,
        Op::Ref {
            reg,
            ty,
            name,
            annotation,
        } => {
            ctx.introduce_ref(*reg, name, ty, annotation)?;
        }
        Op::Call {
            method,
            args,
            returns,
        } => ctx.build_call(method, args, returns)?,
        Op::Return { values } => ctx.build_return(values)?,
    }
    Ok(())
}

fn op_error(method: &MethodBody, addr: usize, source: JitError) -> JitError {
    JitError::Op {
        method: method.name.clone(),
        addr,
        source: Box::new(source),
    }
}

/// Every jump target of a method. A target may be one past the last op.
fn jump_targets(method: &MethodBody) -> Result<BTreeSet<usize>, JitError> {
    let mut targets = BTreeSet::new();
    for (addr, op) in method.ops.iter().enumerate() {
        if let Some(target) = op.jump_target() {
            if target > method.ops.len() {
                return Err(JitError::InvalidJump { addr, target });
            }
            targets.insert(target);
        }
    }
    Ok(targets)
}

fn resolve(method: &MethodBody, ty: &Type) -> Type {
    if method.formals.is_empty() {
        ty.clone()
    } else {
        ty.resolve_formals(&method.formals)
    }
}

/// State of one type-flow pass.
struct TypeFlow<'m> {
    method: &'m MethodBody,
    targets: &'m BTreeSet<usize>,
    /// Types of pending `A_STACK` values
    stack: Vec<Type>,
    /// Register threshold of each enclosing scope
    scopes: Vec<RegId>,
    top_reg: RegId,
    /// Declared types of variables
    declared: HashMap<RegId, Type>,
    changed: bool,
}

impl TypeFlow<'_> {
    fn note(&mut self, widened: BTreeSet<RegId>) {
        self.changed |= !widened.is_empty();
    }

    fn step(&mut self, ts: &TypeSystem, matrix: &mut TypeMatrix, addr: usize, op: &Op) -> Result<(), JitError> {
        let next = addr + 1;
        match op {
            Op::Nop => self.fall(matrix, next),
            Op::Enter => {
                self.scopes.push(self.top_reg);
                self.fall(matrix, next);
            }
            Op::Exit => {
                let threshold = self.scopes.pop().ok_or(JitError::ScopeUnderflow)?;
                self.fall(matrix, next);
                matrix.remove_registers(next as i32, threshold);
                self.top_reg = threshold;
            }
            Op::Var { reg, ty, .. } | Op::Ref { reg, ty, .. } => {
                let ty = resolve(self.method, ty);
                self.declared.insert(*reg, ty.clone());
                self.define(matrix, next, *reg, ty)?;
            }
            Op::Move { from, to } => {
                let src = self.arg_type(matrix, addr, *from)?;
                let ty = match self.declared.get(to) {
                    Some(declared) if !src.is_a(declared) => declared.clone(),
                    _ => src,
                };
                self.define(matrix, next, *to, ty)?;
            }
            Op::Binary { kind, lhs, rhs, ret } => {
                let l = self.arg_type(matrix, addr, *lhs)?;
                let r = self.arg_type(matrix, addr, *rhs)?;
                let ty = result_type(*kind, &l, &r)?;
                self.define(matrix, next, *ret, ty)?;
            }
            Op::Unary { arg, ret, .. } => {
                let ty = self.arg_type(matrix, addr, *arg)?;
                self.define(matrix, next, *ret, ty)?;
            }
            Op::Jump { target } => {
                let widened = matrix.follow(*target as i32);
                self.note(widened);
            }
            Op::JumpIf { cond, target, .. } => {
                self.arg_type(matrix, addr, *cond)?;
                self.fall(matrix, next);
                let widened = matrix.follow(*target as i32);
                self.note(widened);
            }
            Op::JumpNull { arg, when, target } => {
                let ty = self.arg_type(matrix, addr, *arg)?;
                let non_null = ty.remove_nullable();
                let (null_edge, value_edge) = if *when { (*target, next) } else { (next, *target) };
                let widened = matrix.follow(null_edge as i32);
                self.note(widened);
                let widened = matrix.merge(value_edge as i32, *arg, non_null);
                self.note(widened);
            }
            Op::Call {
                method,
                args,
                returns,
            } => {
                let callee = ts
                    .find_method(method)
                    .ok_or_else(|| JitError::UnknownMethod(method.clone()))?;
                for &arg in args {
                    if arg != A_DEFAULT {
                        self.arg_type(matrix, addr, arg)?;
                    }
                }
                if returns.is_empty() {
                    self.fall(matrix, next);
                }
                for (i, &reg) in returns.iter().enumerate() {
                    let ty = callee
                        .returns
                        .get(i)
                        .map(|t| resolve(callee, t))
                        .ok_or(JitError::InvalidIndex { what: "return", index: i })?;
                    self.define(matrix, next, reg, ty)?;
                }
            }
            Op::Return { values } => {
                for &value in values {
                    self.arg_type(matrix, addr, value)?;
                }
            }
        }
        Ok(())
    }

    fn fall(&mut self, matrix: &mut TypeMatrix, next: usize) {
        let widened = matrix.follow(next as i32);
        self.note(widened);
    }

    /// Record a definition of `reg` flowing into `dest`.
    fn define(&mut self, matrix: &mut TypeMatrix, dest: usize, reg: RegId, ty: Type) -> Result<(), JitError> {
        let widened = match reg {
            A_STACK => {
                self.stack.push(ty);
                matrix.follow(dest as i32)
            }
            A_IGNORE => matrix.follow(dest as i32),
            r if r >= 0 => {
                self.top_reg = self.top_reg.max(r + 1);
                if self.targets.contains(&dest) {
                    matrix.merge(dest as i32, r, ty)
                } else {
                    matrix.declare(dest as i32, r, ty)
                }
            }
            other => return Err(JitError::unsupported(format!("result register {other}"))),
        };
        self.note(widened);
        Ok(())
    }

    fn arg_type(&mut self, matrix: &TypeMatrix, addr: usize, arg: ArgId) -> Result<Type, JitError> {
        if arg >= 0 {
            return matrix
                .get(arg, addr as i32)
                .cloned()
                .ok_or(JitError::UnregisteredRegister(arg));
        }
        if let Some(constant) = self.method.constant(arg) {
            return Ok(constant.ty());
        }
        match arg {
            A_STACK => self
                .stack
                .pop()
                .ok_or_else(|| JitError::unsupported("empty temporary stack")),
            A_THIS => matrix
                .get(A_THIS, addr as i32)
                .cloned()
                .ok_or(JitError::UnregisteredRegister(A_THIS)),
            _ => Err(JitError::UnknownConstant(arg)),
        }
    }
}
