//! Code buffer for building native routines.
//!
//! Instructions are appended in order. Labels may be referenced before they
//! are bound; `finish` resolves them and rejects any branch to a label that
//! was never bound.

use serde::Serialize;

use super::insn::{Insn, Label, NativeClass, Slot};
use crate::error::JitError;

/// Debug-info entry for a named local.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalVar {
    pub slot: Slot,
    pub name: String,
    pub class: NativeClass,
    pub start: Label,
    pub end: Label,
}

/// Native call signature: implicit parameters first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeSignature {
    pub params: Vec<NativeClass>,
    pub ret: Option<NativeClass>,
}

/// A buffer for building one routine.
#[derive(Debug)]
pub struct CodeBuffer {
    insns: Vec<Insn>,
    /// Label id -> instruction index, once bound
    labels: Vec<Option<usize>>,
    param_slots: usize,
    max_locals: usize,
    local_vars: Vec<LocalVar>,
}

impl CodeBuffer {
    /// Create a buffer whose first `param_slots` locals hold the arguments.
    pub fn new(param_slots: usize) -> Self {
        Self {
            insns: Vec::new(),
            labels: Vec::new(),
            param_slots,
            max_locals: param_slots,
            local_vars: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Get the current offset (for labels).
    pub fn offset(&self) -> usize {
        self.insns.len()
    }

    pub fn emit(&mut self, insn: Insn) -> &mut Self {
        self.insns.push(insn);
        self
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: Label) {
        if let Some(entry) = self.labels.get_mut(label.0) {
            *entry = Some(self.insns.len());
        }
    }

    pub fn is_bound(&self, label: Label) -> bool {
        matches!(self.labels.get(label.0), Some(Some(_)))
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    /// Local slot holding the native parameter at `index`.
    pub fn parameter_slot(&self, index: usize) -> Slot {
        index
    }

    pub fn param_slots(&self) -> usize {
        self.param_slots
    }

    pub fn max_locals(&self) -> usize {
        self.max_locals
    }

    /// Make sure locals `0..top` exist. Returns true if storage grew.
    pub fn reserve_locals(&mut self, top: usize) -> bool {
        if top > self.max_locals {
            self.max_locals = top;
            true
        } else {
            false
        }
    }

    pub fn local_variable(&mut self, slot: Slot, name: &str, class: NativeClass, start: Label, end: Label) {
        self.local_vars.push(LocalVar {
            slot,
            name: name.to_string(),
            class,
            start,
            end,
        });
    }

    /// Resolve labels and produce the finished routine.
    pub fn finish(self, name: impl Into<String>, signature: NativeSignature) -> Result<Routine, JitError> {
        for insn in &self.insns {
            if let Some(target) = insn.branch_target() {
                if !self.is_bound(target) {
                    return Err(JitError::UnboundLabel(target.0));
                }
            }
        }
        let end = self.insns.len();
        let labels: Vec<usize> = self.labels.iter().map(|l| l.unwrap_or(end)).collect();
        let bound = |label: Label| self.labels.get(label.0).copied().flatten().is_some();
        let local_vars = self
            .local_vars
            .iter()
            .filter(|v| bound(v.start))
            .cloned()
            .collect();
        Ok(Routine {
            name: name.into(),
            insns: self.insns,
            labels,
            max_locals: self.max_locals,
            param_slots: self.param_slots,
            local_vars,
            signature,
        })
    }
}

/// A finished routine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Routine {
    pub name: String,
    pub insns: Vec<Insn>,
    /// Instruction index of every label
    pub labels: Vec<usize>,
    pub max_locals: usize,
    pub param_slots: usize,
    /// Locals that were assigned somewhere in the routine
    pub local_vars: Vec<LocalVar>,
    pub signature: NativeSignature,
}

impl Routine {
    pub fn target(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::insn::{NativeConst, NativeKind};

    fn signature() -> NativeSignature {
        NativeSignature {
            params: vec![NativeClass::object("Ctx")],
            ret: None,
        }
    }

    #[test]
    fn test_forward_label() {
        let mut buf = CodeBuffer::new(1);
        let end = buf.new_label();
        buf.emit(Insn::Goto(end));
        buf.emit(Insn::Const(NativeConst::Int(1))).emit(Insn::Pop);
        buf.bind(end);
        buf.emit(Insn::Return(None));
        let routine = buf.finish("f", signature()).unwrap();
        assert_eq!(routine.target(end), Some(3));
    }

    #[test]
    fn test_unbound_label() {
        let mut buf = CodeBuffer::new(1);
        let missing = buf.new_label();
        buf.emit(Insn::IfNull { target: missing });
        match buf.finish("f", signature()) {
            Err(JitError::UnboundLabel(0)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_reserve_locals() {
        let mut buf = CodeBuffer::new(2);
        assert_eq!(buf.max_locals(), 2);
        assert!(!buf.reserve_locals(2));
        assert!(buf.reserve_locals(4));
        assert_eq!(buf.max_locals(), 4);
    }

    #[test]
    fn test_unassigned_locals_dropped() {
        let mut buf = CodeBuffer::new(1);
        let start = buf.new_label();
        let never = buf.new_label();
        let end = buf.new_label();
        buf.local_variable(1, "x", NativeClass::Long, start, end);
        buf.local_variable(2, "y", NativeClass::Long, never, end);
        buf.bind(start);
        buf.emit(Insn::Store { kind: NativeKind::Long, slot: 1 });
        buf.bind(end);
        let routine = buf.finish("f", signature()).unwrap();
        assert_eq!(routine.local_vars.len(), 1);
        assert_eq!(routine.local_vars[0].name, "x");
    }
}
