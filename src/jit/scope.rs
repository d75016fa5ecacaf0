//! Lexical scopes and native slot allocation.
//!
//! Scopes live in an arena and refer to their parent by index. A child
//! starts allocating at its parent's current top, so sibling scopes reuse
//! the same slot range while a nested scope never overlaps live slots of an
//! ancestor.

use std::collections::HashMap;

use super::codebuf::CodeBuffer;
use super::insn::{Insn, Label, NativeClass, Slot};
use crate::error::JitError;
use crate::ir::RegId;

pub type ScopeId = usize;

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub depth: usize,
    /// First slot this scope allocates
    pub start_slot: Slot,
    /// Next free slot
    pub top_slot: Slot,
    /// Registers at or above this id were introduced inside the scope
    pub top_reg: RegId,
    /// Start slot of the first child that exited
    pub child_base: Option<Slot>,
    pub start: Label,
    pub end: Label,
    synthetics: HashMap<String, (Slot, NativeClass)>,
}

#[derive(Debug)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    current: ScopeId,
}

impl ScopeTree {
    /// Create the method scope. It allocates after the parameter slots.
    pub fn new(code: &mut CodeBuffer) -> Self {
        let start = code.new_label();
        code.bind(start);
        let end = code.new_label();
        let base = code.max_locals();
        Self {
            scopes: vec![Scope {
                parent: None,
                depth: 0,
                start_slot: base,
                top_slot: base,
                top_reg: 0,
                child_base: None,
                start,
                end,
                synthetics: HashMap::new(),
            }],
            current: 0,
        }
    }

    pub fn current(&self) -> &Scope {
        &self.scopes[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Scope {
        &mut self.scopes[self.current]
    }

    pub fn current_id(&self) -> ScopeId {
        self.current
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id)
    }

    pub fn depth(&self) -> usize {
        self.current().depth
    }

    pub fn enter(&mut self, code: &mut CodeBuffer) -> ScopeId {
        let parent = self.current();
        let start = code.new_label();
        code.bind(start);
        let scope = Scope {
            parent: Some(self.current),
            depth: parent.depth + 1,
            start_slot: parent.top_slot,
            top_slot: parent.top_slot,
            top_reg: parent.top_reg,
            child_base: None,
            start,
            end: code.new_label(),
            synthetics: HashMap::new(),
        };
        self.scopes.push(scope);
        self.current = self.scopes.len() - 1;
        self.current
    }

    /// Close the current scope and return to its parent.
    pub fn exit(&mut self, code: &mut CodeBuffer) -> Result<ScopeId, JitError> {
        let exiting = self.current;
        let scope = &self.scopes[exiting];
        let parent = scope.parent.ok_or(JitError::ScopeUnderflow)?;
        let (start_slot, end, depth) = (scope.start_slot, scope.end, scope.depth);
        self.scopes[parent].child_base.get_or_insert(start_slot);
        code.bind(end);
        code.emit(Insn::ScopeEnd { depth });
        self.current = parent;
        Ok(exiting)
    }

    /// Bind the method scope's end label.
    pub fn finish(&mut self, code: &mut CodeBuffer) {
        let end = self.scopes[0].end;
        code.bind(end);
    }

    /// Allocate `count` consecutive slots in the current scope. The code
    /// buffer only grows past its high-water mark.
    pub fn allocate_slots(&mut self, code: &mut CodeBuffer, count: usize) -> Slot {
        let scope = self.current_mut();
        let slot = scope.top_slot;
        scope.top_slot += count;
        let top = scope.top_slot;
        code.reserve_locals(top);
        slot
    }

    /// Allocate slots for a register, recording it as introduced here.
    pub fn allocate_local(&mut self, code: &mut CodeBuffer, reg: RegId, count: usize) -> Slot {
        let scope = self.current_mut();
        if reg >= scope.top_reg {
            scope.top_reg = reg + 1;
        }
        self.allocate_slots(code, count)
    }

    /// A named compiler temporary, reused within the current scope.
    pub fn allocate_synthetic(&mut self, code: &mut CodeBuffer, name: &str, class: NativeClass) -> Slot {
        if let Some((slot, existing)) = self.current().synthetics.get(name) {
            if *existing == class {
                return *slot;
            }
        }
        let slot = self.allocate_slots(code, 1);
        self.current_mut()
            .synthetics
            .insert(name.to_string(), (slot, class));
        slot
    }

    /// Look up a synthetic in the current scope or any ancestor.
    pub fn synthetic(&self, name: &str) -> Option<Slot> {
        let mut id = Some(self.current);
        while let Some(scope) = id.and_then(|i| self.scopes.get(i)) {
            if let Some((slot, _)) = scope.synthetics.get(name) {
                return Some(*slot);
            }
            id = scope.parent;
        }
        None
    }
}
