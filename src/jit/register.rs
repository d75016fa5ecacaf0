//! Value locations for logical registers.
//!
//! A register's value lives either in fixed local slots or, transiently, on
//! the operand stack. Multi-slot values keep their optional flag in a
//! separate extension slot. Stores always write the extension first and the
//! value words in reverse order, matching the order values pop off the
//! stack.

use super::codebuf::CodeBuffer;
use super::flavor::{primitive_of, JitFlavor, StackShape};
use super::insn::{Cond, Insn, NativeClass, NativeConst, NativeKind, Slot};
use super::scope::ScopeTree;
use crate::error::JitError;
use crate::ir::{Constant, ConstantPool, RegId};
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// On the operand stack
    Stack,
    /// Stores drop the value
    Discard,
    Local(Slot),
}

/// A value occupying one native location.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleSlot {
    pub reg: RegId,
    pub location: Location,
    pub flavor: JitFlavor,
    pub ty: Type,
    pub class: NativeClass,
    pub name: String,
    /// Substituted when a with-default reference slot holds `null`
    pub default: Option<Constant>,
}

/// A single-word value with a boolean extension slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedSlot {
    pub reg: RegId,
    pub slot: Slot,
    pub ext_slot: Slot,
    pub flavor: JitFlavor,
    pub ty: Type,
    pub class: NativeClass,
    pub name: String,
    pub default: Option<Constant>,
}

/// A value spread over several native words, with an optional extension.
/// No slots means the words are on the operand stack.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipleSlot {
    pub reg: RegId,
    pub slots: Vec<Slot>,
    pub ext_slot: Option<Slot>,
    pub flavor: JitFlavor,
    pub ty: Type,
    pub class: NativeClass,
    pub word_classes: Vec<NativeClass>,
    pub name: String,
    pub default: Option<Constant>,
}

/// A per-load view of a register whose type flow proved a narrower type.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrowedSlot {
    pub slots: Vec<Slot>,
    pub word_classes: Vec<NativeClass>,
    pub flavor: JitFlavor,
    pub ty: Type,
    pub class: NativeClass,
    /// Emit a checked cast after the load
    pub checked: bool,
    pub original: Box<RegisterInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterInfo {
    Single(SingleSlot),
    Extended(ExtendedSlot),
    Multiple(MultipleSlot),
    Narrowed(NarrowedSlot),
}

impl RegisterInfo {
    /// A single value sitting on the operand stack.
    pub fn on_stack(reg: RegId, ty: Type, flavor: JitFlavor, class: NativeClass) -> Self {
        RegisterInfo::Single(SingleSlot {
            reg,
            location: Location::Stack,
            flavor,
            ty,
            class,
            name: String::new(),
            default: None,
        })
    }

    /// Native words sitting on the operand stack.
    pub fn words_on_stack(reg: RegId, ty: Type, class: NativeClass, word_classes: Vec<NativeClass>) -> Self {
        RegisterInfo::Multiple(MultipleSlot {
            reg,
            slots: Vec::new(),
            ext_slot: None,
            flavor: JitFlavor::XvmPrimitive,
            ty,
            class,
            word_classes,
            name: String::new(),
            default: None,
        })
    }

    pub fn reg_id(&self) -> RegId {
        match self {
            RegisterInfo::Single(s) => s.reg,
            RegisterInfo::Extended(s) => s.reg,
            RegisterInfo::Multiple(s) => s.reg,
            RegisterInfo::Narrowed(s) => s.original.reg_id(),
        }
    }

    pub fn ty(&self) -> &Type {
        match self {
            RegisterInfo::Single(s) => &s.ty,
            RegisterInfo::Extended(s) => &s.ty,
            RegisterInfo::Multiple(s) => &s.ty,
            RegisterInfo::Narrowed(s) => &s.ty,
        }
    }

    pub fn flavor(&self) -> JitFlavor {
        match self {
            RegisterInfo::Single(s) => s.flavor,
            RegisterInfo::Extended(s) => s.flavor,
            RegisterInfo::Multiple(s) => s.flavor,
            RegisterInfo::Narrowed(s) => s.flavor,
        }
    }

    pub fn class(&self) -> &NativeClass {
        match self {
            RegisterInfo::Single(s) => &s.class,
            RegisterInfo::Extended(s) => &s.class,
            RegisterInfo::Multiple(s) => &s.class,
            RegisterInfo::Narrowed(s) => &s.class,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RegisterInfo::Single(s) => &s.name,
            RegisterInfo::Extended(s) => &s.name,
            RegisterInfo::Multiple(s) => &s.name,
            RegisterInfo::Narrowed(s) => s.original.name(),
        }
    }

    /// Value slots, extension excluded.
    pub fn slots(&self) -> Vec<Slot> {
        match self {
            RegisterInfo::Single(SingleSlot {
                location: Location::Local(slot),
                ..
            }) => vec![*slot],
            RegisterInfo::Single(_) => Vec::new(),
            RegisterInfo::Extended(s) => vec![s.slot],
            RegisterInfo::Multiple(s) => s.slots.clone(),
            RegisterInfo::Narrowed(s) => s.slots.clone(),
        }
    }

    pub fn ext_slot(&self) -> Option<Slot> {
        match self {
            RegisterInfo::Extended(s) => Some(s.ext_slot),
            RegisterInfo::Multiple(s) => s.ext_slot,
            _ => None,
        }
    }

    pub fn is_on_stack(&self) -> bool {
        match self {
            RegisterInfo::Single(s) => s.location == Location::Stack,
            RegisterInfo::Multiple(s) => s.slots.is_empty(),
            _ => false,
        }
    }

    /// The register behind a narrowed view.
    pub fn original(&self) -> &RegisterInfo {
        match self {
            RegisterInfo::Narrowed(s) => s.original.original(),
            other => other,
        }
    }

    pub fn default(&self) -> Option<&Constant> {
        match self {
            RegisterInfo::Single(s) => s.default.as_ref(),
            RegisterInfo::Extended(s) => s.default.as_ref(),
            RegisterInfo::Multiple(s) => s.default.as_ref(),
            RegisterInfo::Narrowed(_) => None,
        }
    }

    /// Push the value onto the operand stack. Slots are left untouched.
    pub fn load(&self, code: &mut CodeBuffer, pool: &ConstantPool) -> Result<(), JitError> {
        match self {
            RegisterInfo::Single(s) => match s.location {
                Location::Stack => Ok(()),
                Location::Discard => Err(JitError::unsupported("load of a discarded value")),
                Location::Local(slot) => {
                    code.emit(Insn::Load {
                        kind: s.class.kind(),
                        slot,
                    });
                    if s.flavor.has_default() {
                        let done = code.new_label();
                        code.emit(Insn::Dup)
                            .emit(Insn::IfNonNull { target: done })
                            .emit(Insn::Pop);
                        push_boxed_default(code, pool, self.default())?;
                        code.bind(done);
                    }
                    Ok(())
                }
            },
            RegisterInfo::Extended(s) => {
                if s.flavor == JitFlavor::PrimitiveWithDefault {
                    let use_default = code.new_label();
                    let done = code.new_label();
                    code.emit(Insn::Load {
                        kind: NativeKind::Boolean,
                        slot: s.ext_slot,
                    })
                    .emit(Insn::If {
                        cond: Cond::Ne,
                        target: use_default,
                    })
                    .emit(Insn::Load {
                        kind: s.class.kind(),
                        slot: s.slot,
                    })
                    .emit(Insn::Goto(done));
                    code.bind(use_default);
                    push_default_words(code, &s.ty, s.default.as_ref())?;
                    code.bind(done);
                } else {
                    code.emit(Insn::Load {
                        kind: s.class.kind(),
                        slot: s.slot,
                    })
                    .emit(Insn::Load {
                        kind: NativeKind::Boolean,
                        slot: s.ext_slot,
                    });
                }
                Ok(())
            }
            RegisterInfo::Multiple(s) => {
                if s.slots.is_empty() {
                    return Ok(());
                }
                match (s.flavor, s.ext_slot) {
                    (JitFlavor::XvmPrimitiveWithDefault, Some(ext)) => {
                        let use_default = code.new_label();
                        let done = code.new_label();
                        code.emit(Insn::Load {
                            kind: NativeKind::Boolean,
                            slot: ext,
                        })
                        .emit(Insn::If {
                            cond: Cond::Ne,
                            target: use_default,
                        });
                        load_words(code, &s.slots, &s.word_classes);
                        code.emit(Insn::Goto(done));
                        code.bind(use_default);
                        push_default_words(code, &s.ty, s.default.as_ref())?;
                        code.bind(done);
                    }
                    (_, ext) => {
                        load_words(code, &s.slots, &s.word_classes);
                        if let Some(ext) = ext {
                            code.emit(Insn::Load {
                                kind: NativeKind::Boolean,
                                slot: ext,
                            });
                        }
                    }
                }
                Ok(())
            }
            RegisterInfo::Narrowed(s) => {
                load_words(code, &s.slots, &s.word_classes);
                if s.checked {
                    code.emit(Insn::CheckCast(s.ty.clone()));
                }
                Ok(())
            }
        }
    }

    /// Pop the value off the operand stack into the slots.
    pub fn store(&self, code: &mut CodeBuffer) -> Result<(), JitError> {
        match self {
            RegisterInfo::Single(s) => {
                match s.location {
                    Location::Stack => {}
                    Location::Discard => {
                        for _ in 0..stack_width(s.flavor, &s.ty) {
                            code.emit(Insn::Pop);
                        }
                    }
                    Location::Local(slot) => {
                        code.emit(Insn::Store {
                            kind: s.class.kind(),
                            slot,
                        });
                    }
                }
                Ok(())
            }
            RegisterInfo::Extended(s) => {
                code.emit(Insn::Store {
                    kind: NativeKind::Boolean,
                    slot: s.ext_slot,
                })
                .emit(Insn::Store {
                    kind: s.class.kind(),
                    slot: s.slot,
                });
                Ok(())
            }
            RegisterInfo::Multiple(s) => {
                if let Some(ext) = s.ext_slot {
                    code.emit(Insn::Store {
                        kind: NativeKind::Boolean,
                        slot: ext,
                    });
                }
                for (slot, class) in s.slots.iter().zip(&s.word_classes).rev() {
                    code.emit(Insn::Store {
                        kind: class.kind(),
                        slot: *slot,
                    });
                }
                Ok(())
            }
            RegisterInfo::Narrowed(_) => Err(JitError::unsupported("store into a narrowed view")),
        }
    }

    /// Move an on-stack value into freshly allocated slots, returning the
    /// register bound to them. Resident registers are returned unchanged.
    pub fn store_temp_value(&self, code: &mut CodeBuffer, scopes: &mut ScopeTree) -> Result<RegisterInfo, JitError> {
        match self {
            RegisterInfo::Single(s) if s.location == Location::Stack => {
                let slot = scopes.allocate_slots(code, 1);
                let temp = RegisterInfo::Single(SingleSlot {
                    location: Location::Local(slot),
                    ..s.clone()
                });
                temp.store(code)?;
                Ok(temp)
            }
            RegisterInfo::Multiple(s) if s.slots.is_empty() => {
                let base = scopes.allocate_slots(code, s.word_classes.len());
                let slots = (base..base + s.word_classes.len()).collect();
                let temp = RegisterInfo::Multiple(MultipleSlot {
                    slots,
                    ..s.clone()
                });
                temp.store(code)?;
                Ok(temp)
            }
            other => Ok(other.clone()),
        }
    }
}

fn load_words(code: &mut CodeBuffer, slots: &[Slot], classes: &[NativeClass]) {
    for (slot, class) in slots.iter().zip(classes) {
        code.emit(Insn::Load {
            kind: class.kind(),
            slot: *slot,
        });
    }
}

/// Number of stack entries a value of this flavor takes when stored.
pub fn stack_width(flavor: JitFlavor, ty: &Type) -> usize {
    let words = primitive_of(ty).map_or(1, |p| p.word_count());
    match flavor.passed_shape() {
        StackShape::Ref | StackShape::Value => 1,
        StackShape::FlaggedValue => 2,
        StackShape::Words => words,
        StackShape::FlaggedWords => words + 1,
    }
}

/// Push the unboxed words of a default value.
fn push_default_words(code: &mut CodeBuffer, ty: &Type, default: Option<&Constant>) -> Result<(), JitError> {
    let default = default.ok_or_else(|| JitError::unsupported(format!("missing default for {ty}")))?;
    let p = primitive_of(ty).ok_or_else(|| JitError::unsupported(format!("default for {ty}")))?;
    for word in NativeConst::words_of(default, p)? {
        code.emit(Insn::Const(word));
    }
    Ok(())
}

/// Push a default value as a reference.
fn push_boxed_default(code: &mut CodeBuffer, pool: &ConstantPool, default: Option<&Constant>) -> Result<(), JitError> {
    match default {
        None | Some(Constant::Null) => {
            code.emit(Insn::Const(NativeConst::Null));
        }
        Some(c @ (Constant::String(_) | Constant::Type(_))) => {
            code.emit(Insn::Ldc(pool.register(c.clone())));
        }
        Some(c) => {
            let ty = c.ty();
            let p = ty
                .as_primitive()
                .ok_or_else(|| JitError::unsupported(format!("default {c}")))?;
            for word in NativeConst::words_of(c, p)? {
                code.emit(Insn::Const(word));
            }
            code.emit(Insn::Box(p));
        }
    }
    Ok(())
}
