//! Codegen flavors: how a source type's values live in native storage.

use serde::Serialize;

use super::insn::NativeClass;
use crate::types::{Primitive, Type, OBJECT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JitFlavor {
    /// A reference to a single known class
    Specific,
    /// A reference to a union, held as a common superclass
    Widened,
    /// One unboxed native word
    Primitive,
    /// An unboxed word followed by a boolean "is null" flag
    MultiSlotPrimitive,
    /// A primitive spread across several native words
    XvmPrimitive,
    /// Several native words followed by a boolean "is null" flag
    NullableXvmPrimitive,
    SpecificWithDefault,
    WidenedWithDefault,
    /// An unboxed word followed by a boolean "use default" flag
    PrimitiveWithDefault,
    /// Several native words followed by a boolean "use default" flag
    XvmPrimitiveWithDefault,
    /// The `Null` type; only ever holds `Null`
    AlwaysNull,
}

/// Layout of a value on the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StackShape {
    Ref,
    Value,
    /// Value and a boolean flag on top
    FlaggedValue,
    Words,
    /// Words and a boolean flag on top
    FlaggedWords,
}

impl JitFlavor {
    pub const fn can_optimize(self) -> bool {
        matches!(
            self,
            JitFlavor::Primitive
                | JitFlavor::MultiSlotPrimitive
                | JitFlavor::XvmPrimitive
                | JitFlavor::NullableXvmPrimitive
                | JitFlavor::PrimitiveWithDefault
                | JitFlavor::XvmPrimitiveWithDefault
        )
    }

    pub const fn is_multi_slot(self) -> bool {
        matches!(
            self,
            JitFlavor::MultiSlotPrimitive
                | JitFlavor::XvmPrimitive
                | JitFlavor::NullableXvmPrimitive
                | JitFlavor::PrimitiveWithDefault
                | JitFlavor::XvmPrimitiveWithDefault
        )
    }

    pub const fn has_default(self) -> bool {
        matches!(
            self,
            JitFlavor::SpecificWithDefault
                | JitFlavor::WidenedWithDefault
                | JitFlavor::PrimitiveWithDefault
                | JitFlavor::XvmPrimitiveWithDefault
        )
    }

    /// The with-default counterpart of a flavor.
    pub fn with_default(self) -> Self {
        match self {
            JitFlavor::Specific => JitFlavor::SpecificWithDefault,
            JitFlavor::Widened => JitFlavor::WidenedWithDefault,
            JitFlavor::Primitive => JitFlavor::PrimitiveWithDefault,
            JitFlavor::XvmPrimitive => JitFlavor::XvmPrimitiveWithDefault,
            other => other,
        }
    }

    /// What a load leaves on the stack. Defaults are already resolved.
    pub const fn loaded_shape(self) -> StackShape {
        match self {
            JitFlavor::Specific
            | JitFlavor::Widened
            | JitFlavor::SpecificWithDefault
            | JitFlavor::WidenedWithDefault
            | JitFlavor::AlwaysNull => StackShape::Ref,
            JitFlavor::Primitive | JitFlavor::PrimitiveWithDefault => StackShape::Value,
            JitFlavor::MultiSlotPrimitive => StackShape::FlaggedValue,
            JitFlavor::XvmPrimitive | JitFlavor::XvmPrimitiveWithDefault => StackShape::Words,
            JitFlavor::NullableXvmPrimitive => StackShape::FlaggedWords,
        }
    }

    /// What a store or a parameter of this flavor takes from the stack.
    pub const fn passed_shape(self) -> StackShape {
        match self {
            JitFlavor::PrimitiveWithDefault => StackShape::FlaggedValue,
            JitFlavor::XvmPrimitiveWithDefault => StackShape::FlaggedWords,
            other => other.loaded_shape(),
        }
    }
}

/// Classification of one source type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitTypeDesc {
    pub ty: Type,
    pub flavor: JitFlavor,
    /// The value class: the native word for single-word primitives, the
    /// boxed or widened class otherwise
    pub class: NativeClass,
    /// Native class of every storage slot, flag included
    pub slots: Vec<NativeClass>,
}

/// Classify a source type into its codegen flavor.
///
/// Rules apply in order: native primitive, nullable native primitive,
/// multi-word primitive (plain or nullable), `Null`, a single class, and
/// finally a widened union. With `optimize` off every primitive is boxed.
pub fn classify(ty: &Type, optimize: bool) -> JitTypeDesc {
    if optimize {
        if let Some(p) = ty.as_primitive() {
            return match NativeClass::of_primitive(p) {
                Some(class) => desc(ty, JitFlavor::Primitive, class.clone(), vec![class]),
                None => desc(ty, JitFlavor::XvmPrimitive, NativeClass::boxed(p), NativeClass::words(p)),
            };
        }
        if let Some(p) = ty.nullable_primitive() {
            return match NativeClass::of_primitive(p) {
                Some(class) => desc(
                    ty,
                    JitFlavor::MultiSlotPrimitive,
                    class.clone(),
                    vec![class, NativeClass::Boolean],
                ),
                None => {
                    let mut slots = NativeClass::words(p);
                    slots.push(NativeClass::Boolean);
                    desc(ty, JitFlavor::NullableXvmPrimitive, NativeClass::boxed(p), slots)
                }
            };
        }
    }
    if *ty == Type::Null {
        let class = NativeClass::object("Nullable");
        return desc(ty, JitFlavor::AlwaysNull, class.clone(), vec![class]);
    }
    if let Some(name) = ty.single_class() {
        let class = NativeClass::object(name);
        return desc(ty, JitFlavor::Specific, class.clone(), vec![class]);
    }
    let class = widened_class(ty);
    desc(ty, JitFlavor::Widened, class.clone(), vec![class])
}

fn desc(ty: &Type, flavor: JitFlavor, class: NativeClass, slots: Vec<NativeClass>) -> JitTypeDesc {
    JitTypeDesc {
        ty: ty.clone(),
        flavor,
        class,
        slots,
    }
}

/// The class shared by every non-null member, or `Object`.
fn widened_class(ty: &Type) -> NativeClass {
    if let Type::Union(members) = ty {
        let mut classes = members
            .iter()
            .filter(|m| **m != Type::Null)
            .map(Type::single_class);
        if let Some(Some(first)) = classes.next() {
            if classes.all(|c| c == Some(first)) {
                return NativeClass::object(first);
            }
        }
    }
    NativeClass::object(OBJECT)
}

/// The primitive behind a type that classified as one of the primitive
/// flavors.
pub fn primitive_of(ty: &Type) -> Option<Primitive> {
    ty.as_primitive().or_else(|| ty.nullable_primitive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(s: &str) -> Type {
        s.parse().unwrap()
    }

    #[test]
    fn test_flag_invariant() {
        for flavor in [
            JitFlavor::Specific,
            JitFlavor::Widened,
            JitFlavor::Primitive,
            JitFlavor::MultiSlotPrimitive,
            JitFlavor::XvmPrimitive,
            JitFlavor::NullableXvmPrimitive,
            JitFlavor::SpecificWithDefault,
            JitFlavor::WidenedWithDefault,
            JitFlavor::PrimitiveWithDefault,
            JitFlavor::XvmPrimitiveWithDefault,
            JitFlavor::AlwaysNull,
        ] {
            assert!(!flavor.is_multi_slot() || flavor.can_optimize(), "{flavor:?}");
        }
    }

    #[test]
    fn test_classify_primitives() {
        let d = classify(&ty("Int32"), true);
        assert_eq!(d.flavor, JitFlavor::Primitive);
        assert_eq!(d.class, NativeClass::Int);

        let d = classify(&ty("Int64?"), true);
        assert_eq!(d.flavor, JitFlavor::MultiSlotPrimitive);
        assert_eq!(d.slots, vec![NativeClass::Long, NativeClass::Boolean]);

        let d = classify(&ty("Int128"), true);
        assert_eq!(d.flavor, JitFlavor::XvmPrimitive);
        assert_eq!(d.slots.len(), 2);

        let d = classify(&ty("UInt128?"), true);
        assert_eq!(d.flavor, JitFlavor::NullableXvmPrimitive);
        assert_eq!(d.slots.len(), 3);
    }

    #[test]
    fn test_classify_references() {
        let d = classify(&ty("String"), true);
        assert_eq!(d.flavor, JitFlavor::Specific);
        assert_eq!(d.class, NativeClass::object("String"));

        let d = classify(&ty("String?"), true);
        assert_eq!(d.flavor, JitFlavor::Widened);
        assert_eq!(d.class, NativeClass::object("String"));

        let d = classify(&ty("Int32|String"), true);
        assert_eq!(d.flavor, JitFlavor::Widened);
        assert_eq!(d.class, NativeClass::object(OBJECT));

        assert_eq!(classify(&Type::Null, true).flavor, JitFlavor::AlwaysNull);
        assert_eq!(classify(&ty("$T"), true).flavor, JitFlavor::Widened);
    }

    #[test]
    fn test_classify_without_optimization() {
        let d = classify(&ty("Int32"), false);
        assert_eq!(d.flavor, JitFlavor::Specific);
        assert_eq!(d.class, NativeClass::object("Int32"));
        assert_eq!(classify(&ty("Int64?"), false).flavor, JitFlavor::Widened);
    }

    #[test]
    fn test_classify_is_deterministic() {
        for s in ["Int8", "Boolean?", "Int128", "String|Null", "Char"] {
            assert_eq!(classify(&ty(s), true), classify(&ty(s), true));
        }
    }

    #[test]
    fn test_shapes() {
        assert_eq!(JitFlavor::PrimitiveWithDefault.loaded_shape(), StackShape::Value);
        assert_eq!(JitFlavor::PrimitiveWithDefault.passed_shape(), StackShape::FlaggedValue);
        assert_eq!(JitFlavor::NullableXvmPrimitive.passed_shape(), StackShape::FlaggedWords);
    }
}
