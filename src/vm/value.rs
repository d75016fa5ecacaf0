use std::fmt;
use std::sync::Arc;

use crate::ir::Constant;
use crate::jit::insn::NativeKind;
use crate::types::{Primitive, Type};

/// A heap object of the reference executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Str(String),
    /// A boxed integer primitive, as two's-complement bits
    Num { ty: Primitive, value: i128 },
    Float { ty: Primitive, value: f64 },
    Bool(bool),
    Char(char),
    /// A type literal
    Type(Type),
    /// An injected resource
    Resource { ty: Type, name: String },
    /// The execution context passed as every routine's first argument
    Context,
}

impl Object {
    /// The runtime type of the object.
    pub fn ty(&self) -> Type {
        match self {
            Object::Str(_) => Type::string(),
            Object::Num { ty, .. } | Object::Float { ty, .. } => Type::Primitive(*ty),
            Object::Bool(_) => Type::Primitive(Primitive::Boolean),
            Object::Char(_) => Type::Primitive(Primitive::Char),
            Object::Type(_) => Type::class("Type"),
            Object::Resource { ty, .. } => ty.clone(),
            Object::Context => Type::class("Ctx"),
        }
    }

    /// The object for a constant, `None` for `Null`.
    pub fn from_constant(constant: &Constant) -> Option<Object> {
        let object = match constant {
            Constant::Null => return None,
            Constant::Bool(b) => Object::Bool(*b),
            Constant::Char(c) => Object::Char(*c),
            Constant::Int { ty, value } => Object::Num { ty: *ty, value: *value },
            Constant::Float { ty, value } => Object::Float { ty: *ty, value: value.0 },
            Constant::String(s) => Object::Str(s.clone()),
            Constant::Type(t) => Object::Type(t.clone()),
        };
        Some(object)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Str(s) => f.write_str(s),
            Object::Num { value, .. } => write!(f, "{value}"),
            Object::Float { value, .. } => write!(f, "{value}"),
            Object::Bool(b) => write!(f, "{b}"),
            Object::Char(c) => write!(f, "{c}"),
            Object::Type(t) => write!(f, "{t}"),
            Object::Resource { name, .. } => write!(f, "<resource {name}>"),
            Object::Context => f.write_str("<ctx>"),
        }
    }
}

/// One operand-stack or local-slot value. Booleans are ints.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Option<Arc<Object>>),
}

impl Value {
    pub fn null() -> Self {
        Value::Ref(None)
    }

    pub fn object(object: Object) -> Self {
        Value::Ref(Some(Arc::new(object)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::object(Object::Str(s.into()))
    }

    pub fn bool(b: bool) -> Self {
        Value::Int(b as i32)
    }

    /// Boxed integer primitive.
    pub fn boxed(ty: Primitive, value: i128) -> Self {
        Value::object(Object::Num { ty, value })
    }

    /// Low and high words of a 128-bit value.
    pub fn wide(value: i128) -> (Value, Value) {
        let bits = value as u128;
        (
            Value::Long(bits as u64 as i64),
            Value::Long((bits >> 64) as u64 as i64),
        )
    }

    /// The zero value of a native kind.
    pub fn zero(kind: NativeKind) -> Self {
        match kind {
            NativeKind::Boolean | NativeKind::Int => Value::Int(0),
            NativeKind::Long => Value::Long(0),
            NativeKind::Float => Value::Float(0.0),
            NativeKind::Double => Value::Double(0.0),
            NativeKind::Ref => Value::Ref(None),
        }
    }

    pub fn kind(&self) -> NativeKind {
        match self {
            Value::Int(_) => NativeKind::Int,
            Value::Long(_) => NativeKind::Long,
            Value::Float(_) => NativeKind::Float,
            Value::Double(_) => NativeKind::Double,
            Value::Ref(_) => NativeKind::Ref,
        }
    }

    /// Whether the value can live in a slot of `kind`.
    pub fn fits(&self, kind: NativeKind) -> bool {
        let own = self.kind();
        own == kind || (own == NativeKind::Int && kind == NativeKind::Boolean)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Ref(None))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Ref(r) => r.as_ref(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Ref(None) => "null",
            Value::Ref(Some(_)) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Ref(None), Value::Ref(None)) => true,
            (Value::Ref(Some(a)), Value::Ref(Some(b))) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Long(n) => write!(f, "{n}L"),
            Value::Float(n) => write!(f, "{n}f"),
            Value::Double(n) => write!(f, "{n}"),
            Value::Ref(None) => f.write_str("null"),
            Value::Ref(Some(o)) => write!(f, "{o}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_words() {
        let (lo, hi) = Value::wide(-1);
        assert_eq!(lo, Value::Long(-1));
        assert_eq!(hi, Value::Long(-1));
        let (lo, hi) = Value::wide(1 << 64);
        assert_eq!(lo, Value::Long(0));
        assert_eq!(hi, Value::Long(1));
    }

    #[test]
    fn test_boolean_slots_hold_ints() {
        assert!(Value::bool(true).fits(NativeKind::Boolean));
        assert!(Value::Int(3).fits(NativeKind::Int));
        assert!(!Value::Long(3).fits(NativeKind::Int));
    }

    #[test]
    fn test_equality_by_content() {
        assert_eq!(Value::string("a"), Value::string("a"));
        assert_ne!(Value::string("a"), Value::null());
        assert_ne!(Value::Int(1), Value::Long(1));
    }

    #[test]
    fn test_object_types() {
        assert_eq!(Object::Str("x".into()).ty(), Type::string());
        assert_eq!(
            Object::from_constant(&Constant::int64(4)),
            Some(Object::Num { ty: Primitive::Int64, value: 4 })
        );
        assert_eq!(Object::from_constant(&Constant::Null), None);
    }
}
