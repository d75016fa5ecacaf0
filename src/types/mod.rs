//! Source-level type model for XVM method bodies.
//!
//! Types are kept in a canonical form so that structural equality is also
//! semantic equality: unions are flattened, sorted and de-duplicated, and a
//! nullable type `T?` is just the union of `Null` and `T`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Name of the root class; every type is assignable to it.
pub const OBJECT: &str = "Object";

/// Built-in primitive types with a native representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Boolean,
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    Float32,
    Float64,
}

impl Primitive {
    pub const ALL: [Primitive; 14] = [
        Primitive::Boolean,
        Primitive::Char,
        Primitive::Int8,
        Primitive::Int16,
        Primitive::Int32,
        Primitive::Int64,
        Primitive::Int128,
        Primitive::UInt8,
        Primitive::UInt16,
        Primitive::UInt32,
        Primitive::UInt64,
        Primitive::UInt128,
        Primitive::Float32,
        Primitive::Float64,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Boolean => "Boolean",
            Primitive::Char => "Char",
            Primitive::Int8 => "Int8",
            Primitive::Int16 => "Int16",
            Primitive::Int32 => "Int32",
            Primitive::Int64 => "Int64",
            Primitive::Int128 => "Int128",
            Primitive::UInt8 => "UInt8",
            Primitive::UInt16 => "UInt16",
            Primitive::UInt32 => "UInt32",
            Primitive::UInt64 => "UInt64",
            Primitive::UInt128 => "UInt128",
            Primitive::Float32 => "Float32",
            Primitive::Float64 => "Float64",
        }
    }

    /// Look up a primitive by name. `Int` and `UInt` alias the 64-bit types.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Int" => Some(Primitive::Int64),
            "UInt" => Some(Primitive::UInt64),
            _ => Self::ALL.iter().copied().find(|p| p.name() == name),
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Primitive::UInt8
                | Primitive::UInt16
                | Primitive::UInt32
                | Primitive::UInt64
                | Primitive::UInt128
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::Float32 | Primitive::Float64)
    }

    /// Integer family, including `Char`.
    pub fn is_integer(self) -> bool {
        !self.is_float() && self != Primitive::Boolean
    }

    /// Width of the logical value in bits.
    pub fn bit_width(self) -> u32 {
        match self {
            Primitive::Boolean => 1,
            Primitive::Char => 21,
            Primitive::Int8 | Primitive::UInt8 => 8,
            Primitive::Int16 | Primitive::UInt16 => 16,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float32 => 32,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Float64 => 64,
            Primitive::Int128 | Primitive::UInt128 => 128,
        }
    }

    /// Number of native words a value occupies.
    pub fn word_count(self) -> usize {
        if self.bit_width() > 64 { 2 } else { 1 }
    }

    pub fn is_wide(self) -> bool {
        self.word_count() > 1
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A source type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    /// The type of the `Null` value
    Null,
    Primitive(Primitive),
    /// A named class
    Class(String),
    /// An unresolved formal type parameter: `$Element`
    Formal(String),
    /// A normalized union of two or more members, none of which is a union
    Union(Vec<Type>),
}

impl Type {
    pub fn object() -> Type {
        Type::Class(OBJECT.to_string())
    }

    pub fn string() -> Type {
        Type::Class("String".to_string())
    }

    pub fn class(name: impl Into<String>) -> Type {
        Type::Class(name.into())
    }

    pub fn formal(name: impl Into<String>) -> Type {
        Type::Formal(name.into())
    }

    /// `T?`
    pub fn nullable(inner: Type) -> Type {
        Type::union_of([Type::Null, inner])
    }

    /// Union of this type and another.
    pub fn union(&self, other: &Type) -> Type {
        Type::union_of([self.clone(), other.clone()])
    }

    /// Normalized union of any number of types.
    ///
    /// A union containing `Object` collapses to `Object`.
    pub fn union_of(types: impl IntoIterator<Item = Type>) -> Type {
        let mut members = BTreeSet::new();
        for ty in types {
            match ty {
                Type::Union(inner) => members.extend(inner),
                other => {
                    members.insert(other);
                }
            }
        }
        if members.contains(&Type::object()) {
            return Type::object();
        }
        if members.len() == 1 {
            if let Some(single) = members.pop_first() {
                return single;
            }
        }
        Type::Union(members.into_iter().collect())
    }

    /// Subtyping. A union is a subtype if every member is; a type is a
    /// subtype of a union if it is a subtype of some member.
    pub fn is_a(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Union(members), _) => members.iter().all(|m| m.is_a(other)),
            (_, Type::Union(members)) => members.iter().any(|m| self.is_a(m)),
            (_, Type::Class(name)) if name == OBJECT => true,
            (a, b) => a == b,
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            Type::Null => true,
            Type::Union(members) => members.contains(&Type::Null),
            _ => false,
        }
    }

    /// This type without `Null`. `Null` itself is returned unchanged.
    pub fn remove_nullable(&self) -> Type {
        match self {
            Type::Union(members) => {
                Type::union_of(members.iter().filter(|m| **m != Type::Null).cloned())
            }
            other => other.clone(),
        }
    }

    pub fn as_primitive(&self) -> Option<Primitive> {
        match self {
            Type::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    /// `P` for a type of the exact form `P?`.
    pub fn nullable_primitive(&self) -> Option<Primitive> {
        match self {
            Type::Union(members) if members.len() == 2 && members[0] == Type::Null => {
                members[1].as_primitive()
            }
            _ => None,
        }
    }

    /// The class name for a type with exactly one underlying class.
    /// Primitives answer their boxed class.
    pub fn single_class(&self) -> Option<&str> {
        match self {
            Type::Class(name) => Some(name),
            Type::Primitive(p) => Some(p.name()),
            _ => None,
        }
    }

    pub fn contains_formal(&self) -> bool {
        match self {
            Type::Formal(_) => true,
            Type::Union(members) => members.iter().any(Type::contains_formal),
            _ => false,
        }
    }

    /// Substitute bound formal types. Unbound formals are left in place.
    pub fn resolve_formals(&self, bindings: &HashMap<String, Type>) -> Type {
        match self {
            Type::Formal(name) => bindings.get(name).cloned().unwrap_or_else(|| self.clone()),
            Type::Union(members) => {
                Type::union_of(members.iter().map(|m| m.resolve_formals(bindings)))
            }
            other => other.clone(),
        }
    }
}

impl From<Primitive> for Type {
    fn from(p: Primitive) -> Self {
        Type::Primitive(p)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Null => f.write_str("Null"),
            Type::Primitive(p) => f.write_str(p.name()),
            Type::Class(name) => f.write_str(name),
            Type::Formal(name) => write!(f, "${name}"),
            Type::Union(members) => {
                if members.len() == 2 && members[0] == Type::Null {
                    return write!(f, "{}?", members[1]);
                }
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str("|")?;
                    }
                    write!(f, "{m}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid type '{0}'")]
pub struct TypeParseError(pub String);

fn is_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | ':'))
}

fn parse_simple(name: &str) -> Result<Type, TypeParseError> {
    if name == "Null" {
        return Ok(Type::Null);
    }
    if let Some(formal) = name.strip_prefix('$') {
        return if is_type_name(formal) {
            Ok(Type::Formal(formal.to_string()))
        } else {
            Err(TypeParseError(name.to_string()))
        };
    }
    if let Some(p) = Primitive::from_name(name) {
        return Ok(Type::Primitive(p));
    }
    if is_type_name(name) {
        Ok(Type::Class(name.to_string()))
    } else {
        Err(TypeParseError(name.to_string()))
    }
}

impl FromStr for Type {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut members = Vec::new();
        for part in s.split('|') {
            let part = part.trim();
            let (base, nullable) = match part.strip_suffix('?') {
                Some(base) => (base.trim_end(), true),
                None => (part, false),
            };
            if base.is_empty() {
                return Err(TypeParseError(s.to_string()));
            }
            members.push(parse_simple(base)?);
            if nullable {
                members.push(Type::Null);
            }
        }
        Ok(Type::union_of(members))
    }
}

impl Serialize for Type {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Type {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
