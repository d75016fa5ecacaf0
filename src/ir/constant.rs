//! Constants and the type-system-wide constant pool.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{Primitive, Type};

/// Id of a constant registered in a [`ConstantPool`].
pub type ConstantId = u32;

/// A float compared and hashed by its bit pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloatValue(pub f64);

impl PartialEq for FloatValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatValue {}

impl Hash for FloatValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// 128-bit values travel as decimal strings; TOML integers stop at 64 bits.
mod wide {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable constant value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Constant {
    Null,
    Bool(bool),
    Char(char),
    /// An integer of the given primitive type, as two's-complement bits
    Int {
        ty: Primitive,
        #[serde(with = "wide")]
        value: i128,
    },
    Float {
        ty: Primitive,
        value: FloatValue,
    },
    String(String),
    Type(Type),
}

impl Constant {
    pub fn int(ty: Primitive, value: i128) -> Self {
        Constant::Int { ty, value }
    }

    pub fn int64(value: i64) -> Self {
        Constant::Int {
            ty: Primitive::Int64,
            value: value as i128,
        }
    }

    pub fn float64(value: f64) -> Self {
        Constant::Float {
            ty: Primitive::Float64,
            value: FloatValue(value),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Constant::String(value.into())
    }

    /// The source type of this constant.
    pub fn ty(&self) -> Type {
        match self {
            Constant::Null => Type::Null,
            Constant::Bool(_) => Type::Primitive(Primitive::Boolean),
            Constant::Char(_) => Type::Primitive(Primitive::Char),
            Constant::Int { ty, .. } | Constant::Float { ty, .. } => Type::Primitive(*ty),
            Constant::String(_) => Type::string(),
            Constant::Type(_) => Type::class("Type"),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => f.write_str("Null"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Char(c) => write!(f, "'{c}'"),
            Constant::Int { ty, value } => write!(f, "{value}:{ty}"),
            Constant::Float { ty, value } => write!(f, "{}:{ty}", value.0),
            Constant::String(s) => write!(f, "{s:?}"),
            Constant::Type(t) => write!(f, "{t}.class"),
        }
    }
}

#[derive(Debug, Default)]
struct PoolEntries {
    values: Vec<Arc<Constant>>,
    ids: HashMap<Constant, ConstantId>,
}

/// A de-duplicating constant pool shared by everything compiled in one
/// type system. Ids are stable for the pool's lifetime.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: RwLock<PoolEntries>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constant, returning the id of an equal constant if one
    /// is already present.
    pub fn register(&self, constant: Constant) -> ConstantId {
        if let Some(id) = self.entries.read().ids.get(&constant) {
            return *id;
        }
        let mut entries = self.entries.write();
        if let Some(id) = entries.ids.get(&constant) {
            return *id;
        }
        let id = entries.values.len() as ConstantId;
        entries.values.push(Arc::new(constant.clone()));
        entries.ids.insert(constant, id);
        id
    }

    pub fn get(&self, id: ConstantId) -> Option<Arc<Constant>> {
        self.entries.read().values.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
