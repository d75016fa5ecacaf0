//! Method bodies as delivered by the module metadata provider.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::constant::Constant;
use super::op::{constant_arg, constant_index, ArgId, Op};
use crate::types::Type;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
    /// Value used when the caller passes `A_DEFAULT`
    #[serde(default)]
    pub default: Option<Constant>,
}

fn default_true() -> bool {
    true
}

/// A method: its signature, local constants and op stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Parameter>,
    #[serde(default)]
    pub returns: Vec<Type>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    #[serde(default)]
    pub ops: Vec<Op>,
    #[serde(default = "default_true")]
    pub is_function: bool,
    #[serde(default)]
    pub is_constructor: bool,
    /// Type of `this` for methods and constructors
    #[serde(default)]
    pub this_type: Option<Type>,
    /// Formal type bindings known at this method
    #[serde(default)]
    pub formals: HashMap<String, Type>,
}

impl MethodBody {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: Vec::new(),
            constants: Vec::new(),
            ops: Vec::new(),
            is_function: true,
            is_constructor: false,
            this_type: None,
            formals: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty,
            default: None,
        });
        self
    }

    pub fn with_default_param(mut self, name: impl Into<String>, ty: Type, default: Constant) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty,
            default: Some(default),
        });
        self
    }

    pub fn with_return(mut self, ty: Type) -> Self {
        self.returns.push(ty);
        self
    }

    pub fn with_ops(mut self, ops: Vec<Op>) -> Self {
        self.ops = ops;
        self
    }

    /// Add a local constant, returning the argument id that refers to it.
    pub fn add_constant(&mut self, constant: Constant) -> ArgId {
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return constant_arg(index);
        }
        self.constants.push(constant);
        constant_arg(self.constants.len() - 1)
    }

    pub fn constant(&self, arg: ArgId) -> Option<&Constant> {
        constant_index(arg).and_then(|i| self.constants.get(i))
    }

    pub fn required_param_count(&self) -> usize {
        self.params.iter().take_while(|p| p.default.is_none()).count()
    }
}
