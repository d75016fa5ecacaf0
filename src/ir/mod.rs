//! The XVM intermediate representation consumed by the JIT.

pub mod constant;
pub mod method;
pub mod op;

pub use constant::{Constant, ConstantId, ConstantPool, FloatValue};
pub use method::{MethodBody, Parameter};
pub use op::*;
