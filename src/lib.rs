//! xjit - a JIT core for XVM modules
//!
//! This library links XVM modules into type systems, derives native calling
//! conventions for their methods and generates routines for a typed stack
//! machine. A reference executor runs the generated routines inside
//! containers.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ir;
pub mod jit;
pub mod link;
pub mod types;
pub mod vm;

// Re-export commonly used types
pub use config::{JitConfig, OptimizeMode};
pub use diagnostics::{Diagnostic, ErrorList, Severity};
pub use error::{ConfigError, InjectError, JitError, MachineError, RepositoryError, XvmError};
pub use jit::{CompiledMethod, JitCompiler};
pub use link::{Linker, ModuleStructure, TypeSystem, Xvm};
pub use types::{Primitive, Type};
pub use vm::{Container, Injector, Machine, Value};
