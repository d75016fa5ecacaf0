//! The XVM JIT core.
//!
//! Methods are compiled to routines over a small typed stack machine:
//! - calling conventions (`desc`) derived from type flavors (`flavor`)
//! - register and scope bookkeeping for one method (`register`, `scope`)
//! - a flow-sensitive type matrix driving narrowing (`matrix`)
//! - numeric codegen, including 128-bit arithmetic (`number`, `int128`)

pub mod codebuf;
pub mod compiler;
pub mod context;
pub mod desc;
pub mod flavor;
pub mod insn;
pub mod int128;
pub mod matrix;
pub mod number;
pub mod register;
pub mod scope;

pub use codebuf::{CodeBuffer, NativeSignature, Routine};
pub use compiler::{CompiledMethod, JitCompiler};
pub use context::BuildContext;
pub use desc::{JitMethodDesc, JitParamDesc, MethodKind};
pub use flavor::{classify, JitFlavor, JitTypeDesc};
pub use insn::{Builtin, Insn, NativeClass, NativeKind};
pub use matrix::TypeMatrix;
