//! Error types for the JIT core, the linker registry and the reference executor.

use std::path::PathBuf;

use thiserror::Error;

use crate::ir::{ArgId, RegId};

/// Failures raised while computing calling conventions or generating code.
#[derive(Debug, Error)]
pub enum JitError {
    /// A code shape the generator does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("register {0} is not registered")]
    UnregisteredRegister(RegId),

    #[error("unknown constant argument {0}")]
    UnknownConstant(ArgId),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// A descriptor accessor was asked for an index it does not have.
    #[error("invalid {what} index {index}")]
    InvalidIndex { what: &'static str, index: usize },

    #[error("exit of the outermost scope")]
    ScopeUnderflow,

    #[error("label {0} is referenced but never bound")]
    UnboundLabel(usize),

    #[error("type flow for '{method}' did not converge after {passes} passes")]
    NotConverged { method: String, passes: usize },

    #[error("jump target {target} is out of range at op {addr}")]
    InvalidJump { addr: usize, target: usize },

    /// Failure of a single op, tagged with its method and address.
    #[error("{method}@{addr}: {source}")]
    Op {
        method: String,
        addr: usize,
        #[source]
        source: Box<JitError>,
    },
}

impl JitError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        JitError::Unsupported(what.into())
    }

    /// The innermost error, skipping the op-address wrappers.
    pub fn root(&self) -> &JitError {
        match self {
            JitError::Op { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Runtime faults of the reference executor.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("code point {0:#x} is out of range")]
    CodePointOutOfRange(i64),

    #[error("division by zero")]
    DivisionByZero,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("unknown routine '{0}'")]
    UnknownRoutine(String),

    #[error("label {0} is not bound")]
    UnboundLabel(usize),

    #[error("unknown constant {0}")]
    UnknownConstant(u32),

    #[error("return carrier slot {0} is empty")]
    EmptyCarrier(usize),

    #[error(transparent)]
    Inject(#[from] InjectError),
}

/// Failures of a module repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse module manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize module '{name}': {source}")]
    Serialize {
        name: String,
        #[source]
        source: toml::ser::Error,
    },
}

/// Failures loading a [`crate::config::JitConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures of the process-wide registry.
#[derive(Debug, Error)]
pub enum XvmError {
    #[error("illegal container id {0}")]
    IllegalContainerId(i32),

    #[error("core module '{0}' is not in the repository")]
    MissingCoreModule(String),

    #[error("failed to link '{module}': {errors}")]
    Link {
        module: String,
        errors: crate::diagnostics::ErrorList,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Failures resolving an injected resource.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error("unknown resource '{name}' of type {ty}")]
    UnknownResource { ty: String, name: String },
}
