//! JIT and registry configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Whether the optimized calling convention is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeMode {
    /// Only the standard (boxed) convention is generated
    Off,
    /// Primitives are passed unboxed when their types permit
    #[default]
    On,
}

impl OptimizeMode {
    pub fn is_on(self) -> bool {
        self == OptimizeMode::On
    }
}

/// Configuration shared by the compiler and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub optimize: OptimizeMode,
    /// Log every generated op at trace level
    pub trace_codegen: bool,
    /// Cap on type-flow fixpoint passes per method
    pub max_type_passes: usize,
    pub lock_pool_size: usize,
    pub container_sweep_interval: usize,
    pub type_system_sweep_interval: usize,
    pub loader_sweep_interval: usize,
    /// Module every type system shares
    pub core_module: String,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            optimize: OptimizeMode::On,
            trace_codegen: false,
            max_type_passes: 8,
            lock_pool_size: 61,
            container_sweep_interval: 1024,
            type_system_sweep_interval: 1024,
            loader_sweep_interval: 256,
            core_module: "ecstasy.xtclang.org".to_string(),
        }
    }
}

impl JitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.optimize.is_on());
        assert_eq!(config.max_type_passes, 8);
        assert_eq!(config.lock_pool_size, 61);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = JitConfig::from_toml_str("optimize = \"off\"\nmax_type_passes = 3\n").unwrap();
        assert_eq!(config.optimize, OptimizeMode::Off);
        assert_eq!(config.max_type_passes, 3);
        assert_eq!(config.core_module, "ecstasy.xtclang.org");
    }

    #[test]
    fn test_bad_toml() {
        assert!(JitConfig::from_toml_str("optimize = 7").is_err());
    }
}
