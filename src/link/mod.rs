//! Linking modules into type systems, and the registry that owns them.

pub mod linker;
pub mod module;
pub mod refiner;
pub mod repository;
pub mod typesystem;
pub mod xvm;

pub use linker::{Linker, ModuleSpec};
pub use module::{ModuleDependency, ModuleLoader, ModuleStructure};
pub use refiner::{DefaultRefiner, Refiner, ReleaseCategory};
pub use repository::{DirRepository, MemoryRepository, ModuleRepository};
pub use typesystem::TypeSystem;
pub use xvm::{module_to_package_name, Xvm};
