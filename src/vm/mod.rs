//! Runtime side: containers, resource injection and the reference
//! executor for generated routines.

pub mod container;
pub mod injector;
pub mod machine;
pub mod value;

pub use container::Container;
pub use injector::{FailEverythingInjector, Injector, ResourceInjector};
pub use machine::{Machine, RoutineTable};
pub use value::{Object, Value};
