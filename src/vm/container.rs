//! Containers: the runtime scope a type system executes in.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::injector::Injector;
use super::value::Object;
use crate::error::InjectError;
use crate::link::TypeSystem;
use crate::types::Type;

pub struct Container {
    id: i32,
    parent: Option<Arc<Container>>,
    type_system: Arc<TypeSystem>,
    injector: Arc<dyn Injector>,
    /// Resources already injected, by type and name
    injected: Mutex<HashMap<(Type, String), Arc<Object>>>,
    allocated: AtomicUsize,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("type_system", &self.type_system.name())
            .finish()
    }
}

impl Container {
    pub(crate) fn new(
        id: i32,
        parent: Option<Arc<Container>>,
        type_system: Arc<TypeSystem>,
        injector: Arc<dyn Injector>,
    ) -> Self {
        Self {
            id,
            parent,
            type_system,
            injector,
            injected: Mutex::new(HashMap::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Container>> {
        self.parent.as_ref()
    }

    pub fn type_system(&self) -> &Arc<TypeSystem> {
        &self.type_system
    }

    pub fn injector(&self) -> &Arc<dyn Injector> {
        &self.injector
    }

    /// The native container: no parent.
    pub fn is_core(&self) -> bool {
        self.parent.is_none()
    }

    /// A direct child of the native container.
    pub fn is_main(&self) -> bool {
        self.parent.as_ref().is_some_and(|p| p.is_core())
    }

    pub fn is_nested(&self) -> bool {
        self.parent.as_ref().is_some_and(|p| !p.is_core())
    }

    /// Resolve a resource, asking the injector at most once per type and
    /// name.
    pub fn inject(&self, ty: &Type, name: &str) -> Result<Arc<Object>, InjectError> {
        let key = (ty.clone(), name.to_string());
        let mut injected = self.injected.lock();
        if let Some(resource) = injected.get(&key) {
            return Ok(Arc::clone(resource));
        }
        let resource = self
            .injector
            .inject(ty, name)
            .ok_or_else(|| InjectError::UnknownResource {
                ty: ty.to_string(),
                name: name.to_string(),
            })?;
        tracing::trace!(container = self.id, name, %ty, "injected resource");
        injected.insert(key, Arc::clone(&resource));
        Ok(resource)
    }

    /// Account for an allocation. Returns the total now allocated.
    pub fn alloc(&self, bytes: usize) -> usize {
        self.allocated.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Account for a release. Returns the total still allocated.
    pub fn free(&self, bytes: usize) -> usize {
        let previous = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(bytes)))
            .unwrap_or_default();
        previous.saturating_sub(bytes)
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::injector::{FailEverythingInjector, ResourceInjector};

    fn ts() -> Arc<TypeSystem> {
        TypeSystem::standalone(Vec::new(), true)
    }

    #[derive(Debug, Default)]
    struct CountingInjector {
        calls: AtomicUsize,
    }

    impl Injector for CountingInjector {
        fn inject(&self, ty: &Type, name: &str) -> Option<Arc<Object>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Some(Arc::new(Object::Resource {
                ty: ty.clone(),
                name: name.to_string(),
            }))
        }
    }

    #[test]
    fn test_tree_queries() {
        let core = Arc::new(Container::new(-1, None, ts(), Arc::new(FailEverythingInjector)));
        let main = Arc::new(Container::new(0, Some(Arc::clone(&core)), ts(), Arc::new(ResourceInjector::new())));
        let nested = Container::new(1, Some(Arc::clone(&main)), ts(), Arc::new(ResourceInjector::new()));
        assert!(core.is_core() && !core.is_main() && !core.is_nested());
        assert!(main.is_main() && !main.is_nested());
        assert!(nested.is_nested() && !nested.is_main());
        assert_eq!(nested.parent().map(|p| p.id()), Some(0));
    }

    #[test]
    fn test_inject_once() {
        let injector = Arc::new(CountingInjector::default());
        let c = Container::new(0, None, ts(), injector.clone());
        let clock = Type::class("Clock");
        let a = c.inject(&clock, "clock").unwrap();
        let b = c.inject(&clock, "clock").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(injector.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_inject_unknown() {
        let c = Container::new(-1, None, ts(), Arc::new(FailEverythingInjector));
        let err = c.inject(&Type::class("Console"), "console").unwrap_err();
        assert_eq!(
            err,
            InjectError::UnknownResource {
                ty: "Console".into(),
                name: "console".into()
            }
        );
    }

    #[test]
    fn test_alloc_accounting() {
        let c = Container::new(0, None, ts(), Arc::new(FailEverythingInjector));
        assert_eq!(c.alloc(64), 64);
        assert_eq!(c.alloc(16), 80);
        assert_eq!(c.free(100), 0);
        assert_eq!(c.allocated(), 0);
    }
}
