//! Resource injectors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::value::Object;
use crate::types::Type;

/// Supplies the resources `@Inject` variables ask for.
pub trait Injector: Send + Sync + fmt::Debug {
    /// The resource of the given type and name, if there is one.
    fn inject(&self, ty: &Type, name: &str) -> Option<Arc<Object>>;
}

/// Knows no resources. Used by the native container.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailEverythingInjector;

impl Injector for FailEverythingInjector {
    fn inject(&self, _ty: &Type, _name: &str) -> Option<Arc<Object>> {
        None
    }
}

/// Resources registered by name. A request matches when the registered
/// resource's type is a subtype of the requested one.
#[derive(Debug, Default)]
pub struct ResourceInjector {
    resources: RwLock<HashMap<String, (Type, Arc<Object>)>>,
}

impl ResourceInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(self, ty: Type, name: &str, value: Object) -> Self {
        self.provide(ty, name, value);
        self
    }

    /// Register or replace a resource.
    pub fn provide(&self, ty: Type, name: &str, value: Object) {
        self.resources
            .write()
            .insert(name.to_string(), (ty, Arc::new(value)));
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Injector for ResourceInjector {
    fn inject(&self, ty: &Type, name: &str) -> Option<Arc<Object>> {
        let resources = self.resources.read();
        let (provided, value) = resources.get(name)?;
        provided.is_a(ty).then(|| Arc::clone(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_everything() {
        assert!(FailEverythingInjector.inject(&Type::string(), "anything").is_none());
    }

    #[test]
    fn test_resource_lookup_checks_type() {
        let console = Type::class("Console");
        let injector = ResourceInjector::new().with_resource(
            console.clone(),
            "console",
            Object::Resource {
                ty: console.clone(),
                name: "console".into(),
            },
        );
        assert!(injector.inject(&console, "console").is_some());
        assert!(injector.inject(&Type::object(), "console").is_some());
        assert!(injector.inject(&Type::string(), "console").is_none());
        assert!(injector.inject(&console, "clock").is_none());
        assert_eq!(injector.len(), 1);
    }
}
