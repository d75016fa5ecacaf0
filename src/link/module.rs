//! Module structures: the unit of linking.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::typesystem::TypeSystem;
use crate::ir::MethodBody;

fn default_true() -> bool {
    true
}

/// A module's dependency on another module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub name: String,
    /// Accepted versions; any version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionReq>,
    #[serde(default)]
    pub optional: bool,
    /// The module's own hint whether an optional dependency should be followed
    #[serde(default = "default_true")]
    pub desired: bool,
    /// Only followed when this conditional-compilation name is defined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl ModuleDependency {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            optional: false,
            desired: true,
            condition: None,
        }
    }

    pub fn optional(name: impl Into<String>, desired: bool) -> Self {
        Self {
            optional: true,
            desired,
            ..Self::required(name)
        }
    }

    pub fn with_version(mut self, req: VersionReq) -> Self {
        self.version = Some(req);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// The structural description of one module version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStructure {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
    /// Conditional-compilation names the module tests
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodBody>,
    /// Private copies of dependencies carried along with the module
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedded: Vec<ModuleStructure>,
    #[serde(skip)]
    defined: BTreeSet<String>,
    #[serde(skip)]
    digest: Option<String>,
}

/// The part of a module that identifies its content.
#[derive(Serialize)]
struct DigestView<'a> {
    name: &'a str,
    version: &'a Version,
    dependencies: &'a [ModuleDependency],
    conditions: &'a [String],
    classes: &'a [String],
    methods: &'a [MethodBody],
    defined: &'a BTreeSet<String>,
}

impl ModuleStructure {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            dependencies: Vec::new(),
            conditions: Vec::new(),
            classes: Vec::new(),
            methods: Vec::new(),
            embedded: Vec::new(),
            defined: BTreeSet::new(),
            digest: None,
        }
    }

    pub fn with_dependency(mut self, dep: ModuleDependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_method(mut self, method: MethodBody) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Sort key: name, then version.
    pub fn identity(&self) -> (&str, &Version) {
        (&self.name, &self.version)
    }

    pub fn method(&self, name: &str) -> Option<&MethodBody> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn declares_class(&self, name: &str) -> bool {
        self.classes.iter().any(|c| c == name)
    }

    pub fn embedded_module(&self, name: &str) -> Option<&ModuleStructure> {
        self.embedded.iter().find(|m| m.name == name)
    }

    /// Record which of the module's conditions are defined and compute its
    /// content digest.
    pub fn refine(&mut self, is_defined: impl Fn(&str) -> bool) {
        self.defined = self
            .conditions
            .iter()
            .filter(|c| is_defined(c))
            .cloned()
            .collect();
        self.digest = Some(self.compute_digest());
    }

    pub fn is_refined(&self) -> bool {
        self.digest.is_some()
    }

    /// Conditions found defined by `refine`.
    pub fn defined_conditions(&self) -> &BTreeSet<String> {
        &self.defined
    }

    /// Hex SHA-256 of the refined content.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    fn compute_digest(&self) -> String {
        let view = DigestView {
            name: &self.name,
            version: &self.version,
            dependencies: &self.dependencies,
            conditions: &self.conditions,
            classes: &self.classes,
            methods: &self.methods,
            defined: &self.defined,
        };
        // A `Value` orders object keys, so map fields hash the same in any order.
        let canonical = serde_json::to_value(&view)
            .and_then(|value| serde_json::to_vec(&value))
            .unwrap_or_default();
        let hash = Sha256::digest(&canonical);
        hash.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Replace the embedded copy of `canonical`'s module with `canonical`.
    /// Returns false when the module carries no such copy.
    pub fn graft(&mut self, canonical: &ModuleStructure) -> bool {
        match self.embedded.iter_mut().find(|m| m.name == canonical.name) {
            Some(copy) => {
                *copy = canonical.clone();
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for ModuleStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// A refined module bound to its native package name and to the type
/// system that owns it.
#[derive(Debug)]
pub struct ModuleLoader {
    pub module: ModuleStructure,
    pub package: String,
    pub(crate) type_system: Weak<TypeSystem>,
}

impl ModuleLoader {
    pub fn type_system(&self) -> Option<Arc<TypeSystem>> {
        self.type_system.upgrade()
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    pub fn digest(&self) -> Option<&str> {
        self.module.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Primitive, Type};

    fn module(name: &str) -> ModuleStructure {
        ModuleStructure::new(name, Version::new(1, 0, 0))
    }

    #[test]
    fn test_digest_depends_on_content_and_conditions() {
        let mut a = module("app").with_condition("debug");
        let mut b = a.clone();
        a.refine(|_| false);
        b.refine(|_| false);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().map(str::len), Some(64));

        b.refine(|c| c == "debug");
        assert_ne!(a.digest(), b.digest());
        assert!(b.defined_conditions().contains("debug"));

        let mut c = module("app")
            .with_condition("debug")
            .with_method(MethodBody::new("f").with_return(Type::Primitive(Primitive::Int64)));
        c.refine(|_| false);
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_digest_ignores_formals_order() {
        let mut m1 = MethodBody::new("f");
        let mut m2 = MethodBody::new("f");
        for (k, v) in [("A", "Int64"), ("B", "String"), ("C", "Char")] {
            m1.formals.insert(k.to_string(), v.parse().unwrap());
        }
        for (k, v) in [("C", "Char"), ("A", "Int64"), ("B", "String")] {
            m2.formals.insert(k.to_string(), v.parse().unwrap());
        }
        let mut a = module("x").with_method(m1);
        let mut b = module("x").with_method(m2);
        a.refine(|_| false);
        b.refine(|_| false);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_graft_replaces_embedded_copy() {
        let mut core = module("core").with_class("Object");
        core.refine(|_| false);
        let mut app = module("app");
        app.embedded.push(module("core"));
        assert!(app.graft(&core));
        assert_eq!(app.embedded_module("core").and_then(|m| m.digest()), core.digest());
        assert!(!app.graft(&module("other")));
    }

    #[test]
    fn test_manifest_toml() {
        let text = r#"
name = "app.example.org"
version = "1.2.0-beta.1"
conditions = ["test"]

[[dependencies]]
name = "json.example.org"
version = ">=1.0"
optional = true
desired = false
"#;
        let m: ModuleStructure = toml::from_str(text).unwrap();
        assert_eq!(m.version.pre.as_str(), "beta.1");
        assert!(m.dependencies[0].optional);
        assert!(!m.dependencies[0].desired);
        assert!(!m.is_refined());
        let back = toml::to_string_pretty(&m).unwrap();
        assert!(back.contains("name = \"app.example.org\""));
    }
}
