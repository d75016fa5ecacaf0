//! Building a type system from a main module and its dependencies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use semver::{Prerelease, Version};

use super::module::{ModuleDependency, ModuleLoader, ModuleStructure};
use super::refiner::{DefaultRefiner, Refiner};
use super::repository::ModuleRepository;
use super::typesystem::TypeSystem;
use super::xvm::Xvm;
use crate::diagnostics::{
    ErrorList, Severity, LNK_DEP_MISSING, LNK_EMPTY, LNK_MAIN_EXISTS, LNK_MODULE_LOAD, LNK_NOREPO,
    LNK_REDEF,
};

/// A module named for loading or given directly.
#[derive(Debug, Clone)]
pub enum ModuleSpec {
    Name(String),
    Structure(ModuleStructure),
}

impl From<&str> for ModuleSpec {
    fn from(name: &str) -> Self {
        ModuleSpec::Name(name.to_string())
    }
}

impl From<String> for ModuleSpec {
    fn from(name: String) -> Self {
        ModuleSpec::Name(name)
    }
}

impl From<ModuleStructure> for ModuleSpec {
    fn from(module: ModuleStructure) -> Self {
        ModuleSpec::Structure(module)
    }
}

/// A fluent builder for one type system.
///
/// Shared modules come first, then condition definitions, then exactly one
/// main module and any number of further modules. The first error-severity
/// diagnostic latches the linker bad: later calls change nothing and
/// [`Linker::link`] fails.
pub struct Linker<'a> {
    xvm: &'a Xvm,
    repo: Option<Arc<dyn ModuleRepository>>,
    refiner: Arc<dyn Refiner>,
    defines: BTreeMap<String, bool>,
    shared: Vec<Arc<ModuleLoader>>,
    modules: Vec<ModuleStructure>,
    errors: ErrorList,
    bad: bool,
}

impl<'a> Linker<'a> {
    pub(crate) fn new(xvm: &'a Xvm) -> Self {
        Self {
            xvm,
            repo: Some(Arc::clone(xvm.system_repo())),
            refiner: Arc::new(DefaultRefiner),
            defines: BTreeMap::new(),
            shared: Vec::new(),
            modules: Vec::new(),
            errors: ErrorList::default(),
            bad: false,
        }
    }

    fn log(&mut self, severity: Severity, code: &'static str, params: Vec<String>) {
        if self.errors.log(severity, code, params) {
            self.bad = true;
        }
    }

    pub fn errors(&self) -> &ErrorList {
        &self.errors
    }

    pub fn is_bad(&self) -> bool {
        self.bad || self.errors.has_errors()
    }

    // ----- shared modules -----

    /// Share every module of an existing type system, shared and owned.
    pub fn add_shared_modules(self, ts: &TypeSystem) -> Self {
        ts.shared()
            .iter()
            .chain(ts.owned())
            .fold(self, |linker, loader| linker.add_shared_module(Arc::clone(loader)))
    }

    pub fn add_shared_module(mut self, loader: Arc<ModuleLoader>) -> Self {
        if !self.is_bad() && !self.shared.iter().any(|l| Arc::ptr_eq(l, &loader)) {
            tracing::trace!(module = loader.name(), "linker shares module");
            self.shared.push(loader);
        }
        self
    }

    // ----- conditions -----

    /// Define or undefine a condition name. Changing a definition is a
    /// warning before any module is added and an error after.
    pub fn define(mut self, name: &str, defined: bool) -> Self {
        if self.is_bad() {
            return self;
        }
        if self.defines.get(name).is_some_and(|old| *old != defined) {
            let severity = if self.modules.is_empty() {
                Severity::Warning
            } else {
                Severity::Error
            };
            self.log(severity, LNK_REDEF, vec![name.to_string()]);
        }
        self.defines.insert(name.to_string(), defined);
        self
    }

    pub fn define_all<'n>(self, names: impl IntoIterator<Item = &'n str>, defined: bool) -> Self {
        names
            .into_iter()
            .fold(self, |linker, name| linker.define(name, defined))
    }

    pub fn undefine(self, name: &str) -> Self {
        self.define(name, false)
    }

    /// Whether the linker has a definition for the name either way.
    pub fn specified(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    pub fn defined(&self, name: &str) -> bool {
        self.defines.get(name) == Some(&true)
    }

    pub fn undefined(&self, name: &str) -> bool {
        self.defines.get(name) == Some(&false)
    }

    pub fn defines(&self) -> &BTreeMap<String, bool> {
        &self.defines
    }

    // ----- policy -----

    pub fn with_repo(mut self, repo: Arc<dyn ModuleRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Drop the repository; dependencies then resolve only from embedded copies.
    pub fn without_repo(mut self) -> Self {
        self.repo = None;
        self
    }

    pub fn repo(&self) -> Option<&Arc<dyn ModuleRepository>> {
        self.repo.as_ref()
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refiner = refiner;
        self
    }

    pub fn refiner(&self) -> &Arc<dyn Refiner> {
        &self.refiner
    }

    // ----- modules -----

    /// The main module. A second main module is an error.
    pub fn with_main(mut self, module: impl Into<ModuleSpec>) -> Self {
        if self.is_bad() {
            return self;
        }
        if let Some(main) = self.modules.first() {
            let existing = main.name.clone();
            let requested = match module.into() {
                ModuleSpec::Name(name) => name,
                ModuleSpec::Structure(m) => m.name,
            };
            self.log(Severity::Error, LNK_MAIN_EXISTS, vec![existing, requested]);
            return self;
        }
        self.add_module(module)
    }

    pub fn add_module(mut self, module: impl Into<ModuleSpec>) -> Self {
        if self.is_bad() {
            return self;
        }
        let module = match module.into() {
            ModuleSpec::Structure(m) => Some(m),
            ModuleSpec::Name(name) => self.load_module(&name),
        };
        if let Some(module) = module {
            tracing::debug!(module = %module, main = self.modules.is_empty(), "linker adds module");
            self.modules.push(module);
        }
        self
    }

    fn load_module(&mut self, name: &str) -> Option<ModuleStructure> {
        let Some(repo) = self.repo.clone() else {
            self.log(Severity::Error, LNK_NOREPO, vec![name.to_string()]);
            return None;
        };
        match repo.load_module(name, None) {
            Ok(Some(module)) => Some(module),
            Ok(None) => {
                self.log(Severity::Error, LNK_MODULE_LOAD, vec![name.to_string()]);
                None
            }
            Err(e) => {
                self.log(Severity::Error, LNK_MODULE_LOAD, vec![name.to_string(), e.to_string()]);
                None
            }
        }
    }

    // ----- linking -----

    fn is_condition_defined(&self, name: &str) -> bool {
        self.defines
            .get(name)
            .copied()
            .unwrap_or_else(|| self.refiner.is_defined(name))
    }

    /// Resolve dependencies, refine, graft and hand the modules to the
    /// registry. Fails with the accumulated diagnostics.
    pub fn link(mut self) -> Result<Arc<TypeSystem>, ErrorList> {
        if self.is_bad() {
            return Err(self.errors);
        }
        if self.modules.is_empty() {
            self.log(Severity::Error, LNK_EMPTY, Vec::new());
            return Err(self.errors);
        }

        let mut owned = std::mem::take(&mut self.modules);
        let mut provided: BTreeSet<String> = self
            .shared
            .iter()
            .map(|l| l.name().to_string())
            .chain(owned.iter().map(|m| m.name.clone()))
            .collect();

        let mut i = 0;
        while i < owned.len() {
            let dependencies = owned[i].dependencies.clone();
            for dep in &dependencies {
                if provided.contains(&dep.name) {
                    continue;
                }
                if let Some(condition) = &dep.condition {
                    if !self.is_condition_defined(condition) {
                        continue;
                    }
                }
                if dep.optional && !self.refiner.follow_optional(dep) {
                    continue;
                }
                match self.resolve_dependency(&owned, dep) {
                    Some(module) => {
                        tracing::debug!(module = %module, from = owned[i].name.as_str(), "resolved dependency");
                        provided.insert(module.name.clone());
                        owned.push(module);
                    }
                    None => {
                        let severity = if dep.optional {
                            Severity::Warning
                        } else {
                            Severity::Error
                        };
                        self.log(severity, LNK_DEP_MISSING, vec![dep.name.clone(), owned[i].name.clone()]);
                    }
                }
            }
            i += 1;
        }
        if self.is_bad() {
            return Err(self.errors);
        }

        for module in &mut owned {
            module.refine(|c| self.is_condition_defined(c));
            for loader in &self.shared {
                module.graft(&loader.module);
            }
        }

        let names: Vec<String> = owned.iter().map(ToString::to_string).collect();
        let ts = self.xvm.ensure_type_system(self.shared, owned);
        tracing::debug!(type_system = ts.name(), modules = ?names, "linked");
        Ok(ts)
    }

    /// Pick a version of a dependency from the repository, falling back to
    /// a copy embedded in one of the modules being linked.
    fn resolve_dependency(&self, owned: &[ModuleStructure], dep: &ModuleDependency) -> Option<ModuleStructure> {
        let accepts = |v: &Version| {
            let mut release = v.clone();
            release.pre = Prerelease::EMPTY;
            dep.version.as_ref().is_none_or(|req| req.matches(&release))
        };

        if let Some(repo) = &self.repo {
            let candidates: Vec<Version> = repo
                .versions(&dep.name)
                .into_iter()
                .filter(|v| accepts(v))
                .collect();
            if !candidates.is_empty() {
                if let Some(version) = self.refiner.choose_version(&dep.name, &candidates) {
                    if let Ok(Some(mut module)) = repo.load_module(&dep.name, Some(&version)) {
                        module.embedded.clear();
                        return Some(module);
                    }
                }
            }
        }

        owned
            .iter()
            .filter_map(|m| m.embedded_module(&dep.name))
            .find(|m| accepts(&m.version))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::link::repository::MemoryRepository;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn repo() -> MemoryRepository {
        MemoryRepository::new()
            .with_module(ModuleStructure::new("ecstasy.xtclang.org", v("1.0.0")))
            .with_module(ModuleStructure::new("json.example.org", v("1.0.0")))
            .with_module(ModuleStructure::new("json.example.org", v("1.4.0")))
            .with_module(ModuleStructure::new("json.example.org", v("2.0.0-rc.1")))
            .with_module(
                ModuleStructure::new("app.example.org", v("1.0.0"))
                    .with_dependency(ModuleDependency::required("json.example.org").with_version(">=1.0".parse().unwrap()))
                    .with_dependency(ModuleDependency::optional("extra.example.org", true))
                    .with_dependency(ModuleDependency::required("dbg.example.org").with_condition("debug")),
            )
    }

    fn xvm() -> Xvm {
        Xvm::new(Arc::new(repo()), JitConfig::default()).unwrap()
    }

    #[test]
    fn test_link_resolves_dependencies() {
        let xvm = xvm();
        let linker = xvm.create_linker().with_main("app.example.org");
        assert!(!linker.is_bad());
        let ts = linker.link().unwrap();
        let names: Vec<_> = ts.owned().iter().map(|l| l.module.to_string()).collect();
        assert_eq!(names, vec!["app.example.org:1.0.0", "json.example.org:1.4.0"]);
        assert_eq!(ts.shared().len(), 1);
        assert!(ts.owned().iter().all(|l| l.digest().is_some()));
    }

    #[test]
    fn test_conditional_dependency_is_followed_when_defined() {
        let xvm = xvm();
        let errors = xvm
            .create_linker()
            .define("debug", true)
            .with_main("app.example.org")
            .link()
            .unwrap_err();
        assert!(errors.contains(LNK_DEP_MISSING));
    }

    #[test]
    fn test_missing_optional_dependency_warns() {
        let xvm = xvm();
        let repo = repo().with_module(
            ModuleStructure::new("lib.example.org", v("1.0.0"))
                .with_dependency(ModuleDependency::optional("absent.example.org", true)),
        );
        let linker = xvm
            .create_linker()
            .with_repo(Arc::new(repo))
            .with_main("lib.example.org");
        assert!(linker.link().is_ok());
    }

    #[test]
    fn test_redefinition_severity() {
        let xvm = xvm();
        let linker = xvm.create_linker().define("a", true).define("a", false);
        assert!(!linker.is_bad());
        assert!(linker.errors().contains(LNK_REDEF));
        assert!(linker.undefined("a"));
        assert!(linker.specified("a"));
        assert!(!linker.defined("a"));

        let linker = xvm
            .create_linker()
            .define("a", true)
            .with_main("app.example.org")
            .define("a", false);
        assert!(linker.is_bad());
    }

    #[test]
    fn test_errors_latch() {
        let xvm = xvm();
        let linker = xvm.create_linker().with_main("nope.example.org");
        assert!(linker.is_bad());
        assert!(linker.errors().contains(LNK_MODULE_LOAD));
        let linker = linker.with_main("app.example.org").define("x", true);
        assert!(!linker.specified("x"));
        assert!(linker.link().is_err());
    }

    #[test]
    fn test_second_main_and_empty() {
        let xvm = xvm();
        let linker = xvm
            .create_linker()
            .with_main("app.example.org")
            .with_main("json.example.org");
        assert!(linker.errors().contains(LNK_MAIN_EXISTS));

        let errors = xvm.create_linker().link().unwrap_err();
        assert!(errors.contains(LNK_EMPTY));

        let errors = xvm.create_linker().without_repo().with_main("app.example.org").link().unwrap_err();
        assert!(errors.contains(LNK_NOREPO));
    }

    #[test]
    fn test_embedded_copy_without_repo() {
        let xvm = xvm();
        let mut app = ModuleStructure::new("tool.example.org", v("1.0.0"))
            .with_dependency(ModuleDependency::required("json.example.org"));
        app.embedded.push(ModuleStructure::new("json.example.org", v("0.9.0")));
        let ts = xvm.create_linker().without_repo().with_main(app).link().unwrap();
        let json = ts.find_owner_loader("json.example.org").unwrap();
        assert_eq!(json.module.version, v("0.9.0"));
    }
}
