//! The process-wide registry of type systems, module loaders and containers.
//!
//! Registrations are serialized per key through a fixed pool of mutexes;
//! unrelated keys that hash to the same mutex simply wait on each other.
//! Maps hold weak references. Strong ownership lives with containers and
//! callers, and a sweep every Nth registration drops dead entries.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use semver::{BuildMetadata, Version};

use super::linker::Linker;
use super::module::{ModuleLoader, ModuleStructure};
use super::refiner::Refiner;
use super::repository::ModuleRepository;
use super::typesystem::TypeSystem;
use crate::config::JitConfig;
use crate::diagnostics::{ErrorList, LNK_MODULE_LOAD};
use crate::error::XvmError;
use crate::vm::container::Container;
use crate::vm::injector::{FailEverythingInjector, Injector, ResourceInjector};

/// Native package name of a module.
///
/// Dotted parts are reversed (`ecstasy.xtclang.org` becomes
/// `org.xtclang.ecstasy`), a single-part name gets an `anon` prefix, and the
/// version is appended with its dots turned into underscores, after `_v`
/// when it starts with a digit.
pub fn module_to_package_name(module: &str, version: Option<&Version>) -> String {
    let parts: Vec<&str> = module.split('.').filter(|p| !p.is_empty()).collect();
    let mut buf = String::new();
    if parts.len() <= 1 {
        buf.push_str("anon");
    }
    for part in parts.iter().rev() {
        if !buf.is_empty() {
            buf.push('.');
        }
        buf.push_str(part);
    }
    if let Some(version) = version {
        let mut version = version.clone();
        version.build = BuildMetadata::EMPTY;
        let text = version.to_string().replace('.', "_");
        if text.starts_with(|c: char| c.is_ascii_digit()) {
            buf.push_str("_v");
        }
        buf.push_str(&text);
    }
    buf
}

/// Lock key of a set of modules: the name of a single module, or
/// `{a,b,...}` over the sorted names.
fn type_system_key<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut names: Vec<&str> = names.into_iter().collect();
    if names.len() == 1 {
        return names[0].to_string();
    }
    names.sort_unstable();
    format!("{{{}}}", names.join(","))
}

fn by_identity(a: &ModuleStructure, b: &ModuleStructure) -> std::cmp::Ordering {
    a.identity().cmp(&b.identity())
}

/// Whether the `count`th registration triggers a sweep.
fn sweep_due(count: usize, interval: usize) -> bool {
    interval > 0 && count % interval == 0
}

#[derive(Debug, Default)]
struct LoaderIndex {
    by_package: HashMap<String, Weak<ModuleLoader>>,
    /// Module name -> package names of its loaders. Starts with 4 entries
    /// and doubles when full; emptied entries are reused.
    packages_by_module: HashMap<String, Vec<Option<String>>>,
}

impl LoaderIndex {
    fn sweep(&mut self) {
        self.by_package.retain(|_, loader| loader.strong_count() > 0);
        let by_package = &self.by_package;
        self.packages_by_module.retain(|module, packages| {
            let mut any = false;
            for slot in packages.iter_mut() {
                let live = slot.as_ref().is_some_and(|pkg| {
                    by_package
                        .get(pkg)
                        .and_then(Weak::upgrade)
                        .is_some_and(|l| l.name() == module)
                });
                if live {
                    any = true;
                } else {
                    *slot = None;
                }
            }
            any
        });
    }
}

struct Registry {
    config: JitConfig,
    locks: Vec<Mutex<()>>,
    type_systems: RwLock<HashMap<String, Weak<TypeSystem>>>,
    loaders: Mutex<LoaderIndex>,
    containers: RwLock<HashMap<i32, Weak<Container>>>,
    container_count: AtomicI32,
    ts_generation: AtomicUsize,
    loader_generation: AtomicUsize,
}

impl Registry {
    fn new(config: JitConfig) -> Self {
        let locks = (0..config.lock_pool_size.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            config,
            locks,
            type_systems: RwLock::new(HashMap::new()),
            loaders: Mutex::new(LoaderIndex::default()),
            containers: RwLock::new(HashMap::new()),
            container_count: AtomicI32::new(-1),
            ts_generation: AtomicUsize::new(0),
            loader_generation: AtomicUsize::new(0),
        }
    }

    fn mutex(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() % self.locks.len() as u64) as usize]
    }

    fn ensure_type_system(
        &self,
        mut shared: Vec<Arc<ModuleLoader>>,
        mut owned: Vec<ModuleStructure>,
    ) -> Arc<TypeSystem> {
        // Probe by an owned module, or by the last shared one so the universally
        // shared core module is not the probe.
        let probe = match (owned.first(), shared.last()) {
            (Some(m), _) => m.name.clone(),
            (None, Some(l)) => l.name().to_string(),
            (None, None) => String::new(),
        };
        shared.sort_by(|a, b| by_identity(&a.module, &b.module));
        owned.sort_by(by_identity);

        let key = if owned.is_empty() {
            type_system_key(shared.iter().map(|l| l.name()))
        } else {
            type_system_key(owned.iter().map(|m| m.name.as_str()))
        };
        let _guard = self.mutex(&key).lock();

        if let Some(ts) = self.find_type_system(&probe, &shared, &owned) {
            tracing::debug!(name = ts.name(), key = %key, "reusing type system");
            return ts;
        }

        // Different keys can share a name prefix, so the name is picked and
        // claimed under one write lock.
        let mut map = self.type_systems.write();
        let name = self.generate_type_system_name(&mut map, &shared, &owned);
        let optimize = self.config.optimize.is_on();
        let ts = Arc::new_cyclic(|weak: &Weak<TypeSystem>| {
            let loaders = owned
                .into_iter()
                .map(|module| self.create_module_loader(weak, module))
                .collect();
            TypeSystem::new(name, shared, loaders, optimize)
        });
        map.insert(ts.name().to_string(), Arc::downgrade(&ts));
        drop(map);
        tracing::debug!(name = ts.name(), key = %key, "created type system");
        ts
    }

    fn find_type_system(
        &self,
        module: &str,
        shared: &[Arc<ModuleLoader>],
        owned: &[ModuleStructure],
    ) -> Option<Arc<TypeSystem>> {
        let index = self.loaders.lock();
        let packages = index.packages_by_module.get(module)?;
        packages
            .iter()
            .flatten()
            .filter_map(|pkg| index.by_package.get(pkg).and_then(Weak::upgrade))
            .filter(|loader| loader.name() == module)
            .filter_map(|loader| loader.type_system())
            .find(|ts| ts.same_modules(shared, owned))
    }

    /// A name no live type system holds. Sweeps dead entries when due.
    fn generate_type_system_name(
        &self,
        map: &mut HashMap<String, Weak<TypeSystem>>,
        shared: &[Arc<ModuleLoader>],
        owned: &[ModuleStructure],
    ) -> String {
        let count = self.ts_generation.fetch_add(1, Ordering::Relaxed) + 1;
        if sweep_due(count, self.config.type_system_sweep_interval) {
            let before = map.len();
            map.retain(|_, ts| ts.strong_count() > 0);
            tracing::debug!(removed = before - map.len(), "swept type systems");
        }

        let taken = |name: &str| map.get(name).is_some_and(|ts| ts.strong_count() > 0);
        match owned.first() {
            None => {
                let all = type_system_key(shared.iter().map(|l| l.name()));
                let mut name = format!("shared:{all}");
                let mut n = 1;
                while taken(&name) {
                    n += 1;
                    name = format!("shared_{n}:{all}");
                }
                name
            }
            Some(module) => {
                let pkg = module_to_package_name(&module.name, Some(&module.version));
                let mut name = pkg.clone();
                let mut n = 1;
                while taken(&name) {
                    n += 1;
                    name = format!("{pkg}.alt{n}");
                }
                name
            }
        }
    }

    fn create_module_loader(&self, ts: &Weak<TypeSystem>, module: ModuleStructure) -> Arc<ModuleLoader> {
        let count = self.loader_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut index = self.loaders.lock();
        if sweep_due(count, self.config.loader_sweep_interval) {
            index.sweep();
            tracing::debug!(loaders = index.by_package.len(), "swept module loaders");
        }

        let pkg = module_to_package_name(&module.name, Some(&module.version));
        let mut unique = pkg.clone();
        let mut n = 1;
        while index.by_package.contains_key(&unique) {
            n += 1;
            unique = format!("{pkg}.alt{n}");
        }

        let packages = index
            .packages_by_module
            .entry(module.name.clone())
            .or_insert_with(|| vec![None; 4]);
        let slot = match packages.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                let full = packages.len();
                packages.resize(full * 2, None);
                full
            }
        };
        packages[slot] = Some(unique.clone());

        let loader = Arc::new(ModuleLoader {
            module,
            package: unique.clone(),
            type_system: ts.clone(),
        });
        index.by_package.insert(unique, Arc::downgrade(&loader));
        loader
    }

    fn create_container(
        &self,
        parent: Option<Arc<Container>>,
        ts: Arc<TypeSystem>,
        injector: Arc<dyn Injector>,
    ) -> Arc<Container> {
        let id = self.container_count.fetch_add(1, Ordering::Relaxed);
        let container = Arc::new(Container::new(id, parent, ts, injector));
        let mut map = self.containers.write();
        if map.insert(id, Arc::downgrade(&container)).is_some() {
            panic!("container {id} registered twice");
        }
        if id > 0 && sweep_due(id as usize, self.config.container_sweep_interval) {
            let before = map.len();
            map.retain(|_, c| c.strong_count() > 0);
            tracing::debug!(removed = before - map.len(), "swept containers");
        }
        tracing::debug!(id, type_system = container.type_system().name(), "created container");
        container
    }
}

/// The runtime registry: the core module, the native type system and
/// container, and every type system and container created since.
pub struct Xvm {
    system_repo: Arc<dyn ModuleRepository>,
    registry: Registry,
    core_loader: Arc<ModuleLoader>,
    native_type_system: Arc<TypeSystem>,
    native_container: Arc<Container>,
    default_injector: Arc<ResourceInjector>,
}

impl Xvm {
    /// Load the core module from `repo` and build the native type system
    /// and container.
    pub fn new(repo: Arc<dyn ModuleRepository>, config: JitConfig) -> Result<Self, XvmError> {
        let mut core = repo
            .load_module(&config.core_module, None)?
            .ok_or_else(|| XvmError::MissingCoreModule(config.core_module.clone()))?;
        core.refine(|_| false);

        let registry = Registry::new(config);
        let native_type_system = registry.ensure_type_system(Vec::new(), vec![core]);
        let core_loader = native_type_system
            .owned()
            .first()
            .cloned()
            .ok_or_else(|| XvmError::MissingCoreModule(registry.config.core_module.clone()))?;
        let native_container = registry.create_container(
            None,
            Arc::clone(&native_type_system),
            Arc::new(FailEverythingInjector),
        );
        tracing::debug!(core = core_loader.package.as_str(), "xvm started");
        Ok(Self {
            system_repo: repo,
            registry,
            core_loader,
            native_type_system,
            native_container,
            default_injector: Arc::new(ResourceInjector::new()),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.registry.config
    }

    pub fn system_repo(&self) -> &Arc<dyn ModuleRepository> {
        &self.system_repo
    }

    pub fn core_loader(&self) -> &Arc<ModuleLoader> {
        &self.core_loader
    }

    pub fn native_type_system(&self) -> &Arc<TypeSystem> {
        &self.native_type_system
    }

    pub fn native_container(&self) -> &Arc<Container> {
        &self.native_container
    }

    /// The injector main containers get when none is given.
    pub fn default_injector(&self) -> &Arc<ResourceInjector> {
        &self.default_injector
    }

    /// A linker over the system repository that already shares the core module.
    pub fn create_linker(&self) -> Linker<'_> {
        Linker::new(self).add_shared_module(Arc::clone(&self.core_loader))
    }

    /// Link a module loaded by name, optionally at an exact version.
    pub fn create_type_system(
        &self,
        repo: Option<Arc<dyn ModuleRepository>>,
        module: &str,
        version: Option<&Version>,
        refiner: Option<Arc<dyn Refiner>>,
    ) -> Result<Arc<TypeSystem>, XvmError> {
        let repo = repo.unwrap_or_else(|| Arc::clone(&self.system_repo));
        let Some(structure) = repo.load_module(module, version)? else {
            let mut errors = ErrorList::default();
            let version = version.map(Version::to_string).unwrap_or_default();
            errors.error(LNK_MODULE_LOAD, vec![module.to_string(), version]);
            return Err(XvmError::Link {
                module: module.to_string(),
                errors,
            });
        };
        self.create_type_system_for(Some(repo), structure, refiner)
    }

    /// Link a module structure as the main module.
    pub fn create_type_system_for(
        &self,
        repo: Option<Arc<dyn ModuleRepository>>,
        module: ModuleStructure,
        refiner: Option<Arc<dyn Refiner>>,
    ) -> Result<Arc<TypeSystem>, XvmError> {
        let name = module.name.clone();
        let mut linker = self.create_linker();
        if let Some(repo) = repo {
            linker = linker.with_repo(repo);
        }
        if let Some(refiner) = refiner {
            linker = linker.with_refiner(refiner);
        }
        linker
            .with_main(module)
            .link()
            .map_err(|errors| XvmError::Link { module: name, errors })
    }

    /// Find the registered type system with exactly these modules, or
    /// create and register one.
    pub fn ensure_type_system(
        &self,
        shared: Vec<Arc<ModuleLoader>>,
        owned: Vec<ModuleStructure>,
    ) -> Arc<TypeSystem> {
        self.registry.ensure_type_system(shared, owned)
    }

    /// A main container, child of the native container.
    pub fn create_container(
        &self,
        ts: Arc<TypeSystem>,
        injector: Option<Arc<dyn Injector>>,
    ) -> Arc<Container> {
        self.create_nested_container(&self.native_container, ts, injector)
    }

    pub fn create_nested_container(
        &self,
        parent: &Arc<Container>,
        ts: Arc<TypeSystem>,
        injector: Option<Arc<dyn Injector>>,
    ) -> Arc<Container> {
        let injector = injector.unwrap_or_else(|| self.default_injector.clone() as Arc<dyn Injector>);
        self.registry
            .create_container(Some(Arc::clone(parent)), ts, injector)
    }

    /// A live container by id. `-1` is the native container; other
    /// negative ids are illegal.
    pub fn get_container(&self, id: i32) -> Result<Option<Arc<Container>>, XvmError> {
        match id {
            -1 => Ok(Some(Arc::clone(&self.native_container))),
            id if id < 0 => Err(XvmError::IllegalContainerId(id)),
            id => Ok(self
                .registry
                .containers
                .read()
                .get(&id)
                .and_then(Weak::upgrade)),
        }
    }

    /// Drop a container's registration. Returns false if it was unknown.
    pub fn retire_container(&self, id: i32) -> bool {
        id >= 0 && self.registry.containers.write().remove(&id).is_some()
    }

    /// Drop a type system and its module loaders from the registry.
    pub fn retire_type_system(&self, ts: &Arc<TypeSystem>) -> bool {
        let removed = {
            let mut map = self.registry.type_systems.write();
            let ours = map
                .get(ts.name())
                .and_then(Weak::upgrade)
                .is_some_and(|live| Arc::ptr_eq(&live, ts));
            ours && map.remove(ts.name()).is_some()
        };
        if removed {
            let mut index = self.registry.loaders.lock();
            for loader in ts.owned() {
                index.by_package.remove(&loader.package);
                if let Some(packages) = index.packages_by_module.get_mut(loader.name()) {
                    for slot in packages.iter_mut() {
                        if slot.as_deref() == Some(loader.package.as_str()) {
                            *slot = None;
                        }
                    }
                }
            }
            tracing::debug!(name = ts.name(), "retired type system");
        }
        removed
    }

    /// Number of live registered type systems, the native one included.
    pub fn registered_type_systems(&self) -> usize {
        self.registry
            .type_systems
            .read()
            .values()
            .filter(|ts| ts.strong_count() > 0)
            .count()
    }

    /// Number of live registered containers, the native one included.
    pub fn registered_containers(&self) -> usize {
        self.registry
            .containers
            .read()
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::repository::MemoryRepository;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn xvm() -> Xvm {
        let repo = MemoryRepository::new()
            .with_module(ModuleStructure::new("ecstasy.xtclang.org", v("1.0.0")).with_class("Object"))
            .with_module(ModuleStructure::new("app.example.org", v("1.0.0")));
        Xvm::new(Arc::new(repo), JitConfig::default()).unwrap()
    }

    #[test]
    fn test_module_to_package_name() {
        assert_eq!(module_to_package_name("ecstasy.xtclang.org", None), "org.xtclang.ecstasy");
        assert_eq!(module_to_package_name("test", None), "anon.test");
        assert_eq!(
            module_to_package_name("app.example.org", Some(&v("1.2.3+build.7"))),
            "org.example.app_v1_2_3"
        );
        assert_eq!(
            module_to_package_name("m.x", Some(&v("2.0.0-beta.1"))),
            "x.m_v2_0_0-beta_1"
        );
    }

    #[test]
    fn test_type_system_key() {
        assert_eq!(type_system_key(["b"]), "b");
        assert_eq!(type_system_key(["b", "a"]), "{a,b}");
    }

    #[test]
    fn test_native_state() {
        let xvm = xvm();
        assert_eq!(xvm.native_type_system().name(), "org.xtclang.ecstasy_v1_0_0");
        assert_eq!(xvm.native_container().id(), -1);
        assert!(xvm.native_container().is_core());
        assert_eq!(xvm.registered_type_systems(), 1);
        assert_eq!(xvm.registered_containers(), 1);
        assert!(xvm.core_loader().digest().is_some());
    }

    #[test]
    fn test_missing_core_module() {
        let err = Xvm::new(Arc::new(MemoryRepository::new()), JitConfig::default()).err();
        assert!(matches!(err, Some(XvmError::MissingCoreModule(_))));
    }

    #[test]
    fn test_get_container() {
        let xvm = xvm();
        assert!(matches!(xvm.get_container(-2), Err(XvmError::IllegalContainerId(-2))));
        assert!(xvm.get_container(-1).unwrap().is_some());
        assert!(xvm.get_container(7).unwrap().is_none());

        let ts = xvm.create_type_system(None, "app.example.org", None, None).unwrap();
        let main = xvm.create_container(ts, None);
        assert_eq!(main.id(), 0);
        assert!(main.is_main());
        let nested = xvm.create_nested_container(&main, Arc::clone(main.type_system()), None);
        assert!(nested.is_nested());
        assert!(xvm.get_container(1).unwrap().is_some());

        assert!(xvm.retire_container(1));
        assert!(!xvm.retire_container(1));
        assert!(xvm.get_container(1).unwrap().is_none());
    }

    #[test]
    fn test_packages_by_module_grows() {
        let registry = Registry::new(JitConfig::default());
        let module = ModuleStructure::new("m.example.org", v("1.0.0"));
        let loaders: Vec<_> = (0..5)
            .map(|_| registry.create_module_loader(&Weak::new(), module.clone()))
            .collect();
        assert_eq!(loaders[0].package, "org.example.m_v1_0_0");
        assert_eq!(loaders[1].package, "org.example.m_v1_0_0.alt2");
        let index = registry.loaders.lock();
        let packages = &index.packages_by_module["m.example.org"];
        assert_eq!(packages.len(), 8);
        assert_eq!(packages.iter().flatten().count(), 5);
    }

    #[test]
    fn test_sets_sharing_first_module_get_distinct_names() {
        let registry = Registry::new(JitConfig::default());
        let mut app = ModuleStructure::new("app.example.org", v("1.0.0"));
        let mut json = ModuleStructure::new("json.example.org", v("1.0.0"));
        app.refine(|_| false);
        json.refine(|_| false);
        let linked: Vec<Arc<TypeSystem>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let owned = if i % 2 == 0 {
                        vec![app.clone(), json.clone()]
                    } else {
                        vec![app.clone()]
                    };
                    let registry = &registry;
                    s.spawn(move || registry.ensure_type_system(Vec::new(), owned))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let pair = &linked[0];
        let single = &linked[1];
        assert_ne!(pair.name(), single.name());
        for (i, ts) in linked.iter().enumerate() {
            let expected = if i % 2 == 0 { pair } else { single };
            assert!(Arc::ptr_eq(ts, expected));
        }
        assert_eq!(registry.type_systems.read().len(), 2);
    }

    #[test]
    fn test_retire_type_system() {
        let xvm = xvm();
        let ts = xvm.create_type_system(None, "app.example.org", None, None).unwrap();
        assert_eq!(xvm.registered_type_systems(), 2);
        assert!(xvm.retire_type_system(&ts));
        assert_eq!(xvm.registered_type_systems(), 1);
        let again = xvm.create_type_system(None, "app.example.org", None, None).unwrap();
        assert!(!Arc::ptr_eq(&ts, &again));
    }
}
