//! Module repositories.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use semver::Version;

use super::module::ModuleStructure;
use crate::error::RepositoryError;

/// A source of module structures.
pub trait ModuleRepository: Send + Sync + fmt::Debug {
    fn module_names(&self) -> Vec<String>;

    /// Available versions of a module, ascending.
    fn versions(&self, name: &str) -> Vec<Version>;

    /// Load a module; the highest version when `version` is absent.
    /// `Ok(None)` when there is no such module.
    fn load_module(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Option<ModuleStructure>, RepositoryError>;
}

/// Modules held in memory.
///
/// A loaded module carries private copies of everything it depends on, the
/// way a packaged archive would.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    modules: RwLock<BTreeMap<String, BTreeMap<Version, ModuleStructure>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, module: ModuleStructure) -> Self {
        self.store(module);
        self
    }

    /// Add or replace a module version.
    pub fn store(&self, mut module: ModuleStructure) {
        module.embedded.clear();
        self.modules
            .write()
            .entry(module.name.clone())
            .or_default()
            .insert(module.version.clone(), module);
    }

    pub fn len(&self) -> usize {
        self.modules.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, name: &str, version: Option<&Version>) -> Option<ModuleStructure> {
        let modules = self.modules.read();
        let versions = modules.get(name)?;
        match version {
            Some(v) => versions.get(v).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    /// Embed the newest acceptable version of every transitive dependency.
    fn embed_dependencies(&self, module: &mut ModuleStructure) {
        let mut seen = BTreeSet::from([module.name.clone()]);
        let mut pending: Vec<_> = module.dependencies.clone();
        while let Some(dep) = pending.pop() {
            if !seen.insert(dep.name.clone()) {
                continue;
            }
            let modules = self.modules.read();
            let Some(versions) = modules.get(&dep.name) else {
                continue;
            };
            let chosen = versions
                .iter()
                .rev()
                .find(|(v, _)| dep.version.as_ref().is_none_or(|req| req.matches(v)))
                .map(|(_, m)| m.clone());
            drop(modules);
            if let Some(copy) = chosen {
                pending.extend(copy.dependencies.iter().cloned());
                module.embedded.push(copy);
            }
        }
    }
}

impl ModuleRepository for MemoryRepository {
    fn module_names(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    fn versions(&self, name: &str) -> Vec<Version> {
        self.modules
            .read()
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn load_module(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Option<ModuleStructure>, RepositoryError> {
        Ok(self.find(name, version).map(|mut module| {
            self.embed_dependencies(&mut module);
            module
        }))
    }
}

/// Modules stored as TOML manifests in one directory, one file per version.
#[derive(Debug)]
pub struct DirRepository {
    dir: PathBuf,
    index: MemoryRepository,
}

impl DirRepository {
    pub const EXTENSION: &'static str = "toml";

    /// Read every manifest in `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let dir = dir.as_ref().to_path_buf();
        let io = |source| RepositoryError::Io {
            path: dir.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(io)?;
        let index = MemoryRepository::new();
        for entry in fs::read_dir(&dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            if path.extension().is_some_and(|e| e == Self::EXTENSION) {
                index.store(Self::load_manifest(&path)?);
            }
        }
        tracing::debug!(dir = %dir.display(), modules = index.len(), "opened module directory");
        Ok(Self { dir, index })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse one manifest file.
    pub fn load_manifest(path: &Path) -> Result<ModuleStructure, RepositoryError> {
        let content = fs::read_to_string(path).map_err(|source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| RepositoryError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write a module's manifest and index it. Returns the file written.
    pub fn save(&self, module: &ModuleStructure) -> Result<PathBuf, RepositoryError> {
        let content = toml::to_string_pretty(module).map_err(|source| RepositoryError::Serialize {
            name: module.name.clone(),
            source,
        })?;
        let path = self.manifest_path(module);
        fs::write(&path, content).map_err(|source| RepositoryError::Io {
            path: path.clone(),
            source,
        })?;
        self.index.store(module.clone());
        Ok(path)
    }

    fn manifest_path(&self, module: &ModuleStructure) -> PathBuf {
        self.dir
            .join(format!("{}-{}.{}", module.name, module.version, Self::EXTENSION))
    }
}

impl ModuleRepository for DirRepository {
    fn module_names(&self) -> Vec<String> {
        self.index.module_names()
    }

    fn versions(&self, name: &str) -> Vec<Version> {
        self.index.versions(name)
    }

    fn load_module(
        &self,
        name: &str,
        version: Option<&Version>,
    ) -> Result<Option<ModuleStructure>, RepositoryError> {
        self.index.load_module(name, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::module::ModuleDependency;

    fn module(name: &str, version: &str) -> ModuleStructure {
        ModuleStructure::new(name, Version::parse(version).unwrap())
    }

    #[test]
    fn test_memory_versions_and_latest() {
        let repo = MemoryRepository::new()
            .with_module(module("a", "1.0.0"))
            .with_module(module("a", "1.2.0"))
            .with_module(module("b", "0.1.0"));
        assert_eq!(repo.module_names(), vec!["a", "b"]);
        assert_eq!(repo.versions("a").len(), 2);
        assert!(repo.versions("zzz").is_empty());
        let latest = repo.load_module("a", None).unwrap().unwrap();
        assert_eq!(latest.version, Version::new(1, 2, 0));
        let exact = repo.load_module("a", Some(&Version::new(1, 0, 0))).unwrap().unwrap();
        assert_eq!(exact.version, Version::new(1, 0, 0));
        assert!(repo.load_module("c", None).unwrap().is_none());
    }

    #[test]
    fn test_memory_embeds_transitive_dependencies() {
        let repo = MemoryRepository::new()
            .with_module(module("core", "1.0.0"))
            .with_module(module("lib", "1.0.0").with_dependency(ModuleDependency::required("core")))
            .with_module(module("app", "1.0.0").with_dependency(ModuleDependency::required("lib")));
        let app = repo.load_module("app", None).unwrap().unwrap();
        let mut names: Vec<_> = app.embedded.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["core", "lib"]);
        assert!(app.embedded.iter().all(|m| m.embedded.is_empty()));
    }

    #[test]
    fn test_dir_repository_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let repo = DirRepository::open(temp.path()).unwrap();
        assert!(repo.module_names().is_empty());
        let path = repo.save(&module("app.example.org", "1.0.0")).unwrap();
        assert!(path.exists());
        assert_eq!(repo.module_names(), vec!["app.example.org"]);

        let reopened = DirRepository::open(temp.path()).unwrap();
        assert_eq!(reopened.versions("app.example.org"), vec![Version::new(1, 0, 0)]);
    }

    #[test]
    fn test_dir_repository_bad_manifest() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("broken.toml"), "name = 3").unwrap();
        let err = DirRepository::open(temp.path()).unwrap_err();
        assert!(matches!(err, RepositoryError::Parse { .. }));
    }
}
