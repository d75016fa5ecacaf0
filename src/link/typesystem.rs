//! Linked type systems.
//!
//! A type system is the set of modules code is generated against: the
//! modules it owns plus read-only modules shared with other type systems.
//! It carries the constant pool and the memoized classification and
//! calling-convention caches.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::module::{ModuleLoader, ModuleStructure};
use super::xvm::module_to_package_name;
use crate::ir::{Constant, ConstantPool, MethodBody, Parameter};
use crate::jit::desc::{JitMethodDesc, MethodKind};
use crate::jit::flavor::{classify, JitTypeDesc};
use crate::types::Type;

/// Cache key of a calling convention: everything the convention depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MethodKey {
    name: String,
    params: Vec<(Type, Option<Constant>)>,
    returns: Vec<Type>,
    kind: (bool, bool),
}

pub struct TypeSystem {
    name: String,
    shared: Vec<Arc<ModuleLoader>>,
    owned: Vec<Arc<ModuleLoader>>,
    pool: ConstantPool,
    optimize: bool,
    jit_types: Mutex<HashMap<Type, JitTypeDesc>>,
    method_descs: Mutex<HashMap<MethodKey, Arc<JitMethodDesc>>>,
}

impl fmt::Debug for TypeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeSystem")
            .field("name", &self.name)
            .field("shared", &self.shared.iter().map(|l| l.name()).collect::<Vec<_>>())
            .field("owned", &self.owned.iter().map(|l| l.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl TypeSystem {
    pub(crate) fn new(
        name: String,
        shared: Vec<Arc<ModuleLoader>>,
        owned: Vec<Arc<ModuleLoader>>,
        optimize: bool,
    ) -> Self {
        Self {
            name,
            shared,
            owned,
            pool: ConstantPool::new(),
            optimize,
            jit_types: Mutex::new(HashMap::new()),
            method_descs: Mutex::new(HashMap::new()),
        }
    }

    /// A type system over `modules` that is not registered anywhere.
    /// The modules are refined with nothing defined.
    pub fn standalone(modules: Vec<ModuleStructure>, optimize: bool) -> Arc<TypeSystem> {
        let name = modules
            .first()
            .map(|m| module_to_package_name(&m.name, Some(&m.version)))
            .unwrap_or_else(|| "anon".to_string());
        Arc::new_cyclic(|weak: &Weak<TypeSystem>| {
            let owned = modules
                .into_iter()
                .map(|mut module| {
                    module.refine(|_| false);
                    let package = module_to_package_name(&module.name, Some(&module.version));
                    Arc::new(ModuleLoader {
                        module,
                        package,
                        type_system: weak.clone(),
                    })
                })
                .collect();
            TypeSystem::new(name, Vec::new(), owned, optimize)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared(&self) -> &[Arc<ModuleLoader>] {
        &self.shared
    }

    pub fn owned(&self) -> &[Arc<ModuleLoader>] {
        &self.owned
    }

    /// The first owned module.
    pub fn main_module(&self) -> Option<&ModuleStructure> {
        self.owned.first().map(|l| &l.module)
    }

    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn is_optimized(&self) -> bool {
        self.optimize
    }

    /// Owned loaders first, then shared ones.
    pub fn loaders(&self) -> impl Iterator<Item = &Arc<ModuleLoader>> {
        self.owned.iter().chain(self.shared.iter())
    }

    /// The loader of a module, or of the module declaring a class, by name.
    pub fn find_owner_loader(&self, name: &str) -> Option<&Arc<ModuleLoader>> {
        self.loaders()
            .find(|l| l.name() == name)
            .or_else(|| self.loaders().find(|l| l.module.declares_class(name)))
    }

    /// The loader responsible for producing code for a type.
    ///
    /// Primitives and `Null` belong to the module declaring them, or to the
    /// first shared module. A union has an owner only when every non-null
    /// member agrees.
    pub fn find_owner_of(&self, ty: &Type) -> Option<&Arc<ModuleLoader>> {
        match ty {
            Type::Class(name) => self.find_owner_loader(name),
            Type::Primitive(p) => self
                .find_owner_loader(p.name())
                .or_else(|| self.base_loader()),
            Type::Null => self
                .find_owner_loader("Nullable")
                .or_else(|| self.base_loader()),
            Type::Formal(_) => None,
            Type::Union(members) => {
                let mut owners = members
                    .iter()
                    .filter(|m| **m != Type::Null)
                    .map(|m| self.find_owner_of(m));
                let first = owners.next()??;
                owners
                    .all(|o| o.is_some_and(|o| Arc::ptr_eq(o, first)))
                    .then_some(first)
            }
        }
    }

    fn base_loader(&self) -> Option<&Arc<ModuleLoader>> {
        self.shared.first().or_else(|| self.owned.first())
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodBody> {
        self.loaders().find_map(|l| l.module.method(name))
    }

    /// Classification of a type, memoized.
    pub fn jit_type_desc(&self, ty: &Type) -> JitTypeDesc {
        if let Some(desc) = self.jit_types.lock().get(ty) {
            return desc.clone();
        }
        let desc = classify(ty, self.optimize);
        self.jit_types
            .lock()
            .entry(ty.clone())
            .or_insert(desc)
            .clone()
    }

    /// The calling convention of a method, memoized. Formal types bound at
    /// the method are resolved first.
    pub fn method_desc(&self, method: &MethodBody) -> Arc<JitMethodDesc> {
        let params: Vec<Parameter> = method
            .params
            .iter()
            .map(|p| Parameter {
                name: p.name.clone(),
                ty: p.ty.resolve_formals(&method.formals),
                default: p.default.clone(),
            })
            .collect();
        let returns: Vec<Type> = method
            .returns
            .iter()
            .map(|t| t.resolve_formals(&method.formals))
            .collect();
        let key = MethodKey {
            name: method.name.clone(),
            params: params.iter().map(|p| (p.ty.clone(), p.default.clone())).collect(),
            returns: returns.clone(),
            kind: (method.is_function, method.is_constructor),
        };
        if let Some(desc) = self.method_descs.lock().get(&key) {
            return Arc::clone(desc);
        }

        let kind = if method.is_function {
            MethodKind::Function
        } else if method.is_constructor {
            MethodKind::Constructor {
                add_ctor_ctx: true,
                add_type: false,
            }
        } else {
            MethodKind::Method
        };
        let desc = Arc::new(JitMethodDesc::of(&params, &returns, kind, |t| self.jit_type_desc(t)));
        Arc::clone(self.method_descs.lock().entry(key).or_insert(desc))
    }

    /// Same shared and owned modules, by name and digest, in order.
    pub fn same_modules(&self, shared: &[Arc<ModuleLoader>], owned: &[ModuleStructure]) -> bool {
        self.shared.len() == shared.len()
            && self.owned.len() == owned.len()
            && self.owned.iter().zip(owned).all(|(l, m)| same_module(&l.module, m))
            && self
                .shared
                .iter()
                .zip(shared)
                .all(|(a, b)| same_module(&a.module, &b.module))
    }
}

/// Both refined, with equal names and digests.
pub fn same_module(a: &ModuleStructure, b: &ModuleStructure) -> bool {
    a.is_refined() && b.is_refined() && a.name == b.name && a.digest() == b.digest()
}
