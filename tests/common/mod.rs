//! Shared fixtures for the integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use semver::Version;
use tracing_subscriber::EnvFilter;
use xjit::ir::{BinaryOp, MethodBody, Op, A_STACK};
use xjit::link::{MemoryRepository, ModuleRepository};
use xjit::vm::Injector;
use xjit::{JitCompiler, JitConfig, Machine, ModuleStructure, Primitive, Type, TypeSystem, Xvm};

pub const CORE: &str = "ecstasy.xtclang.org";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn v(s: &str) -> Version {
    Version::parse(s).expect("valid version")
}

pub fn core_module() -> ModuleStructure {
    ModuleStructure::new(CORE, v("1.0.0")).with_class("Object")
}

pub fn repo() -> MemoryRepository {
    MemoryRepository::new().with_module(core_module())
}

pub fn xvm() -> Xvm {
    xvm_with(Arc::new(repo()), JitConfig::default())
}

pub fn xvm_with(repo: Arc<dyn ModuleRepository>, config: JitConfig) -> Xvm {
    init_tracing();
    Xvm::new(repo, config).expect("core module loads")
}

pub fn app(methods: Vec<MethodBody>) -> ModuleStructure {
    methods
        .into_iter()
        .fold(ModuleStructure::new("app.example.org", v("1.0.0")), |m, method| {
            m.with_method(method)
        })
}

/// Link `module`, compile everything it owns and load it into a machine
/// running in a fresh main container.
pub fn machine(xvm: &Xvm, module: ModuleStructure, injector: Option<Arc<dyn Injector>>) -> Machine {
    let ts = xvm
        .create_type_system_for(None, module, None)
        .expect("module links");
    machine_for(xvm, ts, injector)
}

pub fn machine_for(xvm: &Xvm, ts: Arc<TypeSystem>, injector: Option<Arc<dyn Injector>>) -> Machine {
    let compiler = JitCompiler::new(Arc::clone(&ts), xvm.config().clone());
    let compiled = compiler.compile_all().expect("module compiles");
    Machine::new(compiled.into_iter().collect(), xvm.create_container(ts, injector))
}

pub fn prim(p: Primitive) -> Type {
    Type::Primitive(p)
}

/// `name(a: P, b: Q) -> P` computing `a <kind> b`.
pub fn binary_method(name: &str, kind: BinaryOp, p: Primitive, rhs: Primitive) -> MethodBody {
    MethodBody::new(name)
        .with_param("a", prim(p))
        .with_param("b", prim(rhs))
        .with_return(prim(p))
        .with_ops(vec![
            Op::Binary {
                kind,
                lhs: 0,
                rhs: 1,
                ret: A_STACK,
            },
            Op::Return { values: vec![A_STACK] },
        ])
}
