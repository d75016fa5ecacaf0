//! Type system and container registration across links.

mod common;

use std::sync::Arc;

use common::{app, binary_method, xvm};
use xjit::ir::BinaryOp;
use xjit::{Primitive, XvmError};

fn add() -> xjit::ir::MethodBody {
    binary_method("add", BinaryOp::Add, Primitive::Int64, Primitive::Int64)
}

#[test]
fn test_identical_links_share_type_system() {
    let xvm = xvm();
    let a = xvm.create_type_system_for(None, app(vec![add()]), None).unwrap();
    let b = xvm.create_type_system_for(None, app(vec![add()]), None).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(xvm.registered_type_systems(), 2);
}

#[test]
fn test_concurrent_links_share_type_system() {
    let xvm = xvm();
    let linked: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| xvm.create_type_system_for(None, app(vec![add()]), None)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
    });
    for ts in &linked[1..] {
        assert!(Arc::ptr_eq(&linked[0], ts));
    }
    assert_eq!(xvm.registered_type_systems(), 2);
}

#[test]
fn test_different_content_gets_own_type_system() {
    let xvm = xvm();
    let a = xvm.create_type_system_for(None, app(vec![add()]), None).unwrap();
    let sub = binary_method("sub", BinaryOp::Sub, Primitive::Int64, Primitive::Int64);
    let b = xvm.create_type_system_for(None, app(vec![add(), sub]), None).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_ne!(a.name(), b.name());
    assert_ne!(a.owned()[0].digest(), b.owned()[0].digest());
    assert_eq!(xvm.registered_type_systems(), 3);
}

#[test]
fn test_dropped_type_system_is_not_counted() {
    let xvm = xvm();
    let ts = xvm.create_type_system_for(None, app(vec![add()]), None).unwrap();
    assert_eq!(xvm.registered_type_systems(), 2);
    drop(ts);
    assert_eq!(xvm.registered_type_systems(), 1);
}

#[test]
fn test_container_lifecycle() {
    let xvm = xvm();
    let ts = xvm.create_type_system_for(None, app(vec![add()]), None).unwrap();

    let main = xvm.create_container(Arc::clone(&ts), None);
    assert!(main.is_main());
    assert!(Arc::ptr_eq(main.parent().unwrap(), xvm.native_container()));
    let nested = xvm.create_nested_container(&main, Arc::clone(&ts), None);
    assert!(nested.is_nested());
    assert_ne!(main.id(), nested.id());
    assert_eq!(xvm.registered_containers(), 3);

    let found = xvm.get_container(nested.id()).unwrap().unwrap();
    assert!(Arc::ptr_eq(&found, &nested));

    let nested_id = nested.id();
    drop(found);
    drop(nested);
    assert_eq!(xvm.registered_containers(), 2);
    assert!(xvm.get_container(nested_id).unwrap().is_none());

    assert!(xvm.retire_container(main.id()));
    assert_eq!(xvm.registered_containers(), 1);
    assert!(matches!(
        xvm.get_container(-5),
        Err(XvmError::IllegalContainerId(-5))
    ));
}

#[test]
fn test_unknown_module_fails_to_link() {
    let xvm = xvm();
    let err = xvm
        .create_type_system(None, "missing.example.org", None, None)
        .unwrap_err();
    let XvmError::Link { module, errors } = err else {
        panic!("expected a link error");
    };
    assert_eq!(module, "missing.example.org");
    assert!(errors.has_errors());
}
