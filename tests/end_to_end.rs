//! Link, compile and run whole modules.

mod common;

use std::sync::Arc;

use common::{app, machine, prim, xvm};
use xjit::ir::{Annotation, ArgId, BinaryOp, Constant, MethodBody, Op, A_DEFAULT, A_STACK};
use xjit::jit::{Insn, JitFlavor, NativeClass, NativeKind};
use xjit::jit::insn::NativeConst;
use xjit::vm::{FailEverythingInjector, Injector, Object, ResourceInjector};
use xjit::{InjectError, JitCompiler, JitError, MachineError, Primitive, Type, Value};

fn boolean() -> Type {
    prim(Primitive::Boolean)
}

/// `pick(flag: Boolean? = true) -> Boolean`
fn pick() -> MethodBody {
    MethodBody::new("pick")
        .with_default_param("flag", Type::nullable(boolean()), Constant::Bool(true))
        .with_return(boolean())
        .with_ops(vec![Op::Return { values: vec![0] }])
}

/// `pickDefault() -> Boolean`: calls `pick()` with its default.
fn pick_default() -> MethodBody {
    MethodBody::new("pickDefault").with_return(boolean()).with_ops(vec![
        Op::Call {
            method: "pick".into(),
            args: vec![A_DEFAULT],
            returns: vec![A_STACK],
        },
        Op::Return { values: vec![A_STACK] },
    ])
}

#[test]
fn test_nullable_boolean_default() {
    let xvm = xvm();
    let ts = xvm.create_type_system_for(None, app(vec![pick(), pick_default()]), None).unwrap();
    let compiler = JitCompiler::new(Arc::clone(&ts), xvm.config().clone());
    let compiled = compiler.compile_named("pick").unwrap();

    // value slot and "use default" flag beyond the context
    let desc = &compiled.desc;
    let sig = desc.optimized_signature().unwrap();
    assert_eq!(sig.params.len() - desc.implicit_param_count(), 2);
    assert_eq!(sig.params[1..], [NativeClass::Boolean, NativeClass::Boolean]);
    assert_eq!(desc.get_optimized_param(0).unwrap().flavor, JitFlavor::PrimitiveWithDefault);

    // a default argument pushes a zero value and a set flag
    let caller = compiler.compile_named("pickDefault").unwrap();
    let insns = &caller.optimized.as_ref().unwrap().insns;
    let call = insns
        .iter()
        .position(|i| matches!(i, Insn::Call { optimized: true, .. }))
        .unwrap();
    assert_eq!(insns[call - 1], Insn::Const(NativeConst::Int(1)));

    let mut vm = common::machine_for(&xvm, ts, None);
    // flag set: the literal default wins over the passed bits
    let chosen = vm.invoke("pick", true, vec![Value::bool(false), Value::bool(true)]);
    assert_eq!(chosen.unwrap(), Some(Value::bool(true)));
    let passed = vm.invoke("pick", true, vec![Value::bool(false), Value::bool(false)]);
    assert_eq!(passed.unwrap(), Some(Value::bool(false)));
    assert_eq!(vm.invoke("pickDefault", true, vec![]).unwrap(), Some(Value::bool(true)));

    // the standard entry passes Null for "use default"
    let boxed = vm.invoke("pick", false, vec![Value::null()]).unwrap();
    assert_eq!(boxed, Some(Value::object(Object::Bool(true))));
    let boxed = vm.invoke("pickDefault", false, vec![]).unwrap();
    assert_eq!(boxed, Some(Value::object(Object::Bool(true))));
}

#[test]
fn test_optimize_off_generates_standard_only() {
    let xvm = common::xvm_with(
        Arc::new(common::repo()),
        xjit::JitConfig {
            optimize: xjit::OptimizeMode::Off,
            ..Default::default()
        },
    );
    let ts = xvm.create_type_system_for(None, app(vec![pick(), pick_default()]), None).unwrap();
    let compiler = JitCompiler::new(Arc::clone(&ts), xvm.config().clone());
    let compiled = compiler.compile_all().unwrap();
    assert!(compiled.iter().all(|m| m.optimized.is_none()));

    let mut vm = common::machine_for(&xvm, ts, None);
    assert_eq!(
        vm.invoke("pickDefault", false, vec![]).unwrap(),
        Some(Value::object(Object::Bool(true)))
    );
}

/// `console() -> Console` returning an injected resource.
fn console(annotation: Annotation) -> MethodBody {
    let console = Type::class("Console");
    MethodBody::new("console").with_return(console.clone()).with_ops(vec![
        Op::Ref {
            reg: 0,
            ty: console,
            name: "console".into(),
            annotation,
        },
        Op::Return { values: vec![0] },
    ])
}

fn inject() -> Annotation {
    Annotation {
        class: "Inject".into(),
        params: vec![],
    }
}

#[test]
fn test_injection() {
    let xvm = xvm();
    let console_ty = Type::class("Console");
    let resource = Object::Resource {
        ty: console_ty.clone(),
        name: "console".into(),
    };
    let injector = ResourceInjector::new().with_resource(console_ty, "console", resource.clone());
    let mut vm = machine(&xvm, app(vec![console(inject())]), Some(Arc::new(injector)));

    let first = vm.invoke("console", false, vec![]).unwrap();
    assert_eq!(first, Some(Value::object(resource)));
    let second = vm.invoke("console", false, vec![]).unwrap();
    let (Some(Value::Ref(Some(a))), Some(Value::Ref(Some(b)))) = (first, second) else {
        panic!("expected resources");
    };
    assert!(Arc::ptr_eq(&a, &b));
}

/// `console()` whose `@Inject` arguments are built from its constants.
fn console_with(params: impl FnOnce(&mut MethodBody) -> Vec<ArgId>) -> MethodBody {
    let mut method = console(inject());
    let params = params(&mut method);
    if let Op::Ref { annotation, .. } = &mut method.ops[0] {
        annotation.params = params;
    }
    method
}

#[test]
fn test_injection_by_resource_name() {
    let console_ty = Type::class("Console");
    let out = Object::Resource {
        ty: console_ty.clone(),
        name: "out".into(),
    };
    let default = Object::Resource {
        ty: console_ty.clone(),
        name: "console".into(),
    };
    let injector: Arc<dyn Injector> = Arc::new(
        ResourceInjector::new()
            .with_resource(console_ty.clone(), "out", out.clone())
            .with_resource(console_ty, "console", default.clone()),
    );
    let run = |method: MethodBody| {
        let xvm = xvm();
        let mut vm = machine(&xvm, app(vec![method]), Some(injector.clone()));
        vm.invoke("console", false, vec![]).unwrap()
    };

    let named = console_with(|m| vec![m.add_constant(Constant::string("out"))]);
    assert_eq!(run(named), Some(Value::object(out.clone())));

    let default_opts = console_with(|m| vec![m.add_constant(Constant::string("out")), A_DEFAULT]);
    assert_eq!(run(default_opts), Some(Value::object(out)));

    // a name that is not a string falls back to the variable name
    let numeric = console_with(|m| vec![m.add_constant(Constant::int64(7))]);
    assert_eq!(run(numeric), Some(Value::object(default)));
}

#[test]
fn test_injection_failure() {
    let xvm = xvm();
    let mut vm = machine(
        &xvm,
        app(vec![console(inject())]),
        Some(Arc::new(FailEverythingInjector)),
    );
    let err = vm.invoke("console", false, vec![]).unwrap_err();
    assert!(matches!(
        err,
        MachineError::Inject(InjectError::UnknownResource { ref name, .. }) if name == "console"
    ));
}

#[test]
fn test_injection_options_unsupported() {
    let xvm = xvm();
    let method = console_with(|m| {
        vec![
            m.add_constant(Constant::string("out")),
            m.add_constant(Constant::string("opts")),
        ]
    });
    let ts = xvm.create_type_system_for(None, app(vec![method]), None).unwrap();
    let err = JitCompiler::new(ts, xvm.config().clone())
        .compile_named("console")
        .unwrap_err();
    assert!(matches!(err, JitError::Op { addr: 0, .. }));
    assert!(matches!(err.root(), JitError::Unsupported(_)));
}

#[test]
fn test_char_arithmetic() {
    let char_ty = prim(Primitive::Char);
    let next = MethodBody::new("next")
        .with_param("c", char_ty.clone())
        .with_param("n", prim(Primitive::Int32))
        .with_return(char_ty.clone())
        .with_ops(vec![
            Op::Binary {
                kind: BinaryOp::Add,
                lhs: 0,
                rhs: 1,
                ret: A_STACK,
            },
            Op::Return { values: vec![A_STACK] },
        ]);
    let join = MethodBody::new("join")
        .with_param("a", char_ty.clone())
        .with_param("b", char_ty)
        .with_return(Type::string())
        .with_ops(vec![
            Op::Binary {
                kind: BinaryOp::Add,
                lhs: 0,
                rhs: 1,
                ret: A_STACK,
            },
            Op::Return { values: vec![A_STACK] },
        ]);
    let xvm = xvm();
    let mut vm = machine(&xvm, app(vec![next, join]), None);

    let b = vm.invoke("next", true, vec![Value::Int('a' as i32), Value::Int(1)]).unwrap();
    assert_eq!(b, Some(Value::Int('b' as i32)));
    let err = vm
        .invoke("next", true, vec![Value::Int(0x10FFFF), Value::Int(1)])
        .unwrap_err();
    assert!(matches!(err, MachineError::CodePointOutOfRange(0x110000)));
    let err = vm.invoke("next", true, vec![Value::Int(0), Value::Int(-1)]).unwrap_err();
    assert!(matches!(err, MachineError::CodePointOutOfRange(-1)));

    let s = vm
        .invoke("join", true, vec![Value::Int('x' as i32), Value::Int('y' as i32)])
        .unwrap();
    assert_eq!(s, Some(Value::string("xy")));
}

#[test]
fn test_sub_word_results_wrap() {
    let add = common::binary_method("add8", BinaryOp::Add, Primitive::Int8, Primitive::Int8);
    let xvm = xvm();
    let mut vm = machine(&xvm, app(vec![add]), None);
    let r = vm.invoke("add8", true, vec![Value::Int(127), Value::Int(1)]).unwrap();
    assert_eq!(r, Some(Value::Int(-128)));
    assert!(vm.executed() > 0);
    // the natural return never touches the carriers
    assert!(vm.carrier(NativeKind::Long, 0).is_err());
}
