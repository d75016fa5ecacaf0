use semver::Version;
use serde::Serialize;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;
use xjit::ir::{BinaryOp, MethodBody, Op, A_STACK};
use xjit::jit::NativeKind;
use xjit::link::MemoryRepository;
use xjit::{JitCompiler, JitConfig, Machine, ModuleStructure, OptimizeMode, Primitive, Type, Value, Xvm};

const ITERATIONS: usize = 20_000;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    optimized_secs: f64,
    standard_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    iterations: usize,
    results: Vec<BenchmarkResult>,
}

fn binary(name: &str, kind: BinaryOp) -> MethodBody {
    let ty = Type::Primitive(Primitive::Int128);
    MethodBody::new(name)
        .with_param("a", ty.clone())
        .with_param("b", ty.clone())
        .with_return(ty)
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

fn machine(kinds: &[(&str, BinaryOp)]) -> Machine {
    let v = Version::new(1, 0, 0);
    let repo = MemoryRepository::new()
        .with_module(ModuleStructure::new("ecstasy.xtclang.org", v.clone()).with_class("Object"));
    let config = JitConfig {
        optimize: OptimizeMode::On,
        ..Default::default()
    };
    let xvm = Xvm::new(Arc::new(repo), config).unwrap();
    let app = kinds
        .iter()
        .fold(ModuleStructure::new("bench.example.org", v), |m, (name, kind)| {
            m.with_method(binary(name, *kind))
        });
    let ts = xvm.create_type_system_for(None, app, None).unwrap();
    let compiled = JitCompiler::new(Arc::clone(&ts), xvm.config().clone())
        .compile_all()
        .unwrap();
    Machine::new(compiled.into_iter().collect(), xvm.create_container(ts, None))
}

/// Operand pairs with a non-zero divisor.
fn operands() -> Vec<(i128, i128)> {
    let mut x: u64 = 0x2545_F491_4F6C_DD1D;
    let mut next = move || {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        x
    };
    (0..ITERATIONS)
        .map(|_| {
            let a = ((next() as i128) << 64) | next() as i128;
            let b = (next() as i128) | 1;
            (a, b)
        })
        .collect()
}

fn time<F: FnMut()>(mut f: F) -> f64 {
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn run_optimized(vm: &mut Machine, name: &str, ops: &[(i128, i128)]) -> f64 {
    time(|| {
        for &(a, b) in ops {
            let (a_lo, a_hi) = Value::wide(a);
            let (b_lo, b_hi) = Value::wide(b);
            let lo = vm.invoke(name, true, vec![a_lo, a_hi, b_lo, b_hi]).unwrap();
            let hi = vm.carrier(NativeKind::Long, 0).unwrap();
            black_box((lo, hi));
        }
    })
}

fn run_standard(vm: &mut Machine, name: &str, ops: &[(i128, i128)]) -> f64 {
    time(|| {
        for &(a, b) in ops {
            let args = vec![
                Value::boxed(Primitive::Int128, a),
                Value::boxed(Primitive::Int128, b),
            ];
            black_box(vm.invoke(name, false, args).unwrap());
        }
    })
}

fn main() {
    let kinds = [
        ("add", BinaryOp::Add),
        ("mul", BinaryOp::Mul),
        ("div", BinaryOp::Div),
        ("mod", BinaryOp::Mod),
    ];
    let mut vm = machine(&kinds);
    let ops = operands();

    let mut results = Vec::new();
    for (name, kind) in kinds {
        let rust_time = time(|| {
            for &(a, b) in &ops {
                black_box(match kind {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div => a.wrapping_div(b),
                    _ => a.rem_euclid(b),
                });
            }
        });
        results.push(BenchmarkResult {
            name: format!("int128_{name}"),
            optimized_secs: run_optimized(&mut vm, name, &ops),
            standard_secs: run_standard(&mut vm, name, &ops),
            rust_time_secs: rust_time,
        });
    }

    let output = BenchmarkOutput {
        iterations: ITERATIONS,
        results,
    };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
