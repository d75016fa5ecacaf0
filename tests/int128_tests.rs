//! Paired-word 128-bit arithmetic, compiled and run on the reference
//! machine, checked against native `i128`/`u128`.

mod common;

use common::{app, binary_method, machine, prim, xvm};
use xjit::ir::{BinaryOp, MethodBody, Op, UnaryOp, A_STACK};
use xjit::jit::NativeKind;
use xjit::vm::Object;
use xjit::{Machine, MachineError, Primitive, Value};

const BOUNDARY: [i128; 8] = [
    0,
    1,
    -1,
    u64::MAX as i128,
    (u64::MAX as i128) + 1,
    i128::MIN,
    i128::MAX,
    -(u64::MAX as i128),
];

/// Deterministic xorshift so failures are reproducible.
struct Fuzz(u64);

impl Fuzz {
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn next_i128(&mut self) -> i128 {
        let hi = self.next_u64() as u128;
        let lo = self.next_u64() as u128;
        // vary the magnitude so small operands show up too
        let shift = (self.next_u64() % 128) as u32;
        let value = ((hi << 64 | lo) >> shift) as i128;
        if self.next_u64() & 1 == 0 { value } else { value.wrapping_neg() }
    }
}

fn operands() -> Vec<(i128, i128)> {
    let mut pairs = Vec::new();
    for a in BOUNDARY {
        for b in BOUNDARY {
            pairs.push((a, b));
        }
    }
    let mut fuzz = Fuzz(0x9E37_79B9_7F4A_7C15);
    for _ in 0..200 {
        pairs.push((fuzz.next_i128(), fuzz.next_i128()));
    }
    pairs
}

fn wide_machine(p: Primitive) -> Machine {
    let kinds = [
        ("add", BinaryOp::Add),
        ("sub", BinaryOp::Sub),
        ("mul", BinaryOp::Mul),
        ("div", BinaryOp::Div),
        ("mod", BinaryOp::Mod),
        ("and", BinaryOp::And),
        ("or", BinaryOp::Or),
        ("xor", BinaryOp::Xor),
    ];
    let mut methods: Vec<MethodBody> = kinds
        .iter()
        .map(|(name, kind)| binary_method(name, *kind, p, p))
        .collect();
    for (name, kind) in [("shl", BinaryOp::Shl), ("shr", BinaryOp::Shr), ("ushr", BinaryOp::ShrAll)] {
        methods.push(binary_method(name, kind, p, Primitive::Int64));
    }
    for (name, kind) in [("neg", UnaryOp::Neg), ("compl", UnaryOp::Compl)] {
        methods.push(
            MethodBody::new(name)
                .with_param("a", prim(p))
                .with_return(prim(p))
                .with_ops(vec![
                    Op::Unary {
                        kind,
                        arg: 0,
                        ret: A_STACK,
                    },
                    Op::Return { values: vec![A_STACK] },
                ]),
        );
    }
    machine(&xvm(), app(methods), None)
}

fn words(value: i128) -> [Value; 2] {
    let (lo, hi) = Value::wide(value);
    [lo, hi]
}

/// Call an optimized wide routine; the high word comes back in the
/// long carrier.
fn call(vm: &mut Machine, name: &str, args: Vec<Value>) -> Result<i128, MachineError> {
    let lo = vm.invoke(name, true, args)?.and_then(|v| v.as_long()).unwrap();
    let hi = vm.carrier(NativeKind::Long, 0)?.as_long().unwrap();
    Ok(((hi as i128) << 64) | (lo as u64 as i128))
}

fn call2(vm: &mut Machine, name: &str, a: i128, b: i128) -> Result<i128, MachineError> {
    let mut args = words(a).to_vec();
    args.extend(words(b));
    call(vm, name, args)
}

fn floor_mod(a: i128, b: i128) -> i128 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

#[test]
fn test_add_sub_mul_match_native() {
    let mut vm = wide_machine(Primitive::Int128);
    for (a, b) in operands() {
        assert_eq!(call2(&mut vm, "add", a, b).unwrap(), a.wrapping_add(b), "{a} + {b}");
        assert_eq!(call2(&mut vm, "sub", a, b).unwrap(), a.wrapping_sub(b), "{a} - {b}");
        assert_eq!(call2(&mut vm, "mul", a, b).unwrap(), a.wrapping_mul(b), "{a} * {b}");
    }
}

#[test]
fn test_bitwise_and_unary_match_native() {
    let mut vm = wide_machine(Primitive::Int128);
    for (a, b) in operands() {
        assert_eq!(call2(&mut vm, "and", a, b).unwrap(), a & b);
        assert_eq!(call2(&mut vm, "or", a, b).unwrap(), a | b);
        assert_eq!(call2(&mut vm, "xor", a, b).unwrap(), a ^ b);
        assert_eq!(call(&mut vm, "neg", words(a).to_vec()).unwrap(), a.wrapping_neg(), "-{a}");
        assert_eq!(call(&mut vm, "compl", words(a).to_vec()).unwrap(), !a, "~{a}");
    }
}

#[test]
fn test_signed_division() {
    let mut vm = wide_machine(Primitive::Int128);
    for (a, b) in operands() {
        if b == 0 || (a == i128::MIN && b == -1) {
            continue;
        }
        assert_eq!(call2(&mut vm, "div", a, b).unwrap(), a / b, "{a} / {b}");
        assert_eq!(call2(&mut vm, "mod", a, b).unwrap(), floor_mod(a, b), "{a} % {b}");
    }
}

#[test]
fn test_unsigned_division() {
    let mut vm = wide_machine(Primitive::UInt128);
    for (a, b) in operands() {
        let (ua, ub) = (a as u128, b as u128);
        if ub == 0 {
            continue;
        }
        assert_eq!(call2(&mut vm, "div", a, b).unwrap() as u128, ua / ub, "{ua} / {ub}");
        assert_eq!(call2(&mut vm, "mod", a, b).unwrap() as u128, ua % ub, "{ua} % {ub}");
    }
}

#[test]
fn test_division_by_zero_faults() {
    let mut vm = wide_machine(Primitive::Int128);
    let err = call2(&mut vm, "div", 12, 0).unwrap_err();
    assert!(matches!(err, MachineError::DivisionByZero));
}

#[test]
fn test_shift_partitions() {
    let mut vm = wide_machine(Primitive::Int128);
    let values = [1, -1, i128::MIN, i128::MAX, 0x0123_4567_89AB_CDEF_FEDC_BA98_7654_3210];
    for a in values {
        for n in [0u32, 1, 63, 64, 65, 127] {
            let mut args = words(a).to_vec();
            args.push(Value::Long(n as i64));
            assert_eq!(call(&mut vm, "shl", args.clone()).unwrap(), a << n, "{a} << {n}");
            assert_eq!(call(&mut vm, "shr", args.clone()).unwrap(), a >> n, "{a} >> {n}");
            assert_eq!(
                call(&mut vm, "ushr", args).unwrap(),
                ((a as u128) >> n) as i128,
                "{a} >>> {n}"
            );
        }
    }

    // an unsigned type shifts right with zero fill
    let mut vm = wide_machine(Primitive::UInt128);
    let mut args = words(-1).to_vec();
    args.push(Value::Long(127));
    assert_eq!(call(&mut vm, "shr", args).unwrap(), 1);
}

#[test]
fn test_standard_entry_boxes() {
    let mut vm = wide_machine(Primitive::Int128);
    let a = (u64::MAX as i128) + 7;
    let result = vm
        .invoke(
            "add",
            false,
            vec![Value::boxed(Primitive::Int128, a), Value::boxed(Primitive::Int128, -8)],
        )
        .unwrap();
    assert_eq!(
        result,
        Some(Value::object(Object::Num {
            ty: Primitive::Int128,
            value: a - 8
        }))
    );
}
