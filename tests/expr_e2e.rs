//! End-to-end validation of the expression generators: emit, execute, and
//! compare against scalar references; decode the emitted bytes where the
//! instruction selection itself is the contract.

#![cfg(target_arch = "x86_64")]

mod common;

use common::AlignedBuf;
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use tensorjit::expr::{
    AccKind, Expression, ExpressionGenerator, Op, OpKind, ScalarFltSseGenerator,
    VectorFltAvx256Generator,
};
use tensorjit::{CompiledKernel, CpuFeatures, DType, MacroAssembler};

macro_rules! skip_without {
    ($flag:expr, $name:literal) => {
        if !$flag {
            eprintln!(concat!($name, " not supported on this CPU, skipping"));
            return;
        }
    };
}

fn compile(
    gen: &dyn ExpressionGenerator,
    expr: &Expression,
    cpu: CpuFeatures,
) -> (CompiledKernel, Vec<u8>) {
    let mut masm = MacroAssembler::new(cpu).unwrap();
    gen.generate(expr, &mut masm).unwrap();
    let code = masm.finalize().unwrap();
    (CompiledKernel::from_code(&code).unwrap(), code)
}

fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode().mnemonic());
    }
    out
}

fn run_f32(kernel: &CompiledKernel, slots: &mut AlignedBuf) {
    unsafe { kernel.entry_expr_f32()(slots.as_mut_ptr()) }
}

#[test]
fn max_of_sqrt_and_sum() {
    // dst = max(sqrt(a), b + c)
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 2,
        num_slots: 4,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Sqrt).dst(0).src(0),
            Op::new(OpKind::Mov).dst(1).arg(1),
            Op::new(OpKind::Add).dst(1).arg(0).arg(2),
            Op::new(OpKind::Maximum).dst(0).src(1),
            Op::new(OpKind::Mov).src(0).arg(3),
        ],
    };
    let cpu = CpuFeatures::detect();
    let (kernel, code) = compile(&ScalarFltSseGenerator, &expr, cpu);

    let ops = mnemonics(&code);
    assert!(ops.contains(&Mnemonic::Sqrtss));
    assert!(ops.contains(&Mnemonic::Addss));
    assert!(ops.contains(&Mnemonic::Maxss));
    assert!(ops.contains(&Mnemonic::Movss));

    for (a, b, c) in [(4.0f32, 1.0, 0.5), (0.25, 3.0, 2.0), (9.0, -5.0, 1.0)] {
        let mut slots = AlignedBuf::zeroed(4);
        slots.as_mut_slice()[..3].copy_from_slice(&[a, b, c]);
        run_f32(&kernel, &mut slots);
        let expected = a.sqrt().max(b + c);
        assert_eq!(slots.as_slice()[3], expected, "inputs ({a},{b},{c})");
    }
}

#[test]
fn zero_idiom_equivalence() {
    // MOV of the zero constant: XOR idiom on, memory load off. Same result.
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 1,
        num_slots: 2,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).imm(0.0).arg(0),
            Op::new(OpKind::Mov).src(0).arg(1),
        ],
    };

    let mut with_idiom = CpuFeatures::detect();
    with_idiom.zero_idiom = true;
    let (kernel, code) = compile(&ScalarFltSseGenerator, &expr, with_idiom);
    assert!(mnemonics(&code).contains(&Mnemonic::Xorps));
    let mut slots = AlignedBuf::zeroed(2);
    slots.as_mut_slice()[1] = 123.0;
    run_f32(&kernel, &mut slots);
    let with_idiom_result = slots.as_slice()[1];

    let mut without_idiom = CpuFeatures::detect();
    without_idiom.zero_idiom = false;
    let (kernel, code) = compile(&ScalarFltSseGenerator, &expr, without_idiom);
    assert!(!mnemonics(&code).contains(&Mnemonic::Xorps));
    let mut slots = AlignedBuf::zeroed(2);
    slots.as_mut_slice()[1] = 123.0;
    run_f32(&kernel, &mut slots);

    assert_eq!(with_idiom_result, 0.0);
    assert_eq!(slots.as_slice()[1], with_idiom_result);
}

#[test]
fn conditional_picks_by_mask() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.sse41, "SSE4.1");
    // out1 = x > y ? x : y; out2 = x > y ? x : 0
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 4,
        num_slots: 4,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Mov).dst(1).arg(1),
            Op::new(OpKind::Mov).dst(2).arg(0),
            Op::new(OpKind::CmpGtOq).dst(2).src(1),
            Op::new(OpKind::Cond).dst(3).src(0).src2(1).mask(2),
            Op::new(OpKind::Mov).src(3).arg(2),
            Op::new(OpKind::Select).dst(3).src(0).mask(2),
            Op::new(OpKind::Mov).src(3).arg(3),
        ],
    };
    let (kernel, code) = compile(&ScalarFltSseGenerator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Ptest));

    for (x, y) in [(2.0f32, 1.0), (1.0, 2.0), (5.0, 5.0)] {
        let mut slots = AlignedBuf::zeroed(4);
        slots.as_mut_slice()[..2].copy_from_slice(&[x, y]);
        run_f32(&kernel, &mut slots);
        let cond = if x > y { x } else { y };
        let select = if x > y { x } else { 0.0 };
        assert_eq!(slots.as_slice()[2], cond, "cond for ({x},{y})");
        assert_eq!(slots.as_slice()[3], select, "select for ({x},{y})");
    }
}

#[test]
fn floor_rounds_down() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.sse41, "SSE4.1");
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 1,
        num_slots: 2,
        ops: vec![
            Op::new(OpKind::Floor).dst(0).arg(0),
            Op::new(OpKind::Mov).src(0).arg(1),
        ],
    };
    let (kernel, code) = compile(&ScalarFltSseGenerator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Roundss));

    for (input, expected) in [(2.7f32, 2.0f32), (-1.3, -2.0), (5.0, 5.0)] {
        let mut slots = AlignedBuf::zeroed(2);
        slots.as_mut_slice()[0] = input;
        run_f32(&kernel, &mut slots);
        assert_eq!(slots.as_slice()[1], expected, "floor({input})");
    }
}

#[test]
fn bitwise_not_flips_every_bit() {
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 1,
        num_slots: 2,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Not).dst(0).src(0),
            Op::new(OpKind::Mov).src(0).arg(1),
        ],
    };
    let (kernel, _) = compile(&ScalarFltSseGenerator, &expr, CpuFeatures::detect());

    let mut slots = AlignedBuf::zeroed(2);
    slots.as_mut_slice()[0] = 1.0;
    run_f32(&kernel, &mut slots);
    assert_eq!(slots.as_slice()[1].to_bits(), !1.0f32.to_bits());
}

#[test]
fn bitwise_ops_on_float_lanes() {
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 2,
        num_slots: 3,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Mov).dst(1).arg(1),
            Op::new(OpKind::And).dst(0).src(1),
            Op::new(OpKind::Mov).src(0).arg(2),
        ],
    };
    let (kernel, _) = compile(&ScalarFltSseGenerator, &expr, CpuFeatures::detect());

    let mut slots = AlignedBuf::zeroed(3);
    let x = f32::from_bits(0xFFFF_0000);
    let y = f32::from_bits(0x0F0F_0F0F);
    slots.as_mut_slice()[..2].copy_from_slice(&[x, y]);
    run_f32(&kernel, &mut slots);
    assert_eq!(slots.as_slice()[2].to_bits(), 0x0F0F_0000);
}

#[test]
fn exponent_field_extraction() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.sse2, "SSE2");
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 1,
        num_slots: 2,
        ops: vec![
            Op::new(OpKind::CvtExpInt).dst(0).arg(0),
            Op::new(OpKind::Mov).src(0).arg(1),
        ],
    };
    let (kernel, _) = compile(&ScalarFltSseGenerator, &expr, cpu);

    let mut slots = AlignedBuf::zeroed(2);
    slots.as_mut_slice()[0] = 8.0; // biased exponent 130
    run_f32(&kernel, &mut slots);
    assert_eq!(slots.as_slice()[1].to_bits(), 130);
}

#[test]
fn sum_reduction_accumulates() {
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 1,
        num_slots: 4,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Accumulate(AccKind::Sum)).acc(0).arg(1),
            Op::new(OpKind::Accumulate(AccKind::Sum)).acc(0).arg(2),
            Op::new(OpKind::Reduce(AccKind::Sum)).acc(0).arg(3),
        ],
    };
    let (kernel, _) = compile(&ScalarFltSseGenerator, &expr, CpuFeatures::detect());

    let mut slots = AlignedBuf::zeroed(4);
    slots.as_mut_slice()[..3].copy_from_slice(&[1.5, 2.25, -0.75]);
    run_f32(&kernel, &mut slots);
    assert_eq!(slots.as_slice()[3], 3.0);
}

#[test]
fn double_precision_pipeline() {
    // dst = sqrt(a) * (b - c) in f64.
    let expr = Expression {
        dtype: DType::F64,
        num_regs: 2,
        num_slots: 4,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Sqrt).dst(0).src(0),
            Op::new(OpKind::Mov).dst(1).arg(1),
            Op::new(OpKind::Sub).dst(1).arg(0).arg(2),
            Op::new(OpKind::Mul).dst(0).src(1),
            Op::new(OpKind::Mov).src(0).arg(3),
        ],
    };
    let cpu = CpuFeatures::detect();
    let (kernel, code) = compile(&ScalarFltSseGenerator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Sqrtsd));

    let mut slots = vec![0.0f64; 4];
    slots[..3].copy_from_slice(&[16.0, 5.5, 1.5]);
    unsafe { kernel.entry_expr_f64()(slots.as_mut_ptr()) }
    assert_eq!(slots[3], 16.0f64.sqrt() * 4.0);
}

// ── Vector generator ────────────────────────────────────────────────────────

#[test]
fn vector_elementwise_add() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.avx, "AVX");
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 2,
        num_slots: 3,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Add).dst(1).src(0).arg(0).arg(1),
            Op::new(OpKind::Mov).src(1).arg(2),
        ],
    };
    let (kernel, code) = compile(&VectorFltAvx256Generator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Vaddps));

    // Slots are 32-byte vectors: 8 f32 lanes each.
    let mut slots = AlignedBuf::zeroed(3 * 8);
    for lane in 0..8 {
        slots.as_mut_slice()[lane] = lane as f32;
        slots.as_mut_slice()[8 + lane] = 10.0 * lane as f32;
    }
    run_f32(&kernel, &mut slots);
    for lane in 0..8 {
        assert_eq!(slots.as_slice()[16 + lane], 11.0 * lane as f32);
    }
}

#[test]
fn vector_blend_selects_per_lane() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.avx, "AVX");
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 4,
        num_slots: 3,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Mov).dst(1).arg(1),
            Op::new(OpKind::CmpGtOq).dst(2).src(0).src2(1),
            // Blend picks the second source where the mask is set.
            Op::new(OpKind::Cond).dst(3).src(0).src2(1).mask(2),
            Op::new(OpKind::Mov).src(3).arg(2),
        ],
    };
    let (kernel, code) = compile(&VectorFltAvx256Generator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Vblendvps));

    let mut slots = AlignedBuf::zeroed(3 * 8);
    for lane in 0..8 {
        slots.as_mut_slice()[lane] = lane as f32;
        slots.as_mut_slice()[8 + lane] = 4.0;
    }
    run_f32(&kernel, &mut slots);
    for lane in 0..8 {
        let x = lane as f32;
        let expected = if x > 4.0 { 4.0 } else { x };
        assert_eq!(slots.as_slice()[16 + lane], expected, "lane {lane}");
    }
}

#[test]
fn vector_sum_reduction() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.avx, "AVX");
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 1,
        num_slots: 2,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Reduce(AccKind::Sum)).acc(0).arg(1),
        ],
    };
    let (kernel, code) = compile(&VectorFltAvx256Generator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Vhaddps));

    let mut slots = AlignedBuf::zeroed(2 * 8);
    let mut expected = 0.0f32;
    for lane in 0..8 {
        let v = (lane * lane) as f32 - 3.0;
        slots.as_mut_slice()[lane] = v;
        expected += v;
    }
    run_f32(&kernel, &mut slots);
    assert!((slots.as_slice()[8] - expected).abs() < 1e-4);
}

#[test]
fn vector_fma_when_available() {
    let cpu = CpuFeatures::detect();
    skip_without!(cpu.avx && cpu.fma3, "FMA3");
    // r0 = r0 * r1 + r2 via the 213 form.
    let expr = Expression {
        dtype: DType::F32,
        num_regs: 3,
        num_slots: 4,
        ops: vec![
            Op::new(OpKind::Mov).dst(0).arg(0),
            Op::new(OpKind::Mov).dst(1).arg(1),
            Op::new(OpKind::Mov).dst(2).arg(2),
            Op::new(OpKind::MulAdd213).dst(0).src(1).src2(2),
            Op::new(OpKind::Mov).src(0).arg(3),
        ],
    };
    let (kernel, code) = compile(&VectorFltAvx256Generator, &expr, cpu);
    assert!(mnemonics(&code).contains(&Mnemonic::Vfmadd213ps));

    let mut slots = AlignedBuf::zeroed(4 * 8);
    for lane in 0..8 {
        slots.as_mut_slice()[lane] = lane as f32;
        slots.as_mut_slice()[8 + lane] = 2.0;
        slots.as_mut_slice()[16 + lane] = 1.0;
    }
    run_f32(&kernel, &mut slots);
    for lane in 0..8 {
        assert_eq!(slots.as_slice()[24 + lane], lane as f32 * 2.0 + 1.0);
    }
}
