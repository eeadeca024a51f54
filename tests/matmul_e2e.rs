//! End-to-end matmul validation: emit code for each loop nest, execute it,
//! and verify numerical correctness against a scalar reference.
//!
//! Tests runtime-detect the CPU features they need and skip gracefully on
//! hardware without them. Emission-only tests (variants, determinism) run
//! everywhere.

#![cfg(target_arch = "x86_64")]

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tensorjit::{
    register_simd_matmul_library, CompiledKernel, CpuFeatures, DType, Kernel, Library,
    MacroAssembler, Order, SimdMatMul, Step, Tensor,
};

macro_rules! skip_without {
    ($cpu:expr) => {
        if !machine_supports(&$cpu) {
            eprintln!("feature level not supported on this CPU, skipping");
            return;
        }
    };
}

struct MatMulCase {
    m: usize,
    k: usize,
    n: usize,
    a_order: Order,
    b_order: Order,
    c_order: Order,
    transpose_a: bool,
    transpose_b: bool,
    accumulate: bool,
    pad: usize,
}

impl MatMulCase {
    fn new(m: usize, k: usize, n: usize) -> MatMulCase {
        MatMulCase {
            m,
            k,
            n,
            a_order: Order::RowMajor,
            b_order: Order::RowMajor,
            c_order: Order::RowMajor,
            transpose_a: false,
            transpose_b: false,
            accumulate: false,
            pad: 0,
        }
    }

    fn orders(mut self, a: Order, b: Order) -> MatMulCase {
        self.a_order = a;
        self.b_order = b;
        self
    }

    fn c_order(mut self, c: Order) -> MatMulCase {
        self.c_order = c;
        self
    }

    fn transposed(mut self, a: bool, b: bool) -> MatMulCase {
        self.transpose_a = a;
        self.transpose_b = b;
        self
    }

    fn accumulate(mut self) -> MatMulCase {
        self.accumulate = true;
        self
    }

    fn pad(mut self, pad: usize) -> MatMulCase {
        self.pad = pad;
        self
    }

    fn context(&self) -> String {
        format!(
            "{}x{}x{} a={:?}/t{} b={:?}/t{} c={:?} acc={} pad={}",
            self.m,
            self.k,
            self.n,
            self.a_order,
            self.transpose_a,
            self.b_order,
            self.transpose_b,
            self.c_order,
            self.accumulate,
            self.pad
        )
    }
}

/// Emit, run and check one matmul case. Returns the variant string.
fn run_case(cpu: CpuFeatures, case: &MatMulCase, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let a_logical = random_matrix(&mut rng, case.m, case.k);
    let b_logical = random_matrix(&mut rng, case.k, case.n);
    let c0 = random_matrix(&mut rng, case.m, case.n);

    // Physical storage holds the transposed matrix when the step carries a
    // transposition attribute.
    let a_phys = if case.transpose_a { transpose(&a_logical) } else { a_logical.clone() };
    let b_phys = if case.transpose_b { transpose(&b_logical) } else { b_logical.clone() };

    let a_t = Tensor::matrix("a", DType::F32, a_phys.len(), a_phys[0].len(), case.a_order)
        .with_padding(case.pad)
        .shared();
    let b_t = Tensor::matrix("b", DType::F32, b_phys.len(), b_phys[0].len(), case.b_order)
        .with_padding(case.pad)
        .shared();
    let c_t = Tensor::matrix("c", DType::F32, case.m, case.n, case.c_order)
        .with_padding(case.pad)
        .shared();

    let mut step = if case.accumulate {
        Step::new(
            "AssignAddMatMul",
            vec![c_t.clone(), a_t.clone(), b_t.clone()],
            vec![],
        )
    } else {
        Step::new("MatMul", vec![a_t.clone(), b_t.clone()], vec![c_t.clone()])
    };
    step.set_attr("transpose_a", case.transpose_a);
    step.set_attr("transpose_b", case.transpose_b);

    let mut library = Library::new();
    register_simd_matmul_library(&mut library);
    let kernel = library.select(&step).expect("no kernel supports this step");
    kernel.adjust(&step, &cpu);

    let mut masm = MacroAssembler::new(cpu).unwrap();
    kernel.generate(&mut step, &mut masm).unwrap();
    let code = masm.finalize().unwrap();
    let compiled = CompiledKernel::from_code(&code).unwrap();

    let mut a_buf = store_matrix(&a_t.borrow(), &a_phys);
    let mut b_buf = store_matrix(&b_t.borrow(), &b_phys);
    // Initial C content: added when accumulating, overwritten otherwise.
    let mut c_buf = store_matrix(&c_t.borrow(), &c0);

    unsafe {
        let f = compiled.entry3();
        if case.accumulate {
            f(c_buf.as_mut_ptr(), a_buf.as_mut_ptr(), b_buf.as_mut_ptr());
        } else {
            f(a_buf.as_mut_ptr(), b_buf.as_mut_ptr(), c_buf.as_mut_ptr());
        }
    }

    let zeros = vec![vec![0.0f32; case.n]; case.m];
    let expected = reference_matmul(
        &a_logical,
        &b_logical,
        if case.accumulate { &c0 } else { &zeros },
    );
    let actual = read_matrix(&c_t.borrow(), &c_buf);
    assert_matrix_eq(&actual, &expected, &case.context());
    step.variant().to_string()
}

#[test]
fn small_row_row_product() {
    let cpu = CpuFeatures::detect();
    let a_t = Tensor::matrix("a", DType::F32, 2, 3, Order::RowMajor).shared();
    let b_t = Tensor::matrix("b", DType::F32, 3, 2, Order::RowMajor).shared();
    let c_t = Tensor::matrix("c", DType::F32, 2, 2, Order::RowMajor).shared();
    let mut step = Step::new("MatMul", vec![a_t.clone(), b_t.clone()], vec![c_t.clone()]);

    let kernel = SimdMatMul::new(false);
    assert!(kernel.supports(&step));
    kernel.adjust(&step, &cpu);

    let mut masm = MacroAssembler::new(cpu).unwrap();
    kernel.generate(&mut step, &mut masm).unwrap();
    assert!(step.variant().ends_with("RR"));

    let compiled = CompiledKernel::from_code(&masm.finalize().unwrap()).unwrap();
    let mut a = store_matrix(
        &a_t.borrow(),
        &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
    );
    let mut b = store_matrix(
        &b_t.borrow(),
        &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
    );
    let mut c = AlignedBuf::zeroed(c_t.borrow().byte_size() / 4);
    unsafe {
        compiled.entry3()(a.as_mut_ptr(), b.as_mut_ptr(), c.as_mut_ptr());
    }
    assert_eq!(
        read_matrix(&c_t.borrow(), &c),
        vec![vec![4.0, 5.0], vec![10.0, 11.0]]
    );
}

#[test]
fn small_accumulating_product() {
    let cpu = CpuFeatures::detect();
    let c_t = Tensor::matrix("c", DType::F32, 2, 2, Order::RowMajor).shared();
    let a_t = Tensor::matrix("a", DType::F32, 2, 3, Order::RowMajor).shared();
    let b_t = Tensor::matrix("b", DType::F32, 3, 2, Order::RowMajor).shared();
    let mut step = Step::new(
        "AssignAddMatMul",
        vec![c_t.clone(), a_t.clone(), b_t.clone()],
        vec![],
    );

    let kernel = SimdMatMul::new(true);
    assert!(kernel.supports(&step));
    kernel.adjust(&step, &cpu);

    let mut masm = MacroAssembler::new(cpu).unwrap();
    kernel.generate(&mut step, &mut masm).unwrap();
    let compiled = CompiledKernel::from_code(&masm.finalize().unwrap()).unwrap();

    let mut a = store_matrix(
        &a_t.borrow(),
        &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
    );
    let mut b = store_matrix(
        &b_t.borrow(),
        &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
    );
    let mut c = store_matrix(&c_t.borrow(), &[vec![1.0, 1.0], vec![1.0, 1.0]]);
    unsafe {
        compiled.entry3()(c.as_mut_ptr(), a.as_mut_ptr(), b.as_mut_ptr());
    }
    assert_eq!(
        read_matrix(&c_t.borrow(), &c),
        vec![vec![5.0, 6.0], vec![11.0, 12.0]]
    );
}

#[test]
fn identity_leaves_b_unchanged() {
    let cpu = CpuFeatures::detect();
    let a_t = Tensor::matrix("a", DType::F32, 4, 4, Order::RowMajor).shared();
    let b_t = Tensor::matrix("b", DType::F32, 4, 4, Order::RowMajor).shared();
    let c_t = Tensor::matrix("c", DType::F32, 4, 4, Order::RowMajor).shared();
    let mut step = Step::new("MatMul", vec![a_t.clone(), b_t.clone()], vec![c_t.clone()]);

    let kernel = SimdMatMul::new(false);
    kernel.adjust(&step, &cpu);
    let mut masm = MacroAssembler::new(cpu).unwrap();
    kernel.generate(&mut step, &mut masm).unwrap();
    let compiled = CompiledKernel::from_code(&masm.finalize().unwrap()).unwrap();

    let identity: Vec<Vec<f32>> = (0..4)
        .map(|i| (0..4).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    let mut rng = StdRng::seed_from_u64(7);
    let b_data = random_matrix(&mut rng, 4, 4);

    let mut a = store_matrix(&a_t.borrow(), &identity);
    let mut b = store_matrix(&b_t.borrow(), &b_data);
    let mut c = AlignedBuf::zeroed(c_t.borrow().byte_size() / 4);
    unsafe {
        compiled.entry3()(a.as_mut_ptr(), b.as_mut_ptr(), c.as_mut_ptr());
    }
    assert_matrix_eq(&read_matrix(&c_t.borrow(), &c), &b_data, "identity");
}

#[test]
fn outer_product_is_strided_vertical() {
    let cpu = CpuFeatures::detect();
    let variant = run_case(
        cpu,
        &MatMulCase::new(8, 1, 8).orders(Order::ColumnMajor, Order::RowMajor),
        11,
    );
    assert!(variant.ends_with("CR"), "variant {variant}");
}

#[test]
fn orientation_matrix() {
    let cpu = CpuFeatures::detect();
    let combos = [
        (Order::RowMajor, Order::RowMajor, "RR"),
        (Order::RowMajor, Order::ColumnMajor, "RC"),
        (Order::ColumnMajor, Order::RowMajor, "CR"),
        (Order::ColumnMajor, Order::ColumnMajor, "CC"),
    ];
    for (a, b, suffix) in combos {
        for accumulate in [false, true] {
            for (m, k, n) in [(5, 7, 9), (1, 4, 5), (6, 1, 5), (3, 17, 9)] {
                let mut case = MatMulCase::new(m, k, n).orders(a, b);
                if accumulate {
                    case = case.accumulate();
                }
                let variant = run_case(cpu, &case, 100 + m as u64);
                assert!(variant.ends_with(suffix), "variant {variant} for {suffix}");
            }
        }
    }
}

#[test]
fn forced_feature_levels() {
    for cpu in [CpuFeatures::sse_only(), CpuFeatures::avx(), CpuFeatures::avx512()] {
        skip_without!(cpu);
        let combos = [
            (Order::RowMajor, Order::RowMajor),
            (Order::RowMajor, Order::ColumnMajor),
            (Order::ColumnMajor, Order::RowMajor),
            (Order::ColumnMajor, Order::ColumnMajor),
        ];
        for (a, b) in combos {
            run_case(cpu, &MatMulCase::new(5, 19, 7).orders(a, b).accumulate(), 23);
            run_case(cpu, &MatMulCase::new(5, 19, 7).orders(a, b), 29);
        }
    }
}

#[test]
fn avx_without_fma_uses_mul_add_fallback() {
    let mut cpu = CpuFeatures::avx();
    cpu.fma3 = false;
    skip_without!(cpu);
    run_case(cpu, &MatMulCase::new(4, 9, 13), 31);
    run_case(
        cpu,
        &MatMulCase::new(4, 9, 13).orders(Order::RowMajor, Order::ColumnMajor),
        37,
    );
}

#[test]
fn transpose_flags() {
    let cpu = CpuFeatures::detect();
    for (ta, tb) in [(false, false), (true, false), (false, true), (true, true)] {
        run_case(cpu, &MatMulCase::new(5, 6, 7).transposed(ta, tb), 41);
        run_case(
            cpu,
            &MatMulCase::new(5, 6, 7).transposed(ta, tb).accumulate(),
            43,
        );
    }
}

#[test]
fn column_major_output_is_normalised() {
    let cpu = CpuFeatures::detect();
    run_case(cpu, &MatMulCase::new(4, 6, 5).c_order(Order::ColumnMajor), 47);
    run_case(
        cpu,
        &MatMulCase::new(4, 6, 5).c_order(Order::ColumnMajor).accumulate(),
        53,
    );
}

#[test]
fn padded_strides_match_dense_results() {
    let cpu = CpuFeatures::detect();
    for pad in [4, 12, 20] {
        run_case(cpu, &MatMulCase::new(5, 9, 6).pad(pad), 59);
        run_case(
            cpu,
            &MatMulCase::new(5, 9, 6).orders(Order::ColumnMajor, Order::RowMajor).pad(pad),
            61,
        );
        run_case(cpu, &MatMulCase::new(5, 9, 6).accumulate().pad(pad), 67);
    }
}

#[test]
fn aligned_strides_take_the_aligned_path() {
    let cpu = CpuFeatures::avx();
    skip_without!(cpu);
    // 8-column f32 rows are 32 bytes: every stride is a whole vector.
    run_case(cpu, &MatMulCase::new(5, 8, 8), 71);
    run_case(cpu, &MatMulCase::new(5, 8, 8).accumulate(), 73);
}

#[test]
fn avx512_masked_tail() {
    let cpu = CpuFeatures::avx512();
    skip_without!(cpu);
    // 19 = 16 + 3: the bulk runs at 16 lanes and the tail of 3 uses the
    // masked form of the main generator.
    run_case(cpu, &MatMulCase::new(3, 5, 19), 79);
    run_case(cpu, &MatMulCase::new(3, 5, 19).accumulate(), 83);
    // Outer-product shape with a masked tail.
    run_case(cpu, &MatMulCase::new(4, 1, 19), 89);
    run_case(cpu, &MatMulCase::new(4, 1, 19).accumulate(), 97);
}

#[test]
fn emission_is_deterministic() {
    // Emission must be reproducible for kernel caching; no execution here,
    // so this runs on any feature level.
    let emit = || {
        let a_t = Tensor::matrix("a", DType::F32, 7, 13, Order::RowMajor).shared();
        let b_t = Tensor::matrix("b", DType::F32, 13, 21, Order::RowMajor).shared();
        let c_t = Tensor::matrix("c", DType::F32, 7, 21, Order::RowMajor).shared();
        let mut step = Step::new("MatMul", vec![a_t, b_t], vec![c_t]);
        let kernel = SimdMatMul::new(false);
        let mut masm = MacroAssembler::new(CpuFeatures::avx512()).unwrap();
        kernel.generate(&mut step, &mut masm).unwrap();
        masm.finalize().unwrap()
    };
    let first = emit();
    let second = emit();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn variants_for_every_feature_level() {
    // Emission-only: check the cascade name and orientation suffix.
    let expect = [
        (CpuFeatures::sse_only(), "SSEFlt"),
        (CpuFeatures::avx(), "AVXFlt"),
        (CpuFeatures::avx512(), "AVX512Flt"),
    ];
    for (cpu, name) in expect {
        let a_t = Tensor::matrix("a", DType::F32, 3, 4, Order::RowMajor).shared();
        let b_t = Tensor::matrix("b", DType::F32, 4, 5, Order::RowMajor).shared();
        let c_t = Tensor::matrix("c", DType::F32, 3, 5, Order::RowMajor).shared();
        let mut step = Step::new("MatMul", vec![a_t, b_t], vec![c_t]);
        let kernel = SimdMatMul::new(false);
        let mut masm = MacroAssembler::new(cpu).unwrap();
        kernel.generate(&mut step, &mut masm).unwrap();
        assert_eq!(step.variant(), format!("{name}RR"));
    }
}

#[test]
fn library_routes_by_operation() {
    let mut library = Library::new();
    register_simd_matmul_library(&mut library);

    let a_t = Tensor::matrix("a", DType::F32, 2, 3, Order::RowMajor).shared();
    let b_t = Tensor::matrix("b", DType::F32, 3, 2, Order::RowMajor).shared();
    let c_t = Tensor::matrix("c", DType::F32, 2, 2, Order::RowMajor).shared();
    let step = Step::new("MatMul", vec![a_t.clone(), b_t.clone()], vec![c_t.clone()]);
    let kernel = library.select(&step).unwrap();
    assert_eq!(kernel.name(), "SIMDMatMul");
    assert_eq!(kernel.operation(), "MatMul");
    assert_eq!(kernel.complexity(&step), 2 * 2 * 3 * 2);

    let step = Step::new("AssignAddMatMul", vec![c_t, a_t, b_t], vec![]);
    let kernel = library.select(&step).unwrap();
    assert_eq!(kernel.name(), "SIMDAccMatMul");

    let unknown = Step::new("Conv2D", vec![], vec![]);
    assert!(library.select(&unknown).is_none());
}
