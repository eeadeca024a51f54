//! Property-based tests for the strategy planner and argument normaliser.
//!
//! Invariants that must hold for all inputs:
//! - phase plans exactly partition the span, with contiguous offsets
//! - the bulk phase runs first on the main generator; residual widths
//!   strictly descend; at most one masked phase exists and it is last
//! - the swap-and-transpose output normalisation preserves shape agreement

use proptest::prelude::*;

use tensorjit::{
    CpuFeatures, DType, MacroAssembler, MatMulArgs, Order, SimdAssembler, SimdStrategy, Step,
    Tensor,
};

fn feature_levels() -> impl Strategy<Value = CpuFeatures> {
    prop_oneof![
        Just(CpuFeatures::sse_only()),
        Just(CpuFeatures::avx()),
        Just(CpuFeatures::avx512()),
    ]
}

proptest! {
    /// Phases exactly partition [0, size) with contiguous offsets.
    #[test]
    fn phases_partition_the_span(
        cpu in feature_levels(),
        size in 0usize..1024,
        max_unrolls in 1usize..6,
    ) {
        let mut masm = MacroAssembler::new(cpu).unwrap();
        let sasm = SimdAssembler::new(&mut masm, DType::F32, false).unwrap();
        let strategy = SimdStrategy::new(&sasm, size, max_unrolls);

        let mut offset = 0;
        for phase in strategy.phases() {
            prop_assert_eq!(phase.offset, offset);
            prop_assert!(phase.unrolls >= 1);
            offset += phase.elements();
        }
        prop_assert_eq!(offset, size);
    }

    /// The bulk phase is first and uses the main generator; residuals
    /// strictly descend in vector size; at most one masked phase, last.
    #[test]
    fn phases_are_prioritised(
        cpu in feature_levels(),
        size in 1usize..1024,
        max_unrolls in 1usize..6,
    ) {
        let mut masm = MacroAssembler::new(cpu).unwrap();
        let sasm = SimdAssembler::new(&mut masm, DType::F32, false).unwrap();
        let main_size = sasm.main().vector_size();
        let strategy = SimdStrategy::new(&sasm, size, max_unrolls);
        let phases = strategy.phases();

        let masked_count = phases.iter().filter(|p| p.masked > 0).count();
        prop_assert!(masked_count <= 1);
        if masked_count == 1 {
            let last = phases.last().unwrap();
            prop_assert!(last.masked > 0);
            prop_assert_eq!(last.unrolls, 1);
            prop_assert!(last.generator.supports_masking());
        }

        for (i, phase) in phases.iter().enumerate() {
            if phase.repeat > 1 {
                // Only the bulk phase loops, and it leads the plan.
                prop_assert_eq!(i, 0);
                prop_assert_eq!(phase.generator.vector_size(), main_size);
            }
        }

        // Residual phases never grow in vector size.
        for pair in phases.windows(2) {
            prop_assert!(pair[0].generator.vector_size() >= pair[1].generator.vector_size());
        }

        prop_assert!(strategy.max_unrolls() <= size.max(1));
    }

    /// Masked phases only appear on AVX-512, and only for sub-vector tails.
    #[test]
    fn masked_phase_requires_masking_support(
        cpu in feature_levels(),
        size in 1usize..256,
    ) {
        let mut masm = MacroAssembler::new(cpu).unwrap();
        let sasm = SimdAssembler::new(&mut masm, DType::F32, false).unwrap();
        let strategy = SimdStrategy::new(&sasm, size, 4);
        for phase in strategy.phases() {
            if phase.masked > 0 {
                prop_assert!(cpu.avx512f);
                prop_assert!(phase.masked < phase.generator.vector_size());
            }
        }
    }

    /// Output normalisation keeps the shapes consistent and makes the
    /// output effectively row-major.
    #[test]
    fn output_normalisation_preserves_shapes(
        m in 1usize..32,
        k in 1usize..32,
        n in 1usize..32,
        c_col_major in any::<bool>(),
    ) {
        let c_order = if c_col_major { Order::ColumnMajor } else { Order::RowMajor };
        let a = Tensor::matrix("a", DType::F32, m, k, Order::RowMajor).shared();
        let b = Tensor::matrix("b", DType::F32, k, n, Order::RowMajor).shared();
        let c = Tensor::matrix("c", DType::F32, m, n, c_order).shared();
        let step = Step::new("MatMul", vec![a, b], vec![c]);

        let mut args = MatMulArgs::new(&step);
        prop_assert!(args.check_shapes());
        prop_assert!(args.ensure_output_order(Order::RowMajor));
        // Shape agreement survives the swap-and-transpose.
        prop_assert!(args.check_shapes());
        // The output is row-major once transposition is accounted for.
        prop_assert_eq!(args.c().order(), Order::RowMajor);
    }
}
