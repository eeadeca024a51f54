//! Vectorisation strategy planner.
//!
//! Decomposes a linear span of `size` elements into an ordered list of
//! phases that exactly partition it: one bulk phase on the main generator
//! (a loop when its repeat count exceeds one), residual phases on
//! successively narrower generators, and at most one masked phase covering
//! fewer than one vector of trailing elements.

use crate::masm::MacroAssembler;

use super::assembler::SimdAssembler;
use super::generator::SimdGenerator;

/// One phase of the plan. A bulk phase carries `repeat >= 1`; residual
/// phases carry `repeat == 0`; a masked phase carries `masked > 0` and
/// `unrolls == 1`.
pub struct Phase<'a> {
    pub generator: &'a dyn SimdGenerator,
    pub unrolls: usize,
    pub repeat: usize,
    pub masked: usize,
    pub offset: usize,
}

impl Phase<'_> {
    /// Number of elements this phase covers.
    pub fn elements(&self) -> usize {
        if self.masked > 0 {
            self.masked
        } else {
            self.repeat.max(1) * self.unrolls * self.generator.vector_size()
        }
    }
}

/// An ordered phase plan covering a span of `size` elements.
pub struct SimdStrategy<'a> {
    phases: Vec<Phase<'a>>,
}

impl<'a> SimdStrategy<'a> {
    pub fn new(sasm: &'a SimdAssembler, size: usize, max_unrolls: usize) -> SimdStrategy<'a> {
        let mut phases = Vec::new();
        let mut remaining = size;
        let mut offset = 0;

        // Bulk phase on the main generator.
        let vecsize = sasm.main().vector_size();
        let main_elems = (size / vecsize) * vecsize;
        let unrolls = (main_elems / vecsize).min(max_unrolls);
        if unrolls > 0 {
            let repeat = size / (vecsize * unrolls);
            phases.push(Phase {
                generator: sasm.main(),
                unrolls,
                repeat,
                masked: 0,
                offset,
            });
            remaining -= repeat * vecsize * unrolls;
            offset += repeat * vecsize * unrolls;
        }

        // Residual phases on the descending cascade. The main generator
        // participates: it picks up whole vectors the bulk unrolling left
        // behind, and on AVX-512 its masked form handles the final partial
        // vector.
        for gen in sasm.cascade() {
            if remaining == 0 {
                break;
            }

            let vecsize = gen.vector_size();
            let n = remaining / vecsize;
            if n > 0 {
                phases.push(Phase {
                    generator: gen.as_ref(),
                    unrolls: n,
                    repeat: 0,
                    masked: 0,
                    offset,
                });
                offset += n * vecsize;
                remaining -= n * vecsize;
            }

            if gen.supports_masking() && remaining > 0 && remaining < vecsize {
                phases.push(Phase {
                    generator: gen.as_ref(),
                    unrolls: 1,
                    repeat: 0,
                    masked: remaining,
                    offset,
                });
                offset += remaining;
                remaining = 0;
            }
        }

        debug_assert_eq!(remaining, 0, "strategy must cover the whole span");
        SimdStrategy { phases }
    }

    pub fn phases(&self) -> &[Phase<'a>] {
        &self.phases
    }

    /// Largest unroll factor across phases; sizes the accumulator
    /// allocation.
    pub fn max_unrolls(&self) -> usize {
        self.phases.iter().map(|p| p.unrolls).fold(1, usize::max)
    }

    /// Load the lane masks of all masked phases ahead of the loop prologue,
    /// hoisting them out of the inner loops.
    pub fn preload_masks(&self, masm: &mut MacroAssembler) -> Result<(), String> {
        for phase in &self.phases {
            if phase.masked > 0 {
                phase.generator.set_mask(masm, phase.masked)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::CpuFeatures;
    use crate::types::DType;

    fn strategy_phases(cpu: CpuFeatures, size: usize, max_unrolls: usize) -> Vec<(usize, usize, usize, usize, usize)> {
        let mut masm = MacroAssembler::new(cpu).unwrap();
        let sasm = SimdAssembler::new(&mut masm, DType::F32, false).unwrap();
        let strategy = SimdStrategy::new(&sasm, size, max_unrolls);
        strategy
            .phases()
            .iter()
            .map(|p| (p.generator.vector_size(), p.unrolls, p.repeat, p.masked, p.offset))
            .collect()
    }

    #[test]
    fn avx_35_elements() {
        // Bulk of 4x8 covers 32, scalar residual covers 3.
        let phases = strategy_phases(CpuFeatures::avx(), 35, 4);
        assert_eq!(phases, vec![(8, 4, 1, 0, 0), (1, 3, 0, 0, 32)]);
    }

    #[test]
    fn avx512_35_elements() {
        // Bulk of 2x16 covers 32; the main generator's masked form covers
        // the remaining 3.
        let phases = strategy_phases(CpuFeatures::avx512(), 35, 4);
        assert_eq!(phases, vec![(16, 2, 1, 0, 0), (16, 1, 0, 3, 32)]);
    }

    #[test]
    fn bulk_loops_when_long() {
        let phases = strategy_phases(CpuFeatures::avx(), 256, 4);
        assert_eq!(phases, vec![(8, 4, 8, 0, 0)]);
    }

    #[test]
    fn empty_span() {
        let phases = strategy_phases(CpuFeatures::avx(), 0, 4);
        assert!(phases.is_empty());
    }

    #[test]
    fn sse_tail_uses_scalars() {
        let phases = strategy_phases(CpuFeatures::sse_only(), 7, 4);
        assert_eq!(phases, vec![(4, 1, 1, 0, 0), (1, 3, 0, 0, 4)]);
    }

    #[test]
    fn bulk_leftover_vectors_go_to_main_residual() {
        // 24 = 1 repeat of 4x4 (16) + 2 whole vectors on main + 0 scalar.
        let phases = strategy_phases(CpuFeatures::sse_only(), 24, 4);
        assert_eq!(phases, vec![(4, 4, 1, 0, 0), (4, 2, 0, 0, 16)]);
    }

    #[test]
    fn max_unrolls_spans_phases() {
        let mut masm = MacroAssembler::new(CpuFeatures::avx()).unwrap();
        let sasm = SimdAssembler::new(&mut masm, DType::F32, false).unwrap();
        let strategy = SimdStrategy::new(&sasm, 35, 4);
        assert_eq!(strategy.max_unrolls(), 4);
        let strategy = SimdStrategy::new(&sasm, 3, 4);
        assert_eq!(strategy.max_unrolls(), 3);
    }

    #[test]
    fn phases_partition_the_span() {
        for cpu in [CpuFeatures::sse_only(), CpuFeatures::avx(), CpuFeatures::avx512()] {
            let mut masm = MacroAssembler::new(cpu).unwrap();
            let sasm = SimdAssembler::new(&mut masm, DType::F32, false).unwrap();
            for size in 0..200 {
                let strategy = SimdStrategy::new(&sasm, size, 4);
                let mut expected_offset = 0;
                for phase in strategy.phases() {
                    assert_eq!(phase.offset, expected_offset);
                    expected_offset += phase.elements();
                }
                assert_eq!(expected_offset, size, "size {size} not covered");
            }
        }
    }
}
