//! The SIMD cascade: picks the widest generator the CPU supports as the
//! main generator plus a descending sequence for residual handling.

use crate::isa::CpuFeatures;
use crate::masm::MacroAssembler;
use crate::types::DType;

use super::generator::{
    Avx128FloatGenerator, Avx256FloatGenerator, Avx512FloatGenerator, Avx512ScalarFloatGenerator,
    AvxScalarFloatGenerator, SimdGenerator, Sse128FloatGenerator, SseScalarFloatGenerator,
};

/// An ordered collection of SIMD generators of descending width. The first
/// is the main generator; the walk over all of them (main included, which is
/// how the AVX-512 masked tail is reached) serves the residuals.
pub struct SimdAssembler {
    name: &'static str,
    cascade: Vec<Box<dyn SimdGenerator>>,
}

impl SimdAssembler {
    /// Whether the cascade can handle the element type. Only 32-bit float is
    /// supported.
    pub fn supports(dtype: DType) -> bool {
        dtype == DType::F32
    }

    /// Width of the main generator in bytes, used for alignment hints.
    pub fn vector_bytes(cpu: &CpuFeatures, dtype: DType) -> usize {
        if cpu.avx512f {
            64
        } else if cpu.avx {
            32
        } else if cpu.sse {
            16
        } else {
            dtype.size_bytes()
        }
    }

    pub fn new(
        masm: &mut MacroAssembler,
        dtype: DType,
        aligned: bool,
    ) -> Result<SimdAssembler, String> {
        if dtype != DType::F32 {
            return Err(format!("unsupported element type {:?}", dtype));
        }
        let cpu = *masm.cpu();
        if cpu.avx512f {
            Ok(SimdAssembler {
                name: "AVX512Flt",
                cascade: vec![
                    Box::new(Avx512FloatGenerator::new(masm, aligned)),
                    Box::new(Avx512ScalarFloatGenerator),
                ],
            })
        } else if cpu.avx {
            Ok(SimdAssembler {
                name: "AVXFlt",
                cascade: vec![
                    Box::new(Avx256FloatGenerator::new(aligned)),
                    Box::new(Avx128FloatGenerator::new(aligned)),
                    Box::new(AvxScalarFloatGenerator),
                ],
            })
        } else if cpu.sse {
            Ok(SimdAssembler {
                name: "SSEFlt",
                cascade: vec![
                    Box::new(Sse128FloatGenerator::new(aligned)),
                    Box::new(SseScalarFloatGenerator),
                ],
            })
        } else {
            Err("no SIMD support on this CPU".to_string())
        }
    }

    /// Cascade variant label, used in kernel variant strings.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The widest generator.
    pub fn main(&self) -> &dyn SimdGenerator {
        self.cascade[0].as_ref()
    }

    /// All generators in descending width order.
    pub fn cascade(&self) -> &[Box<dyn SimdGenerator>] {
        &self.cascade
    }

    /// The scalar lane generator.
    pub fn scalar(&self) -> &dyn SimdGenerator {
        self.cascade.last().unwrap().as_ref()
    }

    /// Reserve one vector register sized for the main generator.
    pub fn alloc_reg(&self, masm: &mut MacroAssembler) -> u8 {
        self.main().alloc(masm)
    }

    /// Reserve `n` vector registers.
    pub fn alloc_regs(&self, masm: &mut MacroAssembler, n: usize) -> Vec<u8> {
        (0..n).map(|_| self.main().alloc(masm)).collect()
    }

    /// Reduce `regs` into `regs[0]`: tree reduction for four accumulators,
    /// left fold otherwise.
    pub fn sum_registers(&self, masm: &mut MacroAssembler, regs: &[u8]) -> Result<(), String> {
        if regs.len() == 4 {
            self.main().add(masm, regs[0], regs[0], regs[2])?;
            self.main().add(masm, regs[1], regs[1], regs[3])?;
            self.main().add(masm, regs[0], regs[0], regs[1])?;
        } else {
            for n in 1..regs.len() {
                self.main().add(masm, regs[0], regs[0], regs[n])?;
            }
        }
        Ok(())
    }
}
