//! Width-polymorphic SIMD generators.
//!
//! Each generator emits instructions for one register width and feature
//! level behind a common contract, so the loop emitters never mention a
//! concrete instruction set. Register operands are pool indices; memory
//! operands are `Operand` values lowered at the call site.
//!
//! Instruction selection rules:
//! - Loads and stores are aligned (`movaps`) only when the cascade was
//!   constructed aligned; unaligned otherwise.
//! - Zeroing is a self-XOR, which has no memory operand and no
//!   integer/floating-point bypass penalty.
//! - `mul_add` emits a single FMA when FMA3 is available. The fallback
//!   materialises the product in a temporary when `retain` is set; when the
//!   caller has declared the source dead it is clobbered instead.
//! - The non-VEX SSE forms require aligned memory operands, so the SSE
//!   generator spills unaligned operands through a scratch register.
//! - Masked variants exist only on AVX-512: zero-masking loads,
//!   merge-masking stores and arithmetic.

use crate::masm::{mem_k, xmm, ymm, zmm, zmm_k, MacroAssembler, Operand};

/// The instruction-agnostic vector operation contract.
///
/// A masked call on a generator without masking support is a programmer
/// error: the strategy planner only assigns masked phases to generators
/// reporting `supports_masking`.
pub trait SimdGenerator {
    /// Width of a vector register in bytes.
    fn vector_bytes(&self) -> usize;

    /// Number of lanes per vector register.
    fn vector_size(&self) -> usize;

    /// Reserve one vector register from the pool.
    fn alloc(&self, masm: &mut MacroAssembler) -> u8 {
        masm.alloc_vec()
    }

    /// Full-vector move from memory.
    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String>;

    /// Full-vector move to memory.
    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String>;

    /// Replicate one scalar across all lanes. For scalar generators this
    /// degrades to a load.
    fn broadcast(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        debug_assert_eq!(self.vector_size(), 1);
        self.load(masm, dst, src)
    }

    /// Set all bits of a register to zero via self-XOR.
    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String>;

    /// dst = src1 + src2 (lane-wise).
    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String>;

    /// dst = src1 + [mem] (lane-wise).
    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String>;

    /// dst = src1 * [mem] (lane-wise).
    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String>;

    /// dst += src1 * [mem]. Without FMA3 the fallback must not corrupt a
    /// live source: `retain` keeps src1 intact through a temporary.
    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String>;

    /// Reduce all lanes of `r` into lane 0. A no-op for scalars.
    fn sum(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        let _ = (masm, r);
        debug_assert_eq!(self.vector_size(), 1);
        Ok(())
    }

    fn supports_masking(&self) -> bool {
        false
    }

    /// Load the generator's lane mask with `bits` trailing lanes enabled.
    fn set_mask(&self, masm: &mut MacroAssembler, bits: usize) -> Result<(), String> {
        let _ = (masm, bits);
        log::error!("masked operation on a generator without masking support");
        panic!("masking not supported");
    }

    fn masked_load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        let _ = (masm, dst, src);
        log::error!("masked operation on a generator without masking support");
        panic!("masking not supported");
    }

    fn masked_store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        let _ = (masm, dst, src);
        log::error!("masked operation on a generator without masking support");
        panic!("masking not supported");
    }

    fn masked_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        let _ = (masm, dst, src1, src2);
        log::error!("masked operation on a generator without masking support");
        panic!("masking not supported");
    }

    fn masked_mul(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        let _ = (masm, dst, src1, src2);
        log::error!("masked operation on a generator without masking support");
        panic!("masking not supported");
    }

    fn masked_mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        let _ = (masm, dst, src1, src2);
        log::error!("masked operation on a generator without masking support");
        panic!("masking not supported");
    }
}

// ── AVX-512 float, 512-bit ──────────────────────────────────────────────────

/// AVX-512 float generator using ZMM registers. Holds one opmask register
/// for its masked variants, reserved at cascade construction.
pub(crate) struct Avx512FloatGenerator {
    aligned: bool,
    mask: u8,
}

impl Avx512FloatGenerator {
    pub(crate) fn new(masm: &mut MacroAssembler, aligned: bool) -> Avx512FloatGenerator {
        Avx512FloatGenerator {
            aligned,
            mask: masm.alloc_mask(),
        }
    }
}

impl SimdGenerator for Avx512FloatGenerator {
    fn vector_bytes(&self) -> usize {
        64
    }

    fn vector_size(&self) -> usize {
        16
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        if self.aligned {
            masm.code().vmovaps(zmm(dst), src.to_mem()).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(zmm(dst), src.to_mem()).map_err(|e| e.to_string())
        }
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        if self.aligned {
            masm.code().vmovaps(dst.to_mem(), zmm(src)).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(dst.to_mem(), zmm(src)).map_err(|e| e.to_string())
        }
    }

    fn broadcast(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().vbroadcastss(zmm(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().vxorps(zmm(r), zmm(r), zmm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        masm.code().vaddps(zmm(dst), zmm(src1), zmm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vaddps(zmm(dst), zmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vmulps(zmm(dst), zmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if masm.cpu().fma3 {
            masm.code()
                .vfmadd231ps(zmm(dst), zmm(src1), src2.to_mem())
                .map_err(|e| e.to_string())
        } else if retain {
            let acc = masm.alloc_vec();
            masm.code().vmulps(zmm(acc), zmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddps(zmm(dst), zmm(dst), zmm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            masm.code().vmulps(zmm(src1), zmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddps(zmm(dst), zmm(dst), zmm(src1)).map_err(|e| e.to_string())
        }
    }

    fn sum(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        // Fold the upper 256 bits onto the lower, then run the 256-bit
        // pair-sum cascade.
        let acc = masm.alloc_vec();
        masm.code().vshuff32x4(zmm(acc), zmm(r), zmm(r), 0x0E).map_err(|e| e.to_string())?;
        masm.code().vaddps(zmm(r), zmm(r), zmm(acc)).map_err(|e| e.to_string())?;
        masm.code().vperm2f128(ymm(acc), ymm(r), ymm(r), 1).map_err(|e| e.to_string())?;
        masm.code().vhaddps(ymm(r), ymm(r), ymm(acc)).map_err(|e| e.to_string())?;
        masm.code().vhaddps(ymm(r), ymm(r), ymm(r)).map_err(|e| e.to_string())?;
        masm.code().vhaddps(ymm(r), ymm(r), ymm(r)).map_err(|e| e.to_string())?;
        masm.release_vec(acc);
        Ok(())
    }

    fn supports_masking(&self) -> bool {
        true
    }

    fn set_mask(&self, masm: &mut MacroAssembler, bits: usize) -> Result<(), String> {
        masm.load_mask(bits, self.mask)
    }

    fn masked_load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        let reg = zmm_k(dst, self.mask).z();
        if self.aligned {
            masm.code().vmovaps(reg, src.to_mem()).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(reg, src.to_mem()).map_err(|e| e.to_string())
        }
    }

    fn masked_store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        let mem = mem_k(dst.to_mem(), self.mask);
        if self.aligned {
            masm.code().vmovaps(mem, zmm(src)).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(mem, zmm(src)).map_err(|e| e.to_string())
        }
    }

    fn masked_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code()
            .vaddps(zmm_k(dst, self.mask), zmm(src1), src2.to_mem())
            .map_err(|e| e.to_string())
    }

    fn masked_mul(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code()
            .vmulps(zmm_k(dst, self.mask), zmm(src1), src2.to_mem())
            .map_err(|e| e.to_string())
    }

    fn masked_mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code()
            .vfmadd231ps(zmm_k(dst, self.mask), zmm(src1), src2.to_mem())
            .map_err(|e| e.to_string())
    }
}

// ── AVX float, 256-bit ──────────────────────────────────────────────────────

pub(crate) struct Avx256FloatGenerator {
    aligned: bool,
}

impl Avx256FloatGenerator {
    pub(crate) fn new(aligned: bool) -> Avx256FloatGenerator {
        Avx256FloatGenerator { aligned }
    }
}

impl SimdGenerator for Avx256FloatGenerator {
    fn vector_bytes(&self) -> usize {
        32
    }

    fn vector_size(&self) -> usize {
        8
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        if self.aligned {
            masm.code().vmovaps(ymm(dst), src.to_mem()).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(ymm(dst), src.to_mem()).map_err(|e| e.to_string())
        }
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        if self.aligned {
            masm.code().vmovaps(dst.to_mem(), ymm(src)).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(dst.to_mem(), ymm(src)).map_err(|e| e.to_string())
        }
    }

    fn broadcast(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().vbroadcastss(ymm(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().vxorps(ymm(r), ymm(r), ymm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        masm.code().vaddps(ymm(dst), ymm(src1), ymm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vaddps(ymm(dst), ymm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vmulps(ymm(dst), ymm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if masm.cpu().fma3 {
            masm.code()
                .vfmadd231ps(ymm(dst), ymm(src1), src2.to_mem())
                .map_err(|e| e.to_string())
        } else if retain {
            let acc = masm.alloc_vec();
            masm.code().vmulps(ymm(acc), ymm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddps(ymm(dst), ymm(dst), ymm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            masm.code().vmulps(ymm(src1), ymm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddps(ymm(dst), ymm(dst), ymm(src1)).map_err(|e| e.to_string())
        }
    }

    fn sum(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        // Swap the 128-bit lanes, then three pair-sums.
        let acc = masm.alloc_vec();
        masm.code().vperm2f128(ymm(acc), ymm(r), ymm(r), 1).map_err(|e| e.to_string())?;
        masm.code().vhaddps(ymm(r), ymm(r), ymm(acc)).map_err(|e| e.to_string())?;
        masm.code().vhaddps(ymm(r), ymm(r), ymm(r)).map_err(|e| e.to_string())?;
        masm.code().vhaddps(ymm(r), ymm(r), ymm(r)).map_err(|e| e.to_string())?;
        masm.release_vec(acc);
        Ok(())
    }
}

// ── AVX float, 128-bit ──────────────────────────────────────────────────────

pub(crate) struct Avx128FloatGenerator {
    aligned: bool,
}

impl Avx128FloatGenerator {
    pub(crate) fn new(aligned: bool) -> Avx128FloatGenerator {
        Avx128FloatGenerator { aligned }
    }
}

impl SimdGenerator for Avx128FloatGenerator {
    fn vector_bytes(&self) -> usize {
        16
    }

    fn vector_size(&self) -> usize {
        4
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        if self.aligned {
            masm.code().vmovaps(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
        }
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        if self.aligned {
            masm.code().vmovaps(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
        } else {
            masm.code().vmovups(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
        }
    }

    fn broadcast(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().vbroadcastss(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().vxorps(xmm(r), xmm(r), xmm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        masm.code().vaddps(xmm(dst), xmm(src1), xmm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vaddps(xmm(dst), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vmulps(xmm(dst), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if masm.cpu().fma3 {
            masm.code()
                .vfmadd231ps(xmm(dst), xmm(src1), src2.to_mem())
                .map_err(|e| e.to_string())
        } else if retain {
            let acc = masm.alloc_vec();
            masm.code().vmulps(xmm(acc), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddps(xmm(dst), xmm(dst), xmm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            masm.code().vmulps(xmm(src1), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddps(xmm(dst), xmm(dst), xmm(src1)).map_err(|e| e.to_string())
        }
    }

    fn sum(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().vhaddps(xmm(r), xmm(r), xmm(r)).map_err(|e| e.to_string())?;
        masm.code().vhaddps(xmm(r), xmm(r), xmm(r)).map_err(|e| e.to_string())
    }
}

// ── SSE float, 128-bit ──────────────────────────────────────────────────────

/// SSE float generator. The two-address forms require aligned memory
/// operands, so unaligned operands are staged through a scratch register.
pub(crate) struct Sse128FloatGenerator {
    aligned: bool,
}

impl Sse128FloatGenerator {
    pub(crate) fn new(aligned: bool) -> Sse128FloatGenerator {
        Sse128FloatGenerator { aligned }
    }
}

impl SimdGenerator for Sse128FloatGenerator {
    fn vector_bytes(&self) -> usize {
        16
    }

    fn vector_size(&self) -> usize {
        4
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        if self.aligned {
            masm.code().movaps(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
        } else {
            masm.code().movups(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
        }
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        if self.aligned {
            masm.code().movaps(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
        } else {
            masm.code().movups(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
        }
    }

    fn broadcast(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().movss(xmm(dst), src.to_mem()).map_err(|e| e.to_string())?;
        masm.code().shufps(xmm(dst), xmm(dst), 0).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().xorps(xmm(r), xmm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        if dst != src1 {
            masm.code().movaps(xmm(dst), xmm(src1)).map_err(|e| e.to_string())?;
        }
        masm.code().addps(xmm(dst), xmm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        if dst != src1 {
            masm.code().movaps(xmm(dst), xmm(src1)).map_err(|e| e.to_string())?;
        }
        if self.aligned {
            masm.code().addps(xmm(dst), src2.to_mem()).map_err(|e| e.to_string())
        } else {
            let mem = masm.alloc_vec();
            masm.code().movups(xmm(mem), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().addps(xmm(dst), xmm(mem)).map_err(|e| e.to_string())?;
            masm.release_vec(mem);
            Ok(())
        }
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        if dst != src1 {
            masm.code().movaps(xmm(dst), xmm(src1)).map_err(|e| e.to_string())?;
        }
        if self.aligned {
            masm.code().mulps(xmm(dst), src2.to_mem()).map_err(|e| e.to_string())
        } else {
            let mem = masm.alloc_vec();
            masm.code().movups(xmm(mem), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().mulps(xmm(dst), xmm(mem)).map_err(|e| e.to_string())?;
            masm.release_vec(mem);
            Ok(())
        }
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if retain {
            let acc = masm.alloc_vec();
            masm.code().movaps(xmm(acc), xmm(src1)).map_err(|e| e.to_string())?;
            if self.aligned {
                masm.code().mulps(xmm(acc), src2.to_mem()).map_err(|e| e.to_string())?;
            } else {
                let mem = masm.alloc_vec();
                masm.code().movups(xmm(mem), src2.to_mem()).map_err(|e| e.to_string())?;
                masm.code().mulps(xmm(acc), xmm(mem)).map_err(|e| e.to_string())?;
                masm.release_vec(mem);
            }
            masm.code().addps(xmm(dst), xmm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            if self.aligned {
                masm.code().mulps(xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            } else {
                let mem = masm.alloc_vec();
                masm.code().movups(xmm(mem), src2.to_mem()).map_err(|e| e.to_string())?;
                masm.code().mulps(xmm(src1), xmm(mem)).map_err(|e| e.to_string())?;
                masm.release_vec(mem);
            }
            masm.code().addps(xmm(dst), xmm(src1)).map_err(|e| e.to_string())
        }
    }

    fn sum(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().haddps(xmm(r), xmm(r)).map_err(|e| e.to_string())?;
        masm.code().haddps(xmm(r), xmm(r)).map_err(|e| e.to_string())
    }
}

// ── Scalar lane generators ──────────────────────────────────────────────────

/// AVX-512 scalar float generator; only the low lane of the register is
/// live.
pub(crate) struct Avx512ScalarFloatGenerator;

impl SimdGenerator for Avx512ScalarFloatGenerator {
    fn vector_bytes(&self) -> usize {
        4
    }

    fn vector_size(&self) -> usize {
        1
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().vmovss(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        masm.code().vmovss(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().vxorps(xmm(r), xmm(r), xmm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        masm.code().vaddss(xmm(dst), xmm(src1), xmm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vaddss(xmm(dst), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vmulss(xmm(dst), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if masm.cpu().fma3 {
            masm.code()
                .vfmadd231ss(xmm(dst), xmm(src1), src2.to_mem())
                .map_err(|e| e.to_string())
        } else if retain {
            let acc = masm.alloc_vec();
            masm.code().vmulss(xmm(acc), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddss(xmm(dst), xmm(dst), xmm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            masm.code().vmulss(xmm(src1), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddss(xmm(dst), xmm(dst), xmm(src1)).map_err(|e| e.to_string())
        }
    }
}

/// AVX scalar float generator.
pub(crate) struct AvxScalarFloatGenerator;

impl SimdGenerator for AvxScalarFloatGenerator {
    fn vector_bytes(&self) -> usize {
        4
    }

    fn vector_size(&self) -> usize {
        1
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().vmovss(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        masm.code().vmovss(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().vxorps(xmm(r), xmm(r), xmm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        masm.code().vaddss(xmm(dst), xmm(src1), xmm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vaddss(xmm(dst), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        masm.code().vmulss(xmm(dst), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if masm.cpu().fma3 {
            masm.code()
                .vfmadd231ss(xmm(dst), xmm(src1), src2.to_mem())
                .map_err(|e| e.to_string())
        } else if retain {
            let acc = masm.alloc_vec();
            masm.code().vmulss(xmm(acc), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddss(xmm(dst), xmm(dst), xmm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            masm.code().vmulss(xmm(src1), xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().vaddss(xmm(dst), xmm(dst), xmm(src1)).map_err(|e| e.to_string())
        }
    }
}

/// SSE scalar float generator.
pub(crate) struct SseScalarFloatGenerator;

impl SimdGenerator for SseScalarFloatGenerator {
    fn vector_bytes(&self) -> usize {
        4
    }

    fn vector_size(&self) -> usize {
        1
    }

    fn load(&self, masm: &mut MacroAssembler, dst: u8, src: Operand) -> Result<(), String> {
        masm.code().movss(xmm(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    fn store(&self, masm: &mut MacroAssembler, dst: Operand, src: u8) -> Result<(), String> {
        masm.code().movss(dst.to_mem(), xmm(src)).map_err(|e| e.to_string())
    }

    fn zero(&self, masm: &mut MacroAssembler, r: u8) -> Result<(), String> {
        masm.code().xorps(xmm(r), xmm(r)).map_err(|e| e.to_string())
    }

    fn add(&self, masm: &mut MacroAssembler, dst: u8, src1: u8, src2: u8) -> Result<(), String> {
        if dst != src1 {
            masm.code().movss(xmm(dst), xmm(src1)).map_err(|e| e.to_string())?;
        }
        masm.code().addss(xmm(dst), xmm(src2)).map_err(|e| e.to_string())
    }

    fn add_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        if dst != src1 {
            masm.code().movss(xmm(dst), xmm(src1)).map_err(|e| e.to_string())?;
        }
        masm.code().addss(xmm(dst), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_mem(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
    ) -> Result<(), String> {
        if dst != src1 {
            masm.code().movss(xmm(dst), xmm(src1)).map_err(|e| e.to_string())?;
        }
        masm.code().mulss(xmm(dst), src2.to_mem()).map_err(|e| e.to_string())
    }

    fn mul_add(
        &self,
        masm: &mut MacroAssembler,
        dst: u8,
        src1: u8,
        src2: Operand,
        retain: bool,
    ) -> Result<(), String> {
        if retain {
            let acc = masm.alloc_vec();
            masm.code().movss(xmm(acc), xmm(src1)).map_err(|e| e.to_string())?;
            masm.code().mulss(xmm(acc), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().addss(xmm(dst), xmm(acc)).map_err(|e| e.to_string())?;
            masm.release_vec(acc);
            Ok(())
        } else {
            masm.code().mulss(xmm(src1), src2.to_mem()).map_err(|e| e.to_string())?;
            masm.code().addss(xmm(dst), xmm(src1)).map_err(|e| e.to_string())
        }
    }
}
