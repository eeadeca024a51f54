//! Vector float expression generator using AVX and YMM registers.
//!
//! Three-operand VEX instruction model: binary operations compute
//! `dst = src ⊕ rhs`. Fused multiply-add forms are available when FMA3 is.
//! Memory slots are full 256-bit vectors and are accessed with unaligned
//! moves, so the slot array carries no alignment requirement.
//!
//! Integer operations (shifts, integer subtract) use 256-bit forms on AVX2
//! and fall back to splitting the register into 128-bit halves on plain
//! AVX.

use crate::masm::{xmm, ymm, MacroAssembler};
use crate::types::DType;

use super::{
    dst_reg, slot_arg, slot_operand, AccKind, Expression, ExpressionGenerator, ExprReg, Op,
    OpKind, Reservation,
};

const CMP_EQ_OQ: u32 = 0x00;
const CMP_NEQ_UQ: u32 = 0x04;
const CMP_LT_OQ: u32 = 0x11;
const CMP_LE_OQ: u32 = 0x12;
const CMP_GE_OQ: u32 = 0x1D;
const CMP_GT_OQ: u32 = 0x1E;
const CMP_TRUE_UQ: u32 = 0x0F;

const ROUND_DOWN: u32 = 1;

/// Bytes per memory slot: one full YMM vector.
const SLOT_BYTES: usize = 32;

/// Right-hand side of a three-operand operation.
enum Rhs {
    Reg(u8),
    Mem(crate::masm::Operand),
}

pub struct VectorFltAvx256Generator;

impl VectorFltAvx256Generator {
    fn aux(&self, expr: &Expression, n: usize) -> u8 {
        (expr.num_regs + n) as u8
    }

    fn rhs(&self, op: &Op, reg: Option<ExprReg>, arg_index: usize) -> Result<Rhs, String> {
        match reg {
            Some(r) => Ok(Rhs::Reg(r.0)),
            None => Ok(Rhs::Mem(slot_operand(slot_arg(op, arg_index)?, SLOT_BYTES))),
        }
    }

    /// Three-operand binary arithmetic: `dst = src ⊕ rhs`.
    fn emit_bin(
        &self,
        masm: &mut MacroAssembler,
        dtype: DType,
        kind: OpKind,
        dst: u8,
        src: u8,
        rhs: Rhs,
    ) -> Result<(), String> {
        let d = ymm(dst);
        let s = ymm(src);
        let a = masm.code();
        let result = match (dtype, rhs) {
            (DType::F32, Rhs::Reg(r)) => {
                let r = ymm(r);
                match kind {
                    OpKind::Add => a.vaddps(d, s, r),
                    OpKind::Sub => a.vsubps(d, s, r),
                    OpKind::Mul => a.vmulps(d, s, r),
                    OpKind::Div => a.vdivps(d, s, r),
                    OpKind::Minimum => a.vminps(d, s, r),
                    OpKind::Maximum => a.vmaxps(d, s, r),
                    OpKind::BitAnd | OpKind::And => a.vandps(d, s, r),
                    OpKind::BitOr | OpKind::Or => a.vorps(d, s, r),
                    OpKind::Xor => a.vxorps(d, s, r),
                    OpKind::AndNot => a.vandnps(d, s, r),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
            (DType::F32, Rhs::Mem(m)) => {
                let m = m.to_mem();
                match kind {
                    OpKind::Add => a.vaddps(d, s, m),
                    OpKind::Sub => a.vsubps(d, s, m),
                    OpKind::Mul => a.vmulps(d, s, m),
                    OpKind::Div => a.vdivps(d, s, m),
                    OpKind::Minimum => a.vminps(d, s, m),
                    OpKind::Maximum => a.vmaxps(d, s, m),
                    OpKind::BitAnd | OpKind::And => a.vandps(d, s, m),
                    OpKind::BitOr | OpKind::Or => a.vorps(d, s, m),
                    OpKind::Xor => a.vxorps(d, s, m),
                    OpKind::AndNot => a.vandnps(d, s, m),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
            (DType::F64, Rhs::Reg(r)) => {
                let r = ymm(r);
                match kind {
                    OpKind::Add => a.vaddpd(d, s, r),
                    OpKind::Sub => a.vsubpd(d, s, r),
                    OpKind::Mul => a.vmulpd(d, s, r),
                    OpKind::Div => a.vdivpd(d, s, r),
                    OpKind::Minimum => a.vminpd(d, s, r),
                    OpKind::Maximum => a.vmaxpd(d, s, r),
                    OpKind::BitAnd | OpKind::And => a.vandpd(d, s, r),
                    OpKind::BitOr | OpKind::Or => a.vorpd(d, s, r),
                    OpKind::Xor => a.vxorpd(d, s, r),
                    OpKind::AndNot => a.vandnpd(d, s, r),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
            (DType::F64, Rhs::Mem(m)) => {
                let m = m.to_mem();
                match kind {
                    OpKind::Add => a.vaddpd(d, s, m),
                    OpKind::Sub => a.vsubpd(d, s, m),
                    OpKind::Mul => a.vmulpd(d, s, m),
                    OpKind::Div => a.vdivpd(d, s, m),
                    OpKind::Minimum => a.vminpd(d, s, m),
                    OpKind::Maximum => a.vmaxpd(d, s, m),
                    OpKind::BitAnd | OpKind::And => a.vandpd(d, s, m),
                    OpKind::BitOr | OpKind::Or => a.vorpd(d, s, m),
                    OpKind::Xor => a.vxorpd(d, s, m),
                    OpKind::AndNot => a.vandnpd(d, s, m),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
        };
        result.map_err(|e| e.to_string())
    }

    fn emit_mov(
        &self,
        op: &Op,
        masm: &mut MacroAssembler,
        dtype: DType,
    ) -> Result<(), String> {
        if let Some(value) = op.imm {
            let dst = dst_reg(op)?;
            if value != 0.0 {
                return Err("vector move supports only the zero immediate".to_string());
            }
            if masm.cpu().zero_idiom {
                return match dtype {
                    DType::F32 => masm
                        .code()
                        .vxorps(ymm(dst.0), ymm(dst.0), ymm(dst.0))
                        .map_err(|e| e.to_string()),
                    DType::F64 => masm
                        .code()
                        .vxorpd(ymm(dst.0), ymm(dst.0), ymm(dst.0))
                        .map_err(|e| e.to_string()),
                };
            }
            let mem = slot_operand(slot_arg(op, 0)?, SLOT_BYTES).to_mem();
            return match dtype {
                DType::F32 => masm.code().vmovups(ymm(dst.0), mem).map_err(|e| e.to_string()),
                DType::F64 => masm.code().vmovupd(ymm(dst.0), mem).map_err(|e| e.to_string()),
            };
        }

        match (op.dst, op.src) {
            (Some(dst), Some(src)) => masm
                .code()
                .vmovaps(ymm(dst.0), ymm(src.0))
                .map_err(|e| e.to_string()),
            (Some(dst), None) => {
                let mem = slot_operand(slot_arg(op, 0)?, SLOT_BYTES).to_mem();
                match dtype {
                    DType::F32 => masm.code().vmovups(ymm(dst.0), mem).map_err(|e| e.to_string()),
                    DType::F64 => masm.code().vmovupd(ymm(dst.0), mem).map_err(|e| e.to_string()),
                }
            }
            (None, Some(src)) => {
                let mem = slot_operand(slot_arg(op, 0)?, SLOT_BYTES).to_mem();
                match dtype {
                    DType::F32 => masm.code().vmovups(mem, ymm(src.0)).map_err(|e| e.to_string()),
                    DType::F64 => masm.code().vmovupd(mem, ymm(src.0)).map_err(|e| e.to_string()),
                }
            }
            (None, None) => Err("move needs a register source or destination".to_string()),
        }
    }

    /// Fused multiply-add forms; the operand order digit names which
    /// operands are multiplied.
    fn emit_fma(
        &self,
        op: &Op,
        masm: &mut MacroAssembler,
        dtype: DType,
    ) -> Result<(), String> {
        if !masm.cpu().fma3 {
            return Err("fused multiply-add requires FMA3".to_string());
        }
        let dst = dst_reg(op)?;
        let src = op.src.ok_or("fused multiply-add needs a register source")?;
        let d = ymm(dst.0);
        let s = ymm(src.0);
        let rhs = self.rhs(op, op.src2, 2)?;
        let a = masm.code();
        let result = match (dtype, rhs) {
            (DType::F32, Rhs::Reg(r)) => match op.kind {
                OpKind::MulAdd132 => a.vfmadd132ps(d, s, ymm(r)),
                OpKind::MulAdd213 => a.vfmadd213ps(d, s, ymm(r)),
                OpKind::MulAdd231 => a.vfmadd231ps(d, s, ymm(r)),
                _ => unreachable!(),
            },
            (DType::F32, Rhs::Mem(m)) => match op.kind {
                OpKind::MulAdd132 => a.vfmadd132ps(d, s, m.to_mem()),
                OpKind::MulAdd213 => a.vfmadd213ps(d, s, m.to_mem()),
                OpKind::MulAdd231 => a.vfmadd231ps(d, s, m.to_mem()),
                _ => unreachable!(),
            },
            (DType::F64, Rhs::Reg(r)) => match op.kind {
                OpKind::MulAdd132 => a.vfmadd132pd(d, s, ymm(r)),
                OpKind::MulAdd213 => a.vfmadd213pd(d, s, ymm(r)),
                OpKind::MulAdd231 => a.vfmadd231pd(d, s, ymm(r)),
                _ => unreachable!(),
            },
            (DType::F64, Rhs::Mem(m)) => match op.kind {
                OpKind::MulAdd132 => a.vfmadd132pd(d, s, m.to_mem()),
                OpKind::MulAdd213 => a.vfmadd213pd(d, s, m.to_mem()),
                OpKind::MulAdd231 => a.vfmadd231pd(d, s, m.to_mem()),
                _ => unreachable!(),
            },
        };
        result.map_err(|e| e.to_string())
    }

    fn emit_sqrt(&self, op: &Op, masm: &mut MacroAssembler, dtype: DType) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let d = ymm(dst.0);
        match (dtype, self.rhs(op, op.src, 0)?) {
            (DType::F32, Rhs::Reg(s)) => masm.code().vsqrtps(d, ymm(s)).map_err(|e| e.to_string()),
            (DType::F32, Rhs::Mem(m)) => {
                masm.code().vsqrtps(d, m.to_mem()).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Reg(s)) => masm.code().vsqrtpd(d, ymm(s)).map_err(|e| e.to_string()),
            (DType::F64, Rhs::Mem(m)) => {
                masm.code().vsqrtpd(d, m.to_mem()).map_err(|e| e.to_string())
            }
        }
    }

    fn emit_floor(&self, op: &Op, masm: &mut MacroAssembler, dtype: DType) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let d = ymm(dst.0);
        match (dtype, self.rhs(op, op.src, 0)?) {
            (DType::F32, Rhs::Reg(s)) => {
                masm.code().vroundps(d, ymm(s), ROUND_DOWN).map_err(|e| e.to_string())
            }
            (DType::F32, Rhs::Mem(m)) => masm
                .code()
                .vroundps(d, m.to_mem(), ROUND_DOWN)
                .map_err(|e| e.to_string()),
            (DType::F64, Rhs::Reg(s)) => {
                masm.code().vroundpd(d, ymm(s), ROUND_DOWN).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Mem(m)) => masm
                .code()
                .vroundpd(d, m.to_mem(), ROUND_DOWN)
                .map_err(|e| e.to_string()),
        }
    }

    fn emit_compare(
        &self,
        op: &Op,
        masm: &mut MacroAssembler,
        dtype: DType,
        code: u32,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let src = op.src.ok_or("compare needs a register source")?;
        let d = ymm(dst.0);
        let s = ymm(src.0);
        match (dtype, self.rhs(op, op.src2, 1)?) {
            (DType::F32, Rhs::Reg(r)) => {
                masm.code().vcmpps(d, s, ymm(r), code).map_err(|e| e.to_string())
            }
            (DType::F32, Rhs::Mem(m)) => {
                masm.code().vcmpps(d, s, m.to_mem(), code).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Reg(r)) => {
                masm.code().vcmppd(d, s, ymm(r), code).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Mem(m)) => {
                masm.code().vcmppd(d, s, m.to_mem(), code).map_err(|e| e.to_string())
            }
        }
    }

    /// Branch-free conditional via variable blend.
    fn emit_conditional(
        &self,
        op: &Op,
        masm: &mut MacroAssembler,
        dtype: DType,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let src = op.src.ok_or("conditional needs a register source")?;
        let mask = op.mask.ok_or("conditional needs a mask register")?;
        let d = ymm(dst.0);
        let s = ymm(src.0);
        let m = ymm(mask.0);
        match (dtype, self.rhs(op, op.src2, 2)?) {
            (DType::F32, Rhs::Reg(r)) => {
                masm.code().vblendvps(d, s, ymm(r), m).map_err(|e| e.to_string())
            }
            (DType::F32, Rhs::Mem(mem)) => {
                masm.code().vblendvps(d, s, mem.to_mem(), m).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Reg(r)) => {
                masm.code().vblendvpd(d, s, ymm(r), m).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Mem(mem)) => {
                masm.code().vblendvpd(d, s, mem.to_mem(), m).map_err(|e| e.to_string())
            }
        }
    }

    /// Masked select: the mask register already holds all-ones lanes, so an
    /// AND selects or zeroes.
    fn emit_select(&self, op: &Op, masm: &mut MacroAssembler, dtype: DType) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let mask = op.mask.ok_or("select needs a mask register")?;
        let rhs = self.rhs(op, op.src, 1)?;
        self.emit_bin(masm, dtype, OpKind::And, dst.0, mask.0, rhs)
    }

    /// not(x) = xor(all-ones, x).
    fn emit_not(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let aux = self.aux(expr, 0);

        // All-ones in the auxiliary register.
        if masm.cpu().avx2 {
            masm.code()
                .vpcmpeqd(ymm(aux), ymm(aux), ymm(aux))
                .map_err(|e| e.to_string())?;
        } else {
            masm.code()
                .vcmpps(ymm(aux), ymm(aux), ymm(aux), CMP_TRUE_UQ)
                .map_err(|e| e.to_string())?;
        }

        let rhs = self.rhs(op, op.src, 0)?;
        self.emit_bin(masm, expr.dtype, OpKind::Xor, dst.0, aux, rhs)
    }

    /// IEEE-754 exponent shifts. AVX2 shifts the whole register; plain AVX
    /// splits into 128-bit halves.
    fn emit_shift(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
        left: bool,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let bits = match expr.dtype {
            DType::F32 => 23u32,
            DType::F64 => 52u32,
        };

        // Make sure the source is in a register.
        let src = match op.src {
            Some(s) => s.0,
            None => {
                let mem = slot_operand(slot_arg(op, 0)?, SLOT_BYTES).to_mem();
                masm.code().vmovups(ymm(dst.0), mem).map_err(|e| e.to_string())?;
                dst.0
            }
        };

        if masm.cpu().avx2 {
            let d = ymm(dst.0);
            let s = ymm(src);
            let a = masm.code();
            let result = match (expr.dtype, left) {
                (DType::F32, true) => a.vpslld(d, s, bits),
                (DType::F32, false) => a.vpsrld(d, s, bits),
                (DType::F64, true) => a.vpsllq(d, s, bits),
                (DType::F64, false) => a.vpsrlq(d, s, bits),
            };
            return result.map_err(|e| e.to_string());
        }

        // Shift the halves separately.
        let aux = self.aux(expr, 0);
        masm.code()
            .vextractf128(xmm(aux), ymm(src), 1)
            .map_err(|e| e.to_string())?;
        {
            let hi = xmm(aux);
            let lo_d = xmm(dst.0);
            let lo_s = xmm(src);
            let a = masm.code();
            let result = match (expr.dtype, left) {
                (DType::F32, true) => a.vpslld(hi, hi, bits).and_then(|_| a.vpslld(lo_d, lo_s, bits)),
                (DType::F32, false) => a.vpsrld(hi, hi, bits).and_then(|_| a.vpsrld(lo_d, lo_s, bits)),
                (DType::F64, true) => a.vpsllq(hi, hi, bits).and_then(|_| a.vpsllq(lo_d, lo_s, bits)),
                (DType::F64, false) => a.vpsrlq(hi, hi, bits).and_then(|_| a.vpsrlq(lo_d, lo_s, bits)),
            };
            result.map_err(|e| e.to_string())?;
        }
        masm.code()
            .vinsertf128(ymm(dst.0), ymm(dst.0), xmm(aux), 1)
            .map_err(|e| e.to_string())
    }

    /// Integer subtract; split into halves without AVX2.
    fn emit_subint(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let src = op.src.ok_or("integer subtract needs a register source")?;

        if masm.cpu().avx2 {
            let d = ymm(dst.0);
            let s = ymm(src.0);
            return match (expr.dtype, self.rhs(op, op.src2, 1)?) {
                (DType::F32, Rhs::Reg(r)) => {
                    masm.code().vpsubd(d, s, ymm(r)).map_err(|e| e.to_string())
                }
                (DType::F32, Rhs::Mem(m)) => {
                    masm.code().vpsubd(d, s, m.to_mem()).map_err(|e| e.to_string())
                }
                (DType::F64, Rhs::Reg(r)) => {
                    masm.code().vpsubq(d, s, ymm(r)).map_err(|e| e.to_string())
                }
                (DType::F64, Rhs::Mem(m)) => {
                    masm.code().vpsubq(d, s, m.to_mem()).map_err(|e| e.to_string())
                }
            };
        }

        // Move the second operand to a register.
        let src2 = match op.src2 {
            Some(r) => r.0,
            None => {
                let aux0 = self.aux(expr, 0);
                let mem = slot_operand(slot_arg(op, 1)?, SLOT_BYTES).to_mem();
                masm.code().vmovups(ymm(aux0), mem).map_err(|e| e.to_string())?;
                aux0
            }
        };

        // Subtract the upper and lower halves separately.
        let hi1 = self.aux(expr, 1);
        let hi2 = self.aux(expr, 2);
        masm.code()
            .vextractf128(xmm(hi1), ymm(src.0), 1)
            .map_err(|e| e.to_string())?;
        masm.code()
            .vextractf128(xmm(hi2), ymm(src2), 1)
            .map_err(|e| e.to_string())?;
        match expr.dtype {
            DType::F32 => {
                masm.code().vpsubd(xmm(hi1), xmm(hi1), xmm(hi2)).map_err(|e| e.to_string())?;
                masm.code()
                    .vpsubd(xmm(dst.0), xmm(src.0), xmm(src2))
                    .map_err(|e| e.to_string())?;
            }
            DType::F64 => {
                masm.code().vpsubq(xmm(hi1), xmm(hi1), xmm(hi2)).map_err(|e| e.to_string())?;
                masm.code()
                    .vpsubq(xmm(dst.0), xmm(src.0), xmm(src2))
                    .map_err(|e| e.to_string())?;
            }
        }
        masm.code()
            .vinsertf128(ymm(dst.0), ymm(dst.0), xmm(hi1), 1)
            .map_err(|e| e.to_string())
    }

    fn emit_cvt(&self, op: &Op, masm: &mut MacroAssembler, dtype: DType) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let src = op.src.ok_or("conversion needs a register source")?;
        match (dtype, op.kind) {
            (DType::F32, OpKind::CvtFltInt) => masm
                .code()
                .vcvttps2dq(ymm(dst.0), ymm(src.0))
                .map_err(|e| e.to_string()),
            (DType::F32, OpKind::CvtIntFlt) => masm
                .code()
                .vcvtdq2ps(ymm(dst.0), ymm(src.0))
                .map_err(|e| e.to_string()),
            (DType::F64, OpKind::CvtFltInt) => masm
                .code()
                .vcvttpd2dq(xmm(dst.0), ymm(src.0))
                .map_err(|e| e.to_string()),
            (DType::F64, OpKind::CvtIntFlt) => masm
                .code()
                .vcvtdq2pd(ymm(dst.0), xmm(src.0))
                .map_err(|e| e.to_string()),
            _ => unreachable!(),
        }
    }

    fn emit_accumulate(
        &self,
        op: &Op,
        masm: &mut MacroAssembler,
        dtype: DType,
        kind: AccKind,
    ) -> Result<(), String> {
        let acc = op.acc.ok_or("accumulation needs an accumulator register")?;
        let bin = match kind {
            AccKind::Sum => OpKind::Add,
            AccKind::Product => OpKind::Mul,
            AccKind::Min => OpKind::Minimum,
            AccKind::Max => OpKind::Maximum,
        };
        let rhs = self.rhs(op, op.src, 0)?;
        self.emit_bin(masm, dtype, bin, acc.0, acc.0, rhs)
    }

    /// Reduce the accumulator across lanes, then move lane 0 into the
    /// destination register or slot.
    fn emit_reduce(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
        kind: AccKind,
    ) -> Result<(), String> {
        let acc_reg = op.acc.ok_or("reduce needs an accumulator register")?;
        let acc = ymm(acc_reg.0);
        let aux = ymm(self.aux(expr, 0));

        match expr.dtype {
            DType::F32 => {
                masm.code().vperm2f128(aux, acc, acc, 1).map_err(|e| e.to_string())?;
                match kind {
                    AccKind::Sum => {
                        masm.code().vhaddps(acc, acc, aux).map_err(|e| e.to_string())?;
                        masm.code().vhaddps(acc, acc, acc).map_err(|e| e.to_string())?;
                        masm.code().vhaddps(acc, acc, acc).map_err(|e| e.to_string())?;
                    }
                    AccKind::Product | AccKind::Min | AccKind::Max => {
                        self.fold_f32(masm, kind, acc_reg.0, self.aux(expr, 0))?;
                    }
                }
            }
            DType::F64 => {
                masm.code().vperm2f128(aux, acc, acc, 1).map_err(|e| e.to_string())?;
                match kind {
                    AccKind::Sum => {
                        masm.code().vhaddpd(acc, acc, aux).map_err(|e| e.to_string())?;
                        masm.code().vhaddpd(acc, acc, acc).map_err(|e| e.to_string())?;
                    }
                    AccKind::Product | AccKind::Min | AccKind::Max => {
                        self.fold_f64(masm, kind, acc_reg.0, self.aux(expr, 0))?;
                    }
                }
            }
        }

        match (op.dst, expr.dtype) {
            (Some(dst), DType::F32) => masm
                .code()
                .vmovss_3(xmm(dst.0), xmm(dst.0), xmm(acc_reg.0))
                .map_err(|e| e.to_string()),
            (Some(dst), DType::F64) => masm
                .code()
                .vmovsd_3(xmm(dst.0), xmm(dst.0), xmm(acc_reg.0))
                .map_err(|e| e.to_string()),
            (None, DType::F32) => {
                let mem = slot_operand(slot_arg(op, 0)?, SLOT_BYTES).to_mem();
                masm.code().vmovss(mem, xmm(acc_reg.0)).map_err(|e| e.to_string())
            }
            (None, DType::F64) => {
                let mem = slot_operand(slot_arg(op, 0)?, SLOT_BYTES).to_mem();
                masm.code().vmovsd(mem, xmm(acc_reg.0)).map_err(|e| e.to_string())
            }
        }
    }

    /// Lane fold for product/min/max: cross-lane half already merged by the
    /// caller's vperm2f128; fold by 64-bit then 32-bit permutes.
    fn fold_f32(
        &self,
        masm: &mut MacroAssembler,
        kind: AccKind,
        acc: u8,
        aux: u8,
    ) -> Result<(), String> {
        let a_reg = ymm(acc);
        let x_reg = ymm(aux);
        let fold = |masm: &mut MacroAssembler, kind: AccKind| -> Result<(), String> {
            let a = masm.code();
            match kind {
                AccKind::Product => a.vmulps(a_reg, a_reg, x_reg),
                AccKind::Min => a.vminps(a_reg, a_reg, x_reg),
                AccKind::Max => a.vmaxps(a_reg, a_reg, x_reg),
                AccKind::Sum => unreachable!(),
            }
            .map_err(|e| e.to_string())
        };
        fold(masm, kind)?;
        masm.code().vpermilps(x_reg, a_reg, 0x0E).map_err(|e| e.to_string())?;
        fold(masm, kind)?;
        masm.code().vpermilps(x_reg, a_reg, 0x01).map_err(|e| e.to_string())?;
        fold(masm, kind)
    }

    fn fold_f64(
        &self,
        masm: &mut MacroAssembler,
        kind: AccKind,
        acc: u8,
        aux: u8,
    ) -> Result<(), String> {
        let a_reg = ymm(acc);
        let x_reg = ymm(aux);
        let fold = |masm: &mut MacroAssembler, kind: AccKind| -> Result<(), String> {
            let a = masm.code();
            match kind {
                AccKind::Product => a.vmulpd(a_reg, a_reg, x_reg),
                AccKind::Min => a.vminpd(a_reg, a_reg, x_reg),
                AccKind::Max => a.vmaxpd(a_reg, a_reg, x_reg),
                AccKind::Sum => unreachable!(),
            }
            .map_err(|e| e.to_string())
        };
        fold(masm, kind)?;
        masm.code().vpermilpd(x_reg, a_reg, 1).map_err(|e| e.to_string())?;
        fold(masm, kind)
    }
}

impl ExpressionGenerator for VectorFltAvx256Generator {
    fn name(&self) -> &'static str {
        "VFltAVX256"
    }

    fn slot_bytes(&self, _dtype: DType) -> usize {
        SLOT_BYTES
    }

    fn reserve(&self, expr: &Expression, cpu: &crate::isa::CpuFeatures) -> Result<Reservation, String> {
        let cpu_avx2 = cpu.avx2;
        let mut aux_xmm = 0;
        let has = |kind: fn(&OpKind) -> bool| expr.ops.iter().any(|op| kind(&op.kind));

        if !cpu_avx2 && has(|k| matches!(k, OpKind::CvtExpInt | OpKind::CvtIntExp)) {
            aux_xmm = aux_xmm.max(1);
        }
        if !cpu_avx2 && has(|k| matches!(k, OpKind::SubInt)) {
            aux_xmm = aux_xmm.max(3);
        }
        if has(|k| matches!(k, OpKind::Not)) {
            aux_xmm = aux_xmm.max(1);
        }
        if has(|k| matches!(k, OpKind::Accumulate(_) | OpKind::Reduce(_))) {
            aux_xmm = aux_xmm.max(1);
        }
        Ok(Reservation { aux_xmm, aux_gp: 0 })
    }

    fn generate_op(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        if !masm.cpu().avx {
            return Err("vector float expressions require AVX".to_string());
        }
        let dtype = expr.dtype;
        match op.kind {
            OpKind::Mov => self.emit_mov(op, masm, dtype),
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::Minimum
            | OpKind::Maximum
            | OpKind::BitAnd
            | OpKind::BitOr
            | OpKind::And
            | OpKind::Or
            | OpKind::Xor
            | OpKind::AndNot => {
                let dst = dst_reg(op)?;
                let src = op.src.ok_or("binary op needs a register source")?;
                let rhs = self.rhs(op, op.src2, 1)?;
                self.emit_bin(masm, dtype, op.kind, dst.0, src.0, rhs)
            }
            OpKind::MulAdd132 | OpKind::MulAdd213 | OpKind::MulAdd231 => {
                self.emit_fma(op, masm, dtype)
            }
            OpKind::Sqrt => self.emit_sqrt(op, masm, dtype),
            OpKind::Floor => self.emit_floor(op, masm, dtype),
            OpKind::CmpEqOq => self.emit_compare(op, masm, dtype, CMP_EQ_OQ),
            OpKind::CmpNeUq => self.emit_compare(op, masm, dtype, CMP_NEQ_UQ),
            OpKind::CmpLtOq => self.emit_compare(op, masm, dtype, CMP_LT_OQ),
            OpKind::CmpLeOq => self.emit_compare(op, masm, dtype, CMP_LE_OQ),
            OpKind::CmpGtOq => self.emit_compare(op, masm, dtype, CMP_GT_OQ),
            OpKind::CmpGeOq => self.emit_compare(op, masm, dtype, CMP_GE_OQ),
            OpKind::Cond => self.emit_conditional(op, masm, dtype),
            OpKind::Select => self.emit_select(op, masm, dtype),
            OpKind::Not => self.emit_not(expr, op, masm),
            OpKind::CvtFltInt | OpKind::CvtIntFlt => self.emit_cvt(op, masm, dtype),
            OpKind::CvtExpInt => self.emit_shift(expr, op, masm, false),
            OpKind::CvtIntExp => self.emit_shift(expr, op, masm, true),
            OpKind::SubInt => self.emit_subint(expr, op, masm),
            OpKind::Accumulate(kind) => self.emit_accumulate(op, masm, dtype, kind),
            OpKind::Reduce(kind) => self.emit_reduce(expr, op, masm, kind),
        }
    }
}
