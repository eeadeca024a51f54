//! Scalar float expression generator using SSE and XMM registers.
//!
//! Two-address instruction model: binary operations compute `dst ⊕= rhs`
//! where the right-hand side is a register or a memory slot. Virtual
//! registers map directly onto xmm0..; auxiliary registers sit after the
//! program's registers.

use crate::masm::{gp, gp32, xmm, MacroAssembler};
use crate::types::DType;

use super::{
    dst_reg, slot_arg, slot_operand, AccKind, Expression, ExpressionGenerator, Op, OpKind,
    Reservation,
};

// Compare predicate immediates (ordered/unordered, quiet).
const CMP_EQ_OQ: i32 = 0x00;
const CMP_NEQ_UQ: i32 = 0x04;
const CMP_LT_OQ: i32 = 0x11;
const CMP_LE_OQ: i32 = 0x12;
const CMP_GE_OQ: i32 = 0x1D;
const CMP_GT_OQ: i32 = 0x1E;

const ROUND_DOWN: i32 = 1;

/// Right-hand side of a two-address operation.
enum Rhs {
    Reg(u8),
    Mem(crate::masm::Operand),
}

pub struct ScalarFltSseGenerator;

impl ScalarFltSseGenerator {
    fn aux(&self, expr: &Expression, n: usize) -> u8 {
        (expr.num_regs + n) as u8
    }

    fn rhs(&self, expr: &Expression, op: &Op, arg_index: usize) -> Result<Rhs, String> {
        match op.src {
            Some(r) => Ok(Rhs::Reg(r.0)),
            None => Ok(Rhs::Mem(slot_operand(
                slot_arg(op, arg_index)?,
                self.slot_bytes(expr.dtype),
            ))),
        }
    }

    /// Two-address binary arithmetic: `dst ⊕= rhs`.
    fn emit_bin(
        &self,
        masm: &mut MacroAssembler,
        dtype: DType,
        kind: OpKind,
        dst: u8,
        rhs: Rhs,
    ) -> Result<(), String> {
        let d = xmm(dst);
        let a = masm.code();
        let result = match (dtype, rhs) {
            (DType::F32, Rhs::Reg(s)) => {
                let s = xmm(s);
                match kind {
                    OpKind::Add => a.addss(d, s),
                    OpKind::Sub => a.subss(d, s),
                    OpKind::Mul => a.mulss(d, s),
                    OpKind::Div => a.divss(d, s),
                    OpKind::Minimum => a.minss(d, s),
                    OpKind::Maximum => a.maxss(d, s),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
            (DType::F32, Rhs::Mem(m)) => {
                let m = m.to_mem();
                match kind {
                    OpKind::Add => a.addss(d, m),
                    OpKind::Sub => a.subss(d, m),
                    OpKind::Mul => a.mulss(d, m),
                    OpKind::Div => a.divss(d, m),
                    OpKind::Minimum => a.minss(d, m),
                    OpKind::Maximum => a.maxss(d, m),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
            (DType::F64, Rhs::Reg(s)) => {
                let s = xmm(s);
                match kind {
                    OpKind::Add => a.addsd(d, s),
                    OpKind::Sub => a.subsd(d, s),
                    OpKind::Mul => a.mulsd(d, s),
                    OpKind::Div => a.divsd(d, s),
                    OpKind::Minimum => a.minsd(d, s),
                    OpKind::Maximum => a.maxsd(d, s),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
            (DType::F64, Rhs::Mem(m)) => {
                let m = m.to_mem();
                match kind {
                    OpKind::Add => a.addsd(d, m),
                    OpKind::Sub => a.subsd(d, m),
                    OpKind::Mul => a.mulsd(d, m),
                    OpKind::Div => a.divsd(d, m),
                    OpKind::Minimum => a.minsd(d, m),
                    OpKind::Maximum => a.maxsd(d, m),
                    _ => unreachable!("not a binary op: {:?}", kind),
                }
            }
        };
        result.map_err(|e| e.to_string())
    }

    fn emit_mov(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dtype = expr.dtype;
        let slot_bytes = self.slot_bytes(dtype);

        if let Some(value) = op.imm {
            let dst = dst_reg(op)?;
            if value != 0.0 {
                return Err("scalar move supports only the zero immediate".to_string());
            }
            if masm.cpu().zero_idiom {
                // XOR instead of loading the constant from memory. The
                // floating point form avoids bypass delays between the
                // integer and floating point units.
                return match dtype {
                    DType::F32 => masm
                        .code()
                        .xorps(xmm(dst.0), xmm(dst.0))
                        .map_err(|e| e.to_string()),
                    DType::F64 => masm
                        .code()
                        .xorpd(xmm(dst.0), xmm(dst.0))
                        .map_err(|e| e.to_string()),
                };
            }
            // Zero idiom disabled: load the zero constant from its slot.
            let mem = slot_operand(slot_arg(op, 0)?, slot_bytes).to_mem();
            return match dtype {
                DType::F32 => masm.code().movss(xmm(dst.0), mem).map_err(|e| e.to_string()),
                DType::F64 => masm.code().movsd_2(xmm(dst.0), mem).map_err(|e| e.to_string()),
            };
        }

        match (op.dst, op.src) {
            (Some(dst), Some(src)) => match dtype {
                DType::F32 => masm
                    .code()
                    .movss(xmm(dst.0), xmm(src.0))
                    .map_err(|e| e.to_string()),
                DType::F64 => masm
                    .code()
                    .movsd_2(xmm(dst.0), xmm(src.0))
                    .map_err(|e| e.to_string()),
            },
            (Some(dst), None) => {
                let mem = slot_operand(slot_arg(op, 0)?, slot_bytes).to_mem();
                match dtype {
                    DType::F32 => masm.code().movss(xmm(dst.0), mem).map_err(|e| e.to_string()),
                    DType::F64 => masm.code().movsd_2(xmm(dst.0), mem).map_err(|e| e.to_string()),
                }
            }
            (None, Some(src)) => {
                let mem = slot_operand(slot_arg(op, 0)?, slot_bytes).to_mem();
                match dtype {
                    DType::F32 => masm.code().movss(mem, xmm(src.0)).map_err(|e| e.to_string()),
                    DType::F64 => masm.code().movsd_2(mem, xmm(src.0)).map_err(|e| e.to_string()),
                }
            }
            (None, None) => Err("move needs a register source or destination".to_string()),
        }
    }

    fn emit_sqrt(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let d = xmm(dst.0);
        match (expr.dtype, op.src) {
            (DType::F32, Some(s)) => masm.code().sqrtss(d, xmm(s.0)).map_err(|e| e.to_string()),
            (DType::F64, Some(s)) => masm.code().sqrtsd(d, xmm(s.0)).map_err(|e| e.to_string()),
            (DType::F32, None) => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().sqrtss(d, mem).map_err(|e| e.to_string())
            }
            (DType::F64, None) => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().sqrtsd(d, mem).map_err(|e| e.to_string())
            }
        }
    }

    fn emit_compare(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
        code: i32,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let d = xmm(dst.0);
        match (expr.dtype, self.rhs(expr, op, 1)?) {
            (DType::F32, Rhs::Reg(s)) => {
                masm.code().cmpss(d, xmm(s), code as u32).map_err(|e| e.to_string())
            }
            (DType::F32, Rhs::Mem(m)) => {
                masm.code().cmpss(d, m.to_mem(), code as u32).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Reg(s)) => {
                masm.code().cmpsd_3(d, xmm(s), code as u32).map_err(|e| e.to_string())
            }
            (DType::F64, Rhs::Mem(m)) => {
                masm.code().cmpsd_3(d, m.to_mem(), code as u32).map_err(|e| e.to_string())
            }
        }
    }

    /// Conditional: pick the first source when the mask tests non-zero, the
    /// second otherwise.
    fn emit_conditional(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let src = op.src.ok_or("conditional needs a register source")?;
        let mask = op.mask.ok_or("conditional needs a mask register")?;

        let mut l1 = masm.create_label();
        let mut l2 = masm.create_label();
        masm.code()
            .ptest(xmm(mask.0), xmm(mask.0))
            .map_err(|e| e.to_string())?;
        masm.jz(l1)?;
        masm.code()
            .movaps(xmm(dst.0), xmm(src.0))
            .map_err(|e| e.to_string())?;
        masm.jmp(l2)?;
        masm.bind(&mut l1)?;
        match (op.src2, expr.dtype) {
            (Some(s2), _) => masm
                .code()
                .movaps(xmm(dst.0), xmm(s2.0))
                .map_err(|e| e.to_string())?,
            (None, DType::F32) => {
                let mem = slot_operand(slot_arg(op, 2)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().movss(xmm(dst.0), mem).map_err(|e| e.to_string())?;
            }
            (None, DType::F64) => {
                let mem = slot_operand(slot_arg(op, 2)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().movsd_2(xmm(dst.0), mem).map_err(|e| e.to_string())?;
            }
        }
        masm.bind(&mut l2)
    }

    /// Masked select: keep the source when the mask tests non-zero, zero the
    /// destination otherwise.
    fn emit_select(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dst = dst_reg(op)?;
        let mask = op.mask.ok_or("select needs a mask register")?;

        let mut l1 = masm.create_label();
        masm.code()
            .ptest(xmm(mask.0), xmm(mask.0))
            .map_err(|e| e.to_string())?;
        masm.jnz(l1)?;
        match expr.dtype {
            DType::F32 => masm
                .code()
                .xorps(xmm(dst.0), xmm(dst.0))
                .map_err(|e| e.to_string())?,
            DType::F64 => masm
                .code()
                .xorpd(xmm(dst.0), xmm(dst.0))
                .map_err(|e| e.to_string())?,
        }
        if op.src == Some(dst) {
            // Source and destination coincide: nothing to move, skip the
            // jump.
            masm.bind(&mut l1)
        } else {
            let mut l2 = masm.create_label();
            masm.jmp(l2)?;
            masm.bind(&mut l1)?;
            match (op.src, expr.dtype) {
                (Some(s), _) => masm
                    .code()
                    .movaps(xmm(dst.0), xmm(s.0))
                    .map_err(|e| e.to_string())?,
                (None, DType::F32) => {
                    let mem = slot_operand(slot_arg(op, 1)?, self.slot_bytes(expr.dtype)).to_mem();
                    masm.code().movss(xmm(dst.0), mem).map_err(|e| e.to_string())?;
                }
                (None, DType::F64) => {
                    let mem = slot_operand(slot_arg(op, 1)?, self.slot_bytes(expr.dtype)).to_mem();
                    masm.code().movsd_2(xmm(dst.0), mem).map_err(|e| e.to_string())?;
                }
            }
            masm.bind(&mut l2)
        }
    }

    /// Operations that need their memory operand staged in a register:
    /// bitwise logic, integer conversions and integer subtract.
    fn emit_register_op(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let dtype = expr.dtype;
        let dst = dst_reg(op)?;
        let d = xmm(dst.0);
        let src_code = match op.src {
            Some(s) => s.0,
            None => self.aux(expr, 0),
        };
        let s = xmm(src_code);

        if op.src.is_none() {
            let mem = slot_operand(slot_arg(op, 1)?, self.slot_bytes(dtype)).to_mem();
            match dtype {
                DType::F32 => masm.code().movss(s, mem).map_err(|e| e.to_string())?,
                DType::F64 => masm.code().movsd_2(s, mem).map_err(|e| e.to_string())?,
            }
        }

        match (dtype, op.kind) {
            (DType::F32, OpKind::CvtFltInt) => {
                masm.code().cvttps2dq(d, s).map_err(|e| e.to_string())
            }
            (DType::F32, OpKind::CvtIntFlt) => masm.code().cvtdq2ps(d, s).map_err(|e| e.to_string()),
            (DType::F32, OpKind::SubInt) => masm.code().psubd(d, s).map_err(|e| e.to_string()),
            (DType::F32, OpKind::BitAnd) | (DType::F32, OpKind::And) => {
                masm.code().andps(d, s).map_err(|e| e.to_string())
            }
            (DType::F32, OpKind::BitOr) | (DType::F32, OpKind::Or) => {
                masm.code().orps(d, s).map_err(|e| e.to_string())
            }
            (DType::F32, OpKind::Xor) => masm.code().xorps(d, s).map_err(|e| e.to_string()),
            (DType::F32, OpKind::AndNot) => masm.code().andnps(d, s).map_err(|e| e.to_string()),
            (DType::F32, OpKind::Not) => {
                // not(x) = xor(all-ones, x); the all-ones constant comes in
                // through a general-purpose auxiliary.
                let aux_gp = masm.alloc_gp();
                masm.code().mov(gp32(aux_gp), -1i32).map_err(|e| e.to_string())?;
                if op.src == Some(dst) {
                    let tmp = xmm(self.aux(expr, 1));
                    masm.code().movd(tmp, gp32(aux_gp)).map_err(|e| e.to_string())?;
                    masm.code().xorps(d, tmp).map_err(|e| e.to_string())?;
                } else {
                    masm.code().movd(d, gp32(aux_gp)).map_err(|e| e.to_string())?;
                    masm.code().xorps(d, s).map_err(|e| e.to_string())?;
                }
                masm.release_gp(aux_gp);
                Ok(())
            }
            (DType::F64, OpKind::CvtFltInt) => {
                masm.code().cvttpd2dq(d, s).map_err(|e| e.to_string())
            }
            (DType::F64, OpKind::CvtIntFlt) => masm.code().cvtdq2pd(d, s).map_err(|e| e.to_string()),
            (DType::F64, OpKind::SubInt) => masm.code().psubq(d, s).map_err(|e| e.to_string()),
            (DType::F64, OpKind::BitAnd) | (DType::F64, OpKind::And) => {
                masm.code().andpd(d, s).map_err(|e| e.to_string())
            }
            (DType::F64, OpKind::BitOr) | (DType::F64, OpKind::Or) => {
                masm.code().orpd(d, s).map_err(|e| e.to_string())
            }
            (DType::F64, OpKind::Xor) => masm.code().xorpd(d, s).map_err(|e| e.to_string()),
            (DType::F64, OpKind::AndNot) => masm.code().andnpd(d, s).map_err(|e| e.to_string()),
            (DType::F64, OpKind::Not) => {
                let aux_gp = masm.alloc_gp();
                masm.code().mov(gp(aux_gp), -1i64).map_err(|e| e.to_string())?;
                if op.src == Some(dst) {
                    let tmp = xmm(self.aux(expr, 1));
                    masm.code().movq(tmp, gp(aux_gp)).map_err(|e| e.to_string())?;
                    masm.code().xorpd(d, tmp).map_err(|e| e.to_string())?;
                } else {
                    masm.code().movq(d, gp(aux_gp)).map_err(|e| e.to_string())?;
                    masm.code().xorpd(d, s).map_err(|e| e.to_string())?;
                }
                masm.release_gp(aux_gp);
                Ok(())
            }
            _ => Err(format!("unsupported register op {:?}", op.kind)),
        }
    }

    fn emit_floor(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        if !masm.cpu().sse41 {
            return Err("FLOOR requires SSE 4.1".to_string());
        }
        let dst = dst_reg(op)?;
        let d = xmm(dst.0);
        match (expr.dtype, op.src) {
            (DType::F32, Some(s)) => masm
                .code()
                .roundss(d, xmm(s.0), ROUND_DOWN as u32)
                .map_err(|e| e.to_string()),
            (DType::F64, Some(s)) => masm
                .code()
                .roundsd(d, xmm(s.0), ROUND_DOWN as u32)
                .map_err(|e| e.to_string()),
            (DType::F32, None) => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().roundss(d, mem, ROUND_DOWN as u32).map_err(|e| e.to_string())
            }
            (DType::F64, None) => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().roundsd(d, mem, ROUND_DOWN as u32).map_err(|e| e.to_string())
            }
        }
    }

    /// IEEE-754 exponent field extraction/injection via logical shifts.
    fn emit_shift(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
        left: bool,
    ) -> Result<(), String> {
        if !masm.cpu().sse2 {
            return Err("exponent shifts require SSE2".to_string());
        }
        let dst = dst_reg(op)?;
        let d = xmm(dst.0);

        // Move the argument into the destination register.
        match op.src {
            Some(s) => {
                if s != dst {
                    masm.code().movapd(d, xmm(s.0)).map_err(|e| e.to_string())?;
                }
            }
            None => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                match expr.dtype {
                    DType::F32 => masm.code().movss(d, mem).map_err(|e| e.to_string())?,
                    DType::F64 => masm.code().movsd_2(d, mem).map_err(|e| e.to_string())?,
                }
            }
        }

        match (expr.dtype, left) {
            (DType::F32, true) => masm.code().pslld(d, 23u32).map_err(|e| e.to_string()),
            (DType::F32, false) => masm.code().psrld(d, 23u32).map_err(|e| e.to_string()),
            (DType::F64, true) => masm.code().psllq(d, 52u32).map_err(|e| e.to_string()),
            (DType::F64, false) => masm.code().psrlq(d, 52u32).map_err(|e| e.to_string()),
        }
    }

    fn emit_accumulate(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
        kind: AccKind,
    ) -> Result<(), String> {
        let acc = op.acc.ok_or("accumulation needs an accumulator register")?;
        let bin = match kind {
            AccKind::Sum => OpKind::Add,
            AccKind::Product => OpKind::Mul,
            AccKind::Min => OpKind::Minimum,
            AccKind::Max => OpKind::Maximum,
        };
        let rhs = match op.src {
            Some(s) => Rhs::Reg(s.0),
            None => Rhs::Mem(slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype))),
        };
        self.emit_bin(masm, expr.dtype, bin, acc.0, rhs)
    }

    /// Final move of the accumulator into the destination register or slot.
    fn emit_reduce(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        let acc = op.acc.ok_or("reduce needs an accumulator register")?;
        match (op.dst, expr.dtype) {
            (Some(dst), DType::F32) => masm
                .code()
                .movss(xmm(dst.0), xmm(acc.0))
                .map_err(|e| e.to_string()),
            (Some(dst), DType::F64) => masm
                .code()
                .movsd_2(xmm(dst.0), xmm(acc.0))
                .map_err(|e| e.to_string()),
            (None, DType::F32) => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().movss(mem, xmm(acc.0)).map_err(|e| e.to_string())
            }
            (None, DType::F64) => {
                let mem = slot_operand(slot_arg(op, 0)?, self.slot_bytes(expr.dtype)).to_mem();
                masm.code().movsd_2(mem, xmm(acc.0)).map_err(|e| e.to_string())
            }
        }
    }
}

impl ExpressionGenerator for ScalarFltSseGenerator {
    fn name(&self) -> &'static str {
        "FltSSE"
    }

    fn slot_bytes(&self, dtype: DType) -> usize {
        dtype.size_bytes()
    }

    fn reserve(&self, expr: &Expression, _cpu: &crate::isa::CpuFeatures) -> Result<Reservation, String> {
        let mut aux_xmm = 0;
        let mut aux_gp = 0;
        let has = |kind: fn(&OpKind) -> bool| expr.ops.iter().any(|op| kind(&op.kind));

        if has(|k| {
            matches!(
                k,
                OpKind::BitAnd
                    | OpKind::BitOr
                    | OpKind::And
                    | OpKind::Or
                    | OpKind::Xor
                    | OpKind::AndNot
                    | OpKind::CvtFltInt
                    | OpKind::CvtIntFlt
                    | OpKind::SubInt
            )
        }) {
            aux_xmm = aux_xmm.max(1);
        }
        if has(|k| matches!(k, OpKind::Not)) {
            aux_xmm = aux_xmm.max(2);
            aux_gp = 1;
        }
        Ok(Reservation { aux_xmm, aux_gp })
    }

    fn generate_op(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String> {
        match op.kind {
            OpKind::Mov => self.emit_mov(expr, op, masm),
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::Minimum
            | OpKind::Maximum => {
                let dst = dst_reg(op)?;
                let rhs = self.rhs(expr, op, 1)?;
                self.emit_bin(masm, expr.dtype, op.kind, dst.0, rhs)
            }
            OpKind::Sqrt => self.emit_sqrt(expr, op, masm),
            OpKind::CmpEqOq => self.emit_compare(expr, op, masm, CMP_EQ_OQ),
            OpKind::CmpNeUq => self.emit_compare(expr, op, masm, CMP_NEQ_UQ),
            OpKind::CmpLtOq => self.emit_compare(expr, op, masm, CMP_LT_OQ),
            OpKind::CmpLeOq => self.emit_compare(expr, op, masm, CMP_LE_OQ),
            OpKind::CmpGtOq => self.emit_compare(expr, op, masm, CMP_GT_OQ),
            OpKind::CmpGeOq => self.emit_compare(expr, op, masm, CMP_GE_OQ),
            OpKind::Cond => self.emit_conditional(expr, op, masm),
            OpKind::Select => self.emit_select(expr, op, masm),
            OpKind::BitAnd
            | OpKind::BitOr
            | OpKind::And
            | OpKind::Or
            | OpKind::Xor
            | OpKind::AndNot
            | OpKind::Not
            | OpKind::SubInt => self.emit_register_op(expr, op, masm),
            OpKind::Floor => self.emit_floor(expr, op, masm),
            OpKind::CvtFltInt | OpKind::CvtIntFlt => {
                if !masm.cpu().sse2 {
                    return Err("integer conversions require SSE2".to_string());
                }
                self.emit_register_op(expr, op, masm)
            }
            OpKind::CvtExpInt => self.emit_shift(expr, op, masm, false),
            OpKind::CvtIntExp => self.emit_shift(expr, op, masm, true),
            OpKind::Accumulate(kind) => self.emit_accumulate(expr, op, masm, kind),
            OpKind::Reduce(_) => self.emit_reduce(expr, op, masm),
            OpKind::MulAdd132 | OpKind::MulAdd213 | OpKind::MulAdd231 => {
                Err("fused multiply-add is not in the scalar SSE model".to_string())
            }
        }
    }
}
