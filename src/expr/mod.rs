//! Elementwise floating-point expression programs and their code
//! generators.
//!
//! An [`Expression`] is a straight-line program over virtual registers the
//! surrounding register allocator has already assigned. Operands are either
//! virtual registers ([`ExprReg`]) or memory slots: `None` in a register
//! field means "the operand lives in memory, look it up via `args`".
//!
//! At runtime an expression kernel receives a single base pointer to its
//! slot array. For the scalar generator a slot is one element; for the
//! vector generator a slot is one full vector.
//!
//! Operand conventions (memory slot indices into `args`):
//! - `Mov` load/store and unary functions (sqrt, floor, cvt, shifts) use
//!   `args[0]`.
//! - Binary arithmetic, compares, bitwise ops and NOT use `args[1]`.
//! - `Cond` uses `args[2]` for its second source, `Select` uses `args[1]`.
//! - `Accumulate` and `Reduce` use `args[0]`.

mod scalar_sse;
mod vector_avx256;

pub use scalar_sse::ScalarFltSseGenerator;
pub use vector_avx256::VectorFltAvx256Generator;

use crate::isa::CpuFeatures;
use crate::masm::{MacroAssembler, Operand};
use crate::types::DType;

/// A virtual expression register, assigned by the surrounding allocator.
/// Distinct from general-purpose register handles by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprReg(pub u8);

/// Reduction flavour for accumulation and the final reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccKind {
    Sum,
    Product,
    Min,
    Max,
}

/// Expression operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Mov,
    Add,
    Sub,
    Mul,
    Div,
    Minimum,
    Maximum,
    Sqrt,
    MulAdd132,
    MulAdd213,
    MulAdd231,
    CmpEqOq,
    CmpNeUq,
    CmpLtOq,
    CmpLeOq,
    CmpGtOq,
    CmpGeOq,
    Cond,
    Select,
    BitAnd,
    BitOr,
    And,
    Or,
    Xor,
    AndNot,
    Not,
    Floor,
    CvtFltInt,
    CvtIntFlt,
    CvtExpInt,
    CvtIntExp,
    SubInt,
    Accumulate(AccKind),
    Reduce(AccKind),
}

/// One expression operation.
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: OpKind,
    pub dst: Option<ExprReg>,
    pub src: Option<ExprReg>,
    pub src2: Option<ExprReg>,
    pub mask: Option<ExprReg>,
    pub acc: Option<ExprReg>,
    /// Memory slot indices; meaning depends on the operation.
    pub args: Vec<usize>,
    /// Immediate for Mov; only 0.0 is meaningful (the zero idiom).
    pub imm: Option<f64>,
}

impl Op {
    pub fn new(kind: OpKind) -> Op {
        Op {
            kind,
            dst: None,
            src: None,
            src2: None,
            mask: None,
            acc: None,
            args: Vec::new(),
            imm: None,
        }
    }

    pub fn dst(mut self, r: u8) -> Op {
        self.dst = Some(ExprReg(r));
        self
    }

    pub fn src(mut self, r: u8) -> Op {
        self.src = Some(ExprReg(r));
        self
    }

    pub fn src2(mut self, r: u8) -> Op {
        self.src2 = Some(ExprReg(r));
        self
    }

    pub fn mask(mut self, r: u8) -> Op {
        self.mask = Some(ExprReg(r));
        self
    }

    pub fn acc(mut self, r: u8) -> Op {
        self.acc = Some(ExprReg(r));
        self
    }

    pub fn arg(mut self, slot: usize) -> Op {
        self.args.push(slot);
        self
    }

    pub fn imm(mut self, value: f64) -> Op {
        self.imm = Some(value);
        self
    }
}

/// A straight-line expression program.
pub struct Expression {
    pub dtype: DType,
    /// Number of virtual registers the program uses. Auxiliary registers are
    /// placed after these.
    pub num_regs: usize,
    /// Number of memory slots in the kernel's slot array.
    pub num_slots: usize,
    pub ops: Vec<Op>,
}

/// Auxiliary registers a generator needs for the ops present, reported to
/// the surrounding allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub aux_xmm: usize,
    pub aux_gp: usize,
}

/// An expression code generator.
pub trait ExpressionGenerator {
    /// Generator name, used as a variant label.
    fn name(&self) -> &'static str;

    /// Auxiliary register requirements for this program on the given CPU.
    fn reserve(&self, expr: &Expression, cpu: &CpuFeatures) -> Result<Reservation, String>;

    /// Bytes per memory slot in the kernel's slot array.
    fn slot_bytes(&self, dtype: DType) -> usize;

    /// Emit code for one operation.
    fn generate_op(
        &self,
        expr: &Expression,
        op: &Op,
        masm: &mut MacroAssembler,
    ) -> Result<(), String>;

    /// Emit the whole program followed by a return.
    fn generate(&self, expr: &Expression, masm: &mut MacroAssembler) -> Result<(), String> {
        let reservation = self.reserve(expr, masm.cpu())?;
        if expr.num_regs + reservation.aux_xmm > 16 {
            return Err(format!(
                "expression needs {} registers plus {} auxiliary, only 16 available",
                expr.num_regs, reservation.aux_xmm
            ));
        }
        log::debug!(
            "expression codegen: {} ops via {} ({:?})",
            expr.ops.len(),
            self.name(),
            expr.dtype
        );
        for op in &expr.ops {
            self.generate_op(expr, op, masm)?;
        }
        masm.ret()
    }
}

/// Memory operand for a slot of the kernel's slot array.
pub(crate) fn slot_operand(slot: usize, slot_bytes: usize) -> Operand {
    Operand::with_disp(MacroAssembler::arg_reg(0), (slot * slot_bytes) as i32)
}

/// First memory slot listed by an op, as an error if missing.
pub(crate) fn slot_arg(op: &Op, index: usize) -> Result<usize, String> {
    op.args
        .get(index)
        .copied()
        .ok_or_else(|| format!("{:?} needs a memory slot in args[{}]", op.kind, index))
}

/// Destination register, as an error if the op has none.
pub(crate) fn dst_reg(op: &Op) -> Result<ExprReg, String> {
    op.dst.ok_or_else(|| format!("{:?} needs a register destination", op.kind))
}
