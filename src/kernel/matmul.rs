//! General matrix multiplication using the SIMD generator cascade.
//!
//! The emitter normalises the output to row-major via the identity
//! `C = A·B  ⇔  Cᵀ = Bᵀ·Aᵀ`, then picks one of four loop nests from the
//! effective (declared XOR transposed) orders of A and B:
//!
//! | A            | B            | algorithm                  | variant |
//! |--------------|--------------|----------------------------|---------|
//! | row-major    | row-major    | vertical, consecutive A    | `RR`    |
//! | column-major | row-major    | vertical, strided A        | `CR`    |
//! | row-major    | column-major | horizontal (dot products)  | `RC`    |
//! | column-major | column-major | scalar dot products        | `CC`    |
//!
//! Vertical nests walk column blocks of B with vertical accumulation;
//! the horizontal nest scans co-indexed chunks of A and B rows and reduces
//! with horizontal sums. Accumulation (`C += A·B`) loads or adds C before
//! the store in every phase shape.

use crate::isa::CpuFeatures;
use crate::masm::{MacroAssembler, Operand, Reg};
use crate::simd::{SimdAssembler, SimdGenerator, SimdStrategy};
use crate::tensor::{Step, TensorRef};
use crate::types::{DType, Order, Shape};

use super::Kernel;

/// Maximum number of loop unrolls.
const MAX_UNROLLS: usize = 4;

/// One matmul operand: a tensor plus its transposition state.
#[derive(Clone)]
pub struct Arg {
    tensor: TensorRef,
    shape: Shape,
    transposed: bool,
}

impl Arg {
    fn init(tensor: TensorRef, transposed: bool) -> Arg {
        let shape = {
            let t = tensor.borrow();
            if transposed {
                t.shape().transposed()
            } else {
                t.shape().clone()
            }
        };
        Arg {
            tensor,
            shape,
            transposed,
        }
    }

    /// Flip the transposition state.
    fn transpose(&mut self) {
        self.transposed = !self.transposed;
        self.shape = self.shape.transposed();
    }

    /// Element order with respect to transposition.
    pub fn order(&self) -> Order {
        match self.tensor.borrow().order() {
            Order::RowMajor => {
                if self.transposed {
                    Order::ColumnMajor
                } else {
                    Order::RowMajor
                }
            }
            Order::ColumnMajor => {
                if self.transposed {
                    Order::RowMajor
                } else {
                    Order::ColumnMajor
                }
            }
            Order::Any => Order::Any,
        }
    }

    /// Outer dimension in the stored array.
    fn outer(&self) -> usize {
        if self.tensor.borrow().order() == Order::RowMajor {
            0
        } else {
            1
        }
    }

    /// Inner dimension in the stored array.
    fn inner(&self) -> usize {
        1 - self.outer()
    }

    /// Extent of the outer dimension of the stored array.
    pub fn height(&self) -> usize {
        let outer = self.outer();
        self.tensor.borrow().dim(outer)
    }

    /// Extent of the inner dimension of the stored array.
    pub fn width(&self) -> usize {
        let inner = self.inner();
        self.tensor.borrow().dim(inner)
    }

    /// Tensor byte size including padding.
    pub fn size(&self) -> usize {
        self.tensor.borrow().byte_size()
    }

    /// Bytes per outer step, including padding.
    pub fn stride(&self) -> usize {
        let outer = self.outer();
        self.tensor.borrow().stride(outer)
    }

    /// Padding bytes per outer step.
    pub fn padding(&self) -> usize {
        let outer = self.outer();
        self.tensor.borrow().padding(outer)
    }

    pub fn dtype(&self) -> DType {
        self.tensor.borrow().dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn transposed(&self) -> bool {
        self.transposed
    }

    pub fn tensor(&self) -> &TensorRef {
        &self.tensor
    }
}

/// Matmul arguments with orientation normalisation: `c = a * b`.
pub struct MatMulArgs {
    c: Arg,
    a: Arg,
    b: Arg,
    accumulate: bool,
}

impl MatMulArgs {
    /// Check that the step has the inputs and outputs of a matmul. An
    /// accumulating matmul takes the result as its first input.
    pub fn valid(step: &Step) -> bool {
        if step.op() == "AssignAddMatMul" {
            step.indegree() >= 3
        } else {
            step.indegree() >= 2 && step.outdegree() >= 1
        }
    }

    pub fn new(step: &Step) -> MatMulArgs {
        assert!(MatMulArgs::valid(step));
        let accumulate = step.op() == "AssignAddMatMul";

        let (c, a, b) = if accumulate {
            (step.input(0), step.input(1), step.input(2))
        } else {
            (step.output(0), step.input(0), step.input(1))
        };

        MatMulArgs {
            c: Arg::init(c, step.attr("transpose_c", false)),
            a: Arg::init(a, step.attr("transpose_a", false)),
            b: Arg::init(b, step.attr("transpose_b", false)),
            accumulate,
        }
    }

    /// Ensure the output element order, transforming `C = A·B` into
    /// `Cᵀ = Bᵀ·Aᵀ` when needed. Returns false if the output tensor does not
    /// support its storage order.
    pub fn ensure_output_order(&mut self, order: Order) -> bool {
        let transform = match order {
            Order::RowMajor => self.c.tensor.borrow().order() == Order::ColumnMajor,
            Order::ColumnMajor => self.c.tensor.borrow().order() == Order::RowMajor,
            Order::Any => false,
        };

        if transform {
            std::mem::swap(&mut self.a, &mut self.b);
            self.c.transpose();
            self.a.transpose();
            self.b.transpose();
        }

        let declared = self.c.tensor.borrow().order();
        self.c.tensor.borrow().supports_order(declared)
    }

    /// Publish the required storage order on the output tensor, inverted by
    /// its transposition state.
    pub fn set_required_order(&mut self, order: Order) {
        self.ensure_output_order(order);
        let required = match order {
            Order::RowMajor => {
                if self.c.transposed {
                    Order::ColumnMajor
                } else {
                    Order::RowMajor
                }
            }
            Order::ColumnMajor => {
                if self.c.transposed {
                    Order::RowMajor
                } else {
                    Order::ColumnMajor
                }
            }
            Order::Any => Order::Any,
        };
        self.c.tensor.borrow_mut().set_required_order(required);
    }

    /// Check that argument shapes agree with a matrix multiplication.
    pub fn check_shapes(&self) -> bool {
        if self.a.shape.rank() != 2 || self.b.shape.rank() != 2 || self.c.shape.rank() != 2 {
            return false;
        }
        self.a.shape.dim(0) == self.c.shape.dim(0)
            && self.a.shape.dim(1) == self.b.shape.dim(0)
            && self.b.shape.dim(1) == self.c.shape.dim(1)
    }

    /// Whether all three strides are multiples of `align`.
    pub fn aligned(&self, align: usize) -> bool {
        self.a.stride() % align == 0 && self.b.stride() % align == 0 && self.c.stride() % align == 0
    }

    pub fn accumulate(&self) -> bool {
        self.accumulate
    }

    pub fn a(&self) -> &Arg {
        &self.a
    }

    pub fn b(&self) -> &Arg {
        &self.b
    }

    pub fn c(&self) -> &Arg {
        &self.c
    }
}

/// General matrix multiplication kernel. Supports transposed inputs and
/// output as well as output accumulation.
pub struct SimdMatMul {
    accumulate: bool,
}

impl SimdMatMul {
    pub fn new(accumulate: bool) -> SimdMatMul {
        SimdMatMul { accumulate }
    }

    /// Dot products between rows/columns of A and column blocks of B using
    /// vertical summing. The vectors of A are traversed top to bottom
    /// (strided) or left to right (consecutive).
    fn generate_vertical(
        &self,
        step: &mut Step,
        masm: &mut MacroAssembler,
        args: &MatMulArgs,
        strided: bool,
    ) -> Result<(), String> {
        let dtype = args.c().dtype();
        let dsize = dtype.size_bytes();
        let vecbytes = SimdAssembler::vector_bytes(masm.cpu(), dtype);

        masm.prologue()?;
        let sasm = SimdAssembler::new(masm, dtype, args.aligned(vecbytes))?;
        step.set_variant(format!("{}{}", sasm.name(), if strided { "CR" } else { "RR" }));
        if strided {
            assert_eq!(args.a().height(), args.b().height());
        } else {
            assert_eq!(args.a().width(), args.b().height());
        }

        let strategy = SimdStrategy::new(&sasm, args.b().width(), MAX_UNROLLS);
        strategy.preload_masks(masm)?;

        // Allocate registers.
        let a = masm.alloc_gp();
        let b = masm.alloc_gp();
        let c = masm.alloc_gp();
        let a_ofs = masm.alloc_gp();
        let b_ptr = masm.alloc_gp();
        let col_ofs = masm.alloc_gp();
        let sum = sasm.alloc_regs(masm, strategy.max_unrolls());
        let elem = sasm.alloc_reg(masm);

        // Load tensor addresses.
        masm.load_tensor_address(a, &args.a().tensor().borrow())?;
        masm.load_tensor_address(b, &args.b().tensor().borrow())?;
        masm.load_tensor_address(c, &args.c().tensor().borrow())?;

        // Compute inner and outer dimensions.
        let (outer_step, outer_limit, inner_step, inner_limit) = if strided {
            (
                dsize,
                dsize * args.a().width(),
                args.a().stride(),
                args.a().stride() * args.a().height(),
            )
        } else {
            (
                args.a().stride(),
                args.a().stride() * args.a().height(),
                dsize,
                dsize * args.a().width(),
            )
        };
        let outer_single = outer_step == outer_limit;
        let inner_single = inner_step == inner_limit;

        // Loop over rows/columns of A.
        let a_end = masm.alloc_gp();
        let mut l1 = masm.create_label();
        if !outer_single {
            masm.lea(a_end, Operand::with_disp(a, outer_limit as i32))?;
            masm.bind(&mut l1)?;
        }

        // Dot product between a row/column of A and column blocks of B.
        for phase in strategy.phases() {
            let gen = phase.generator;
            let vecsize = gen.vector_size();
            let blkstart = (phase.offset * dsize) as i32;
            let blksize = (phase.unrolls * vecsize * dsize) as i32;

            if phase.repeat > 1 {
                // Repeated phase.
                let mut l2 = masm.create_label();
                if phase.offset == 0 {
                    masm.zero_gp(col_ofs)?;
                } else {
                    masm.mov_imm(col_ofs, blkstart as i64)?;
                }
                masm.bind(&mut l2)?;

                if inner_single {
                    // Outer product of an A element and a B row block.
                    gen.broadcast(masm, elem, Operand::base(a))?;
                    for i in 0..phase.unrolls {
                        let disp = (i * vecsize * dsize) as i32;
                        if self.accumulate {
                            gen.load(masm, sum[i], Operand::with_disp(c, disp))?;
                            let retain = i != phase.unrolls - 1;
                            gen.mul_add(masm, sum[i], elem, Operand::indexed(b, col_ofs, disp), retain)?;
                        } else {
                            gen.mul_mem(masm, sum[i], elem, Operand::indexed(b, col_ofs, disp))?;
                        }
                        gen.store(masm, Operand::with_disp(c, disp), sum[i])?;
                    }
                } else {
                    self.emit_inner_loop(
                        masm, gen, args, phase.unrolls, &sum, elem,
                        a, a_ofs, b, b_ptr, InnerBase::Register(col_ofs),
                        inner_step, inner_limit,
                    )?;
                    // Save the result in C.
                    for i in 0..phase.unrolls {
                        let disp = (i * vecsize * dsize) as i32;
                        if self.accumulate {
                            gen.add_mem(masm, sum[i], sum[i], Operand::with_disp(c, disp))?;
                        }
                        gen.store(masm, Operand::with_disp(c, disp), sum[i])?;
                    }
                }
                masm.add_imm(c, blksize)?;

                // Next block.
                masm.add_imm(col_ofs, blksize)?;
                masm.cmp_imm(col_ofs, blkstart + phase.repeat as i32 * blksize)?;
                masm.jl(l2)?;
            } else if phase.masked == 0 {
                // Residual phase.
                if inner_single {
                    // Outer product of an A element and a B row block.
                    gen.broadcast(masm, elem, Operand::base(a))?;
                    for i in 0..phase.unrolls {
                        let disp = blkstart + (i * vecsize * dsize) as i32;
                        if self.accumulate {
                            gen.load(masm, sum[i], Operand::with_disp(c, (i * vecsize * dsize) as i32))?;
                            let retain = i != phase.unrolls - 1;
                            gen.mul_add(masm, sum[i], elem, Operand::with_disp(b, disp), retain)?;
                        } else {
                            gen.mul_mem(masm, sum[i], elem, Operand::with_disp(b, disp))?;
                        }
                        gen.store(masm, Operand::with_disp(c, (i * vecsize * dsize) as i32), sum[i])?;
                    }
                } else {
                    self.emit_inner_loop(
                        masm, gen, args, phase.unrolls, &sum, elem,
                        a, a_ofs, b, b_ptr, InnerBase::Immediate(blkstart),
                        inner_step, inner_limit,
                    )?;
                    // Save the result in C.
                    for i in 0..phase.unrolls {
                        let disp = (i * vecsize * dsize) as i32;
                        if self.accumulate {
                            gen.add_mem(masm, sum[i], sum[i], Operand::with_disp(c, disp))?;
                        }
                        gen.store(masm, Operand::with_disp(c, disp), sum[i])?;
                    }
                }
                masm.add_imm(c, blksize)?;
            } else {
                // Masked phase.
                assert_eq!(phase.unrolls, 1);
                if inner_single {
                    gen.broadcast(masm, elem, Operand::base(a))?;
                    if self.accumulate {
                        // Load C's active lanes into the accumulator, then
                        // add the masked outer product on top.
                        gen.masked_load(masm, sum[0], Operand::base(c))?;
                        gen.masked_mul_add(masm, sum[0], elem, Operand::with_disp(b, blkstart))?;
                    } else {
                        gen.masked_mul(masm, sum[0], elem, Operand::with_disp(b, blkstart))?;
                    }
                    gen.masked_store(masm, Operand::base(c), sum[0])?;
                } else {
                    gen.zero(masm, sum[0])?;
                    masm.zero_gp(a_ofs)?;
                    masm.lea(b_ptr, Operand::with_disp(b, blkstart))?;

                    // Loop over columns/rows of A and rows of B.
                    let mut l3 = masm.create_label();
                    masm.bind(&mut l3)?;
                    gen.broadcast(masm, elem, Operand::indexed(a, a_ofs, 0))?;
                    gen.masked_mul_add(masm, sum[0], elem, Operand::base(b_ptr))?;
                    masm.add_imm(b_ptr, args.b().stride() as i32)?;
                    masm.add_imm(a_ofs, inner_step as i32)?;
                    masm.cmp_imm(a_ofs, inner_limit as i32)?;
                    masm.jl(l3)?;

                    // Save the result in C.
                    if self.accumulate {
                        gen.masked_add(masm, sum[0], sum[0], Operand::base(c))?;
                    }
                    gen.masked_store(masm, Operand::base(c), sum[0])?;
                }
                masm.add_imm(c, (phase.masked * dsize) as i32)?;
            }
        }

        // Next row/column of A.
        if !outer_single {
            if args.c().padding() > 0 {
                masm.add_imm(c, args.c().padding() as i32)?;
            }
            masm.add_imm(a, outer_step as i32)?;
            masm.cmp(a, a_end)?;
            masm.jl(l1)?;
        }

        masm.epilogue()
    }

    /// The vertical inner loop: zero accumulators, broadcast A[k], multiply
    /// into the corresponding B row block, advance B by its row stride.
    #[allow(clippy::too_many_arguments)]
    fn emit_inner_loop(
        &self,
        masm: &mut MacroAssembler,
        gen: &dyn SimdGenerator,
        args: &MatMulArgs,
        unrolls: usize,
        sum: &[u8],
        elem: u8,
        a: Reg,
        a_ofs: Reg,
        b: Reg,
        b_ptr: Reg,
        base: InnerBase,
        inner_step: usize,
        inner_limit: usize,
    ) -> Result<(), String> {
        let vecsize = gen.vector_size();
        let dsize = args.c().dtype().size_bytes();

        for &r in sum.iter().take(unrolls) {
            gen.zero(masm, r)?;
        }
        masm.zero_gp(a_ofs)?;
        match base {
            InnerBase::Register(col_ofs) => masm.lea(b_ptr, Operand::indexed(b, col_ofs, 0))?,
            InnerBase::Immediate(blkstart) => masm.lea(b_ptr, Operand::with_disp(b, blkstart))?,
        }

        // Loop over columns/rows of A and rows of B.
        let mut l3 = masm.create_label();
        masm.bind(&mut l3)?;
        gen.broadcast(masm, elem, Operand::indexed(a, a_ofs, 0))?;
        for i in 0..unrolls {
            let disp = (i * vecsize * dsize) as i32;
            let retain = i != unrolls - 1;
            gen.mul_add(masm, sum[i], elem, Operand::with_disp(b_ptr, disp), retain)?;
        }
        masm.add_imm(b_ptr, args.b().stride() as i32)?;
        masm.add_imm(a_ofs, inner_step as i32)?;
        masm.cmp_imm(a_ofs, inner_limit as i32)?;
        masm.jl(l3)
    }

    /// Dot products between row blocks of A and row blocks of B using
    /// horizontal summation.
    fn generate_horizontal(
        &self,
        step: &mut Step,
        masm: &mut MacroAssembler,
        args: &MatMulArgs,
    ) -> Result<(), String> {
        let dtype = args.c().dtype();
        let dsize = dtype.size_bytes();
        let vecbytes = SimdAssembler::vector_bytes(masm.cpu(), dtype);

        masm.prologue()?;
        let sasm = SimdAssembler::new(masm, dtype, args.aligned(vecbytes))?;
        step.set_variant(format!("{}RC", sasm.name()));
        assert_eq!(args.a().width(), args.b().width());

        let strategy = SimdStrategy::new(&sasm, args.b().width(), MAX_UNROLLS);
        strategy.preload_masks(masm)?;

        // Allocate registers.
        let a = masm.alloc_gp();
        let b = masm.alloc_gp();
        let c = masm.alloc_gp();
        let b_ptr_reg = masm.alloc_gp();
        let b_end = masm.alloc_gp();
        let ofs = masm.alloc_gp();
        let sum = sasm.alloc_regs(masm, strategy.max_unrolls());
        let elem = sasm.alloc_regs(masm, strategy.max_unrolls());

        // Load tensor addresses.
        masm.load_tensor_address(a, &args.a().tensor().borrow())?;
        masm.load_tensor_address(b, &args.b().tensor().borrow())?;
        masm.load_tensor_address(c, &args.c().tensor().borrow())?;

        // Loop over rows of A.
        if args.b().height() > 1 {
            masm.lea(b_end, Operand::with_disp(b, args.b().size() as i32))?;
        }
        let a_end = masm.alloc_gp();
        let mut l1 = masm.create_label();
        if args.a().height() > 1 {
            masm.lea(a_end, Operand::with_disp(a, args.a().size() as i32))?;
            masm.bind(&mut l1)?;
        }

        // Loop over rows of B.
        let mut l2 = masm.create_label();
        let mut b_ptr = b_ptr_reg;
        if args.b().height() > 1 {
            if args.a().height() > 1 {
                masm.mov(b_ptr, b)?;
            } else {
                b_ptr = b;
            }
            masm.bind(&mut l2)?;
        } else {
            b_ptr = b;
        }
        for &r in &sum {
            sasm.main().zero(masm, r)?;
        }

        // Dot product between a row of A and a row of B.
        for phase in strategy.phases() {
            let gen = phase.generator;
            let vecsize = gen.vector_size();
            let blkstart = (phase.offset * dsize) as i32;
            let blksize = (phase.unrolls * vecsize * dsize) as i32;

            if phase.repeat > 1 {
                // Repeated phase.
                let mut l3 = masm.create_label();
                if blkstart == 0 {
                    masm.zero_gp(ofs)?;
                } else {
                    masm.mov_imm(ofs, blkstart as i64)?;
                }
                masm.bind(&mut l3)?;
                for i in 0..phase.unrolls {
                    let disp = (i * vecsize * dsize) as i32;
                    gen.load(masm, elem[i], Operand::indexed(a, ofs, disp))?;
                    gen.mul_add(masm, sum[i], elem[i], Operand::indexed(b_ptr, ofs, disp), false)?;
                }
                masm.add_imm(ofs, blksize)?;
                masm.cmp_imm(ofs, blkstart + phase.repeat as i32 * blksize)?;
                masm.jl(l3)?;
            } else if phase.masked == 0 {
                // Residual phase.
                if phase.offset == 0 || vecsize == sasm.main().vector_size() {
                    // Same vector size as the bulk; unroll directly into the
                    // sum registers.
                    for i in 0..phase.unrolls {
                        let disp = blkstart + (i * vecsize * dsize) as i32;
                        gen.load(masm, elem[i], Operand::with_disp(a, disp))?;
                        gen.mul_add(masm, sum[i], elem[i], Operand::with_disp(b_ptr, disp), false)?;
                    }
                } else if phase.unrolls == 1 {
                    // Single residual; merge into the first sum register.
                    gen.load(masm, elem[0], Operand::with_disp(a, blkstart))?;
                    gen.mul_mem(masm, elem[0], elem[0], Operand::with_disp(b_ptr, blkstart))?;
                    sasm.main().add(masm, sum[0], sum[0], elem[0])?;
                } else {
                    // Accumulate the unrolled residual separately and merge
                    // into the first sum register.
                    let acc = sasm.alloc_reg(masm);
                    gen.zero(masm, acc)?;
                    for i in 0..phase.unrolls {
                        let disp = blkstart + (i * vecsize * dsize) as i32;
                        gen.load(masm, elem[i], Operand::with_disp(a, disp))?;
                        gen.mul_add(masm, acc, elem[i], Operand::with_disp(b_ptr, disp), false)?;
                    }
                    sasm.main().add(masm, sum[0], sum[0], acc)?;
                }
            } else {
                // Masked phase.
                assert_eq!(phase.unrolls, 1);
                gen.masked_load(masm, elem[0], Operand::with_disp(a, blkstart))?;
                gen.masked_mul_add(masm, sum[0], elem[0], Operand::with_disp(b_ptr, blkstart))?;
            }
        }

        // Horizontal sum of the results.
        sasm.sum_registers(masm, &sum)?;
        sasm.main().sum(masm, sum[0])?;

        // Save the result in C.
        if self.accumulate {
            sasm.scalar().add_mem(masm, sum[0], sum[0], Operand::base(c))?;
        }
        sasm.scalar().store(masm, Operand::base(c), sum[0])?;
        masm.add_imm(c, dsize as i32)?;

        // Next row of B.
        if args.b().height() > 1 {
            masm.add_imm(b_ptr, args.b().stride() as i32)?;
            masm.cmp(b_ptr, b_end)?;
            masm.jl(l2)?;
        }

        // Next row of A.
        if args.a().height() > 1 {
            if args.c().padding() > 0 {
                masm.add_imm(c, args.c().padding() as i32)?;
            }
            masm.add_imm(a, args.a().stride() as i32)?;
            masm.cmp(a, a_end)?;
            masm.jl(l1)?;
        }

        masm.epilogue()
    }

    /// Dot products between columns of A and rows of B. No vectorisation is
    /// possible across the column-vs-row stride pattern, so the scalar
    /// generator does all the work.
    fn generate_colcol(
        &self,
        step: &mut Step,
        masm: &mut MacroAssembler,
        args: &MatMulArgs,
    ) -> Result<(), String> {
        let dtype = args.c().dtype();
        let dsize = dtype.size_bytes();

        masm.prologue()?;
        let sasm = SimdAssembler::new(masm, dtype, true)?;
        step.set_variant(format!("{}CC", sasm.name()));
        assert_eq!(args.a().height(), args.b().width());

        // Allocate registers.
        let a = masm.alloc_gp();
        let b = masm.alloc_gp();
        let c = masm.alloc_gp();
        let b_ptr = masm.alloc_gp();
        let a_end = masm.alloc_gp();
        let b_end = masm.alloc_gp();
        let a_ofs = masm.alloc_gp();
        let b_ofs = masm.alloc_gp();
        let elem = sasm.alloc_reg(masm);
        let sum = sasm.alloc_reg(masm);

        // Load tensor addresses.
        masm.load_tensor_address(a, &args.a().tensor().borrow())?;
        masm.load_tensor_address(b, &args.b().tensor().borrow())?;
        masm.load_tensor_address(c, &args.c().tensor().borrow())?;
        if args.a().width() > 1 {
            masm.lea(a_end, Operand::with_disp(a, (args.a().width() * dsize) as i32))?;
        }
        if args.b().height() > 1 {
            masm.lea(b_end, Operand::with_disp(b, args.b().size() as i32))?;
        }

        // Loop over columns of A.
        let mut l1 = masm.create_label();
        masm.bind(&mut l1)?;

        // Loop over rows of B.
        masm.mov(b_ptr, b)?;
        let mut l2 = masm.create_label();
        masm.bind(&mut l2)?;

        // Dot product between a column of A and a row of B.
        let gen = sasm.scalar();
        if args.b().width() == 1 {
            gen.load(masm, sum, Operand::base(a))?;
            gen.mul_mem(masm, sum, sum, Operand::base(b_ptr))?;
        } else {
            masm.zero_gp(a_ofs)?;
            masm.zero_gp(b_ofs)?;
            gen.zero(masm, sum)?;
            let mut l3 = masm.create_label();
            masm.bind(&mut l3)?;
            gen.load(masm, elem, Operand::indexed(a, a_ofs, 0))?;
            gen.mul_add(masm, sum, elem, Operand::indexed(b_ptr, b_ofs, 0), false)?;
            masm.add_imm(a_ofs, args.a().stride() as i32)?;
            masm.add_imm(b_ofs, dsize as i32)?;
            masm.cmp_imm(b_ofs, (args.b().width() * dsize) as i32)?;
            masm.jl(l3)?;
        }

        // Save the result in C.
        if self.accumulate {
            gen.add_mem(masm, sum, sum, Operand::base(c))?;
        }
        gen.store(masm, Operand::base(c), sum)?;
        masm.add_imm(c, dsize as i32)?;

        // Next row of B.
        if args.b().height() > 1 {
            masm.add_imm(b_ptr, args.b().stride() as i32)?;
            masm.cmp(b_ptr, b_end)?;
            masm.jl(l2)?;
        }

        // Next column of A.
        if args.a().width() > 1 {
            if args.c().padding() > 0 {
                masm.add_imm(c, args.c().padding() as i32)?;
            }
            masm.add_imm(a, dsize as i32)?;
            masm.cmp(a, a_end)?;
            masm.jl(l1)?;
        }

        masm.epilogue()
    }
}

/// Base addressing mode for the vertical inner loop's B pointer.
enum InnerBase {
    Register(Reg),
    Immediate(i32),
}

impl Kernel for SimdMatMul {
    fn name(&self) -> &'static str {
        if self.accumulate {
            "SIMDAccMatMul"
        } else {
            "SIMDMatMul"
        }
    }

    fn operation(&self) -> &'static str {
        if self.accumulate {
            "AssignAddMatMul"
        } else {
            "MatMul"
        }
    }

    fn supports(&self, step: &Step) -> bool {
        // Check inputs and outputs.
        if !MatMulArgs::valid(step) {
            return false;
        }
        let mut args = MatMulArgs::new(step);
        if !args.check_shapes() {
            return false;
        }
        if args.accumulate() != self.accumulate {
            return false;
        }

        // Output must be row-major.
        if !args.ensure_output_order(Order::RowMajor) {
            return false;
        }

        // Check that the element type is supported.
        let dtype = args.c().dtype();
        if !SimdAssembler::supports(dtype) {
            return false;
        }
        args.a().dtype() == dtype && args.b().dtype() == dtype
    }

    fn adjust(&self, step: &Step, cpu: &CpuFeatures) {
        // Set the required order for the output.
        let mut args = MatMulArgs::new(step);
        args.set_required_order(Order::RowMajor);

        // Set alignment.
        let vecbytes = SimdAssembler::vector_bytes(cpu, args.c().dtype());
        args.a().tensor().borrow_mut().set_minimum_alignment(vecbytes);
        args.b().tensor().borrow_mut().set_minimum_alignment(vecbytes);
        args.c().tensor().borrow_mut().set_minimum_alignment(vecbytes);
    }

    fn generate(&self, step: &mut Step, masm: &mut MacroAssembler) -> Result<(), String> {
        let mut args = MatMulArgs::new(step);
        if !args.ensure_output_order(Order::RowMajor) {
            return Err("output does not support row-major order".to_string());
        }

        // The input element orders select the algorithm.
        let a = args.a().order();
        let b = args.b().order();
        log::debug!(
            "matmul codegen: {}x{} * {}x{} a={:?} b={:?} accumulate={}",
            args.a().shape().dim(0),
            args.a().shape().dim(1),
            args.b().shape().dim(0),
            args.b().shape().dim(1),
            a,
            b,
            self.accumulate
        );
        match (a, b) {
            (Order::RowMajor, Order::RowMajor) => self.generate_vertical(step, masm, &args, false),
            (Order::RowMajor, Order::ColumnMajor) => self.generate_horizontal(step, masm, &args),
            (Order::ColumnMajor, Order::RowMajor) => self.generate_vertical(step, masm, &args, true),
            (Order::ColumnMajor, Order::ColumnMajor) => self.generate_colcol(step, masm, &args),
            _ => Err("unsupported element order".to_string()),
        }
    }

    fn complexity(&self, step: &Step) -> i64 {
        let args = MatMulArgs::new(step);
        let elements = args.c().tensor().borrow().elements();
        (elements * args.a().shape().dim(1) * 2) as i64
    }
}
