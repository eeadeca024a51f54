//! tensorjit: SIMD JIT code generation for tensor compute graphs.
//!
//! Given a typed tensor operation (general matrix multiplication, or a
//! small elementwise floating-point expression program), this crate emits
//! x86-64 machine code tailored to the CPU feature set detected at JIT time
//! (SSE, SSE2, SSE4.1, AVX, AVX2/FMA3, AVX-512F).
//!
//! The pieces:
//! - [`isa::CpuFeatures`]: the CPU feature oracle.
//! - [`masm::MacroAssembler`]: assembler façade over iced-x86 with the
//!   register pools.
//! - [`simd`]: width-polymorphic vector generators, the feature cascade,
//!   and the bulk/residual/masked strategy planner.
//! - [`kernel`]: the kernel library protocol and the SIMD matmul emitter.
//! - [`expr`]: scalar and vector elementwise expression generators.
//! - [`executable`]: mmap'd executable buffers for running emitted code.

pub mod executable;
pub mod expr;
pub mod isa;
pub mod kernel;
pub mod masm;
pub mod simd;
pub mod tensor;
pub mod types;

pub use executable::CompiledKernel;
pub use isa::CpuFeatures;
pub use kernel::{register_simd_matmul_library, Kernel, Library, MatMulArgs, SimdMatMul};
pub use masm::{MacroAssembler, Operand};
pub use simd::{SimdAssembler, SimdGenerator, SimdStrategy};
pub use tensor::{Step, Tensor, TensorRef};
pub use types::{DType, Order, Shape};
