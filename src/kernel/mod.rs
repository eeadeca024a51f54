//! Kernel library protocol: how code-generating kernels are surfaced to the
//! surrounding compute graph.

mod matmul;

pub use matmul::{MatMulArgs, SimdMatMul};

use crate::isa::CpuFeatures;
use crate::masm::MacroAssembler;
use crate::tensor::Step;

/// A code-generating kernel. The graph gates each step through `supports`,
/// lets the kernel publish layout requirements in `adjust`, and finally asks
/// it to emit code.
pub trait Kernel {
    /// Kernel name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Operation this kernel implements.
    fn operation(&self) -> &'static str;

    /// Whether the kernel can handle the step. This is the only recoverable
    /// boundary: a false return sends the caller to a different kernel.
    fn supports(&self, step: &Step) -> bool;

    /// Publish required storage order and alignment on the step's tensors.
    fn adjust(&self, step: &Step, cpu: &CpuFeatures);

    /// Emit code for the step.
    fn generate(&self, step: &mut Step, masm: &mut MacroAssembler) -> Result<(), String>;

    /// FLOP estimate for the scheduler.
    fn complexity(&self, step: &Step) -> i64;
}

/// An ordered kernel registry. Selection returns the first registered kernel
/// whose operation matches and whose `supports` gate passes.
#[derive(Default)]
pub struct Library {
    kernels: Vec<Box<dyn Kernel>>,
}

impl Library {
    pub fn new() -> Library {
        Library { kernels: Vec::new() }
    }

    pub fn register(&mut self, kernel: Box<dyn Kernel>) {
        self.kernels.push(kernel);
    }

    pub fn select(&self, step: &Step) -> Option<&dyn Kernel> {
        self.kernels
            .iter()
            .map(|k| k.as_ref())
            .find(|k| k.operation() == step.op() && k.supports(step))
    }
}

/// Register the accumulating and non-accumulating SIMD matmul kernels.
pub fn register_simd_matmul_library(library: &mut Library) {
    library.register(Box::new(SimdMatMul::new(true)));
    library.register(Box::new(SimdMatMul::new(false)));
}
