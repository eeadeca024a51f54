//! Macro assembler façade over `iced_x86::code_asm::CodeAssembler`.
//!
//! Owns the instruction stream, the register pools (general-purpose, vector,
//! opmask) and the CPU feature oracle for one emission. Emitters allocate
//! registers up front, hold them across their loops so the pool cannot
//! reissue them, and release temporaries as soon as they are dead.
//!
//! Emitted kernels follow the System V AMD64 ABI: base pointers arrive in
//! rdi/rsi/rdx (argument-slot order), the prologue saves the callee-saved
//! registers the pool can hand out, and the epilogue restores them before
//! `ret`.

use iced_x86::code_asm::*;

use crate::isa::CpuFeatures;
use crate::tensor::Tensor;

/// General-purpose register handle: an index in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub(crate) u8);

#[rustfmt::skip]
const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
    r8, r9, r10, r11, r12, r13, r14, r15,
];

#[rustfmt::skip]
const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi,
    r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

#[rustfmt::skip]
pub(crate) const XMM: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
    xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
];

#[rustfmt::skip]
pub(crate) const YMM: [AsmRegisterYmm; 16] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7,
    ymm8, ymm9, ymm10, ymm11, ymm12, ymm13, ymm14, ymm15,
];

#[rustfmt::skip]
pub(crate) const ZMM: [AsmRegisterZmm; 16] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7,
    zmm8, zmm9, zmm10, zmm11, zmm12, zmm13, zmm14, zmm15,
];

pub(crate) const KREG: [AsmRegisterK; 8] = [k0, k1, k2, k3, k4, k5, k6, k7];

/// Kernel argument registers, in slot order.
const ARG_REGS: [Reg; 6] = [Reg(7), Reg(6), Reg(2), Reg(1), Reg(8), Reg(9)];

/// Pool allocation order: caller-saved registers first, callee-saved (which
/// the prologue preserves) last. rsp/rbp and the first three argument
/// registers are never handed out.
const GP_POOL: [Reg; 11] = [
    Reg(0),  // rax
    Reg(1),  // rcx
    Reg(8),  // r8
    Reg(9),  // r9
    Reg(10), // r10
    Reg(11), // r11
    Reg(3),  // rbx
    Reg(12), // r12
    Reg(13), // r13
    Reg(14), // r14
    Reg(15), // r15
];

/// Callee-saved registers the prologue must preserve.
const CALLEE_SAVED: [AsmRegister64; 5] = [rbx, r12, r13, r14, r15];

pub(crate) fn gp(r: Reg) -> AsmRegister64 {
    GP64[r.0 as usize]
}

pub(crate) fn gp32(r: Reg) -> AsmRegister32 {
    GP32[r.0 as usize]
}

pub(crate) fn xmm(r: u8) -> AsmRegisterXmm {
    XMM[r as usize]
}

pub(crate) fn ymm(r: u8) -> AsmRegisterYmm {
    YMM[r as usize]
}

pub(crate) fn zmm(r: u8) -> AsmRegisterZmm {
    ZMM[r as usize]
}

/// ZMM register with a merge-masking opmask attached.
pub(crate) fn zmm_k(r: u8, mask: u8) -> AsmRegisterZmm {
    let reg = zmm(r);
    match mask {
        1 => reg.k1(),
        2 => reg.k2(),
        3 => reg.k3(),
        4 => reg.k4(),
        5 => reg.k5(),
        6 => reg.k6(),
        7 => reg.k7(),
        _ => reg,
    }
}

/// Memory operand with an opmask attached (masked store form).
pub(crate) fn mem_k(mem: AsmMemoryOperand, mask: u8) -> AsmMemoryOperand {
    match mask {
        1 => mem.k1(),
        2 => mem.k2(),
        3 => mem.k3(),
        4 => mem.k4(),
        5 => mem.k5(),
        6 => mem.k6(),
        7 => mem.k7(),
        _ => mem,
    }
}

/// Memory operand: `[base + index + disp]`.
#[derive(Debug, Clone, Copy)]
pub struct Operand {
    base: Reg,
    index: Option<Reg>,
    disp: i32,
}

impl Operand {
    pub fn base(base: Reg) -> Operand {
        Operand { base, index: None, disp: 0 }
    }

    pub fn with_disp(base: Reg, disp: i32) -> Operand {
        Operand { base, index: None, disp }
    }

    pub fn indexed(base: Reg, index: Reg, disp: i32) -> Operand {
        Operand { base, index: Some(index), disp }
    }

    pub(crate) fn to_mem(self) -> AsmMemoryOperand {
        match self.index {
            Some(ix) => ptr(gp(self.base) + gp(ix) + self.disp),
            None => ptr(gp(self.base) + self.disp),
        }
    }
}

struct GpPool {
    used: [bool; 16],
}

impl GpPool {
    fn new() -> GpPool {
        GpPool { used: [false; 16] }
    }

    fn alloc(&mut self) -> Reg {
        for &r in GP_POOL.iter() {
            if !self.used[r.0 as usize] {
                self.used[r.0 as usize] = true;
                return r;
            }
        }
        log::error!("general-purpose register pool exhausted");
        panic!("general-purpose register pool exhausted");
    }

    fn release(&mut self, r: Reg) {
        self.used[r.0 as usize] = false;
    }
}

struct VecPool {
    used: [bool; 16],
}

impl VecPool {
    fn new() -> VecPool {
        VecPool { used: [false; 16] }
    }

    fn alloc(&mut self) -> u8 {
        for (i, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return i as u8;
            }
        }
        log::error!("vector register pool exhausted");
        panic!("vector register pool exhausted");
    }

    fn release(&mut self, r: u8) {
        self.used[r as usize] = false;
    }
}

struct MaskPool {
    used: [bool; 8],
}

impl MaskPool {
    fn new() -> MaskPool {
        // k0 encodes "unmasked" and is never handed out.
        let mut used = [false; 8];
        used[0] = true;
        MaskPool { used }
    }

    fn alloc(&mut self) -> u8 {
        for (i, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return i as u8;
            }
        }
        log::error!("opmask register pool exhausted");
        panic!("opmask register pool exhausted");
    }
}

/// The assembler façade: instruction stream, register pools and CPU oracle
/// for one emission.
pub struct MacroAssembler {
    asm: CodeAssembler,
    cpu: CpuFeatures,
    rr: GpPool,
    mm: VecPool,
    kk: MaskPool,
}

impl MacroAssembler {
    pub fn new(cpu: CpuFeatures) -> Result<MacroAssembler, String> {
        let asm = CodeAssembler::new(64).map_err(|e| e.to_string())?;
        Ok(MacroAssembler {
            asm,
            cpu,
            rr: GpPool::new(),
            mm: VecPool::new(),
            kk: MaskPool::new(),
        })
    }

    pub fn cpu(&self) -> &CpuFeatures {
        &self.cpu
    }

    /// Direct access to the instruction stream for the SIMD generators.
    pub(crate) fn code(&mut self) -> &mut CodeAssembler {
        &mut self.asm
    }

    pub fn alloc_gp(&mut self) -> Reg {
        self.rr.alloc()
    }

    pub fn release_gp(&mut self, r: Reg) {
        self.rr.release(r);
    }

    pub fn alloc_vec(&mut self) -> u8 {
        self.mm.alloc()
    }

    pub fn release_vec(&mut self, r: u8) {
        self.mm.release(r);
    }

    pub fn alloc_mask(&mut self) -> u8 {
        self.kk.alloc()
    }

    /// The register carrying the kernel argument in `slot`.
    pub fn arg_reg(slot: usize) -> Reg {
        ARG_REGS[slot]
    }

    /// Save the callee-saved registers the pool can hand out.
    pub fn prologue(&mut self) -> Result<(), String> {
        for &r in CALLEE_SAVED.iter() {
            self.asm.push(r).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Restore callee-saved registers and return.
    pub fn epilogue(&mut self) -> Result<(), String> {
        for &r in CALLEE_SAVED.iter().rev() {
            self.asm.pop(r).map_err(|e| e.to_string())?;
        }
        self.asm.ret().map_err(|e| e.to_string())
    }

    /// Load the base address of a tensor from its argument slot.
    pub fn load_tensor_address(&mut self, dst: Reg, tensor: &Tensor) -> Result<(), String> {
        let src = ARG_REGS[tensor.arg_slot()];
        self.asm.mov(gp(dst), gp(src)).map_err(|e| e.to_string())
    }

    /// Load an opmask register with `bits` trailing lanes enabled.
    pub fn load_mask(&mut self, bits: usize, mask: u8) -> Result<(), String> {
        debug_assert!(bits > 0 && bits <= 16);
        let tmp = self.rr.alloc();
        let value = (1u32 << bits) - 1;
        self.asm.mov(gp32(tmp), value).map_err(|e| e.to_string())?;
        self.asm
            .kmovw(KREG[mask as usize], gp32(tmp))
            .map_err(|e| e.to_string())?;
        self.rr.release(tmp);
        Ok(())
    }

    // ── General-purpose helpers for loop control ────────────────────────

    pub fn mov(&mut self, dst: Reg, src: Reg) -> Result<(), String> {
        self.asm.mov(gp(dst), gp(src)).map_err(|e| e.to_string())
    }

    pub fn mov_imm(&mut self, dst: Reg, imm: i64) -> Result<(), String> {
        self.asm.mov(gp(dst), imm).map_err(|e| e.to_string())
    }

    /// Zero a register via self-XOR.
    pub fn zero_gp(&mut self, r: Reg) -> Result<(), String> {
        self.asm.xor(gp(r), gp(r)).map_err(|e| e.to_string())
    }

    pub fn add(&mut self, dst: Reg, src: Reg) -> Result<(), String> {
        self.asm.add(gp(dst), gp(src)).map_err(|e| e.to_string())
    }

    pub fn add_imm(&mut self, r: Reg, imm: i32) -> Result<(), String> {
        self.asm.add(gp(r), imm).map_err(|e| e.to_string())
    }

    pub fn cmp(&mut self, a: Reg, b: Reg) -> Result<(), String> {
        self.asm.cmp(gp(a), gp(b)).map_err(|e| e.to_string())
    }

    pub fn cmp_imm(&mut self, r: Reg, imm: i32) -> Result<(), String> {
        self.asm.cmp(gp(r), imm).map_err(|e| e.to_string())
    }

    pub fn lea(&mut self, dst: Reg, src: Operand) -> Result<(), String> {
        self.asm.lea(gp(dst), src.to_mem()).map_err(|e| e.to_string())
    }

    // ── Labels and branches ─────────────────────────────────────────────

    pub fn create_label(&mut self) -> CodeLabel {
        self.asm.create_label()
    }

    pub fn bind(&mut self, label: &mut CodeLabel) -> Result<(), String> {
        self.asm.set_label(label).map_err(|e| e.to_string())
    }

    pub fn jl(&mut self, label: CodeLabel) -> Result<(), String> {
        self.asm.jl(label).map_err(|e| e.to_string())
    }

    pub fn jz(&mut self, label: CodeLabel) -> Result<(), String> {
        self.asm.jz(label).map_err(|e| e.to_string())
    }

    pub fn jnz(&mut self, label: CodeLabel) -> Result<(), String> {
        self.asm.jnz(label).map_err(|e| e.to_string())
    }

    pub fn jmp(&mut self, label: CodeLabel) -> Result<(), String> {
        self.asm.jmp(label).map_err(|e| e.to_string())
    }

    pub fn ret(&mut self) -> Result<(), String> {
        self.asm.ret().map_err(|e| e.to_string())
    }

    /// Resolve branches and return the final byte sequence.
    pub fn finalize(mut self) -> Result<Vec<u8>, String> {
        self.asm.assemble(0).map_err(|e| e.to_string())
    }
}
