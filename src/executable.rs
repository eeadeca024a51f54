//! Executable memory for JIT-compiled kernels.
//!
//! Emitted bytes are copied into an mmap'd region which is then flipped to
//! PROT_READ|PROT_EXEC and called through a typed function pointer. The
//! buffer owns the mapping and unmaps on drop.

/// A matmul kernel entry point. Arguments are tensor base pointers in
/// argument-slot order (inputs first, then outputs).
pub type Kernel3Fn = unsafe extern "C" fn(*mut f32, *mut f32, *mut f32);

/// An expression kernel entry point: one base pointer to the f32 slot array.
pub type ExprF32Fn = unsafe extern "C" fn(*mut f32);

/// An expression kernel entry point: one base pointer to the f64 slot array.
pub type ExprF64Fn = unsafe extern "C" fn(*mut f64);

/// An executable memory buffer backed by mmap.
struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: ExecutableBuffer owns its mapping exclusively. The pointer is never
// aliased and the region is immutable (PROT_READ|PROT_EXEC) after
// construction.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    fn new(code: &[u8]) -> Result<ExecutableBuffer, String> {
        if code.is_empty() {
            return Ok(ExecutableBuffer {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }

        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no file descriptor; the return
        // value is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err("mmap failed for executable buffer".to_string());
        }
        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err("mprotect failed for executable buffer".to_string());
        }

        Ok(ExecutableBuffer { ptr, len })
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A JIT-compiled kernel: executable code plus its size, for cache
/// accounting.
pub struct CompiledKernel {
    code: ExecutableBuffer,
    code_len: usize,
}

impl CompiledKernel {
    pub fn from_code(code: &[u8]) -> Result<CompiledKernel, String> {
        Ok(CompiledKernel {
            code: ExecutableBuffer::new(code)?,
            code_len: code.len(),
        })
    }

    pub fn code_size(&self) -> usize {
        self.code_len
    }

    /// Entry point for a three-tensor kernel.
    ///
    /// # Safety
    /// The caller must pass valid base pointers matching the layout the
    /// kernel was compiled against, in argument-slot order.
    pub unsafe fn entry3(&self) -> Kernel3Fn {
        std::mem::transmute::<*mut u8, Kernel3Fn>(self.code.ptr)
    }

    /// Entry point for an f32 expression kernel.
    ///
    /// # Safety
    /// The slot array must hold at least the number of slots the expression
    /// references.
    pub unsafe fn entry_expr_f32(&self) -> ExprF32Fn {
        std::mem::transmute::<*mut u8, ExprF32Fn>(self.code.ptr)
    }

    /// Entry point for an f64 expression kernel.
    ///
    /// # Safety
    /// The slot array must hold at least the number of slots the expression
    /// references.
    pub unsafe fn entry_expr_f64(&self) -> ExprF64Fn {
        std::mem::transmute::<*mut u8, ExprF64Fn>(self.code.ptr)
    }
}
