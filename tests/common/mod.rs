//! Shared helpers for the JIT integration tests: aligned buffers, matrix
//! layout by tensor order, and a scalar reference matmul.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use tensorjit::{CpuFeatures, Order, Tensor};

/// A 64-byte aligned f32 buffer, so aligned-move kernels can be exercised.
pub struct AlignedBuf {
    ptr: *mut f32,
    len: usize,
    layout: std::alloc::Layout,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> AlignedBuf {
        let layout = std::alloc::Layout::from_size_align(len.max(1) * 4, 64).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut f32;
        assert!(!ptr.is_null());
        AlignedBuf { ptr, len, layout }
    }

    pub fn as_mut_ptr(&mut self) -> *mut f32 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr as *mut u8, self.layout) }
    }
}

/// Float offset of element (i, j) of a tensor within its storage.
pub fn element_index(t: &Tensor, i: usize, j: usize) -> usize {
    match t.order() {
        Order::RowMajor | Order::Any => i * (t.stride(0) / 4) + j,
        Order::ColumnMajor => j * (t.stride(1) / 4) + i,
    }
}

/// Allocate storage for a tensor and fill it with the given matrix
/// (indexed by the tensor's own shape).
pub fn store_matrix(t: &Tensor, data: &[Vec<f32>]) -> AlignedBuf {
    let mut buf = AlignedBuf::zeroed(t.byte_size() / 4);
    for (i, row) in data.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            let index = element_index(t, i, j);
            buf.as_mut_slice()[index] = v;
        }
    }
    buf
}

/// Read a tensor's storage back into a dense matrix.
pub fn read_matrix(t: &Tensor, buf: &AlignedBuf) -> Vec<Vec<f32>> {
    let rows = t.dim(0);
    let cols = t.dim(1);
    (0..rows)
        .map(|i| (0..cols).map(|j| buf.as_slice()[element_index(t, i, j)]).collect())
        .collect()
}

pub fn transpose(m: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let rows = m.len();
    let cols = m[0].len();
    (0..cols)
        .map(|j| (0..rows).map(|i| m[i][j]).collect())
        .collect()
}

/// Scalar reference: `c0 + a * b` in f64.
pub fn reference_matmul(a: &[Vec<f32>], b: &[Vec<f32>], c0: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let m = a.len();
    let k = b.len();
    let n = b[0].len();
    let mut c = vec![vec![0.0f32; n]; m];
    for i in 0..m {
        for j in 0..n {
            let mut acc = c0[i][j] as f64;
            for t in 0..k {
                acc += a[i][t] as f64 * b[t][j] as f64;
            }
            c[i][j] = acc as f32;
        }
    }
    c
}

pub fn assert_matrix_eq(actual: &[Vec<f32>], expected: &[Vec<f32>], context: &str) {
    assert_eq!(actual.len(), expected.len(), "{context}: row count");
    for (i, (ar, er)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(ar.len(), er.len(), "{context}: column count in row {i}");
        for (j, (&a, &e)) in ar.iter().zip(er.iter()).enumerate() {
            let tolerance = 1e-4f32.max(e.abs() * 1e-5);
            assert!(
                (a - e).abs() <= tolerance,
                "{context}: mismatch at ({i},{j}): got {a}, expected {e}"
            );
        }
    }
}

pub fn random_matrix(rng: &mut impl rand::Rng, rows: usize, cols: usize) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect())
        .collect()
}

/// Whether the machine we run on can execute code emitted for `cpu`.
pub fn machine_supports(cpu: &CpuFeatures) -> bool {
    let host = CpuFeatures::detect();
    (!cpu.sse || host.sse)
        && (!cpu.sse2 || host.sse2)
        && (!cpu.sse41 || host.sse41)
        && (!cpu.avx || host.avx)
        && (!cpu.avx2 || host.avx2)
        && (!cpu.fma3 || host.fma3)
        && (!cpu.avx512f || host.avx512f)
}
