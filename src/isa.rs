//! CPU feature oracle.
//!
//! Code generation is keyed on the feature set captured here, not on compile
//! time `target_feature` flags: the same binary must emit AVX-512 code on one
//! machine and SSE code on another. Tests and benches construct forced
//! feature levels to exercise every cascade.

/// CPU features consulted during code generation.
///
/// `zero_idiom` is not a CPU feature but an emission-time switch: when set,
/// loading the constant zero is emitted as a self-XOR instead of a memory
/// load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    pub sse: bool,
    pub sse2: bool,
    pub sse41: bool,
    pub avx: bool,
    pub avx2: bool,
    pub fma3: bool,
    pub avx512f: bool,
    pub zero_idiom: bool,
}

impl CpuFeatures {
    /// Detect the features of the machine we are running on.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        CpuFeatures {
            sse: std::arch::is_x86_feature_detected!("sse"),
            sse2: std::arch::is_x86_feature_detected!("sse2"),
            sse41: std::arch::is_x86_feature_detected!("sse4.1"),
            avx: std::arch::is_x86_feature_detected!("avx"),
            avx2: std::arch::is_x86_feature_detected!("avx2"),
            fma3: std::arch::is_x86_feature_detected!("fma"),
            avx512f: std::arch::is_x86_feature_detected!("avx512f"),
            zero_idiom: true,
        }
    }

    /// On non-x86 hosts nothing is supported; emission still works (iced is
    /// host-independent) but the generated code cannot run locally.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        CpuFeatures::none()
    }

    pub fn none() -> Self {
        CpuFeatures {
            sse: false,
            sse2: false,
            sse41: false,
            avx: false,
            avx2: false,
            fma3: false,
            avx512f: false,
            zero_idiom: true,
        }
    }

    /// Baseline x86-64: SSE through SSE4.1, no VEX.
    pub fn sse_only() -> Self {
        CpuFeatures {
            sse: true,
            sse2: true,
            sse41: true,
            avx: false,
            avx2: false,
            fma3: false,
            avx512f: false,
            zero_idiom: true,
        }
    }

    /// AVX2 + FMA3 level (the common desktop baseline).
    pub fn avx() -> Self {
        CpuFeatures {
            sse: true,
            sse2: true,
            sse41: true,
            avx: true,
            avx2: true,
            fma3: true,
            avx512f: false,
            zero_idiom: true,
        }
    }

    /// AVX-512F level.
    pub fn avx512() -> Self {
        CpuFeatures {
            avx512f: true,
            ..CpuFeatures::avx()
        }
    }
}
