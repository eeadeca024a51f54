//! Element types, storage orders and shapes shared across the code
//! generators.

/// Element type of a tensor or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// Storage order of a rank-2 tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    RowMajor,
    ColumnMajor,
    /// No preference; resolved by the kernel during the adjust phase.
    Any,
}

/// Tensor shape. Matmul only uses rank 2, but the shape itself is generic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Shape(vec![rows, cols])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.0[axis]
    }

    pub fn elements(&self) -> usize {
        self.0.iter().product()
    }

    /// Shape with the two dimensions of a matrix swapped.
    pub fn transposed(&self) -> Shape {
        debug_assert_eq!(self.rank(), 2);
        Shape(vec![self.0[1], self.0[0]])
    }
}
