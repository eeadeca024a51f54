//! Tensor metadata and compute-graph steps.
//!
//! The code generators never touch tensor data; they consume metadata
//! (shape, order, strides) through read-only accessors and publish layout
//! requirements (`required_order`, `min_alignment`) during the adjust phase.
//! At runtime the emitted kernel receives one base pointer per tensor,
//! in argument-slot order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::types::{DType, Order, Shape};

/// Shared, interior-mutable tensor handle. The graph owns its tensors; steps
/// and kernels hold non-owning references.
pub type TensorRef = Rc<RefCell<Tensor>>;

/// Rank-2 tensor metadata with byte strides including row padding.
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    dtype: DType,
    shape: Shape,
    order: Order,
    /// Bytes per step along each axis, including padding.
    stride: Vec<usize>,
    required_order: Option<Order>,
    min_alignment: usize,
    /// Position in the emitted function's argument list.
    arg_slot: usize,
}

impl Tensor {
    /// Dense rank-2 tensor with no padding.
    pub fn matrix(name: &str, dtype: DType, rows: usize, cols: usize, order: Order) -> Tensor {
        let d = dtype.size_bytes();
        let stride = match order {
            Order::RowMajor | Order::Any => vec![cols * d, d],
            Order::ColumnMajor => vec![d, rows * d],
        };
        Tensor {
            name: name.to_string(),
            dtype,
            shape: Shape::matrix(rows, cols),
            order,
            stride,
            required_order: None,
            min_alignment: d,
            arg_slot: 0,
        }
    }

    /// Add `pad` bytes of padding at the end of each row (row-major) or
    /// column (column-major).
    pub fn with_padding(mut self, pad: usize) -> Tensor {
        match self.order {
            Order::RowMajor | Order::Any => self.stride[0] += pad,
            Order::ColumnMajor => self.stride[1] += pad,
        }
        self
    }

    pub fn shared(self) -> TensorRef {
        Rc::new(RefCell::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape.dim(axis)
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elements(&self) -> usize {
        self.shape.elements()
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// Bytes per step along `axis`, including padding.
    pub fn stride(&self, axis: usize) -> usize {
        self.stride[axis]
    }

    /// Padding bytes at the end of each row/column along `axis`.
    pub fn padding(&self, axis: usize) -> usize {
        let inner = match axis {
            0 => self.dim(1) * self.dtype.size_bytes(),
            _ => self.dim(0) * self.dtype.size_bytes(),
        };
        self.stride[axis] - inner
    }

    /// Total byte size including padding.
    pub fn byte_size(&self) -> usize {
        match self.order {
            Order::RowMajor | Order::Any => self.stride[0] * self.dim(0),
            Order::ColumnMajor => self.stride[1] * self.dim(1),
        }
    }

    /// Whether the tensor can be stored in the given order.
    pub fn supports_order(&self, order: Order) -> bool {
        matches!(self.order, Order::Any) || self.order == order
    }

    pub fn required_order(&self) -> Option<Order> {
        self.required_order
    }

    pub fn set_required_order(&mut self, order: Order) {
        self.required_order = Some(order);
    }

    pub fn min_alignment(&self) -> usize {
        self.min_alignment
    }

    /// Raise the minimum alignment requirement; never lowers it.
    pub fn set_minimum_alignment(&mut self, align: usize) {
        if align > self.min_alignment {
            self.min_alignment = align;
        }
    }

    pub fn arg_slot(&self) -> usize {
        self.arg_slot
    }
}

/// A compute-graph step presented to a kernel: an operation name, input and
/// output tensors, and boolean attributes.
pub struct Step {
    op: String,
    inputs: Vec<TensorRef>,
    outputs: Vec<TensorRef>,
    attrs: HashMap<String, bool>,
    variant: String,
}

impl Step {
    /// Build a step. Argument slots are assigned in order: inputs first,
    /// then outputs, matching the emitted function's parameter list.
    pub fn new(op: &str, inputs: Vec<TensorRef>, outputs: Vec<TensorRef>) -> Step {
        let mut slot = 0;
        for t in inputs.iter().chain(outputs.iter()) {
            t.borrow_mut().arg_slot = slot;
            slot += 1;
        }
        Step {
            op: op.to_string(),
            inputs,
            outputs,
            attrs: HashMap::new(),
            variant: String::new(),
        }
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn indegree(&self) -> usize {
        self.inputs.len()
    }

    pub fn outdegree(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, i: usize) -> TensorRef {
        Rc::clone(&self.inputs[i])
    }

    pub fn output(&self, i: usize) -> TensorRef {
        Rc::clone(&self.outputs[i])
    }

    pub fn set_attr(&mut self, name: &str, value: bool) {
        self.attrs.insert(name.to_string(), value);
    }

    pub fn attr(&self, name: &str, default: bool) -> bool {
        *self.attrs.get(name).unwrap_or(&default)
    }

    /// Variant label published by the kernel for observability.
    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn set_variant(&mut self, variant: String) {
        self.variant = variant;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_strides() {
        let t = Tensor::matrix("a", DType::F32, 3, 5, Order::RowMajor);
        assert_eq!(t.stride(0), 20);
        assert_eq!(t.stride(1), 4);
        assert_eq!(t.padding(0), 0);
        assert_eq!(t.byte_size(), 60);
    }

    #[test]
    fn padded_strides() {
        let t = Tensor::matrix("a", DType::F32, 3, 5, Order::RowMajor).with_padding(12);
        assert_eq!(t.stride(0), 32);
        assert_eq!(t.padding(0), 12);
        assert_eq!(t.byte_size(), 96);
    }

    #[test]
    fn column_major_strides() {
        let t = Tensor::matrix("a", DType::F32, 4, 2, Order::ColumnMajor);
        assert_eq!(t.stride(0), 4);
        assert_eq!(t.stride(1), 16);
        assert_eq!(t.byte_size(), 32);
    }

    #[test]
    fn step_assigns_arg_slots() {
        let a = Tensor::matrix("a", DType::F32, 2, 2, Order::RowMajor).shared();
        let b = Tensor::matrix("b", DType::F32, 2, 2, Order::RowMajor).shared();
        let c = Tensor::matrix("c", DType::F32, 2, 2, Order::RowMajor).shared();
        let step = Step::new("MatMul", vec![a.clone(), b.clone()], vec![c.clone()]);
        assert_eq!(a.borrow().arg_slot(), 0);
        assert_eq!(b.borrow().arg_slot(), 1);
        assert_eq!(c.borrow().arg_slot(), 2);
        assert!(!step.attr("transpose_a", false));
    }
}
