//! Core tensor types and fundamental operations

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StorchError, StorchResult};

/// Runtime shape. Plate axes come and go during inference, so the rank is dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    /// Row-major strides
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Dense row-major `f64` tensor. Cloning shares the buffer.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: Arc<[f64]>,
    shape: Shape,
}

impl Tensor {
    /// Create from a flat buffer, checking it matches the shape
    pub fn from_vec(data: Vec<f64>, shape: impl Into<Shape>) -> StorchResult<Self> {
        let shape = shape.into();
        if data.len() != shape.total_elements() {
            return Err(StorchError::shape_error(
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self {
            data: data.into(),
            shape,
        })
    }

    /// Caller guarantees `data.len() == shape.total_elements()`
    pub(crate) fn from_parts(data: Vec<f64>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.total_elements());
        Self {
            data: data.into(),
            shape,
        }
    }

    /// One-dimensional tensor from a slice
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            data: values.into(),
            shape: Shape::new(vec![values.len()]),
        }
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            data: vec![value].into(),
            shape: Shape::scalar(),
        }
    }

    pub fn full(shape: impl Into<Shape>, value: f64) -> Self {
        let shape = shape.into();
        Self {
            data: vec![value; shape.total_elements()].into(),
            shape,
        }
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(other.shape.clone())
    }

    pub fn ones_like(other: &Tensor) -> Self {
        Self::ones(other.shape.clone())
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape.dims
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.to_vec()
    }

    /// Value of a one-element tensor
    pub fn item(&self) -> StorchResult<f64> {
        if self.numel() != 1 {
            return Err(StorchError::shape_error(
                "a one-element tensor",
                &self.shape.to_string(),
                None,
            ));
        }
        Ok(self.data[0])
    }

    /// Element at a full multi-index
    pub fn get(&self, index: &[usize]) -> StorchResult<f64> {
        if index.len() != self.ndim() || index.iter().zip(self.dims()).any(|(&i, &d)| i >= d) {
            return Err(StorchError::InvalidInput(format!(
                "index {:?} out of bounds for shape {}",
                index, self.shape
            )));
        }
        let offset: usize = index
            .iter()
            .zip(self.shape.strides())
            .map(|(i, s)| i * s)
            .sum();
        Ok(self.data[offset])
    }

    pub fn allclose(&self, other: &Tensor, tol: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &&self.data[..])
            .finish()
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ndim() == 0 {
            return write!(f, "{}", self.data[0]);
        }
        write!(f, "tensor(shape={}, {:?})", self.shape, &self.data[..])
    }
}
