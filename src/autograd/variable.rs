//! Variable wrapper for tensors in the computation graph

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    error::StorchResult,
    tensor::{Shape, Tensor},
};
use super::function::{Function, GradFn};
use super::{graph, is_grad_enabled};

pub type VariableId = u64;

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(0);

struct VariableInner {
    id: VariableId,
    data: Tensor,
    requires_grad: bool,
    grad: Mutex<Option<Tensor>>,
    grad_fn: Option<Arc<GradFn>>,
}

/// Variable represents a tensor that can participate in automatic differentiation.
///
/// Clones are handles to the same variable: they share the gradient buffer and
/// compare equal under [`Variable::same_as`].
#[derive(Clone)]
pub struct Variable(Arc<VariableInner>);

impl Variable {
    fn build(data: Tensor, requires_grad: bool, grad_fn: Option<Arc<GradFn>>) -> Self {
        Self(Arc::new(VariableInner {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            data,
            requires_grad,
            grad: Mutex::new(None),
            grad_fn,
        }))
    }

    /// Create a leaf variable
    pub fn from_tensor(tensor: Tensor, requires_grad: bool) -> Self {
        Self::build(tensor, requires_grad, None)
    }

    /// Leaf that accumulates gradients
    pub fn parameter(tensor: Tensor) -> Self {
        Self::from_tensor(tensor, true)
    }

    /// Leaf that never receives gradients
    pub fn constant(tensor: Tensor) -> Self {
        Self::from_tensor(tensor, false)
    }

    pub fn scalar(value: f64) -> Self {
        Self::constant(Tensor::scalar(value))
    }

    /// Result of a differentiable op. The function is only recorded when grad
    /// mode is on and one of its inputs requires grad.
    pub(crate) fn from_op(data: Tensor, function: impl Function + 'static) -> Self {
        if is_grad_enabled() && function.inputs().iter().any(|v| v.requires_grad()) {
            Self::build(data, true, Some(Arc::new(GradFn::new(Box::new(function)))))
        } else {
            Self::constant(data)
        }
    }

    pub fn id(&self) -> VariableId {
        self.0.id
    }

    /// Identity comparison
    pub fn same_as(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn data(&self) -> &Tensor {
        &self.0.data
    }

    pub fn shape(&self) -> &Shape {
        self.0.data.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.0.data.dims()
    }

    pub fn ndim(&self) -> usize {
        self.0.data.ndim()
    }

    pub fn numel(&self) -> usize {
        self.0.data.numel()
    }

    pub fn item(&self) -> StorchResult<f64> {
        self.0.data.item()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.0.grad_fn.is_none()
    }

    pub fn grad_fn(&self) -> Option<&Arc<GradFn>> {
        self.0.grad_fn.as_ref()
    }

    /// Accumulated gradient, if a backward pass reached this leaf
    pub fn grad(&self) -> Option<Tensor> {
        self.0.grad.lock().clone()
    }

    pub fn zero_grad(&self) {
        *self.0.grad.lock() = None;
    }

    pub(crate) fn accumulate_grad(&self, incoming: Tensor) -> StorchResult<()> {
        let mut grad = self.0.grad.lock();
        let next = match grad.take() {
            Some(existing) => existing.add(&incoming)?,
            None => incoming,
        };
        *grad = Some(next);
        Ok(())
    }

    /// Detach variable from computation graph
    pub fn detach(&self) -> Self {
        Self::constant(self.0.data.clone())
    }

    /// Run backpropagation from this one-element variable
    pub fn backward(&self, retain_graph: bool) -> StorchResult<()> {
        graph::backward(self, retain_graph)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.0.id)
            .field("shape", self.shape())
            .field("requires_grad", &self.0.requires_grad)
            .field("grad_fn", &self.0.grad_fn.as_ref().map(|g| g.name()))
            .finish()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.data)?;
        if let Some(grad_fn) = &self.0.grad_fn {
            write!(f, " (grad_fn={})", grad_fn.name())?;
        } else if self.0.requires_grad {
            write!(f, " (requires_grad)")?;
        }
        Ok(())
    }
}

impl From<Tensor> for Variable {
    fn from(tensor: Tensor) -> Self {
        Variable::constant(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_creation() {
        let var = Variable::parameter(Tensor::zeros([2, 3]));
        assert!(var.requires_grad());
        assert!(var.is_leaf());
        assert_eq!(var.dims(), &[2, 3]);
        assert!(var.grad().is_none());
    }

    #[test]
    fn test_clones_share_identity() {
        let a = Variable::scalar(1.0);
        let b = a.clone();
        let c = Variable::scalar(1.0);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_detach_drops_history() {
        let a = Variable::parameter(Tensor::from_slice(&[1.0, 2.0]));
        let b = a.mul_scalar(3.0);
        assert!(b.requires_grad());
        let d = b.detach();
        assert!(!d.requires_grad());
        assert!(d.is_leaf());
        assert_eq!(d.data().to_vec(), vec![3.0, 6.0]);
    }
}
