//! Function trait and backward rules for automatic differentiation

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::StorchResult,
    tensor::Tensor,
};
use super::variable::Variable;

/// Trait for functions that can be differentiated
///
/// A function remembers the variables it was applied to; those are its
/// predecessors in the recorded computation and are what graph walks follow.
pub trait Function: Debug + Send + Sync {
    /// Compute one gradient per input given the gradient of the output.
    /// `None` means the input does not need one.
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>>;

    /// Inputs of the forward computation, in argument order
    fn inputs(&self) -> &[Variable];

    /// Get function name for debugging
    fn name(&self) -> &'static str;
}

/// A recorded function plus its release flag.
#[derive(Debug)]
pub struct GradFn {
    function: Box<dyn Function>,
    released: AtomicBool,
}

impl GradFn {
    pub fn new(function: Box<dyn Function>) -> Self {
        Self {
            function,
            released: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.function.name()
    }

    /// Predecessor iterator over the recorded computation
    pub fn next_variables(&self) -> &[Variable] {
        self.function.inputs()
    }

    pub fn apply(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        self.function.backward(grad_output)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

fn needs_grad(inputs: &[Variable], index: usize) -> bool {
    inputs.get(index).map(|v| v.requires_grad()).unwrap_or(false)
}

/// Addition function for automatic differentiation
#[derive(Debug)]
pub struct AddBackward {
    pub(crate) inputs: Vec<Variable>,
}

impl Function for AddBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        // d/dx (x + y) = 1, d/dy (x + y) = 1
        let mut grads = Vec::with_capacity(2);
        for (i, input) in self.inputs.iter().enumerate() {
            grads.push(if needs_grad(&self.inputs, i) {
                Some(grad_output.sum_to_shape(input.dims())?)
            } else {
                None
            });
        }
        Ok(grads)
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

#[derive(Debug)]
pub struct SubBackward {
    pub(crate) inputs: Vec<Variable>,
}

impl Function for SubBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        let lhs = if needs_grad(&self.inputs, 0) {
            Some(grad_output.sum_to_shape(self.inputs[0].dims())?)
        } else {
            None
        };
        let rhs = if needs_grad(&self.inputs, 1) {
            Some(grad_output.scale(-1.0).sum_to_shape(self.inputs[1].dims())?)
        } else {
            None
        };
        Ok(vec![lhs, rhs])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "SubBackward"
    }
}

/// Multiplication function for automatic differentiation
#[derive(Debug)]
pub struct MulBackward {
    pub(crate) inputs: Vec<Variable>,
}

impl Function for MulBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        // d/dx (x * y) = y, d/dy (x * y) = x
        let (a, b) = (&self.inputs[0], &self.inputs[1]);
        let lhs = if needs_grad(&self.inputs, 0) {
            Some(grad_output.mul(b.data())?.sum_to_shape(a.dims())?)
        } else {
            None
        };
        let rhs = if needs_grad(&self.inputs, 1) {
            Some(grad_output.mul(a.data())?.sum_to_shape(b.dims())?)
        } else {
            None
        };
        Ok(vec![lhs, rhs])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

#[derive(Debug)]
pub struct DivBackward {
    pub(crate) inputs: Vec<Variable>,
}

impl Function for DivBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        // d/dx (x / y) = 1 / y, d/dy (x / y) = -x / y^2
        let (a, b) = (&self.inputs[0], &self.inputs[1]);
        let lhs = if needs_grad(&self.inputs, 0) {
            Some(grad_output.div(b.data())?.sum_to_shape(a.dims())?)
        } else {
            None
        };
        let rhs = if needs_grad(&self.inputs, 1) {
            let local = a.data().zip_with(b.data(), |x, y| -x / (y * y))?;
            Some(grad_output.mul(&local)?.sum_to_shape(b.dims())?)
        } else {
            None
        };
        Ok(vec![lhs, rhs])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "DivBackward"
    }
}

/// Elementwise unary function with a precomputed local derivative
#[derive(Debug)]
pub struct UnaryBackward {
    pub(crate) inputs: Vec<Variable>,
    pub(crate) local_grad: Tensor,
    pub(crate) name: &'static str,
}

impl Function for UnaryBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        if !needs_grad(&self.inputs, 0) {
            return Ok(vec![None]);
        }
        Ok(vec![Some(grad_output.mul(&self.local_grad)?)])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Full or single-axis sum
#[derive(Debug)]
pub struct SumBackward {
    pub(crate) inputs: Vec<Variable>,
    pub(crate) axis: Option<usize>,
}

impl Function for SumBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        if !needs_grad(&self.inputs, 0) {
            return Ok(vec![None]);
        }
        let input_dims = self.inputs[0].dims();
        let grad = match self.axis {
            Some(axis) => grad_output.unsqueeze(axis)?.broadcast_to(input_dims)?,
            None => grad_output.broadcast_to(input_dims)?,
        };
        Ok(vec![Some(grad)])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

#[derive(Debug)]
pub struct PermuteBackward {
    pub(crate) inputs: Vec<Variable>,
    pub(crate) perm: Vec<usize>,
}

impl Function for PermuteBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        if !needs_grad(&self.inputs, 0) {
            return Ok(vec![None]);
        }
        let mut inverse = vec![0; self.perm.len()];
        for (i, &p) in self.perm.iter().enumerate() {
            inverse[p] = i;
        }
        Ok(vec![Some(grad_output.permute(&inverse)?)])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "PermuteBackward"
    }
}

#[derive(Debug)]
pub struct ReshapeBackward {
    pub(crate) inputs: Vec<Variable>,
}

impl Function for ReshapeBackward {
    fn backward(&self, grad_output: &Tensor) -> StorchResult<Vec<Option<Tensor>>> {
        if !needs_grad(&self.inputs, 0) {
            return Ok(vec![None]);
        }
        Ok(vec![Some(grad_output.reshape(self.inputs[0].dims().to_vec())?)])
    }

    fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    fn name(&self) -> &'static str {
        "ReshapeBackward"
    }
}
