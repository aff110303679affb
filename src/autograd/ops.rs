//! High-level operations that integrate with automatic differentiation

use crate::{
    error::StorchResult,
    tensor::Tensor,
};
use super::{
    function::*,
    variable::Variable,
};

impl Variable {
    /// Element-wise addition with broadcasting
    pub fn add(&self, other: &Variable) -> StorchResult<Variable> {
        let data = self.data().add(other.data())?;
        Ok(Variable::from_op(data, AddBackward {
            inputs: vec![self.clone(), other.clone()],
        }))
    }

    /// Element-wise subtraction with broadcasting
    pub fn sub(&self, other: &Variable) -> StorchResult<Variable> {
        let data = self.data().sub(other.data())?;
        Ok(Variable::from_op(data, SubBackward {
            inputs: vec![self.clone(), other.clone()],
        }))
    }

    /// Element-wise multiplication with broadcasting
    pub fn mul(&self, other: &Variable) -> StorchResult<Variable> {
        let data = self.data().mul(other.data())?;
        Ok(Variable::from_op(data, MulBackward {
            inputs: vec![self.clone(), other.clone()],
        }))
    }

    /// Element-wise division with broadcasting
    pub fn div(&self, other: &Variable) -> StorchResult<Variable> {
        let data = self.data().div(other.data())?;
        Ok(Variable::from_op(data, DivBackward {
            inputs: vec![self.clone(), other.clone()],
        }))
    }

    fn unary(&self, data: Tensor, local_grad: Tensor, name: &'static str) -> Variable {
        Variable::from_op(data, UnaryBackward {
            inputs: vec![self.clone()],
            local_grad,
            name,
        })
    }

    pub fn neg(&self) -> Variable {
        self.mul_scalar(-1.0)
    }

    pub fn mul_scalar(&self, factor: f64) -> Variable {
        let local = Tensor::full(self.shape().clone(), factor);
        self.unary(self.data().scale(factor), local, "MulScalarBackward")
    }

    pub fn add_scalar(&self, value: f64) -> Variable {
        let local = Tensor::ones_like(self.data());
        self.unary(self.data().map(|x| x + value), local, "AddScalarBackward")
    }

    /// `value - self`
    pub fn rsub_scalar(&self, value: f64) -> Variable {
        let local = Tensor::full(self.shape().clone(), -1.0);
        self.unary(self.data().map(|x| value - x), local, "RSubScalarBackward")
    }

    pub fn exp(&self) -> Variable {
        let out = self.data().map(f64::exp);
        self.unary(out.clone(), out, "ExpBackward")
    }

    pub fn log(&self) -> Variable {
        let local = self.data().map(|x| 1.0 / x);
        self.unary(self.data().map(f64::ln), local, "LogBackward")
    }

    pub fn powf(&self, exponent: f64) -> Variable {
        let local = self.data().map(|x| exponent * x.powf(exponent - 1.0));
        self.unary(self.data().map(|x| x.powf(exponent)), local, "PowBackward")
    }

    pub fn square(&self) -> Variable {
        self.powf(2.0)
    }

    /// Sum of all elements, as a scalar
    pub fn sum(&self) -> Variable {
        Variable::from_op(self.data().sum_all(), SumBackward {
            inputs: vec![self.clone()],
            axis: None,
        })
    }

    /// Sum over one axis, removing it
    pub fn sum_axis(&self, axis: usize) -> StorchResult<Variable> {
        let data = self.data().sum_axis(axis)?;
        Ok(Variable::from_op(data, SumBackward {
            inputs: vec![self.clone()],
            axis: Some(axis),
        }))
    }

    /// Sum over every axis from `start` on
    pub fn sum_trailing(&self, start: usize) -> StorchResult<Variable> {
        let mut out = self.clone();
        while out.ndim() > start {
            out = out.sum_axis(out.ndim() - 1)?;
        }
        Ok(out)
    }

    pub fn mean(&self) -> Variable {
        let n = self.numel().max(1) as f64;
        self.sum().mul_scalar(1.0 / n)
    }

    pub fn permute(&self, perm: &[usize]) -> StorchResult<Variable> {
        let data = self.data().permute(perm)?;
        Ok(Variable::from_op(data, PermuteBackward {
            inputs: vec![self.clone()],
            perm: perm.to_vec(),
        }))
    }

    pub fn transpose(&self, a: usize, b: usize) -> StorchResult<Variable> {
        let data = self.data().transpose(a, b)?;
        let mut perm: Vec<usize> = (0..self.ndim()).collect();
        perm.swap(a, b);
        Ok(Variable::from_op(data, PermuteBackward {
            inputs: vec![self.clone()],
            perm,
        }))
    }

    pub fn reshape(&self, dims: &[usize]) -> StorchResult<Variable> {
        let data = self.data().reshape(dims.to_vec())?;
        Ok(Variable::from_op(data, ReshapeBackward {
            inputs: vec![self.clone()],
        }))
    }

    pub fn unsqueeze(&self, axis: usize) -> StorchResult<Variable> {
        let data = self.data().unsqueeze(axis)?;
        Ok(Variable::from_op(data, ReshapeBackward {
            inputs: vec![self.clone()],
        }))
    }

    pub fn squeeze(&self, axis: usize) -> StorchResult<Variable> {
        let data = self.data().squeeze(axis)?;
        Ok(Variable::from_op(data, ReshapeBackward {
            inputs: vec![self.clone()],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;

    fn param(values: &[f64]) -> Variable {
        Variable::parameter(Tensor::from_slice(values))
    }

    #[test]
    fn test_mul_gradients() {
        let a = param(&[2.0, 3.0]);
        let b = param(&[5.0, 7.0]);
        a.mul(&b).unwrap().sum().backward(false).unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![5.0, 7.0]);
        assert_eq!(b.grad().unwrap().to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_broadcast_gradient_is_summed() {
        let w = param(&[1.0, 2.0]);
        let x = Variable::constant(Tensor::ones([3, 2]));
        x.mul(&w).unwrap().sum().backward(false).unwrap();
        assert_eq!(w.grad().unwrap().to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_div_log_exp_gradients() {
        let a = param(&[2.0]);
        let b = param(&[4.0]);
        a.div(&b).unwrap().sum().backward(false).unwrap();
        assert!((a.grad().unwrap().item().unwrap() - 0.25).abs() < 1e-12);
        assert!((b.grad().unwrap().item().unwrap() + 0.125).abs() < 1e-12);

        let x = param(&[3.0]);
        x.log().sum().backward(false).unwrap();
        assert!((x.grad().unwrap().item().unwrap() - 1.0 / 3.0).abs() < 1e-12);

        let y = param(&[0.5]);
        y.exp().sum().backward(false).unwrap();
        assert!((y.grad().unwrap().item().unwrap() - 0.5f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn test_sum_axis_and_permute_gradients() {
        let a = Variable::parameter(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap());
        let weights = Variable::constant(Tensor::from_vec(vec![1.0, 10.0], [2, 1]).unwrap());
        let t = a.transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        let s = t.sum_axis(0).unwrap();
        assert_eq!(s.data().to_vec(), vec![6.0, 15.0]);
        s.reshape(&[2, 1]).unwrap().mul(&weights).unwrap().sum().backward(false).unwrap();
        assert_eq!(a.grad().unwrap().to_vec(), vec![1.0, 1.0, 1.0, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn test_no_grad_records_nothing() {
        let a = param(&[1.0]);
        let b = no_grad(|| a.mul_scalar(2.0));
        assert!(!b.requires_grad());
        assert!(b.grad_fn().is_none());
    }

    #[test]
    fn test_square_and_rsub() {
        let a = param(&[3.0]);
        a.rsub_scalar(1.0).square().sum().backward(false).unwrap();
        // d/da (1 - a)^2 = -2 (1 - a) = 4
        assert!((a.grad().unwrap().item().unwrap() - 4.0).abs() < 1e-12);
    }
}
