//! Numeric kernels: broadcasting elementwise ops, axis reductions and layout changes

use crate::error::{StorchError, StorchResult};
use super::core::{Shape, Tensor};

/// NumPy-style broadcast of two shapes (trailing axes aligned)
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> StorchResult<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i + a.len() >= ndim { a[i + a.len() - ndim] } else { 1 };
        let db = if i + b.len() >= ndim { b[i + b.len() - ndim] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(StorchError::shape_error(
                    &format!("shapes broadcastable with {:?}", a),
                    &format!("{:?}", b),
                    None,
                ))
            }
        };
    }
    Ok(out)
}

/// Strides of `dims` when viewed as broadcast into an `ndim`-rank output
fn broadcast_strides(dims: &[usize], ndim: usize) -> Vec<usize> {
    let own = Shape::new(dims.to_vec()).strides();
    let offset = ndim - dims.len();
    (0..ndim)
        .map(|i| {
            if i < offset || dims[i - offset] == 1 {
                0
            } else {
                own[i - offset]
            }
        })
        .collect()
}

impl Tensor {
    /// Elementwise binary op with broadcasting
    pub fn zip_with<F>(&self, other: &Tensor, f: F) -> StorchResult<Tensor>
    where
        F: Fn(f64, f64) -> f64,
    {
        if self.dims() == other.dims() {
            let data = self
                .as_slice()
                .iter()
                .zip(other.as_slice())
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Tensor::from_vec(data, self.shape().clone());
        }

        let out_dims = broadcast_shape(self.dims(), other.dims())?;
        let ndim = out_dims.len();
        let sa = broadcast_strides(self.dims(), ndim);
        let sb = broadcast_strides(other.dims(), ndim);
        let total: usize = out_dims.iter().product();

        let (a, b) = (self.as_slice(), other.as_slice());
        let mut index = vec![0usize; ndim];
        let mut data = Vec::with_capacity(total);
        for _ in 0..total {
            let ia: usize = index.iter().zip(&sa).map(|(i, s)| i * s).sum();
            let ib: usize = index.iter().zip(&sb).map(|(i, s)| i * s).sum();
            data.push(f(a[ia], b[ib]));
            // odometer increment
            for axis in (0..ndim).rev() {
                index[axis] += 1;
                if index[axis] < out_dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Tensor::from_vec(data, out_dims)
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f64) -> f64,
    {
        let data: Vec<f64> = self.as_slice().iter().map(|&x| f(x)).collect();
        Tensor::from_parts(data, self.shape().clone())
    }

    pub fn add(&self, other: &Tensor) -> StorchResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> StorchResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> StorchResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> StorchResult<Tensor> {
        self.zip_with(other, |a, b| a / b)
    }

    pub fn scale(&self, factor: f64) -> Tensor {
        self.map(|x| x * factor)
    }

    pub fn sum_all(&self) -> Tensor {
        Tensor::scalar(self.as_slice().iter().sum())
    }

    pub fn mean_all(&self) -> Tensor {
        let n = self.numel().max(1) as f64;
        Tensor::scalar(self.as_slice().iter().sum::<f64>() / n)
    }

    /// Sum over one axis, removing it
    pub fn sum_axis(&self, axis: usize) -> StorchResult<Tensor> {
        let dims = self.dims();
        if axis >= dims.len() {
            return Err(StorchError::InvalidInput(format!(
                "axis {} out of range for shape {}",
                axis,
                self.shape()
            )));
        }
        let outer: usize = dims[..axis].iter().product();
        let size = dims[axis];
        let inner: usize = dims[axis + 1..].iter().product();

        let src = self.as_slice();
        let mut data = vec![0.0; outer * inner];
        for o in 0..outer {
            for k in 0..size {
                let base = (o * size + k) * inner;
                for i in 0..inner {
                    data[o * inner + i] += src[base + i];
                }
            }
        }
        let mut out_dims = dims.to_vec();
        out_dims.remove(axis);
        Tensor::from_vec(data, out_dims)
    }

    /// Reorder axes: output axis `i` is input axis `perm[i]`
    pub fn permute(&self, perm: &[usize]) -> StorchResult<Tensor> {
        let ndim = self.ndim();
        let mut seen = vec![false; ndim];
        if perm.len() != ndim || perm.iter().any(|&p| p >= ndim || std::mem::replace(&mut seen[p], true)) {
            return Err(StorchError::InvalidInput(format!(
                "{:?} is not a permutation of {} axes",
                perm, ndim
            )));
        }
        if perm.iter().enumerate().all(|(i, &p)| i == p) {
            return Ok(self.clone());
        }

        let in_strides = self.shape().strides();
        let out_dims: Vec<usize> = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();
        let src = self.as_slice();

        let mut index = vec![0usize; ndim];
        let mut data = Vec::with_capacity(self.numel());
        for _ in 0..self.numel() {
            let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
            data.push(src[offset]);
            for axis in (0..ndim).rev() {
                index[axis] += 1;
                if index[axis] < out_dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Tensor::from_vec(data, out_dims)
    }

    pub fn transpose(&self, a: usize, b: usize) -> StorchResult<Tensor> {
        let mut perm: Vec<usize> = (0..self.ndim()).collect();
        if a >= perm.len() || b >= perm.len() {
            return Err(StorchError::InvalidInput(format!(
                "cannot transpose axes {} and {} of shape {}",
                a,
                b,
                self.shape()
            )));
        }
        perm.swap(a, b);
        self.permute(&perm)
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> StorchResult<Tensor> {
        Tensor::from_vec(self.to_vec(), shape)
    }

    pub fn unsqueeze(&self, axis: usize) -> StorchResult<Tensor> {
        if axis > self.ndim() {
            return Err(StorchError::InvalidInput(format!(
                "cannot insert axis {} into shape {}",
                axis,
                self.shape()
            )));
        }
        let mut dims = self.dims().to_vec();
        dims.insert(axis, 1);
        self.reshape(dims)
    }

    pub fn squeeze(&self, axis: usize) -> StorchResult<Tensor> {
        if self.dims().get(axis) != Some(&1) {
            return Err(StorchError::shape_error(
                &format!("size 1 at axis {}", axis),
                &self.shape().to_string(),
                None,
            ));
        }
        let mut dims = self.dims().to_vec();
        dims.remove(axis);
        self.reshape(dims)
    }

    pub fn broadcast_to(&self, dims: &[usize]) -> StorchResult<Tensor> {
        let target = broadcast_shape(self.dims(), dims)?;
        if target != dims {
            return Err(StorchError::shape_error(
                &format!("{:?}", dims),
                &self.shape().to_string(),
                Some("the source must broadcast to the target"),
            ));
        }
        self.zip_with(&Tensor::zeros(dims.to_vec()), |a, _| a)
    }

    /// Inverse of broadcasting: sum a gradient back down to `dims`
    pub fn sum_to_shape(&self, dims: &[usize]) -> StorchResult<Tensor> {
        if self.dims() == dims {
            return Ok(self.clone());
        }
        if dims.len() > self.ndim() {
            return Err(StorchError::shape_error(
                &format!("rank at most {}", self.ndim()),
                &format!("{:?}", dims),
                None,
            ));
        }
        let mut out = self.clone();
        while out.ndim() > dims.len() {
            out = out.sum_axis(0)?;
        }
        for (axis, &d) in dims.iter().enumerate() {
            if d == 1 && out.dims()[axis] != 1 {
                out = out.sum_axis(axis)?.unsqueeze(axis)?;
            } else if d != out.dims()[axis] {
                return Err(StorchError::shape_error(
                    &format!("{:?}", dims),
                    &out.shape().to_string(),
                    None,
                ));
            }
        }
        Ok(out)
    }

    pub fn max_value(&self) -> f64 {
        self.as_slice().iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min_value(&self) -> f64 {
        self.as_slice().iter().cloned().fold(f64::INFINITY, f64::min)
    }

    /// Sample standard deviation (n - 1 denominator)
    pub fn std_value(&self) -> f64 {
        let n = self.numel();
        if n < 2 {
            return f64::NAN;
        }
        let mean = self.as_slice().iter().sum::<f64>() / n as f64;
        let var = self.as_slice().iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        var.sqrt()
    }
}
