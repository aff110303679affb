use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::Rng;

use crate::{
    autograd::{no_grad, Variable},
    error::{StorchError, StorchResult},
    tensor::{broadcast_shape, Tensor},
};
use super::{check_sample_count, sample_shape, Distribution};

/// Gaussian with elementwise `loc` and `scale`
#[derive(Debug, Clone)]
pub struct Normal {
    loc: Variable,
    scale: Variable,
    batch_shape: Vec<usize>,
}

impl Normal {
    pub fn new(loc: Variable, scale: Variable) -> StorchResult<Self> {
        if scale.data().as_slice().iter().any(|&s| s <= 0.0) {
            return Err(StorchError::InvalidInput(
                "Normal scale must be strictly positive".to_string(),
            ));
        }
        let batch_shape = broadcast_shape(loc.dims(), scale.dims())?;
        Ok(Self {
            loc,
            scale,
            batch_shape,
        })
    }

    pub fn loc(&self) -> &Variable {
        &self.loc
    }

    pub fn scale(&self) -> &Variable {
        &self.scale
    }

    /// Standard normal noise via Box-Muller
    fn standard_noise(&self, n: usize, rng: &mut StdRng) -> StorchResult<Tensor> {
        let dims = sample_shape(n, &self.batch_shape);
        let total: usize = dims.iter().product();
        let data = (0..total)
            .map(|_| {
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen::<f64>();
                (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
            })
            .collect();
        Tensor::from_vec(data, dims)
    }
}

impl Distribution for Normal {
    fn name(&self) -> &'static str {
        "Normal"
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.batch_shape.clone()
    }

    fn parameters(&self) -> Vec<(&'static str, Variable)> {
        vec![("loc", self.loc.clone()), ("scale", self.scale.clone())]
    }

    fn sample(&self, n: usize, rng: &mut StdRng) -> StorchResult<Variable> {
        no_grad(|| self.rsample(n, rng))
    }

    fn rsample(&self, n: usize, rng: &mut StdRng) -> StorchResult<Variable> {
        check_sample_count(self.name(), n)?;
        let eps = Variable::constant(self.standard_noise(n, rng)?);
        self.loc.add(&self.scale.mul(&eps)?)
    }

    fn has_rsample(&self) -> bool {
        true
    }

    fn log_prob(&self, value: &Variable) -> StorchResult<Variable> {
        // -(x - mu)^2 / (2 sigma^2) - ln sigma - ln sqrt(2 pi)
        let z = value.sub(&self.loc)?.div(&self.scale)?;
        let quad = z.square().mul_scalar(-0.5);
        let norm = self.scale.log().add_scalar(0.5 * (2.0 * PI).ln());
        quad.sub(&norm)
    }
}
