//! Probability distributions consumed by sampling methods
//!
//! Every distribution here is elementwise: its batch shape is the broadcast
//! shape of its parameters and `log_prob` is evaluated per element. Draws of
//! `n` samples are stacked on a new leading axis.

mod bernoulli;
mod normal;

pub use bernoulli::Bernoulli;
pub use normal::Normal;

use std::fmt::Debug;

use rand::rngs::StdRng;

use crate::{
    autograd::Variable,
    error::{StorchError, StorchResult},
};

pub trait Distribution: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Broadcast shape of the parameters
    fn batch_shape(&self) -> Vec<usize>;

    /// Named parameters, in declaration order
    fn parameters(&self) -> Vec<(&'static str, Variable)>;

    /// `n` draws of shape `[n, *batch_shape]`, with no gradient attached
    fn sample(&self, n: usize, rng: &mut StdRng) -> StorchResult<Variable>;

    /// Reparameterized draws; gradient flows to the parameters
    fn rsample(&self, _n: usize, _rng: &mut StdRng) -> StorchResult<Variable> {
        Err(StorchError::UnsupportedOperation(format!(
            "{} does not support reparameterized sampling",
            self.name()
        )))
    }

    fn has_rsample(&self) -> bool {
        false
    }

    /// Elementwise log density (or mass) of `value`
    fn log_prob(&self, value: &Variable) -> StorchResult<Variable>;
}

/// Parameters of `d`, optionally only those that require grad
pub fn get_distr_parameters(d: &dyn Distribution, filter_requires_grad: bool) -> Vec<Variable> {
    d.parameters()
        .into_iter()
        .map(|(_, p)| p)
        .filter(|p| !filter_requires_grad || p.requires_grad())
        .collect()
}

pub(crate) fn sample_shape(n: usize, batch: &[usize]) -> Vec<usize> {
    let mut dims = Vec::with_capacity(batch.len() + 1);
    dims.push(n);
    dims.extend_from_slice(batch);
    dims
}

pub(crate) fn check_sample_count(name: &str, n: usize) -> StorchResult<()> {
    if n == 0 {
        return Err(StorchError::InvalidInput(format!(
            "{} needs at least one sample, got n = 0",
            name
        )));
    }
    Ok(())
}
