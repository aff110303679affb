use rand::rngs::StdRng;

use crate::{
    autograd::Variable,
    distributions::Distribution,
    error::StorchResult,
    node::{AlignedStochastic, StorchTensor},
    plate::Plate,
    tensor::Tensor,
};
use super::SamplingMethod;

/// Pathwise estimator: gradient flows through `rsample` into the cost itself,
/// so no surrogate term is added.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reparameterization;

impl SamplingMethod for Reparameterization {
    fn name(&self) -> &'static str {
        "Reparameterization"
    }

    fn sample(
        &self,
        distribution: &dyn Distribution,
        n: usize,
        rng: &mut StdRng,
    ) -> StorchResult<Variable> {
        distribution.rsample(n, rng)
    }

    fn adds_loss(&self, _node: &StorchTensor, _cost: &StorchTensor) -> bool {
        false
    }

    fn estimate(
        &self,
        view: &AlignedStochastic,
        _cost: &Variable,
        _cost_plates: &[Plate],
    ) -> StorchResult<Variable> {
        let batch = view.tensor().dims()[..view.plates().len()].to_vec();
        Ok(Variable::constant(Tensor::zeros(batch)))
    }
}
