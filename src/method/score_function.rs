use std::sync::Arc;

use rand::rngs::StdRng;

use crate::{
    autograd::Variable,
    distributions::Distribution,
    error::StorchResult,
    node::{AlignedStochastic, StorchTensor},
    plate::{align_plates, Plate},
};
use super::{Baseline, SamplingMethod};

/// Score-function (REINFORCE) estimator.
///
/// The surrogate term is `log p(x) * (cost - baseline)` with cost and baseline
/// held constant, whose gradient is the likelihood-ratio estimate of the
/// gradient of the expected cost.
#[derive(Debug, Clone, Default)]
pub struct ScoreFunction {
    baseline: Option<Arc<dyn Baseline>>,
}

impl ScoreFunction {
    pub fn new() -> Self {
        Self { baseline: None }
    }

    pub fn with_baseline(baseline: Arc<dyn Baseline>) -> Self {
        Self {
            baseline: Some(baseline),
        }
    }

    pub fn baseline(&self) -> Option<&Arc<dyn Baseline>> {
        self.baseline.as_ref()
    }
}

impl SamplingMethod for ScoreFunction {
    fn name(&self) -> &'static str {
        "ScoreFunction"
    }

    fn sample(
        &self,
        distribution: &dyn Distribution,
        n: usize,
        rng: &mut StdRng,
    ) -> StorchResult<Variable> {
        distribution.sample(n, rng)
    }

    fn adds_loss(&self, _node: &StorchTensor, _cost: &StorchTensor) -> bool {
        true
    }

    fn estimate(
        &self,
        view: &AlignedStochastic,
        cost: &Variable,
        cost_plates: &[Plate],
    ) -> StorchResult<Variable> {
        let source = view.source();
        let log_prob = view
            .distribution()
            .log_prob(source.tensor())?
            .sum_trailing(source.plates().len())?;
        let log_prob = view.align(&log_prob)?;

        let cost = align_plates(&cost.detach(), cost_plates, view.plates())?;
        let advantage = match &self.baseline {
            Some(baseline) => cost.sub(&baseline.compute_baseline(view, &cost)?.detach())?,
            None => cost,
        };
        log_prob.mul(&advantage)
    }

    fn update_parameters(&self) -> StorchResult<()> {
        if let Some(baseline) = &self.baseline {
            baseline.update_parameters();
        }
        Ok(())
    }
}
