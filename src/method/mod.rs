//! Gradient estimation strategies for stochastic nodes
//!
//! A [`SamplingMethod`] draws the samples of a stochastic node and, during
//! `backward`, decides whether the node contributes a surrogate term for a
//! given cost and what that term is. The orchestrator only ever sees the trait.

mod baseline;
mod reparameterization;
mod score_function;

pub use baseline::{Baseline, BatchAverageBaseline, MovingAverageBaseline};
pub use reparameterization::Reparameterization;
pub use score_function::ScoreFunction;

use std::fmt::Debug;

use rand::rngs::StdRng;

use crate::{
    autograd::Variable,
    distributions::Distribution,
    error::StorchResult,
    node::{AlignedStochastic, StorchTensor},
    plate::Plate,
};

pub trait SamplingMethod: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Draw `n` samples stacked on a new leading axis
    fn sample(
        &self,
        distribution: &dyn Distribution,
        n: usize,
        rng: &mut StdRng,
    ) -> StorchResult<Variable>;

    /// Whether `node` contributes a surrogate term for `cost`
    fn adds_loss(&self, node: &StorchTensor, cost: &StorchTensor) -> bool;

    /// Surrogate term per sample, laid out along `view.plates()`.
    ///
    /// The leading axes of `cost` follow `cost_plates`, none of which is a
    /// multi-dim plate that the view lacks.
    fn estimate(
        &self,
        view: &AlignedStochastic,
        cost: &Variable,
        cost_plates: &[Plate],
    ) -> StorchResult<Variable>;

    /// Bookkeeping after the engine's backward pass
    fn update_parameters(&self) -> StorchResult<()> {
        Ok(())
    }
}
