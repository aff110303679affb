//! Variance-reducing baselines for the score-function estimator

use std::fmt::Debug;

use parking_lot::Mutex;

use crate::{
    autograd::Variable,
    error::{StorchError, StorchResult},
    node::AlignedStochastic,
};

pub trait Baseline: Debug + Send + Sync {
    /// Baseline for `cost`, which is laid out along `view.plates()`.
    /// The result must broadcast against `cost`.
    fn compute_baseline(&self, view: &AlignedStochastic, cost: &Variable)
        -> StorchResult<Variable>;

    fn update_parameters(&self) {}
}

#[derive(Debug, Default)]
struct MovingAverageState {
    average: f64,
    pending: Option<f64>,
}

/// Exponential moving average of the mean cost.
///
/// `compute_baseline` reports the updated average; it only becomes the new
/// state once `update_parameters` runs after the backward pass.
#[derive(Debug)]
pub struct MovingAverageBaseline {
    decay: f64,
    state: Mutex<MovingAverageState>,
}

impl MovingAverageBaseline {
    pub fn new(decay: f64) -> StorchResult<Self> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(StorchError::InvalidInput(format!(
                "moving average decay must lie in [0, 1], got {}",
                decay
            )));
        }
        Ok(Self {
            decay,
            state: Mutex::new(MovingAverageState::default()),
        })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn moving_average(&self) -> f64 {
        self.state.lock().average
    }
}

impl Default for MovingAverageBaseline {
    fn default() -> Self {
        Self {
            decay: 0.95,
            state: Mutex::new(MovingAverageState::default()),
        }
    }
}

impl Baseline for MovingAverageBaseline {
    fn compute_baseline(
        &self,
        _view: &AlignedStochastic,
        cost: &Variable,
    ) -> StorchResult<Variable> {
        let mean = cost.data().mean_all().item()?;
        let mut state = self.state.lock();
        let next = self.decay * state.average + (1.0 - self.decay) * mean;
        state.pending = Some(next);
        Ok(Variable::scalar(next))
    }

    fn update_parameters(&self) {
        let mut state = self.state.lock();
        if let Some(next) = state.pending.take() {
            state.average = next;
        }
    }
}

/// Leave-one-out mean over the samples of the node itself
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchAverageBaseline;

impl Baseline for BatchAverageBaseline {
    fn compute_baseline(
        &self,
        view: &AlignedStochastic,
        cost: &Variable,
    ) -> StorchResult<Variable> {
        if view.n() == 1 {
            return Err(StorchError::InvalidInput(
                "the batch average baseline needs more than one sample".to_string(),
            ));
        }
        let axis = view.sample_axis().ok_or_else(|| {
            StorchError::InternalError("sample view lost its own plate".to_string())
        })?;
        let k = cost.dims()[axis];
        if k == 1 {
            // cost is constant along the samples
            return Ok(cost.detach());
        }
        let cost = cost.data();
        let total = cost.sum_axis(axis)?.unsqueeze(axis)?;
        let others = total.sub(cost)?.scale(1.0 / (k - 1) as f64);
        Ok(Variable::constant(others))
    }
}
