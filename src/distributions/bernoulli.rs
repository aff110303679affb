use rand::rngs::StdRng;
use rand::Rng;

use crate::{
    autograd::Variable,
    error::{StorchError, StorchResult},
    tensor::Tensor,
};
use super::{check_sample_count, sample_shape, Distribution};

/// Bernoulli over `{0, 1}` with elementwise success probability
#[derive(Debug, Clone)]
pub struct Bernoulli {
    probs: Variable,
}

impl Bernoulli {
    pub fn new(probs: Variable) -> StorchResult<Self> {
        if probs
            .data()
            .as_slice()
            .iter()
            .any(|&p| !(0.0..=1.0).contains(&p))
        {
            return Err(StorchError::InvalidInput(
                "Bernoulli probabilities must lie in [0, 1]".to_string(),
            ));
        }
        Ok(Self { probs })
    }

    pub fn probs(&self) -> &Variable {
        &self.probs
    }
}

impl Distribution for Bernoulli {
    fn name(&self) -> &'static str {
        "Bernoulli"
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.probs.dims().to_vec()
    }

    fn parameters(&self) -> Vec<(&'static str, Variable)> {
        vec![("probs", self.probs.clone())]
    }

    fn sample(&self, n: usize, rng: &mut StdRng) -> StorchResult<Variable> {
        check_sample_count(self.name(), n)?;
        let probs = self.probs.data().as_slice();
        let mut data = Vec::with_capacity(n * probs.len());
        for _ in 0..n {
            for &p in probs {
                data.push(if rng.gen::<f64>() < p { 1.0 } else { 0.0 });
            }
        }
        Ok(Variable::constant(Tensor::from_vec(
            data,
            sample_shape(n, self.probs.dims()),
        )?))
    }

    fn log_prob(&self, value: &Variable) -> StorchResult<Variable> {
        // x ln p + (1 - x) ln(1 - p)
        let hit = value.mul(&self.probs.log())?;
        let miss = value.rsub_scalar(1.0).mul(&self.probs.rsub_scalar(1.0).log())?;
        hit.add(&miss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_rejects_out_of_range_probs() {
        assert!(Bernoulli::new(Variable::scalar(1.5)).is_err());
    }

    #[test]
    fn test_samples_are_binary() {
        let d = Bernoulli::new(Variable::constant(Tensor::from_slice(&[0.3, 0.9]))).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let s = d.sample(5, &mut rng).unwrap();
        assert_eq!(s.dims(), &[5, 2]);
        assert!(s.data().as_slice().iter().all(|&x| x == 0.0 || x == 1.0));
        assert!(!d.has_rsample());
        assert!(d.rsample(1, &mut rng).is_err());
    }

    #[test]
    fn test_log_prob_gradient() {
        let p = Variable::parameter(Tensor::from_slice(&[0.25]));
        let d = Bernoulli::new(p.clone()).unwrap();
        let lp = d.log_prob(&Variable::constant(Tensor::from_slice(&[1.0]))).unwrap();
        assert!((lp.item().unwrap() - 0.25f64.ln()).abs() < 1e-12);
        lp.sum().backward(false).unwrap();
        // d/dp ln p = 1 / p
        assert!((p.grad().unwrap().item().unwrap() - 4.0).abs() < 1e-9);
    }
}
