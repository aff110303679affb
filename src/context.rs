//! Graph construction and the cost registry

use std::cell::Cell;
use std::sync::Arc;
use std::thread::LocalKey;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::{
    autograd::{has_backwards_path, is_grad_enabled, Variable},
    config::{get_config, StorchConfig},
    distributions::{get_distr_parameters, Distribution},
    error::{StorchError, StorchResult},
    method::SamplingMethod,
    node::{NodeKind, StochasticInfo, StorchTensor},
    plate::{align_plates, format_plates, merge_plates, Plate},
};

thread_local! {
    static DETERMINISTIC_DEPTH: Cell<usize> = Cell::new(0);
    static STOCHASTIC_DEPTH: Cell<usize> = Cell::new(0);
}

#[derive(Clone, Copy)]
enum ScopeKind {
    Deterministic,
    Stochastic,
}

fn depth(kind: ScopeKind) -> &'static LocalKey<Cell<usize>> {
    match kind {
        ScopeKind::Deterministic => &DETERMINISTIC_DEPTH,
        ScopeKind::Stochastic => &STOCHASTIC_DEPTH,
    }
}

struct ScopeGuard(ScopeKind);

impl ScopeGuard {
    fn enter(kind: ScopeKind) -> Self {
        depth(kind).with(|d| d.set(d.get() + 1));
        Self(kind)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        depth(self.0).with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Whether this thread is inside a deterministic or stochastic scope
pub fn in_tracing_scope() -> bool {
    DETERMINISTIC_DEPTH.with(|d| d.get() > 0) || STOCHASTIC_DEPTH.with(|d| d.get() > 0)
}

/// Input accepted by [`StorchContext::denote_independent`]
#[derive(Debug, Clone, Copy)]
pub enum IndependentSource<'a> {
    Raw(&'a Variable),
    Node(&'a StorchTensor),
}

impl<'a> From<&'a Variable> for IndependentSource<'a> {
    fn from(v: &'a Variable) -> Self {
        IndependentSource::Raw(v)
    }
}

impl<'a> From<&'a StorchTensor> for IndependentSource<'a> {
    fn from(n: &'a StorchTensor) -> Self {
        IndependentSource::Node(n)
    }
}

/// Name of a node denoted independent over `plate`
fn independent_name(name: Option<&str>, plate: &str) -> String {
    match name {
        Some(name) if !name.is_empty() => {
            let suffix = format!("_indep_{}", plate);
            if name.ends_with(&suffix) {
                name.to_string()
            } else {
                format!("{}{}", name, suffix)
            }
        }
        _ => plate.to_string(),
    }
}

/// Bring axis `dim` of a raw tensor to the front by swapping it with axis 0
fn swap_to_front(tensor: &Variable, dim: usize) -> StorchResult<Variable> {
    if dim == 0 {
        return Ok(tensor.clone());
    }
    tensor.transpose(0, dim)
}

/// Bring axis `dim` to the front, keeping the other axes in order
fn move_to_front(tensor: &Variable, dim: usize) -> StorchResult<Variable> {
    if dim == 0 {
        return Ok(tensor.clone());
    }
    let perm: Vec<usize> = std::iter::once(dim)
        .chain((0..tensor.ndim()).filter(|&a| a != dim))
        .collect();
    tensor.permute(&perm)
}

fn align_inputs(parents: &[StorchTensor]) -> StorchResult<(Vec<Plate>, Vec<Variable>)> {
    let plates = merge_plates(parents.iter().map(|p| p.plates()));
    let inputs = parents
        .iter()
        .map(|p| align_plates(p.tensor(), p.plates(), &plates))
        .collect::<StorchResult<Vec<_>>>()?;
    Ok((plates, inputs))
}

/// Owns the cost registry of one stochastic computation graph.
///
/// Costs accumulate through [`StorchContext::add_cost`] and are consumed by
/// [`StorchContext::backward`].
pub struct StorchContext {
    pub(crate) costs: Vec<StorchTensor>,
    config: StorchConfig,
    rng: StdRng,
}

impl StorchContext {
    /// Context using a snapshot of the global configuration
    pub fn new() -> Self {
        let config = get_config();
        let rng = Self::rng_for(&config);
        Self {
            costs: Vec::new(),
            config,
            rng,
        }
    }

    pub fn with_config(config: StorchConfig) -> StorchResult<Self> {
        config.validate()?;
        let rng = Self::rng_for(&config);
        Ok(Self {
            costs: Vec::new(),
            config,
            rng,
        })
    }

    fn rng_for(config: &StorchConfig) -> StdRng {
        match config.sampling.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub fn config(&self) -> &StorchConfig {
        &self.config
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Costs registered since the last reset
    pub fn costs(&self) -> &[StorchTensor] {
        &self.costs
    }

    /// Clear the cost registry
    pub fn reset(&mut self) {
        self.costs.clear();
    }

    /// Apply `f` to the parents' tensors laid out over the union of their plates
    pub fn deterministic<F>(
        &self,
        name: Option<&str>,
        parents: &[StorchTensor],
        f: F,
    ) -> StorchResult<StorchTensor>
    where
        F: FnOnce(&[Variable]) -> StorchResult<Variable>,
    {
        let _scope = ScopeGuard::enter(ScopeKind::Deterministic);
        let (plates, inputs) = align_inputs(parents)?;
        let output = f(&inputs)?;

        let outputs = [output.clone()];
        let edges = parents
            .iter()
            .map(|p| Ok((p.clone(), has_backwards_path(&outputs, p.tensor())?)))
            .collect::<StorchResult<Vec<_>>>()?;
        StorchTensor::new(
            output,
            NodeKind::Deterministic,
            name.map(str::to_string),
            plates,
            edges,
        )
    }

    /// Sample `n` times from the distribution `build` returns.
    ///
    /// The node gets a new leading plate named `name` of size `n`.
    pub fn stochastic<F>(
        &mut self,
        name: &str,
        method: Arc<dyn SamplingMethod>,
        parents: &[StorchTensor],
        n: usize,
        build: F,
    ) -> StorchResult<StorchTensor>
    where
        F: FnOnce(&[Variable]) -> StorchResult<Arc<dyn Distribution>>,
    {
        if name.is_empty() {
            return Err(StorchError::InvalidInput(
                "stochastic nodes need a name for their plate".to_string(),
            ));
        }
        if n == 0 {
            return Err(StorchError::InvalidInput(format!(
                "stochastic node '{}' needs at least one sample",
                name
            )));
        }

        let _scope = ScopeGuard::enter(ScopeKind::Stochastic);
        let (parent_plates, inputs) = align_inputs(parents)?;
        if parent_plates.iter().any(|p| p.name() == name) {
            return Err(StorchError::InvalidInput(format!(
                "plate '{}' already appears among the parents' plates {}",
                name,
                format_plates(&parent_plates)
            )));
        }

        let distribution = build(&inputs)?;
        let sample = method.sample(distribution.as_ref(), n, &mut self.rng)?;
        let params = get_distr_parameters(distribution.as_ref(), false);
        let requires_grad = params.iter().any(|p| p.requires_grad());
        let edges = parents
            .iter()
            .map(|p| Ok((p.clone(), has_backwards_path(&params, p.tensor())?)))
            .collect::<StorchResult<Vec<_>>>()?;

        let mut plates = Vec::with_capacity(parent_plates.len() + 1);
        plates.push(Plate::new(name, n));
        plates.extend(parent_plates);

        tracing::debug!(
            "sampled {} x{} from {} with {} ({})",
            name,
            n,
            distribution.name(),
            method.name(),
            sample.shape()
        );
        StorchTensor::new(
            sample,
            NodeKind::Stochastic(StochasticInfo {
                distribution,
                method,
                n,
                requires_grad,
            }),
            Some(name.to_string()),
            plates,
            edges,
        )
    }

    /// Mark axis `dim` as a batch of independent entries under a new plate.
    ///
    /// On a raw tensor the axis swaps places with axis 0. On an existing node
    /// `dim` must address an event axis; it moves in front of the plate axes
    /// and the node becomes the sole parent.
    pub fn denote_independent<'a>(
        &self,
        input: impl Into<IndependentSource<'a>>,
        dim: usize,
        plate_name: &str,
    ) -> StorchResult<StorchTensor> {
        self.independent(input.into(), dim, plate_name, None)
    }

    /// [`StorchContext::denote_independent`] under a plate whose entries are
    /// weighted by `weight` instead of `1 / n`.
    ///
    /// `backward` reduces costs over the plate with these weights and, when
    /// `weight` requires grad, propagates the cost into it.
    pub fn denote_independent_weighted<'a>(
        &self,
        input: impl Into<IndependentSource<'a>>,
        dim: usize,
        plate_name: &str,
        weight: Variable,
    ) -> StorchResult<StorchTensor> {
        self.independent(input.into(), dim, plate_name, Some(weight))
    }

    fn independent(
        &self,
        input: IndependentSource<'_>,
        dim: usize,
        plate_name: &str,
        weight: Option<Variable>,
    ) -> StorchResult<StorchTensor> {
        let make_plate = |n: usize| match &weight {
            Some(w) => Plate::weighted(plate_name, n, w.clone()),
            None => Ok(Plate::new(plate_name, n)),
        };

        if in_tracing_scope() {
            return Err(StorchError::InvalidContext(
                "cannot create independent tensors within a deterministic or stochastic context"
                    .to_string(),
            ));
        }
        if plate_name.is_empty() {
            return Err(StorchError::InvalidInput("plate name must not be empty".to_string()));
        }

        match input {
            IndependentSource::Raw(tensor) => {
                if dim >= tensor.ndim() {
                    return Err(StorchError::shape_error(
                        &format!("an axis {} to denote independent", dim),
                        &tensor.shape().to_string(),
                        None,
                    ));
                }
                let tensor = swap_to_front(tensor, dim)?;
                let plate = make_plate(tensor.dims()[0])?;
                StorchTensor::new(
                    tensor,
                    NodeKind::Independent,
                    Some(plate_name.to_string()),
                    vec![plate],
                    Vec::new(),
                )
            }
            IndependentSource::Node(node) => {
                let first_event = node.plates().len();
                if dim < first_event || dim >= node.tensor().ndim() {
                    return Err(StorchError::InvalidInput(format!(
                        "dim {} of {} is not an event axis",
                        dim, node
                    )));
                }
                if node.plates().iter().any(|p| p.name() == plate_name) {
                    return Err(StorchError::InvalidInput(format!(
                        "{} is already independent over plate '{}'",
                        node, plate_name
                    )));
                }
                let tensor = move_to_front(node.tensor(), dim)?;
                let mut plates = vec![make_plate(tensor.dims()[0])?];
                plates.extend_from_slice(node.plates());
                StorchTensor::new(
                    tensor,
                    NodeKind::Independent,
                    Some(independent_name(node.name(), plate_name)),
                    plates,
                    vec![(node.clone(), true)],
                )
            }
        }
    }

    /// Register `cost` as a cost node named `name`.
    ///
    /// The node is only tracked for the next `backward` while grad mode is on.
    pub fn add_cost(&mut self, cost: &StorchTensor, name: &str) -> StorchResult<StorchTensor> {
        if !cost.event_shape().is_empty() {
            return Err(StorchError::InvalidInput(format!(
                "can only register costs with an empty event shape, got {:?}",
                cost.event_shape()
            )));
        }
        if name.is_empty() {
            return Err(StorchError::InvalidInput(
                "no name provided to register the cost node".to_string(),
            ));
        }

        let node = StorchTensor::new(
            cost.tensor().clone(),
            NodeKind::Cost,
            Some(name.to_string()),
            cost.plates().to_vec(),
            vec![(cost.clone(), true)],
        )?;
        if is_grad_enabled() {
            self.costs.push(node.clone());
        }
        Ok(node)
    }
}

impl Default for StorchContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        autograd::no_grad,
        distributions::Normal,
        method::{Reparameterization, ScoreFunction},
        tensor::Tensor,
    };

    fn seeded() -> StorchContext {
        let mut config = StorchConfig::default();
        config.sampling.seed = Some(5);
        StorchContext::with_config(config).unwrap()
    }

    #[test]
    fn test_denote_independent_raw_moves_axis_to_front() {
        let ctx = seeded();
        let raw = Variable::constant(Tensor::zeros([3, 4]));
        let node = ctx.denote_independent(&raw, 1, "data").unwrap();
        assert_eq!(node.tensor().dims(), &[4, 3]);
        assert_eq!(node.plates(), &[Plate::new("data", 4)]);
        assert_eq!(node.name(), Some("data"));
        assert!(node.parents().is_empty());
        assert!(matches!(node.kind(), NodeKind::Independent));
    }

    #[test]
    fn test_denote_independent_raw_swaps_with_first_axis() {
        let ctx = seeded();
        let raw = Variable::constant(
            Tensor::from_vec((0..24).map(f64::from).collect(), [2, 3, 4]).unwrap(),
        );
        let node = ctx.denote_independent(&raw, 2, "data").unwrap();
        assert_eq!(node.tensor().dims(), &[4, 3, 2]);
        assert_eq!(node.event_shape(), &[3, 2]);
        // element [k, j, i] comes from raw[i, j, k]
        assert_eq!(node.tensor().data().get(&[3, 1, 1]).unwrap(), 19.0);
    }

    #[test]
    fn test_denote_independent_weighted_carries_weights() {
        let ctx = seeded();
        let weight = Variable::parameter(Tensor::from_slice(&[0.25, 0.75]));
        let raw = Variable::constant(Tensor::zeros([2, 3]));
        let node = ctx
            .denote_independent_weighted(&raw, 0, "data", weight.clone())
            .unwrap();
        let carried = node.plates()[0].weight().unwrap();
        assert!(carried.same_as(&weight));

        let sq = ctx.deterministic(None, &[node.clone()], |xs| Ok(xs[0].square())).unwrap();
        assert!(sq.plates()[0].weight().is_some());

        let wrong = Variable::constant(Tensor::ones([3]));
        assert!(matches!(
            ctx.denote_independent_weighted(&raw, 0, "data", wrong),
            Err(StorchError::ShapeError(_))
        ));
    }

    #[test]
    fn test_denote_independent_on_node_prepends_plate() {
        let ctx = seeded();
        let base = ctx
            .denote_independent(&Variable::constant(Tensor::zeros([2, 5])), 0, "outer")
            .unwrap();
        let named = ctx.deterministic(Some("x"), &[base], |xs| Ok(xs[0].clone())).unwrap();
        let inner = ctx.denote_independent(&named, 1, "inner").unwrap();
        assert_eq!(inner.tensor().dims(), &[5, 2]);
        assert_eq!(inner.plates(), &[Plate::new("inner", 5), Plate::new("outer", 2)]);
        assert_eq!(inner.name(), Some("x_indep_inner"));
        assert_eq!(inner.parents().len(), 1);
        assert!(inner.parents()[0].0 == named);

        // plate axes cannot be denoted again
        assert!(ctx.denote_independent(&named, 0, "again").is_err());
        assert!(ctx.denote_independent(&inner, 1, "other").is_err());
    }

    #[test]
    fn test_denote_independent_naming_is_idempotent() {
        let ctx = seeded();
        let x = StorchTensor::leaf(Variable::constant(Tensor::zeros([3])), Some("x"));
        let first = ctx.denote_independent(&x, 0, "p").unwrap();
        let second = ctx.denote_independent(&x, 0, "p").unwrap();
        assert_eq!(first.name(), Some("x_indep_p"));
        assert_eq!(first.name(), second.name());

        // a node already named for the plate keeps its name
        let renamed = StorchTensor::leaf(Variable::constant(Tensor::zeros([3])), Some("x_indep_p"));
        let again = ctx.denote_independent(&renamed, 0, "p").unwrap();
        assert_eq!(again.name(), Some("x_indep_p"));

        let unnamed = StorchTensor::leaf(Variable::constant(Tensor::zeros([3])), None);
        assert_eq!(ctx.denote_independent(&unnamed, 0, "p").unwrap().name(), Some("p"));
    }

    #[test]
    fn test_denote_independent_rejected_inside_scope() {
        let ctx = seeded();
        let raw = Variable::constant(Tensor::zeros([2]));
        let parent = StorchTensor::leaf(Variable::scalar(1.0), None);
        let result = ctx.deterministic(None, &[parent], |xs| {
            assert!(matches!(
                ctx.denote_independent(&raw, 0, "p"),
                Err(StorchError::InvalidContext(_))
            ));
            Ok(xs[0].clone())
        });
        assert!(result.is_ok());
        assert!(!in_tracing_scope());
        assert!(ctx.denote_independent(&raw, 0, "p").is_ok());
    }

    #[test]
    fn test_deterministic_aligns_parent_plates() {
        let ctx = seeded();
        let a = ctx
            .denote_independent(&Variable::constant(Tensor::ones([2])), 0, "a")
            .unwrap();
        let b = ctx
            .denote_independent(&Variable::constant(Tensor::ones([3])), 0, "b")
            .unwrap();
        let sum = ctx.deterministic(Some("sum"), &[a, b], |xs| xs[0].add(&xs[1])).unwrap();
        assert_eq!(sum.plates(), &[Plate::new("a", 2), Plate::new("b", 3)]);
        assert_eq!(sum.tensor().dims(), &[2, 3]);
        assert!(sum.event_shape().is_empty());
    }

    #[test]
    fn test_deterministic_edges_track_differentiability() {
        let ctx = seeded();
        let w = StorchTensor::leaf(Variable::parameter(Tensor::from_slice(&[1.0, 2.0])), None);
        let frozen = StorchTensor::leaf(Variable::parameter(Tensor::from_slice(&[1.0, 2.0])), None);
        let out = ctx
            .deterministic(None, &[w.clone(), frozen.clone()], |xs| {
                Ok(xs[0].mul(&xs[1].detach())?)
            })
            .unwrap();
        assert!(out.parents()[0].1);
        assert!(!out.parents()[1].1);
        assert!(w.children()[0].1);
        assert!(!frozen.children()[0].1);
    }

    #[test]
    fn test_stochastic_node_prepends_own_plate() {
        let mut ctx = seeded();
        let loc = ctx
            .denote_independent(&Variable::parameter(Tensor::zeros([3])), 0, "data")
            .unwrap();
        let z = ctx
            .stochastic("z", Arc::new(ScoreFunction::new()), &[loc.clone()], 4, |xs| {
                Ok(Arc::new(Normal::new(xs[0].clone(), Variable::scalar(1.0))?)
                    as Arc<dyn Distribution>)
            })
            .unwrap();
        assert_eq!(z.tensor().dims(), &[4, 3]);
        assert_eq!(z.plates(), &[Plate::new("z", 4), Plate::new("data", 3)]);
        assert!(z.requires_grad());
        assert!(!z.tensor().requires_grad());
        assert!(z.parents()[0].1);
        assert_eq!(z.stochastic().map(|s| s.n), Some(4));

        // plate names must be fresh
        let clash = ctx.stochastic("data", Arc::new(Reparameterization), &[loc], 1, |xs| {
            Ok(Arc::new(Normal::new(xs[0].clone(), Variable::scalar(1.0))?) as Arc<dyn Distribution>)
        });
        assert!(matches!(clash, Err(StorchError::InvalidInput(_))));
    }

    #[test]
    fn test_seeded_contexts_sample_identically() {
        let draw = || {
            let mut ctx = seeded();
            ctx.stochastic("z", Arc::new(Reparameterization), &[], 3, |_| {
                Ok(Arc::new(Normal::new(Variable::scalar(0.0), Variable::scalar(1.0))?)
                    as Arc<dyn Distribution>)
            })
            .unwrap()
            .tensor()
            .data()
            .to_vec()
        };
        assert_eq!(draw(), draw());
    }

    #[test]
    fn test_add_cost_preconditions() {
        let mut ctx = seeded();
        let event = StorchTensor::leaf(Variable::constant(Tensor::zeros([4])), None);
        assert!(matches!(
            ctx.add_cost(&event, "loss"),
            Err(StorchError::InvalidInput(_))
        ));

        let scalar = StorchTensor::leaf(Variable::scalar(1.0), None);
        assert!(matches!(
            ctx.add_cost(&scalar, ""),
            Err(StorchError::InvalidInput(_))
        ));
        assert!(ctx.costs().is_empty());

        let cost = ctx.add_cost(&scalar, "loss").unwrap();
        assert!(cost.is_cost());
        assert_eq!(ctx.costs(), &[cost]);
    }

    #[test]
    fn test_add_cost_untracked_without_grad() {
        let mut ctx = seeded();
        let scalar = StorchTensor::leaf(Variable::scalar(1.0), None);
        let cost = no_grad(|| ctx.add_cost(&scalar, "loss")).unwrap();
        assert_eq!(cost.name(), Some("loss"));
        assert!(ctx.costs().is_empty());

        ctx.add_cost(&scalar, "loss").unwrap();
        ctx.reset();
        ctx.reset();
        assert!(ctx.costs().is_empty());
    }
}
