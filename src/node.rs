//! Nodes of the stochastic computation graph

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::{
    autograd::Variable,
    distributions::Distribution,
    error::{StorchError, StorchResult},
    method::SamplingMethod,
    plate::{format_plates, Plate},
};

pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Sampling details carried by stochastic nodes
#[derive(Clone)]
pub struct StochasticInfo {
    pub distribution: Arc<dyn Distribution>,
    pub method: Arc<dyn SamplingMethod>,
    pub n: usize,
    pub requires_grad: bool,
}

impl fmt::Debug for StochasticInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StochasticInfo")
            .field("distribution", &self.distribution.name())
            .field("method", &self.method.name())
            .field("n", &self.n)
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Deterministic,
    Stochastic(StochasticInfo),
    Cost,
    Independent,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Deterministic => "Deterministic",
            NodeKind::Stochastic(_) => "Stochastic",
            NodeKind::Cost => "Cost",
            NodeKind::Independent => "Independent",
        }
    }
}

/// A parent or child together with whether the edge carries gradient
pub type Edge = (StorchTensor, bool);

struct NodeInner {
    id: NodeId,
    tensor: Variable,
    kind: NodeKind,
    name: Option<String>,
    plates: Vec<Plate>,
    parents: Vec<Edge>,
    children: RwLock<Vec<(Weak<NodeInner>, bool)>>,
}

/// Shared handle to a graph node.
///
/// Parents are held strongly and children weakly, so a node keeps its
/// ancestry alive but not its descendants. Equality is identity.
#[derive(Clone)]
pub struct StorchTensor(Arc<NodeInner>);

impl StorchTensor {
    /// Build a node and mirror each parent edge into that parent's children.
    ///
    /// The leading axes of `tensor` must follow `plates`, each of size `n` or 1.
    pub(crate) fn new(
        tensor: Variable,
        kind: NodeKind,
        name: Option<String>,
        plates: Vec<Plate>,
        parents: Vec<Edge>,
    ) -> StorchResult<Self> {
        if tensor.ndim() < plates.len() {
            return Err(StorchError::shape_error(
                &format!("{} leading plate axes for {}", plates.len(), format_plates(&plates)),
                &tensor.shape().to_string(),
                None,
            ));
        }
        for (axis, plate) in plates.iter().enumerate() {
            let size = tensor.dims()[axis];
            if size != plate.n() && size != 1 {
                return Err(StorchError::shape_error(
                    &format!("axis {} of size {} or 1 for plate '{}'", axis, plate.n(), plate.name()),
                    &tensor.shape().to_string(),
                    None,
                ));
            }
        }

        let inner = Arc::new(NodeInner {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            tensor,
            kind,
            name,
            plates,
            parents,
            children: RwLock::new(Vec::new()),
        });
        for (parent, differentiable) in &inner.parents {
            let mut children = parent.0.children.write();
            children.retain(|(weak, _)| weak.strong_count() > 0);
            children.push((Arc::downgrade(&inner), *differentiable));
        }
        Ok(Self(inner))
    }

    /// Deterministic source node without plates or parents
    pub fn leaf(tensor: Variable, name: Option<&str>) -> Self {
        Self(Arc::new(NodeInner {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            tensor,
            kind: NodeKind::Deterministic,
            name: name.map(str::to_string),
            plates: Vec::new(),
            parents: Vec::new(),
            children: RwLock::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn tensor(&self) -> &Variable {
        &self.0.tensor
    }

    pub fn kind(&self) -> &NodeKind {
        &self.0.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn plates(&self) -> &[Plate] {
        &self.0.plates
    }

    pub fn multi_dim_plates(&self) -> Vec<Plate> {
        self.0
            .plates
            .iter()
            .filter(|p| p.is_multi_dim())
            .cloned()
            .collect()
    }

    pub fn parents(&self) -> &[Edge] {
        &self.0.parents
    }

    /// Children that are still alive, in insertion order
    pub fn children(&self) -> Vec<Edge> {
        self.0
            .children
            .read()
            .iter()
            .filter_map(|(weak, d)| weak.upgrade().map(|inner| (StorchTensor(inner), *d)))
            .collect()
    }

    pub fn has_children(&self) -> bool {
        self.0
            .children
            .read()
            .iter()
            .any(|(weak, _)| weak.strong_count() > 0)
    }

    pub fn stochastic(&self) -> Option<&StochasticInfo> {
        match &self.0.kind {
            NodeKind::Stochastic(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_stochastic(&self) -> bool {
        self.stochastic().is_some()
    }

    pub fn is_cost(&self) -> bool {
        matches!(self.0.kind, NodeKind::Cost)
    }

    pub fn requires_grad(&self) -> bool {
        match &self.0.kind {
            NodeKind::Stochastic(info) => info.requires_grad,
            _ => self.0.tensor.requires_grad(),
        }
    }

    /// Sizes of the leading plate axes
    pub fn batch_shape(&self) -> &[usize] {
        &self.0.tensor.dims()[..self.0.plates.len()]
    }

    /// Dims left once the plate axes are removed
    pub fn event_shape(&self) -> &[usize] {
        &self.0.tensor.dims()[self.0.plates.len()..]
    }

    pub fn same_as(&self, other: &StorchTensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for StorchTensor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for StorchTensor {}

impl Hash for StorchTensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for StorchTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorchTensor")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind.label())
            .field("name", &self.0.name)
            .field("plates", &self.0.plates)
            .field("shape", self.0.tensor.shape())
            .finish()
    }
}

impl fmt::Display for StorchTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] plates={} shape={}",
            self.0.kind.label(),
            self.0.name.as_deref().unwrap_or("unnamed"),
            format_plates(&self.0.plates),
            self.0.tensor.shape()
        )
    }
}

/// A stochastic node seen with its plate axes permuted.
///
/// The view borrows the source's position in the graph through the shared
/// handle; no edge of the graph points back at it.
#[derive(Debug, Clone)]
pub struct AlignedStochastic {
    source: StorchTensor,
    info: StochasticInfo,
    tensor: Variable,
    plates: Vec<Plate>,
    perm: Vec<usize>,
}

impl AlignedStochastic {
    /// View `source` with its plates in `plate_order`, a permutation of them
    pub fn new(source: &StorchTensor, plate_order: Vec<Plate>) -> StorchResult<Self> {
        let info = source.stochastic().cloned().ok_or_else(|| {
            StorchError::InvalidInput(format!("cannot build a sample view of {}", source))
        })?;
        if plate_order.len() != source.plates().len() {
            return Err(StorchError::InvalidInput(format!(
                "plate order {} is not a permutation of {}",
                format_plates(&plate_order),
                format_plates(source.plates())
            )));
        }
        let mut perm = Vec::with_capacity(source.tensor().ndim());
        for plate in &plate_order {
            let axis = source.plates().iter().position(|p| p == plate).ok_or_else(|| {
                StorchError::InvalidInput(format!(
                    "plate {} is not carried by {}",
                    plate,
                    source
                ))
            })?;
            perm.push(axis);
        }
        perm.extend(plate_order.len()..source.tensor().ndim());

        let tensor = permute_if_needed(source.tensor(), &perm)?;
        Ok(Self {
            source: source.clone(),
            info,
            tensor,
            plates: plate_order,
            perm,
        })
    }

    pub fn source(&self) -> &StorchTensor {
        &self.source
    }

    pub fn info(&self) -> &StochasticInfo {
        &self.info
    }

    pub fn distribution(&self) -> &dyn Distribution {
        self.info.distribution.as_ref()
    }

    pub fn n(&self) -> usize {
        self.info.n
    }

    /// The permuted sample
    pub fn tensor(&self) -> &Variable {
        &self.tensor
    }

    pub fn plates(&self) -> &[Plate] {
        &self.plates
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn parents(&self) -> &[Edge] {
        self.source.parents()
    }

    pub fn children(&self) -> Vec<Edge> {
        self.source.children()
    }

    /// Axis of the source's own sample plate within the view
    pub fn sample_axis(&self) -> Option<usize> {
        let own = self.source.plates().first()?;
        self.plates.iter().position(|p| p == own)
    }

    /// Apply the view's permutation to a tensor laid out like the source
    pub fn align(&self, tensor: &Variable) -> StorchResult<Variable> {
        let plates = self.plates.len();
        if tensor.ndim() < plates {
            return Err(StorchError::shape_error(
                &format!("at least {} leading plate axes", plates),
                &tensor.shape().to_string(),
                None,
            ));
        }
        let perm: Vec<usize> = self.perm[..plates]
            .iter()
            .copied()
            .chain(plates..tensor.ndim())
            .collect();
        permute_if_needed(tensor, &perm)
    }
}

fn permute_if_needed(tensor: &Variable, perm: &[usize]) -> StorchResult<Variable> {
    if perm.iter().enumerate().all(|(i, &p)| i == p) {
        Ok(tensor.clone())
    } else {
        tensor.permute(perm)
    }
}
