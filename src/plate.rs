//! Plates: named batch axes with a weighted reduction

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{
    autograd::Variable,
    error::{StorchError, StorchResult},
    node::{NodeKind, StorchTensor},
};

/// One named, sized batch axis.
///
/// Plates compare and hash by `(name, n)`; the weight does not take part in
/// identity. Without a weight every entry counts `1 / n`.
#[derive(Clone)]
pub struct Plate {
    name: String,
    n: usize,
    weight: Option<Variable>,
}

impl Plate {
    pub fn new(name: impl Into<String>, n: usize) -> Self {
        Self {
            name: name.into(),
            n,
            weight: None,
        }
    }

    /// Plate whose entries are weighted by `weight`, a vector of length `n`
    pub fn weighted(name: impl Into<String>, n: usize, weight: Variable) -> StorchResult<Self> {
        if weight.dims() != &[n][..] {
            return Err(StorchError::shape_error(
                &format!("plate weights of shape [{}]", n),
                &weight.shape().to_string(),
                None,
            ));
        }
        Ok(Self {
            name: name.into(),
            n,
            weight: Some(weight),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn weight(&self) -> Option<&Variable> {
        self.weight.as_ref()
    }

    pub fn is_multi_dim(&self) -> bool {
        self.n > 1
    }

    /// Contract `axis` of `tensor` by a weighted sum over the plate entries.
    ///
    /// A size-1 axis stands for a value constant along the plate: it is
    /// squeezed and scaled by the total weight.
    pub fn reduce_axis(
        &self,
        tensor: &Variable,
        axis: usize,
        detach_weights: bool,
    ) -> StorchResult<Variable> {
        let size = *tensor.dims().get(axis).ok_or_else(|| {
            StorchError::shape_error(
                &format!("an axis {} for plate '{}'", axis, self.name),
                &tensor.shape().to_string(),
                None,
            )
        })?;
        if size == 1 && self.n != 1 {
            let squeezed = tensor.squeeze(axis)?;
            return match self.weight_for(detach_weights) {
                None => Ok(squeezed),
                Some(weight) => squeezed.mul(&weight.sum()),
            };
        }
        if size != self.n {
            return Err(StorchError::shape_error(
                &format!("axis {} of size {} for plate '{}'", axis, self.n, self.name),
                &tensor.shape().to_string(),
                None,
            ));
        }

        match self.weight_for(detach_weights) {
            None => Ok(tensor.sum_axis(axis)?.mul_scalar(1.0 / self.n as f64)),
            Some(weight) => {
                let mut dims = vec![1; tensor.ndim()];
                dims[axis] = self.n;
                tensor.mul(&weight.reshape(&dims)?)?.sum_axis(axis)
            }
        }
    }

    fn weight_for(&self, detach: bool) -> Option<Variable> {
        self.weight
            .as_ref()
            .map(|w| if detach { w.detach() } else { w.clone() })
    }

    /// Reduce `node` over this plate, yielding a deterministic node without it
    pub fn reduce(&self, node: &StorchTensor, detach_weights: bool) -> StorchResult<StorchTensor> {
        let axis = node
            .plates()
            .iter()
            .position(|p| p == self)
            .ok_or_else(|| {
                StorchError::shape_error(
                    &format!("a node over plate '{}' of size {}", self.name, self.n),
                    &format!("plates {}", format_plates(node.plates())),
                    None,
                )
            })?;
        let tensor = self.reduce_axis(node.tensor(), axis, detach_weights)?;
        let plates = node
            .plates()
            .iter()
            .filter(|p| *p != self)
            .cloned()
            .collect();
        StorchTensor::new(
            tensor,
            NodeKind::Deterministic,
            node.name().map(str::to_string),
            plates,
            vec![(node.clone(), true)],
        )
    }
}

impl PartialEq for Plate {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.n == other.n
    }
}

impl Eq for Plate {}

impl Hash for Plate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.n.hash(state);
    }
}

impl fmt::Debug for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plate")
            .field("name", &self.name)
            .field("n", &self.n)
            .field("weighted", &self.weight.is_some())
            .finish()
    }
}

impl fmt::Display for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.n)
    }
}

/// Reduce `tensor`, whose leading axes follow `plates`, over each plate of
/// `over` in turn. Returns the result and the plates left on it.
///
/// Works on the values alone; no node is added to the graph.
pub fn reduce_plates(
    tensor: &Variable,
    plates: &[Plate],
    over: &[Plate],
    detach_weights: bool,
) -> StorchResult<(Variable, Vec<Plate>)> {
    let mut out = tensor.clone();
    let mut left = plates.to_vec();
    for plate in over {
        let axis = left.iter().position(|p| p == plate).ok_or_else(|| {
            StorchError::shape_error(
                &format!("a tensor over plate '{}' of size {}", plate.name, plate.n),
                &format!("plates {}", format_plates(&left)),
                None,
            )
        })?;
        let carried = left.remove(axis);
        out = carried.reduce_axis(&out, axis, detach_weights)?;
    }
    Ok((out, left))
}

pub(crate) fn format_plates(plates: &[Plate]) -> String {
    let names: Vec<String> = plates.iter().map(|p| p.to_string()).collect();
    format!("[{}]", names.join(", "))
}

/// Union of plate lists in first-appearance order
pub fn merge_plates<'a>(lists: impl IntoIterator<Item = &'a [Plate]>) -> Vec<Plate> {
    let mut merged: Vec<Plate> = Vec::new();
    for list in lists {
        for plate in list {
            if !merged.contains(plate) {
                merged.push(plate.clone());
            }
        }
    }
    merged
}

/// Lay `tensor`, whose leading axes follow `from`, out along `to`.
///
/// Shared plates are permuted into `to`'s order, size-1 plates missing from
/// `to` are squeezed and size-1 axes are inserted for plates of `to` that
/// `from` lacks. Event axes stay trailing.
pub fn align_plates(tensor: &Variable, from: &[Plate], to: &[Plate]) -> StorchResult<Variable> {
    if tensor.ndim() < from.len() {
        return Err(StorchError::shape_error(
            &format!("at least {} leading plate axes", from.len()),
            &tensor.shape().to_string(),
            None,
        ));
    }

    let mut out = tensor.clone();
    let mut kept: Vec<Plate> = from.to_vec();
    for axis in (0..from.len()).rev() {
        if to.contains(&from[axis]) {
            continue;
        }
        if from[axis].is_multi_dim() && out.dims()[axis] != 1 {
            return Err(StorchError::shape_error(
                &format!("plate '{}' to be present in {}", from[axis].name(), format_plates(to)),
                &format_plates(from),
                Some("reduce over the plate before aligning"),
            ));
        }
        out = out.squeeze(axis)?;
        kept.remove(axis);
    }

    let mut order: Vec<usize> = (0..kept.len()).collect();
    order.sort_by_key(|&i| to.iter().position(|p| *p == kept[i]));
    if order.iter().enumerate().any(|(i, &j)| i != j) {
        let perm: Vec<usize> = order.into_iter().chain(kept.len()..out.ndim()).collect();
        out = out.permute(&perm)?;
    }

    for (axis, plate) in to.iter().enumerate() {
        if !kept.contains(plate) {
            out = out.unsqueeze(axis)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn two_by_two() -> Variable {
        Variable::constant(Tensor::from_vec(vec![1.0, 1.0, 3.0, 3.0], [2, 2]).unwrap())
    }

    #[test]
    fn test_identity_by_name_and_size() {
        let w = Variable::constant(Tensor::from_slice(&[0.2, 0.8]));
        assert_eq!(Plate::new("a", 2), Plate::weighted("a", 2, w).unwrap());
        assert_ne!(Plate::new("a", 2), Plate::new("a", 3));
        assert_ne!(Plate::new("a", 2), Plate::new("b", 2));
        assert!(!Plate::new("a", 1).is_multi_dim());
    }

    #[test]
    fn test_weighted_rejects_bad_weights() {
        let w = Variable::constant(Tensor::from_slice(&[1.0, 0.0, 0.0]));
        assert!(Plate::weighted("a", 2, w).is_err());
    }

    #[test]
    fn test_uniform_reduce_axis() {
        let plate = Plate::new("a", 2);
        let out = plate.reduce_axis(&two_by_two(), 0, true).unwrap();
        assert_eq!(out.data().to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_reduce_axis_gradient_to_weights() {
        let w = Variable::parameter(Tensor::from_slice(&[0.5, 0.5]));
        let plate = Plate::weighted("a", 2, w.clone()).unwrap();

        let detached = plate.reduce_axis(&two_by_two(), 0, true).unwrap();
        assert_eq!(detached.data().to_vec(), vec![2.0, 2.0]);
        assert!(!detached.requires_grad());

        let attached = plate.reduce_axis(&two_by_two(), 0, false).unwrap();
        attached.sum().backward(false).unwrap();
        assert_eq!(w.grad().unwrap().to_vec(), vec![2.0, 6.0]);
    }

    #[test]
    fn test_reduce_axis_size_mismatch() {
        let plate = Plate::new("a", 3);
        assert!(matches!(
            plate.reduce_axis(&two_by_two(), 0, true),
            Err(StorchError::ShapeError(_))
        ));
        // size-1 axis is constant along the plate
        let single = Variable::constant(Tensor::from_vec(vec![4.0, 5.0], [1, 2]).unwrap());
        assert_eq!(plate.reduce_axis(&single, 0, true).unwrap().dims(), &[2]);
    }

    #[test]
    fn test_size_one_axis_scaled_by_total_weight() {
        let w = Variable::parameter(Tensor::from_slice(&[0.25, 0.5]));
        let plate = Plate::weighted("a", 2, w.clone()).unwrap();
        let single = Variable::constant(Tensor::from_vec(vec![4.0, 5.0], [1, 2]).unwrap());

        let detached = plate.reduce_axis(&single, 0, true).unwrap();
        assert_eq!(detached.data().to_vec(), vec![3.0, 3.75]);
        assert!(!detached.requires_grad());

        let attached = plate.reduce_axis(&single, 0, false).unwrap();
        assert_eq!(attached.data().to_vec(), vec![3.0, 3.75]);
        attached.sum().backward(false).unwrap();
        assert_eq!(w.grad().unwrap().to_vec(), vec![9.0, 9.0]);
    }

    #[test]
    fn test_reduce_plates_uses_carried_weights() {
        let w = Variable::constant(Tensor::from_slice(&[0.0, 1.0]));
        let a = Plate::weighted("a", 2, w).unwrap();
        let b = Plate::new("b", 3);
        // [a, b]: rows [0, 1, 2] and [3, 4, 5]
        let t = Variable::constant(
            Tensor::from_vec((0..6).map(f64::from).collect(), [2, 3]).unwrap(),
        );

        let (out, left) =
            reduce_plates(&t, &[a.clone(), b.clone()], &[Plate::new("a", 2)], true).unwrap();
        assert_eq!(out.data().to_vec(), vec![3.0, 4.0, 5.0]);
        assert_eq!(left, vec![b.clone()]);

        let (out, left) = reduce_plates(&t, &[a.clone(), b.clone()], &[b.clone(), a], true).unwrap();
        assert_eq!(out.item().unwrap(), 4.0);
        assert!(left.is_empty());

        assert!(matches!(
            reduce_plates(&t, &[Plate::new("a", 2), b], &[Plate::new("c", 2)], true),
            Err(StorchError::ShapeError(_))
        ));
    }

    #[test]
    fn test_merge_plates_keeps_first_appearance() {
        let a = Plate::new("a", 2);
        let b = Plate::new("b", 3);
        let c = Plate::new("c", 4);
        let merged = merge_plates([&[a.clone(), b.clone()][..], &[c.clone(), a.clone()][..]]);
        assert_eq!(merged, vec![a, b, c]);
    }

    #[test]
    fn test_align_plates_permutes_and_inserts() {
        let a = Plate::new("a", 2);
        let b = Plate::new("b", 3);
        let c = Plate::new("c", 4);
        // [b, a] with one event axis of size 5
        let t = Variable::constant(Tensor::zeros([3, 2, 5]));
        let out = align_plates(&t, &[b.clone(), a.clone()], &[a.clone(), c, b.clone()]).unwrap();
        assert_eq!(out.dims(), &[2, 1, 3, 5]);
    }

    #[test]
    fn test_align_plates_squeezes_single_plates() {
        let one = Plate::new("one", 1);
        let a = Plate::new("a", 2);
        let t = Variable::constant(Tensor::zeros([1, 2]));
        let out = align_plates(&t, &[one, a.clone()], &[a]).unwrap();
        assert_eq!(out.dims(), &[2]);
    }

    #[test]
    fn test_align_plates_values_follow_permutation() {
        let a = Plate::new("a", 2);
        let b = Plate::new("b", 3);
        let t = Variable::constant(
            Tensor::from_vec((0..6).map(f64::from).collect(), [2, 3]).unwrap(),
        );
        let out = align_plates(&t, &[a.clone(), b.clone()], &[b, a]).unwrap();
        assert_eq!(out.dims(), &[3, 2]);
        assert_eq!(out.data().to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_align_plates_rejects_dropping_multi_dim_plate() {
        let a = Plate::new("a", 2);
        let t = Variable::constant(Tensor::zeros([2]));
        assert!(matches!(
            align_plates(&t, &[a], &[]),
            Err(StorchError::ShapeError(_))
        ));
    }
}
