//! Walks over the node graph

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write;

use crate::{
    error::{StorchError, StorchResult},
    node::{Edge, NodeId, NodeKind, StorchTensor},
    tensor::Tensor,
};

pub use crate::autograd::{has_backwards_path, walk_backward_graph};

/// Order every node reachable from `costs` so that each appears after all of
/// its children (reverse Kahn).
///
/// Inputs must be cost nodes without live children. Tie order among ready
/// nodes follows the stack and carries no meaning.
pub fn topological_sort(costs: &[StorchTensor]) -> StorchResult<Vec<StorchTensor>> {
    for c in costs {
        if !c.is_cost() || c.has_children() {
            return Err(StorchError::InvalidInput(format!(
                "topological sort expects sink cost nodes, got {}",
                c
            )));
        }
    }

    let mut order = Vec::new();
    let mut emitted: HashSet<NodeId> = HashSet::new();
    let mut remaining: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut stack: Vec<StorchTensor> = costs.to_vec();
    while let Some(node) = stack.pop() {
        if !emitted.insert(node.id()) {
            continue;
        }
        for (parent, _) in node.parents() {
            let children = remaining.entry(parent.id()).or_insert_with(|| {
                parent.children().iter().map(|(child, _)| child.id()).collect()
            });
            // a child may list the same parent twice
            children.retain(|&id| id != node.id());
            if children.is_empty() {
                stack.push(parent.clone());
            }
        }
        order.push(node);
    }
    Ok(order)
}

fn walk(
    start: &StorchTensor,
    depth_first: bool,
    only_differentiable: bool,
    next: impl Fn(&StorchTensor) -> Vec<Edge>,
) -> Vec<StorchTensor> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut out = Vec::new();
    let admit = |edges: Vec<Edge>| -> Vec<StorchTensor> {
        edges
            .into_iter()
            .filter(|(_, d)| *d || !only_differentiable)
            .map(|(n, _)| n)
            .collect()
    };

    if depth_first {
        let mut stack: Vec<StorchTensor> = admit(next(start));
        stack.reverse();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id()) {
                continue;
            }
            let mut more = admit(next(&node));
            more.reverse();
            stack.extend(more);
            out.push(node);
        }
    } else {
        let mut queue: VecDeque<StorchTensor> = admit(next(start)).into();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.id()) {
                continue;
            }
            queue.extend(admit(next(&node)));
            out.push(node);
        }
    }
    out
}

/// Ancestors of `node`, each once; breadth-first yields shallowest first
pub fn walk_parents(
    node: &StorchTensor,
    depth_first: bool,
    only_differentiable: bool,
) -> Vec<StorchTensor> {
    walk(node, depth_first, only_differentiable, |n| n.parents().to_vec())
}

/// Live descendants of `node`, each once
pub fn walk_children(
    node: &StorchTensor,
    depth_first: bool,
    only_differentiable: bool,
) -> Vec<StorchTensor> {
    walk(node, depth_first, only_differentiable, |n| n.children())
}

/// Whether `output` is reachable from `input` over differentiable edges
pub fn has_differentiable_path(output: &StorchTensor, input: &StorchTensor) -> bool {
    walk_children(input, true, true)
        .iter()
        .any(|c| c == output)
}

/// One line per node in topological order followed by its incoming edges,
/// e.g. `s1-D->c1`. Labels count stochastic (`s`), cost (`c`) and other
/// (`d`) nodes separately.
pub fn describe_graph(costs: &[StorchTensor]) -> StorchResult<String> {
    let nodes = topological_sort(costs)?;
    let mut counters = [1usize; 3];
    let mut labels: HashMap<NodeId, String> = HashMap::new();
    let mut label = |node: &StorchTensor| -> String {
        labels
            .entry(node.id())
            .or_insert_with(|| {
                let (prefix, slot) = match node.kind() {
                    NodeKind::Stochastic(_) => ("s", 0),
                    NodeKind::Cost => ("c", 1),
                    NodeKind::Deterministic | NodeKind::Independent => ("d", 2),
                };
                let name = format!("{}{}", prefix, counters[slot]);
                counters[slot] += 1;
                name
            })
            .clone()
    };

    let mut out = String::new();
    for node in &nodes {
        let name = label(node);
        let _ = writeln!(out, "{} {}", name, node);
        for (parent, differentiable) in node.parents() {
            let edge = if *differentiable { "-D->" } else { "-X->" };
            let _ = writeln!(out, "{}{}{}", label(parent), edge, name);
        }
    }
    Ok(out)
}

/// Short summary of a tensor's values
pub fn tensor_stats(tensor: &Tensor) -> String {
    format!(
        "shape {} mean {:.3} std {:.3} max {:.3} min {:.3}",
        tensor.shape(),
        tensor.mean_all().as_slice().first().copied().unwrap_or(f64::NAN),
        tensor.std_value(),
        tensor.max_value(),
        tensor.min_value()
    )
}
