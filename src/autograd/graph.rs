//! Reverse-mode backward pass and walks over the recorded computation

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    error::{StorchError, StorchResult},
    tensor::Tensor,
};
use super::variable::{Variable, VariableId};

/// Variables reachable from `root` through recorded functions, inputs before outputs
fn topological_order(root: &Variable) -> Vec<Variable> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // explicit stack: (variable, inputs already expanded)
    let mut stack = vec![(root.clone(), false)];
    while let Some((var, expanded)) = stack.pop() {
        if expanded {
            order.push(var);
            continue;
        }
        if !visited.insert(var.id()) {
            continue;
        }
        stack.push((var.clone(), true));
        if let Some(grad_fn) = var.grad_fn() {
            for input in grad_fn.next_variables().iter().rev() {
                if !visited.contains(&input.id()) {
                    stack.push((input.clone(), false));
                }
            }
        }
    }
    order
}

/// Perform backward pass from a one-element root
pub fn backward(root: &Variable, retain_graph: bool) -> StorchResult<()> {
    if root.numel() != 1 {
        return Err(StorchError::shape_error(
            "a one-element loss",
            &root.shape().to_string(),
            Some("reduce the loss before calling backward"),
        ));
    }
    if !root.requires_grad() {
        return Err(StorchError::InvalidState(
            "backward called on a variable that does not require grad".to_string(),
        ));
    }

    let order = topological_order(root);
    let mut grads: HashMap<VariableId, Tensor> = HashMap::new();
    grads.insert(root.id(), Tensor::ones(root.shape().clone()));

    // Traverse in reverse topological order
    for var in order.iter().rev() {
        let grad = match grads.remove(&var.id()) {
            Some(g) => g,
            None => continue,
        };
        match var.grad_fn() {
            Some(grad_fn) => {
                if grad_fn.is_released() {
                    return Err(StorchError::InvalidState(format!(
                        "trying to backward through {} a second time; pass retain_graph = true on the first call",
                        grad_fn.name()
                    )));
                }
                let input_grads = grad_fn.apply(&grad)?;
                for (input, input_grad) in grad_fn.next_variables().iter().zip(input_grads) {
                    let Some(input_grad) = input_grad else { continue };
                    if !input.requires_grad() {
                        continue;
                    }
                    let next = match grads.remove(&input.id()) {
                        Some(existing) => existing.add(&input_grad)?,
                        None => input_grad,
                    };
                    grads.insert(input.id(), next);
                }
            }
            None => {
                if var.requires_grad() {
                    var.accumulate_grad(grad)?;
                }
            }
        }
    }

    if !retain_graph {
        for var in &order {
            if let Some(grad_fn) = var.grad_fn() {
                grad_fn.release();
            }
        }
    }
    Ok(())
}

/// Predecessors of `var` in its recorded computation, each reported once
pub fn walk_backward_graph(var: &Variable, depth_first: bool) -> StorchResult<Vec<Variable>> {
    let grad_fn = var.grad_fn().ok_or_else(|| {
        StorchError::InvalidInput(
            "can only walk backward over graphs with a gradient function".to_string(),
        )
    })?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    if depth_first {
        let mut stack: Vec<Variable> = grad_fn.next_variables().iter().rev().cloned().collect();
        while let Some(v) = stack.pop() {
            if !seen.insert(v.id()) {
                continue;
            }
            if let Some(gf) = v.grad_fn() {
                stack.extend(gf.next_variables().iter().rev().cloned());
            }
            out.push(v);
        }
    } else {
        let mut queue: VecDeque<Variable> = grad_fn.next_variables().iter().cloned().collect();
        while let Some(v) = queue.pop_front() {
            if !seen.insert(v.id()) {
                continue;
            }
            if let Some(gf) = v.grad_fn() {
                queue.extend(gf.next_variables().iter().cloned());
            }
            out.push(v);
        }
    }
    Ok(out)
}

/// Whether `input` influences any of `outputs` differentiably.
///
/// True when `input` requires grad and is either one of the outputs (e.g. a
/// distribution parameter passed straight through) or a predecessor of one.
pub fn has_backwards_path(outputs: &[Variable], input: &Variable) -> StorchResult<bool> {
    if !input.requires_grad() {
        return Ok(false);
    }
    for output in outputs {
        if output.same_as(input) {
            return Ok(true);
        }
        if output.grad_fn().is_none() {
            continue;
        }
        if walk_backward_graph(output, false)?
            .iter()
            .any(|p| p.same_as(input))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_accumulates_shared_input() {
        let x = Variable::parameter(Tensor::scalar(3.0));
        // y = x * x + x  => dy/dx = 2x + 1 = 7
        let y = x.mul(&x).unwrap().add(&x).unwrap();
        y.backward(false).unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 7.0);
    }

    #[test]
    fn test_backward_rejects_non_scalar_and_constant() {
        let x = Variable::parameter(Tensor::ones([2]));
        assert!(matches!(
            x.mul_scalar(2.0).backward(false),
            Err(StorchError::ShapeError(_))
        ));
        assert!(matches!(
            Variable::scalar(1.0).backward(false),
            Err(StorchError::InvalidState(_))
        ));
    }

    #[test]
    fn test_second_backward_requires_retained_graph() {
        let x = Variable::parameter(Tensor::scalar(2.0));
        let y = x.square();
        y.backward(true).unwrap();
        y.backward(false).unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 8.0);
        assert!(matches!(y.backward(false), Err(StorchError::InvalidState(_))));
    }

    #[test]
    fn test_walk_backward_graph_orders() {
        let a = Variable::parameter(Tensor::scalar(1.0));
        let b = Variable::parameter(Tensor::scalar(2.0));
        let c = a.mul(&b).unwrap();
        let d = c.add(&a).unwrap();

        let bfs = walk_backward_graph(&d, false).unwrap();
        assert!(bfs[0].same_as(&c));
        assert!(bfs[1].same_as(&a));
        assert_eq!(bfs.len(), 3);

        let dfs = walk_backward_graph(&d, true).unwrap();
        assert!(dfs[0].same_as(&c));
        assert!(dfs[1].same_as(&a));
        assert!(dfs[2].same_as(&b));

        assert!(walk_backward_graph(&a, true).is_err());
    }

    #[test]
    fn test_has_backwards_path() {
        let a = Variable::parameter(Tensor::scalar(1.0));
        let unrelated = Variable::parameter(Tensor::scalar(1.0));
        let frozen = Variable::constant(Tensor::scalar(1.0));
        let out = a.mul(&frozen).unwrap().exp();

        assert!(has_backwards_path(&[out.clone()], &a).unwrap());
        assert!(has_backwards_path(&[a.clone()], &a).unwrap());
        assert!(!has_backwards_path(&[out.clone()], &unrelated).unwrap());
        assert!(!has_backwards_path(&[out.detach()], &a).unwrap());
        assert!(!has_backwards_path(&[out], &frozen).unwrap());
    }
}
