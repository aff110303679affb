//! Surrogate-loss construction and the backward pass over registered costs

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::{
    autograd::Variable,
    context::StorchContext,
    error::{StorchError, StorchResult},
    node::{AlignedStochastic, NodeId, StorchTensor},
    plate::{format_plates, reduce_plates, Plate},
    tensor::Tensor,
    traversal::{describe_graph, tensor_stats, walk_parents},
};

/// Drop the remaining size-1 axes of a one-element tensor
fn collapse_to_scalar(tensor: &Variable) -> StorchResult<Variable> {
    if tensor.numel() != 1 {
        return Err(StorchError::shape_error(
            "a single element after reducing all plates",
            &tensor.shape().to_string(),
            Some("costs must have an empty event shape"),
        ));
    }
    if tensor.ndim() == 0 {
        Ok(tensor.clone())
    } else {
        tensor.reshape(&[])
    }
}

/// Plates of `parent` with the ones it shares with the cost first, in the
/// cost's order, followed by the rest in the parent's order
fn aligned_plate_order(parent: &StorchTensor, cost_plates: &[Plate]) -> Vec<Plate> {
    let mut order: Vec<Plate> = cost_plates
        .iter()
        .filter(|p| parent.plates().contains(p))
        .cloned()
        .collect();
    for plate in parent.plates() {
        if !order.contains(plate) {
            order.push(plate.clone());
        }
    }
    order
}

impl StorchContext {
    /// [`StorchContext::backward_with`] using the configured defaults
    pub fn backward(&mut self) -> StorchResult<(Tensor, Tensor)> {
        let options = self.config().backward.clone();
        self.backward_with(options.retain_graph, options.debug, options.print_costs)
    }

    /// Build the surrogate loss over all registered costs and backpropagate it.
    ///
    /// Returns `(total_cost, surrogate_loss)`: the summed plate-averaged costs
    /// and the loss whose gradient estimates the gradient of the expected
    /// cost. Unless `retain_graph` is set the registry is cleared afterwards.
    pub fn backward_with(
        &mut self,
        retain_graph: bool,
        debug: bool,
        print_costs: bool,
    ) -> StorchResult<(Tensor, Tensor)> {
        if self.costs.is_empty() {
            if debug {
                warn!("backward called without registered costs");
            }
            return Ok((Tensor::scalar(0.0), Tensor::scalar(0.0)));
        }
        let costs = self.costs.clone();
        if debug {
            match describe_graph(&costs) {
                Ok(graph) => debug!("stochastic graph:\n{}", graph),
                Err(e) => warn!("could not describe the stochastic graph: {}", e),
            }
        }

        let mut total_cost = Tensor::scalar(0.0);
        let mut accum_loss = Variable::scalar(0.0);
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stochastic_nodes: Vec<StorchTensor> = Vec::new();

        for c in &costs {
            // weights stay attached so weighted plates are optimized through the cost
            let (avg_cost, _) =
                reduce_plates(c.tensor(), c.plates(), &c.multi_dim_plates(), false)?;
            let avg_cost = collapse_to_scalar(&avg_cost)?;
            if print_costs {
                info!("{}: {}", c.name().unwrap_or("cost"), avg_cost.item()?);
            }
            total_cost = total_cost.add(avg_cost.data())?;

            for parent in walk_parents(c, false, false) {
                let Some(info) = parent.stochastic() else {
                    continue;
                };
                if seen.insert(parent.id()) {
                    stochastic_nodes.push(parent.clone());
                }
                if !info.requires_grad || !info.method.adds_loss(&parent, c) {
                    continue;
                }

                let absent: Vec<Plate> = c
                    .multi_dim_plates()
                    .into_iter()
                    .filter(|p| !parent.plates().contains(p))
                    .collect();
                let (reduced_cost, cost_plates) =
                    reduce_plates(c.tensor(), c.plates(), &absent, true)?;

                let view = AlignedStochastic::new(&parent, aligned_plate_order(&parent, &cost_plates))?;
                let mut cost_per_sample = info.method.estimate(&view, &reduced_cost, &cost_plates)?;
                for (axis, plate) in view.plates().iter().enumerate().rev() {
                    if plate.is_multi_dim() {
                        cost_per_sample = plate.reduce_axis(&cost_per_sample, axis, true)?;
                    }
                }
                let final_cost = collapse_to_scalar(&cost_per_sample)?;

                if debug {
                    debug!(
                        "{} for {} over {}: reduced cost {}, surrogate {}",
                        info.method.name(),
                        parent,
                        format_plates(view.plates()),
                        tensor_stats(reduced_cost.data()),
                        final_cost.data()
                    );
                }
                accum_loss = accum_loss.add(&final_cost)?;
            }

            // ordinary differentiable paths from parameters to the cost
            if avg_cost.requires_grad() {
                accum_loss = accum_loss.add(&avg_cost)?;
            }
        }

        if accum_loss.requires_grad() {
            accum_loss.backward(retain_graph)?;
        }

        for node in &stochastic_nodes {
            if let Some(info) = node.stochastic() {
                info.method.update_parameters()?;
            }
        }

        if !retain_graph {
            self.reset();
        }
        Ok((total_cost, accum_loss.data().clone()))
    }
}
