//! Automatic differentiation system with computation graph
//!
//! This module implements reverse-mode automatic differentiation with a dynamic
//! computation graph. It is the engine the stochastic-graph layer composes its
//! surrogate losses on; it knows nothing about plates or sampling.

pub mod function;
pub mod graph;
pub mod ops;
pub mod variable;

use std::cell::Cell;

pub use function::{Function, GradFn};
pub use graph::{backward, has_backwards_path, walk_backward_graph};
pub use variable::{Variable, VariableId};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = Cell::new(true);
}

/// Whether differentiable ops currently record their history on this thread
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

/// Disables gradient recording until dropped
pub struct NoGradGuard {
    previous: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let previous = GRAD_ENABLED.with(|g| g.replace(false));
        Self { previous }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.previous));
    }
}

/// Run `f` with gradient recording disabled
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    let _guard = NoGradGuard::new();
    f()
}
