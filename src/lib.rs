//! storch - gradient estimation for stochastic computation graphs
//!
//! Features:
//! - Reverse-mode autodiff over `f64` tensors with broadcasting
//! - Plates: named batch axes with weighted reduction
//! - Deterministic, stochastic, independent and cost nodes with tracked edges
//! - Score-function and reparameterization estimators with baselines
//! - A backward pass that turns registered costs into one surrogate loss

pub mod autograd;
pub mod config;
pub mod context;
pub mod distributions;
pub mod error;
pub mod inference;
pub mod method;
pub mod node;
pub mod plate;
pub mod tensor;
pub mod traversal;

use std::str::FromStr;

pub use autograd::{no_grad, NoGradGuard, Variable};
pub use config::{ConfigBuilder, ConfigManager, StorchConfig};
pub use context::{IndependentSource, StorchContext};
pub use distributions::{Bernoulli, Distribution, Normal};
pub use error::{StorchError, StorchResult};
pub use method::{
    Baseline, BatchAverageBaseline, MovingAverageBaseline, Reparameterization, SamplingMethod,
    ScoreFunction,
};
pub use node::{AlignedStochastic, NodeKind, StorchTensor};
pub use plate::Plate;
pub use tensor::{Shape, Tensor};
pub use traversal::topological_sort;

/// Install a formatting subscriber at the configured log level.
///
/// Calling it again, or after another subscriber was installed, is a no-op.
pub fn init() -> StorchResult<()> {
    let config = config::get_config();
    let level = tracing::Level::from_str(&config.development.log_level).map_err(|e| {
        StorchError::ConfigurationError(format!(
            "invalid log level '{}': {}",
            config.development.log_level, e
        ))
    })?;
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .is_ok()
    {
        tracing::info!("storch initialized at log level {}", level);
    }
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
