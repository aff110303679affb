//! Dense CPU tensors backing the autograd engine
//!
//! Storage is a shared, immutable row-major `f64` buffer. Every operation
//! returns a new tensor; nothing here mutates a buffer in place.

pub mod core;
pub mod ops;

// Re-export main types for convenience
pub use self::core::{Shape, Tensor};
pub use self::ops::broadcast_shape;
