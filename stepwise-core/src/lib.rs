//! Tensor and parameter substrate for the stepwise optimizers.
//!
//! Holds the dense `Tensor`, the row-sparse gradient representation, the
//! shared `Parameter` handle the optimizers mutate, and the error type used
//! across the workspace.

pub mod autograd;
pub mod error;
pub mod gradient;
pub mod parameter;
pub mod tensor;

pub use autograd::Backward;
pub use error::{Result, StepwiseError};
pub use gradient::{Gradient, SparseGradient};
pub use parameter::{read_param, write_param, Parameter, SharedParameter};
pub use tensor::Tensor;
