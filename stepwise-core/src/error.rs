use thiserror::Error;

/// Error type shared by every crate of the stepwise workspace.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum StepwiseError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?} during operation {operation}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
        operation: String,
    },

    #[error("Tensor creation error: data length {data_len} does not match shape {shape:?}")]
    TensorCreationError { data_len: usize, shape: Vec<usize> },

    #[error("Index out of bounds: index {index} for dimension of size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("{optimizer} does not support sparse gradients")]
    SparseGradientUnsupported { optimizer: String },

    #[error("{optimizer} only supports sparse gradients")]
    DenseGradientUnsupported { optimizer: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid value '{value}' for option '{option}'")]
    InvalidOption { option: String, value: String },

    #[error("State dict mismatch: {0}")]
    StateDictMismatch(String),

    #[error("Failed to acquire {lock_type} lock: {reason}")]
    LockError { lock_type: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Failure reported by a collaborator outside this workspace
    /// (autodiff graph, mixed-precision library).
    #[error("External error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, StepwiseError>;
