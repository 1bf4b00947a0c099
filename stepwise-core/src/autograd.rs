use crate::error::Result;

/// Seam to the external autodiff graph.
///
/// A loss handed to the optimizer controller only needs to know how to push
/// gradients into the parameters it depends on. How the graph is built and
/// traversed is not this workspace's concern.
pub trait Backward {
    /// Accumulates gradients of this value into every parameter it depends on.
    fn backward(&self) -> Result<()>;
}

impl<F> Backward for F
where
    F: Fn() -> Result<()>,
{
    fn backward(&self) -> Result<()> {
        self()
    }
}
