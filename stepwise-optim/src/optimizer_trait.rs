use stepwise_core::{Result, SharedParameter};

use crate::optimizer_state::OptimizerState;

/// Common interface of every update algorithm.
///
/// Optimizers update the parameters they were built with, in place, using the
/// gradient currently attached to each parameter.
pub trait Optimizer {
    /// Applies one update to every parameter that has a gradient.
    ///
    /// Parameters without a gradient are skipped and their state is left
    /// untouched.
    fn step(&mut self) -> Result<()>;

    /// Zero-fills dense gradients and empties sparse ones. Absent gradients
    /// stay absent.
    fn zero_grad(&mut self) -> Result<()>;

    /// Sets the learning rate of every parameter group.
    fn set_learning_rate(&mut self, lr: f32);

    /// Current learning rate of each group, in group order.
    fn learning_rates(&self) -> Vec<f32>;

    /// Parameters of each group, in group order.
    fn group_params(&self) -> Vec<Vec<SharedParameter>>;

    /// Snapshot of the groups and per-parameter accumulators.
    fn state_dict(&self) -> OptimizerState;

    /// Restores accumulators saved by `state_dict`.
    ///
    /// The record must describe the same groups with the same number of
    /// parameters, and every accumulator must fit its parameter. The
    /// hyperparameters this optimizer was built with are kept.
    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;
}
