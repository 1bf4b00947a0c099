//! Optimizers, learning-rate schedules and the training-step controller.
//!
//! The training loop talks to [`OptimizerController`]: it builds the
//! configured optimizer from [`TrainOptions`], applies the decay schedule and
//! gradient clipping on every step, and saves or restores its state through
//! [`Checkpoint`]s.

pub mod adadelta;
pub mod adafactor;
pub mod adagrad;
pub mod adam;
pub mod amp;
pub mod base;
pub mod bert_adam;
pub mod checkpoint;
pub mod controller;
pub mod grad_clipping;
pub mod lr_scheduler;
pub mod multiple;
pub mod optimizer_state;
pub mod optimizer_trait;
pub mod options;
pub mod param_group;
pub mod sgd;
pub mod sparse_adam;

pub use adadelta::{AdadeltaHyperParams, AdadeltaOptimizer};
pub use adafactor::{AdafactorHyperParams, AdafactorOptimizer, MomentCorrection};
pub use adagrad::{AdagradHyperParams, AdagradOptimizer};
pub use adam::{AdamHyperParams, AdamOptimizer};
pub use amp::{LossScale, MixedPrecision};
pub use base::{build_optimizer, BaseOptimizer};
pub use bert_adam::{BertAdamHyperParams, BertAdamOptimizer};
pub use checkpoint::{Checkpoint, ControllerState, LegacyOptimizer, SavedOptimizer};
pub use controller::OptimizerController;
pub use grad_clipping::{clip_grad_norm_, total_grad_norm};
pub use lr_scheduler::DecaySchedule;
pub use multiple::MultipleOptimizer;
pub use optimizer_state::OptimizerState;
pub use optimizer_trait::Optimizer;
pub use options::{DecayMethod, ModelDtype, OptimKind, ResetPolicy, TrainOptions};
pub use param_group::{HyperParams, ParamGroup};
pub use sgd::{SgdHyperParams, SgdOptimizer};
pub use sparse_adam::{SparseAdamHyperParams, SparseAdamOptimizer};

#[cfg(test)]
mod test_utils;
