use std::fmt;

use stepwise_core::{read_param, Backward, Result, SharedParameter, StepwiseError};

use crate::amp::{LossScale, MixedPrecision};
use crate::base::{build_optimizer, BaseOptimizer};
use crate::checkpoint::{Checkpoint, ControllerState};
use crate::grad_clipping::clip_grad_norm_;
use crate::lr_scheduler::DecaySchedule;
use crate::optimizer_trait::Optimizer;
use crate::options::{ModelDtype, OptimKind, ResetPolicy, TrainOptions};

/// Single entry point of the training loop into the update subsystem.
///
/// Wraps one optimizer and owns the two step counters, the decay schedule,
/// the clipping threshold and, for fp16 models, the mixed-precision hook.
/// Both counters start at 1 and advance together on every successful
/// [`step`](OptimizerController::step); they only differ after a restore
/// that sets one but not the other.
pub struct OptimizerController {
    optimizer: BaseOptimizer,
    base_learning_rate: f32,
    schedule: Option<DecaySchedule>,
    max_grad_norm: f32,
    training_step: u64,
    decay_step: u64,
    mixed_precision: Option<Box<dyn MixedPrecision>>,
}

impl OptimizerController {
    /// Wraps `optimizer`. An absent `max_grad_norm` disables clipping.
    pub fn new(
        optimizer: BaseOptimizer,
        learning_rate: f32,
        schedule: Option<DecaySchedule>,
        max_grad_norm: Option<f32>,
    ) -> Self {
        OptimizerController {
            optimizer,
            base_learning_rate: learning_rate,
            schedule,
            max_grad_norm: max_grad_norm.unwrap_or(0.0),
            training_step: 1,
            decay_step: 1,
            mixed_precision: None,
        }
    }

    /// Builds the controller for a run, resuming from `checkpoint` when
    /// `options.train_from` is set and the checkpoint carries optimizer state.
    ///
    /// `options.reset_optim` decides what is taken from the checkpoint:
    /// `none` keeps its options and full state, `all` ignores it, `states`
    /// keeps its options and counters but not the accumulators, and
    /// `keep_states` builds from the fresh options and loads the saved
    /// counters and accumulators into them.
    ///
    /// # Errors
    /// `InvalidOption` for unknown option values, `ConfigurationError` for
    /// invalid hyperparameters or an fp16 model without a mixed-precision
    /// hook, `StateDictMismatch` when the saved accumulators do not fit the
    /// parameters.
    pub fn from_options(
        params: &[SharedParameter],
        options: &TrainOptions,
        checkpoint: Option<&Checkpoint>,
        mixed_precision: Option<Box<dyn MixedPrecision>>,
    ) -> Result<Self> {
        let policy = options.reset_policy()?;
        let mut optim_options = options.clone();
        let mut restored: Option<ControllerState> = None;
        let saved = options
            .train_from
            .as_ref()
            .and_then(|_| checkpoint)
            .and_then(|ckpt| ckpt.optim.clone().map(|optim| (ckpt, optim)));
        if let Some((ckpt, optim)) = saved {
            let state = optim.normalize();
            log::info!("Restoring optimizer with reset policy {:?}", policy);
            match policy {
                ResetPolicy::None => {
                    optim_options = ckpt.opt.clone();
                    restored = Some(state);
                }
                ResetPolicy::All => {}
                ResetPolicy::States => {
                    optim_options = ckpt.opt.clone();
                    restored = Some(ControllerState {
                        optimizer: None,
                        ..state
                    });
                }
                ResetPolicy::KeepStates => restored = Some(state),
            }
        }

        let optimizer = build_optimizer(params, &optim_options)?;
        let schedule = DecaySchedule::from_options(&optim_options)?;
        let mut controller = Self::new(
            optimizer,
            optim_options.learning_rate,
            schedule,
            optim_options.max_grad_norm,
        );

        match optim_options.dtype()? {
            ModelDtype::Fp16 => {
                let mut hook = mixed_precision.ok_or_else(|| {
                    StepwiseError::ConfigurationError(
                        "fp16 training requires a mixed-precision hook".to_string(),
                    )
                })?;
                let keep_batchnorm_fp32 =
                    (optim_options.optim_kind()? == OptimKind::FusedAdam).then_some(false);
                let mut trainable = Vec::with_capacity(params.len());
                for param in params {
                    if read_param(param, "from_options")?.requires_grad() {
                        trainable.push(param.clone());
                    }
                }
                hook.initialize(
                    &trainable,
                    &optim_options.apex_opt_level,
                    LossScale::from_option(optim_options.loss_scale),
                    keep_batchnorm_fp32,
                )?;
                controller.mixed_precision = Some(hook);
            }
            ModelDtype::Fp32 => {
                if mixed_precision.is_some() {
                    log::debug!("Ignoring mixed-precision hook for an fp32 model");
                }
            }
        }

        if let Some(state) = restored {
            controller.load_state_dict(&state)?;
        }
        Ok(controller)
    }

    pub fn training_step(&self) -> u64 {
        self.training_step
    }

    pub fn decay_step(&self) -> u64 {
        self.decay_step
    }

    /// Learning rate the next step will use.
    pub fn learning_rate(&self) -> f32 {
        match &self.schedule {
            Some(schedule) => (schedule.scale(self.decay_step) * self.base_learning_rate as f64) as f32,
            None => self.base_learning_rate,
        }
    }

    pub fn schedule(&self) -> Option<&DecaySchedule> {
        self.schedule.as_ref()
    }

    pub fn optimizer(&self) -> &BaseOptimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut BaseOptimizer {
        &mut self.optimizer
    }

    pub fn max_grad_norm(&self) -> f32 {
        self.max_grad_norm
    }

    pub fn uses_mixed_precision(&self) -> bool {
        self.mixed_precision.is_some()
    }

    /// Zeroes every gradient the wrapped optimizer owns.
    pub fn zero_grad(&mut self) -> Result<()> {
        self.optimizer.zero_grad()
    }

    /// Accumulates gradients of `loss`, through the loss scaler for fp16.
    pub fn backward(&mut self, loss: &dyn Backward) -> Result<()> {
        match self.mixed_precision.as_mut() {
            Some(hook) => hook.scale_loss(loss, &mut |scaled| scaled.backward()),
            None => loss.backward(),
        }
    }

    /// Updates the parameters with the current gradients.
    ///
    /// Sets every group to the scheduled learning rate, clips gradients when
    /// a threshold is configured, runs the optimizer and advances both
    /// counters. On error the counters are left as they were.
    pub fn step(&mut self) -> Result<()> {
        let learning_rate = self.learning_rate();
        log::debug!(
            "Step {} (decay step {}): learning rate {}",
            self.training_step,
            self.decay_step,
            learning_rate
        );

        if let Some(hook) = self.mixed_precision.as_mut() {
            hook.update_master_grads()?;
            if self.max_grad_norm > 0.0 {
                let norm = clip_grad_norm_(&hook.master_params(), self.max_grad_norm)?;
                log::debug!("Master gradient norm before clipping: {}", norm);
            }
        }

        self.optimizer.set_learning_rate(learning_rate);

        if self.mixed_precision.is_none() && self.max_grad_norm > 0.0 {
            for (i, group) in self.optimizer.group_params().iter().enumerate() {
                let norm = clip_grad_norm_(group, self.max_grad_norm)?;
                log::debug!("Group {} gradient norm before clipping: {}", i, norm);
            }
        }

        self.optimizer.step()?;
        self.decay_step += 1;
        self.training_step += 1;
        Ok(())
    }

    pub fn state_dict(&self) -> ControllerState {
        ControllerState {
            training_step: self.training_step,
            decay_step: Some(self.decay_step),
            optimizer: Some(self.optimizer.state_dict()),
        }
    }

    /// Restores counters and accumulators. A missing `decay_step` or
    /// `optimizer` leaves the current value in place.
    pub fn load_state_dict(&mut self, state: &ControllerState) -> Result<()> {
        if let Some(optimizer) = &state.optimizer {
            self.optimizer.load_state_dict(optimizer)?;
        }
        self.training_step = state.training_step;
        if let Some(decay_step) = state.decay_step {
            self.decay_step = decay_step;
        }
        log::info!(
            "Restored optimizer at training step {}, decay step {}",
            self.training_step,
            self.decay_step
        );
        Ok(())
    }
}

impl fmt::Debug for OptimizerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizerController")
            .field("optimizer", &self.optimizer.kind())
            .field("base_learning_rate", &self.base_learning_rate)
            .field("schedule", &self.schedule)
            .field("max_grad_norm", &self.max_grad_norm)
            .field("training_step", &self.training_step)
            .field("decay_step", &self.decay_step)
            .field("mixed_precision", &self.mixed_precision.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
