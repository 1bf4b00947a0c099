use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Result, SharedParameter, StepwiseError, Tensor};

use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{
    flat_params, require_dense, validate_groups, zero_grad_groups, HyperParams, ParamGroup,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamHyperParams {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub amsgrad: bool,
}

impl Default for AdamHyperParams {
    fn default() -> Self {
        AdamHyperParams {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

impl HyperParams for AdamHyperParams {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        validate_adam_like(self.lr, self.betas, self.eps)?;
        if self.weight_decay < 0.0 {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Checks shared by the Adam family: `lr >= 0`, betas in `[0, 1)`, `eps >= 0`.
pub(crate) fn validate_adam_like(lr: f32, betas: (f32, f32), eps: f32) -> Result<()> {
    if lr.is_nan() || lr < 0.0 {
        return Err(StepwiseError::ConfigurationError(format!(
            "Invalid learning rate: {} - should be >= 0.0",
            lr
        )));
    }
    if !(0.0..1.0).contains(&betas.0) {
        return Err(StepwiseError::ConfigurationError(format!(
            "Invalid beta1 parameter: {} - should be in [0.0, 1.0)",
            betas.0
        )));
    }
    if !(0.0..1.0).contains(&betas.1) {
        return Err(StepwiseError::ConfigurationError(format!(
            "Invalid beta2 parameter: {} - should be in [0.0, 1.0)",
            betas.1
        )));
    }
    if eps.is_nan() || eps < 0.0 {
        return Err(StepwiseError::ConfigurationError(format!(
            "Invalid epsilon value: {} - should be >= 0.0",
            eps
        )));
    }
    Ok(())
}

/// `1 - beta^step`, computed in f64.
pub(crate) fn bias_correction(beta: f32, step: u64) -> f32 {
    (1.0 - (beta as f64).powf(step as f64)) as f32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamParamState {
    pub step: u64,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
    pub max_exp_avg_sq: Option<Tensor>,
}

impl ParamState<AdamHyperParams> for AdamParamState {
    fn check_shape(&self, shape: &[usize], _options: &AdamHyperParams) -> Result<()> {
        expect_shape(&self.exp_avg, shape, "exp_avg")?;
        expect_shape(&self.exp_avg_sq, shape, "exp_avg_sq")?;
        if let Some(max) = &self.max_exp_avg_sq {
            expect_shape(max, shape, "max_exp_avg_sq")?;
        }
        Ok(())
    }
}

/// Adam with bias correction, optional L2 weight decay and AMSGrad.
#[derive(Debug)]
pub struct AdamOptimizer {
    param_groups: Vec<ParamGroup<AdamHyperParams>>,
    state: BTreeMap<usize, AdamParamState>,
}

impl AdamOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: AdamHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<AdamHyperParams>>) -> Result<Self> {
        validate_groups("Adam", &param_groups)?;
        log::info!("Created Adam optimizer with {} parameter group(s)", param_groups.len());
        Ok(AdamOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<AdamHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&AdamParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "Adam step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let Some(grad) = grad else {
                continue;
            };
            let mut g = require_dense(grad, "Adam")?.clone();
            if options.weight_decay != 0.0 {
                g.add_scaled_(tensor, options.weight_decay)?;
            }

            let state = self.state.entry(index).or_insert_with(|| {
                log::debug!("Adam: allocating state for parameter {}", index);
                AdamParamState {
                    step: 0,
                    exp_avg: Tensor::zeros_like(tensor),
                    exp_avg_sq: Tensor::zeros_like(tensor),
                    max_exp_avg_sq: options.amsgrad.then(|| Tensor::zeros_like(tensor)),
                }
            });
            state.step += 1;
            let (beta1, beta2) = options.betas;
            let bias_correction1 = bias_correction(beta1, state.step);
            let bias_correction2 = bias_correction(beta2, state.step);

            state.exp_avg.mul_scalar_(beta1);
            state.exp_avg.add_scaled_(&g, 1.0 - beta1)?;
            state.exp_avg_sq.mul_scalar_(beta2);
            state.exp_avg_sq.addcmul_(1.0 - beta2, &g, &g)?;

            let second_moment = match state.max_exp_avg_sq.as_mut() {
                Some(max) if options.amsgrad => {
                    max.max_(&state.exp_avg_sq)?;
                    &*max
                }
                _ => &state.exp_avg_sq,
            };
            let correction2_sqrt = bias_correction2.sqrt();
            let eps = options.eps;
            let update = state
                .exp_avg
                .zip_map(second_moment, |m, v| m / (v.sqrt() / correction2_sqrt + eps))?;
            tensor.add_scaled_(&update, -options.lr / bias_correction1)?;
        }
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        zero_grad_groups(&self.param_groups)
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.param_groups.iter_mut().for_each(|g| g.set_lr(lr));
    }

    fn learning_rates(&self) -> Vec<f32> {
        self.param_groups.iter().map(ParamGroup::lr).collect()
    }

    fn group_params(&self) -> Vec<Vec<SharedParameter>> {
        self.param_groups.iter().map(|g| g.params.clone()).collect()
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState::Adam(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::Adam(record) = state else {
            return Err(state.kind_mismatch("adam"));
        };
        self.state = load_record("Adam", &self.param_groups, record)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "adam_test.rs"]
mod tests;
