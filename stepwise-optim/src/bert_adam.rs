use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Result, SharedParameter, Tensor};

use crate::adam::validate_adam_like;
use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{
    flat_params, require_dense, validate_groups, zero_grad_groups, HyperParams, ParamGroup,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertAdamHyperParams {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    /// Recorded with the group; clipping itself is done by the controller.
    pub max_grad_norm: f32,
}

impl Default for BertAdamHyperParams {
    fn default() -> Self {
        BertAdamHyperParams {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-6,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
        }
    }
}

impl HyperParams for BertAdamHyperParams {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        validate_adam_like(self.lr, self.betas, self.eps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertAdamParamState {
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

impl ParamState<BertAdamHyperParams> for BertAdamParamState {
    fn check_shape(&self, shape: &[usize], _options: &BertAdamHyperParams) -> Result<()> {
        expect_shape(&self.exp_avg, shape, "exp_avg")?;
        expect_shape(&self.exp_avg_sq, shape, "exp_avg_sq")
    }
}

/// Adam with decoupled weight decay and no bias correction.
///
/// The decay term `weight_decay * p` is added to the normalized update rather
/// than to the gradient, so it never enters the moment estimates.
#[derive(Debug)]
pub struct BertAdamOptimizer {
    param_groups: Vec<ParamGroup<BertAdamHyperParams>>,
    state: BTreeMap<usize, BertAdamParamState>,
}

impl BertAdamOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: BertAdamHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<BertAdamHyperParams>>) -> Result<Self> {
        validate_groups("BertAdam", &param_groups)?;
        log::info!("Created BertAdam optimizer with {} parameter group(s)", param_groups.len());
        Ok(BertAdamOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<BertAdamHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&BertAdamParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for BertAdamOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "BertAdam step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let Some(grad) = grad else {
                continue;
            };
            let g = require_dense(grad, "BertAdam")?;

            let state = self.state.entry(index).or_insert_with(|| BertAdamParamState {
                exp_avg: Tensor::zeros_like(tensor),
                exp_avg_sq: Tensor::zeros_like(tensor),
            });
            let (beta1, beta2) = options.betas;
            state.exp_avg.mul_scalar_(beta1);
            state.exp_avg.add_scaled_(g, 1.0 - beta1)?;
            state.exp_avg_sq.mul_scalar_(beta2);
            state.exp_avg_sq.addcmul_(1.0 - beta2, g, g)?;

            let eps = options.eps;
            let mut update = state
                .exp_avg
                .zip_map(&state.exp_avg_sq, |m, v| m / (v.sqrt() + eps))?;
            if options.weight_decay > 0.0 {
                update.add_scaled_(tensor, options.weight_decay)?;
            }
            tensor.add_scaled_(&update, -options.lr)?;
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
        OptimizerState::BertAdam(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::BertAdam(record) = state else {
            return Err(state.kind_mismatch("bert_adam"));
        };
        self.state = load_record("BertAdam", &self.param_groups, record)?;
        Ok(())
    }
}
