use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Gradient, Result, SharedParameter, StepwiseError, Tensor};

use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{flat_params, validate_groups, zero_grad_groups, HyperParams, ParamGroup};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdHyperParams {
    pub lr: f32,
    pub momentum: f32,
    pub dampening: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
}

impl SgdHyperParams {
    /// Plain SGD: no momentum, no weight decay.
    pub fn with_lr(lr: f32) -> Self {
        SgdHyperParams {
            lr,
            ..Default::default()
        }
    }
}

impl Default for SgdHyperParams {
    fn default() -> Self {
        SgdHyperParams {
            lr: 1.0,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

impl HyperParams for SgdHyperParams {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        if self.lr < 0.0 {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid learning rate: {}",
                self.lr
            )));
        }
        if self.momentum < 0.0 {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid momentum value: {}",
                self.momentum
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        if self.nesterov && (self.momentum <= 0.0 || self.dampening != 0.0) {
            return Err(StepwiseError::ConfigurationError(
                "Nesterov momentum requires a momentum and zero dampening".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdParamState {
    pub momentum_buffer: Tensor,
}

impl ParamState<SgdHyperParams> for SgdParamState {
    fn check_shape(&self, shape: &[usize], _options: &SgdHyperParams) -> Result<()> {
        expect_shape(&self.momentum_buffer, shape, "momentum_buffer")
    }
}

/// Stochastic gradient descent with optional momentum, dampening, Nesterov
/// momentum and L2 weight decay.
///
/// Sparse gradients are accepted when momentum and weight decay are both off;
/// only the rows present in the gradient move.
#[derive(Debug)]
pub struct SgdOptimizer {
    param_groups: Vec<ParamGroup<SgdHyperParams>>,
    state: BTreeMap<usize, SgdParamState>,
}

impl SgdOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: SgdHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<SgdHyperParams>>) -> Result<Self> {
        validate_groups("SGD", &param_groups)?;
        log::info!("Created SGD optimizer with {} parameter group(s)", param_groups.len());
        Ok(SgdOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<SgdHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&SgdParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for SgdOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "SGD step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let grad = match grad {
                Some(Gradient::Dense(g)) => g,
                Some(Gradient::Sparse(sparse)) => {
                    if options.momentum != 0.0 || options.weight_decay != 0.0 {
                        return Err(StepwiseError::SparseGradientUnsupported {
                            optimizer: "SGD with momentum or weight decay".to_string(),
                        });
                    }
                    let width = sparse.row_width();
                    let data = tensor.data_mut();
                    for (i, &row) in sparse.indices().iter().enumerate() {
                        let target = &mut data[row * width..(row + 1) * width];
                        for (p, g) in target.iter_mut().zip(sparse.row(i)) {
                            *p -= options.lr * g;
                        }
                    }
                    continue;
                }
                None => continue,
            };

            let mut d_p = grad.clone();
            if options.weight_decay != 0.0 {
                d_p.add_scaled_(tensor, options.weight_decay)?;
            }
            if options.momentum != 0.0 {
                let buf = match self.state.entry(index) {
                    Entry::Vacant(slot) => {
                        &slot
                            .insert(SgdParamState {
                                momentum_buffer: d_p.clone(),
                            })
                            .momentum_buffer
                    }
                    Entry::Occupied(slot) => {
                        let buf = &mut slot.into_mut().momentum_buffer;
                        buf.mul_scalar_(options.momentum);
                        buf.add_scaled_(&d_p, 1.0 - options.dampening)?;
                        &*buf
                    }
                };
                if options.nesterov {
                    d_p.add_scaled_(buf, options.momentum)?;
                } else {
                    d_p = buf.clone();
                }
            }
            tensor.add_scaled_(&d_p, -options.lr)?;
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
        OptimizerState::Sgd(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::Sgd(record) = state else {
            return Err(state.kind_mismatch("sgd"));
        };
        self.state = load_record("SGD", &self.param_groups, record)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "sgd_test.rs"]
mod tests;
