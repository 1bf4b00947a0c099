use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Result, SharedParameter, StepwiseError, Tensor};

use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{
    flat_params, require_dense, validate_groups, zero_grad_groups, HyperParams, ParamGroup,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdadeltaHyperParams {
    pub lr: f32,
    pub rho: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdadeltaHyperParams {
    fn default() -> Self {
        AdadeltaHyperParams {
            lr: 1.0,
            rho: 0.9,
            eps: 1e-6,
            weight_decay: 0.0,
        }
    }
}

impl HyperParams for AdadeltaHyperParams {
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
        if !(0.0..=1.0).contains(&self.rho) {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid rho value: {}",
                self.rho
            )));
        }
        if self.eps < 0.0 {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid epsilon value: {}",
                self.eps
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(StepwiseError::ConfigurationError(format!(
                "Invalid weight_decay value: {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdadeltaParamState {
    pub step: u64,
    pub square_avg: Tensor,
    pub acc_delta: Tensor,
}

impl ParamState<AdadeltaHyperParams> for AdadeltaParamState {
    fn check_shape(&self, shape: &[usize], _options: &AdadeltaHyperParams) -> Result<()> {
        expect_shape(&self.square_avg, shape, "square_avg")?;
        expect_shape(&self.acc_delta, shape, "acc_delta")
    }
}

/// Adadelta: step sizes from the ratio of running RMS of past updates to
/// running RMS of gradients.
#[derive(Debug)]
pub struct AdadeltaOptimizer {
    param_groups: Vec<ParamGroup<AdadeltaHyperParams>>,
    state: BTreeMap<usize, AdadeltaParamState>,
}

impl AdadeltaOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: AdadeltaHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<AdadeltaHyperParams>>) -> Result<Self> {
        validate_groups("Adadelta", &param_groups)?;
        log::info!("Created Adadelta optimizer with {} parameter group(s)", param_groups.len());
        Ok(AdadeltaOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<AdadeltaHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&AdadeltaParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for AdadeltaOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "Adadelta step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let Some(grad) = grad else {
                continue;
            };
            let mut g = require_dense(grad, "Adadelta")?.clone();
            if options.weight_decay != 0.0 {
                g.add_scaled_(tensor, options.weight_decay)?;
            }

            let state = self.state.entry(index).or_insert_with(|| AdadeltaParamState {
                step: 0,
                square_avg: Tensor::zeros_like(tensor),
                acc_delta: Tensor::zeros_like(tensor),
            });
            state.step += 1;
            let (rho, eps) = (options.rho, options.eps);

            state.square_avg.mul_scalar_(rho);
            state.square_avg.addcmul_(1.0 - rho, &g, &g)?;
            let std = state.square_avg.map(|v| (v + eps).sqrt());
            let delta = state
                .acc_delta
                .map(|a| (a + eps).sqrt())
                .div(&std)?
                .zip_map(&g, |ratio, gi| ratio * gi)?;
            tensor.add_scaled_(&delta, -options.lr)?;
            state.acc_delta.mul_scalar_(rho);
            state.acc_delta.addcmul_(1.0 - rho, &delta, &delta)?;
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
        OptimizerState::Adadelta(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::Adadelta(record) = state else {
            return Err(state.kind_mismatch("adadelta"));
        };
        self.state = load_record("Adadelta", &self.param_groups, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_vec_f32_eq, param_with_grad, set_sparse_grad, values};
    use stepwise_core::Parameter;

    #[test]
    fn test_adadelta_first_step() -> Result<()> {
        let param = param_with_grad(vec![1.0], vec![1], vec![1.0]);
        let mut optimizer = AdadeltaOptimizer::new(vec![param.clone()], AdadeltaHyperParams::default())?;
        optimizer.step()?;
        // square_avg = 0.1; delta = sqrt(1e-6) / sqrt(0.1 + 1e-6)
        let delta = (1e-6f32).sqrt() / (0.1f32 + 1e-6).sqrt();
        assert_vec_f32_eq(&values(&param), &[1.0 - delta], 1e-7);
        let state = optimizer.state(0).unwrap();
        assert_vec_f32_eq(state.square_avg.data(), &[0.1], 1e-7);
        assert_vec_f32_eq(state.acc_delta.data(), &[0.1 * delta * delta], 1e-9);
        Ok(())
    }

    #[test]
    fn test_adadelta_rejects_sparse() -> Result<()> {
        let param = Parameter::new_unnamed(Tensor::zeros(&[2, 1])).shared();
        set_sparse_grad(&param, vec![0], vec![1.0]);
        let mut optimizer = AdadeltaOptimizer::new(vec![param], AdadeltaHyperParams::default())?;
        assert!(matches!(
            optimizer.step(),
            Err(StepwiseError::SparseGradientUnsupported { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_adadelta_rho_out_of_range() {
        let options = AdadeltaHyperParams {
            rho: 1.5,
            ..Default::default()
        };
        assert!(AdadeltaOptimizer::new(vec![], options).is_err());
    }
}
