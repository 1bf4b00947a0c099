use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Gradient, Result, SharedParameter, StepwiseError, Tensor};

use crate::adam::{bias_correction, validate_adam_like};
use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{flat_params, validate_groups, zero_grad_groups, HyperParams, ParamGroup};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseAdamHyperParams {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
}

impl Default for SparseAdamHyperParams {
    fn default() -> Self {
        SparseAdamHyperParams {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }
}

impl HyperParams for SparseAdamHyperParams {
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
pub struct SparseAdamParamState {
    pub step: u64,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

impl ParamState<SparseAdamHyperParams> for SparseAdamParamState {
    fn check_shape(&self, shape: &[usize], _options: &SparseAdamHyperParams) -> Result<()> {
        expect_shape(&self.exp_avg, shape, "exp_avg")?;
        expect_shape(&self.exp_avg_sq, shape, "exp_avg_sq")
    }
}

/// Lazy Adam for row-sparse gradients (embedding tables).
///
/// Only the moment rows present in the coalesced gradient are decayed and
/// updated; the step counter still advances once per step for the whole
/// parameter. Dense gradients are rejected.
#[derive(Debug)]
pub struct SparseAdamOptimizer {
    param_groups: Vec<ParamGroup<SparseAdamHyperParams>>,
    state: BTreeMap<usize, SparseAdamParamState>,
}

impl SparseAdamOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: SparseAdamHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<SparseAdamHyperParams>>) -> Result<Self> {
        validate_groups("SparseAdam", &param_groups)?;
        log::info!("Created SparseAdam optimizer with {} parameter group(s)", param_groups.len());
        Ok(SparseAdamOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<SparseAdamHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&SparseAdamParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for SparseAdamOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "SparseAdam step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let sparse = match grad {
                Some(Gradient::Sparse(s)) => s.coalesce(),
                Some(Gradient::Dense(_)) => {
                    return Err(StepwiseError::DenseGradientUnsupported {
                        optimizer: "SparseAdam".to_string(),
                    })
                }
                None => continue,
            };

            let state = self.state.entry(index).or_insert_with(|| SparseAdamParamState {
                step: 0,
                exp_avg: Tensor::zeros_like(tensor),
                exp_avg_sq: Tensor::zeros_like(tensor),
            });
            state.step += 1;
            let (beta1, beta2) = options.betas;
            let step_size = options.lr * bias_correction(beta2, state.step).sqrt()
                / bias_correction(beta1, state.step);

            let width = sparse.row_width();
            let exp_avg = state.exp_avg.data_mut();
            let exp_avg_sq = state.exp_avg_sq.data_mut();
            let data = tensor.data_mut();
            for (i, &row) in sparse.indices().iter().enumerate() {
                let start = row * width;
                for (offset, &g) in sparse.row(i).iter().enumerate() {
                    let k = start + offset;
                    exp_avg[k] += (g - exp_avg[k]) * (1.0 - beta1);
                    exp_avg_sq[k] += (g * g - exp_avg_sq[k]) * (1.0 - beta2);
                    data[k] -= step_size * exp_avg[k] / (exp_avg_sq[k].sqrt() + options.eps);
                }
            }
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
        OptimizerState::SparseAdam(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::SparseAdam(record) = state else {
            return Err(state.kind_mismatch("sparse_adam"));
        };
        self.state = load_record("SparseAdam", &self.param_groups, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_vec_f32_eq, param_with_grad, set_sparse_grad, values};
    use stepwise_core::Parameter;

    #[test]
    fn test_sparse_adam_updates_present_rows_only() -> Result<()> {
        let param = Parameter::new(Tensor::full(&[3, 2], 1.0), "decoder.embeddings").shared();
        set_sparse_grad(&param, vec![2, 0, 2], vec![0.05, 0.05, 0.1, 0.1, 0.05, 0.05]);
        let options = SparseAdamHyperParams {
            lr: 0.1,
            ..Default::default()
        };
        let mut optimizer = SparseAdamOptimizer::new(vec![param.clone()], options)?;
        optimizer.step()?;
        // First step: every touched element moves by about lr.
        assert_vec_f32_eq(&values(&param), &[0.9, 0.9, 1.0, 1.0, 0.9, 0.9], 1e-5);
        let state = optimizer.state(0).unwrap();
        assert_eq!(state.step, 1);
        assert_vec_f32_eq(state.exp_avg.data(), &[0.01, 0.01, 0.0, 0.0, 0.01, 0.01], 1e-7);
        Ok(())
    }

    #[test]
    fn test_sparse_adam_rejects_dense() -> Result<()> {
        let param = param_with_grad(vec![0.0, 0.0], vec![2, 1], vec![1.0, 1.0]);
        let mut optimizer = SparseAdamOptimizer::new(vec![param], SparseAdamHyperParams::default())?;
        assert!(matches!(
            optimizer.step(),
            Err(StepwiseError::DenseGradientUnsupported { .. })
        ));
        Ok(())
    }
}
