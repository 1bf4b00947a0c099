use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Gradient, Result, SharedParameter, StepwiseError, Tensor};

use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{flat_params, validate_groups, zero_grad_groups, HyperParams, ParamGroup};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdagradHyperParams {
    pub lr: f32,
    pub lr_decay: f32,
    pub weight_decay: f32,
    pub initial_accumulator_value: f32,
    pub eps: f32,
}

impl Default for AdagradHyperParams {
    fn default() -> Self {
        AdagradHyperParams {
            lr: 1e-2,
            lr_decay: 0.0,
            weight_decay: 0.0,
            initial_accumulator_value: 0.0,
            eps: 1e-10,
        }
    }
}

impl HyperParams for AdagradHyperParams {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        let checks = [
            (self.lr, "learning rate"),
            (self.lr_decay, "lr_decay"),
            (self.weight_decay, "weight_decay"),
            (self.initial_accumulator_value, "initial_accumulator_value"),
            (self.eps, "epsilon"),
        ];
        for (value, what) in checks {
            if value < 0.0 {
                return Err(StepwiseError::ConfigurationError(format!(
                    "Invalid {} value: {}",
                    what, value
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdagradParamState {
    pub step: u64,
    pub sum: Tensor,
}

impl ParamState<AdagradHyperParams> for AdagradParamState {
    fn check_shape(&self, shape: &[usize], _options: &AdagradHyperParams) -> Result<()> {
        expect_shape(&self.sum, shape, "sum")
    }
}

/// Adagrad: per-element learning rates from the running sum of squared
/// gradients.
///
/// Sparse gradients only touch the accumulator rows they carry; they cannot be
/// combined with weight decay.
#[derive(Debug)]
pub struct AdagradOptimizer {
    param_groups: Vec<ParamGroup<AdagradHyperParams>>,
    state: BTreeMap<usize, AdagradParamState>,
}

impl AdagradOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: AdagradHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<AdagradHyperParams>>) -> Result<Self> {
        validate_groups("Adagrad", &param_groups)?;
        log::info!("Created Adagrad optimizer with {} parameter group(s)", param_groups.len());
        Ok(AdagradOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<AdagradHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&AdagradParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for AdagradOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "Adagrad step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let Some(grad) = grad else {
                continue;
            };
            if grad.is_sparse() && options.weight_decay != 0.0 {
                return Err(StepwiseError::SparseGradientUnsupported {
                    optimizer: "Adagrad with weight decay".to_string(),
                });
            }

            let state = self.state.entry(index).or_insert_with(|| {
                log::debug!("Adagrad: allocating state for parameter {}", index);
                AdagradParamState {
                    step: 0,
                    sum: Tensor::full(tensor.shape(), options.initial_accumulator_value),
                }
            });
            state.step += 1;
            let clr = options.lr / (1.0 + (state.step - 1) as f32 * options.lr_decay);

            match grad {
                Gradient::Dense(g) => {
                    let mut g = g.clone();
                    if options.weight_decay != 0.0 {
                        g.add_scaled_(tensor, options.weight_decay)?;
                    }
                    state.sum.addcmul_(1.0, &g, &g)?;
                    let update = g.zip_map(&state.sum, |gi, si| gi / (si.sqrt() + options.eps))?;
                    tensor.add_scaled_(&update, -clr)?;
                }
                Gradient::Sparse(sparse) => {
                    let sparse = sparse.coalesce();
                    let width = sparse.row_width();
                    let sum = state.sum.data_mut();
                    let data = tensor.data_mut();
                    for (i, &row) in sparse.indices().iter().enumerate() {
                        let range = row * width..(row + 1) * width;
                        let rows = sum[range.clone()].iter_mut().zip(&mut data[range]);
                        for ((s, p), g) in rows.zip(sparse.row(i)) {
                            *s += g * g;
                            *p -= clr * g / (s.sqrt() + options.eps);
                        }
                    }
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
        OptimizerState::Adagrad(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::Adagrad(record) = state else {
            return Err(state.kind_mismatch("adagrad"));
        };
        self.state = load_record("Adagrad", &self.param_groups, record)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "adagrad_test.rs"]
mod tests;
