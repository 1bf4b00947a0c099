use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stepwise_core::{write_param, Result, SharedParameter, StepwiseError, Tensor};

use crate::optimizer_state::{expect_shape, load_record, OptimizerState, ParamState, StateRecord};
use crate::optimizer_trait::Optimizer;
use crate::param_group::{
    flat_params, require_dense, validate_groups, zero_grad_groups, HyperParams, ParamGroup,
};

/// How the moment decay rates evolve over steps.
///
/// AMSGrad needs constant decay rates, so the two options are one choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentCorrection {
    /// `beta_t = beta * (1 - beta^(t-1)) / (1 - beta^t)`.
    NonConstantDecay,
    Constant,
    /// Constant decay, normalizing by the running maximum second moment.
    AmsGrad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdafactorHyperParams {
    /// Relative step size; scaled each step by the parameter's RMS.
    pub lr: f32,
    /// First-moment decay; `None` disables momentum.
    pub beta1: Option<f32>,
    pub beta2: f32,
    pub eps1: f32,
    pub eps2: f32,
    pub clipping_threshold: f32,
    pub correction: MomentCorrection,
    pub factorized: bool,
    pub weight_decay: f32,
}

impl AdafactorHyperParams {
    /// Momentum is on exactly when `beta1` is non-zero.
    pub fn momentum_from(beta1: f32) -> Option<f32> {
        (beta1 != 0.0).then_some(beta1)
    }
}

impl Default for AdafactorHyperParams {
    fn default() -> Self {
        AdafactorHyperParams {
            lr: 1.0,
            beta1: Some(0.9),
            beta2: 0.999,
            eps1: 1e-30,
            eps2: 1e-3,
            clipping_threshold: 1.0,
            correction: MomentCorrection::NonConstantDecay,
            factorized: true,
            weight_decay: 0.0,
        }
    }
}

impl HyperParams for AdafactorHyperParams {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn validate(&self) -> Result<()> {
        let invalid = |what: &str, value: f32| {
            Err(StepwiseError::ConfigurationError(format!(
                "Invalid {} value for Adafactor: {}",
                what, value
            )))
        };
        if self.lr.is_nan() || self.lr < 0.0 {
            return invalid("learning rate", self.lr);
        }
        if let Some(beta1) = self.beta1 {
            if !(0.0..1.0).contains(&beta1) {
                return invalid("beta1", beta1);
            }
        }
        if !(0.0..1.0).contains(&self.beta2) {
            return invalid("beta2", self.beta2);
        }
        if self.eps1 < 0.0 {
            return invalid("eps1", self.eps1);
        }
        if self.eps2 < 0.0 {
            return invalid("eps2", self.eps2);
        }
        if self.clipping_threshold.is_nan() || self.clipping_threshold <= 0.0 {
            return invalid("clipping_threshold", self.clipping_threshold);
        }
        if self.weight_decay < 0.0 {
            return invalid("weight_decay", self.weight_decay);
        }
        Ok(())
    }
}

/// Second-moment estimate: a row/column factorization for matrix-like
/// tensors, or a full buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecondMoment {
    /// `row` is `[1, cols]`, `col` is `[rows, 1]`.
    Factored { row: Tensor, col: Tensor },
    Full(Tensor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdafactorParamState {
    pub step: u64,
    pub exp_avg: Option<Tensor>,
    pub second_moment: SecondMoment,
    pub exp_avg_sq_hat: Option<Tensor>,
}

impl ParamState<AdafactorHyperParams> for AdafactorParamState {
    // Buffers live in the working view, which depends on `factorized`.
    fn check_shape(&self, shape: &[usize], options: &AdafactorHyperParams) -> Result<()> {
        let work_shape = working_shape(shape, options.factorized);
        if let Some(m) = &self.exp_avg {
            expect_shape(m, &work_shape, "exp_avg")?;
        }
        if let Some(hat) = &self.exp_avg_sq_hat {
            expect_shape(hat, &work_shape, "exp_avg_sq_hat")?;
        }
        let (is_matrix, _) = check_shape(shape);
        match (&self.second_moment, is_matrix && options.factorized) {
            (SecondMoment::Factored { row, col }, true) => {
                expect_shape(row, &[1, work_shape[1]], "row second moment")?;
                expect_shape(col, &[work_shape[0], 1], "column second moment")
            }
            (SecondMoment::Full(v), false) => expect_shape(v, &work_shape, "exp_avg_sq"),
            (SecondMoment::Factored { .. }, false) => Err(StepwiseError::StateDictMismatch(format!(
                "factored second moment saved for a parameter of shape {:?} that is not factored",
                shape
            ))),
            (SecondMoment::Full(_), true) => Err(StepwiseError::StateDictMismatch(format!(
                "full second moment saved for a factored parameter of shape {:?}",
                shape
            ))),
        }
    }
}

/// Classifies a gradient shape as `(matrix_like, needs_reshape)`.
///
/// Every rank-2 tensor counts as a matrix, including ones with a singleton
/// dimension.
pub fn check_shape(shape: &[usize]) -> (bool, bool) {
    match shape.len() {
        n if n > 2 => (true, true),
        2 => (true, false),
        _ => (false, false),
    }
}

/// 2-D view used to factor a tensor of rank > 2.
///
/// Rank 3 `(a, b, c)` becomes `(a, b*c)`. For higher ranks the trailing
/// dimensions are split in two: the first half (rounded up) joins the
/// columns, the rest joins the rows.
pub fn factored_shape(shape: &[usize]) -> [usize; 2] {
    let trailing = &shape[2..];
    if trailing.len() == 1 {
        return [shape[0], shape[1] * trailing[0]];
    }
    let split = trailing.len() / 2 + trailing.len() % 2;
    let rows = shape[0] * trailing[split..].iter().product::<usize>();
    let cols = shape[1] * trailing[..split].iter().product::<usize>();
    [rows, cols]
}

/// Shape the update works in: the factored 2-D view for factorized tensors of
/// rank > 2, the parameter shape otherwise.
pub fn working_shape(shape: &[usize], factorized: bool) -> Vec<usize> {
    match check_shape(shape) {
        (_, true) if factorized => factored_shape(shape).to_vec(),
        _ => shape.to_vec(),
    }
}

fn decay_rate(beta: f32, step: u64, correction: MomentCorrection) -> f32 {
    match correction {
        MomentCorrection::NonConstantDecay => {
            let beta = beta as f64;
            let step = step as f64;
            (beta * (1.0 - beta.powf(step - 1.0)) / (1.0 - beta.powf(step))) as f32
        }
        MomentCorrection::Constant | MomentCorrection::AmsGrad => beta,
    }
}

/// Adafactor: adaptive step sizes with a factored second moment.
///
/// Matrix-like parameters keep one row and one column accumulator instead of a
/// full second-moment buffer; tensors of rank > 2 are viewed as matrices for
/// the update. The step size is relative to the parameter's RMS.
#[derive(Debug)]
pub struct AdafactorOptimizer {
    param_groups: Vec<ParamGroup<AdafactorHyperParams>>,
    state: BTreeMap<usize, AdafactorParamState>,
}

impl AdafactorOptimizer {
    pub fn new(params: Vec<SharedParameter>, options: AdafactorHyperParams) -> Result<Self> {
        Self::with_groups(vec![ParamGroup::new(params, options)])
    }

    pub fn with_groups(param_groups: Vec<ParamGroup<AdafactorHyperParams>>) -> Result<Self> {
        validate_groups("Adafactor", &param_groups)?;
        log::info!("Created Adafactor optimizer with {} parameter group(s)", param_groups.len());
        Ok(AdafactorOptimizer {
            param_groups,
            state: BTreeMap::new(),
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup<AdafactorHyperParams>] {
        &self.param_groups
    }

    pub fn state(&self, index: usize) -> Option<&AdafactorParamState> {
        self.state.get(&index)
    }
}

impl Optimizer for AdafactorOptimizer {
    fn step(&mut self) -> Result<()> {
        for (index, options, param) in flat_params(&self.param_groups) {
            let mut param = write_param(param, "Adafactor step")?;
            if !param.requires_grad() {
                continue;
            }
            let (tensor, grad) = param.tensor_and_grad_mut();
            let Some(grad) = grad else {
                continue;
            };
            let mut g = require_dense(grad, "Adafactor")?.clone();

            let (is_matrix, _) = check_shape(g.shape());
            let work_shape = working_shape(tensor.shape(), options.factorized);
            let reshaped = work_shape != tensor.shape();
            if reshaped {
                g.reshape_(&work_shape)?;
            }

            let state = self.state.entry(index).or_insert_with(|| {
                log::debug!(
                    "Adafactor: allocating state for parameter {} with shape {:?}",
                    index,
                    work_shape
                );
                let second_moment = if is_matrix && options.factorized {
                    SecondMoment::Factored {
                        row: Tensor::zeros(&[1, work_shape[1]]),
                        col: Tensor::zeros(&[work_shape[0], 1]),
                    }
                } else {
                    SecondMoment::Full(Tensor::zeros(&work_shape))
                };
                AdafactorParamState {
                    step: 0,
                    exp_avg: None,
                    second_moment,
                    exp_avg_sq_hat: None,
                }
            });
            state.step += 1;
            let step = state.step;
            let lr_t = options.lr * options.eps2.max(tensor.rms());

            let mut beta1_t = None;
            if let Some(beta1) = options.beta1 {
                let b1 = decay_rate(beta1, step, options.correction);
                let exp_avg = state
                    .exp_avg
                    .get_or_insert_with(|| Tensor::zeros(&work_shape));
                exp_avg.mul_scalar_(b1);
                exp_avg.add_scaled_(&g, 1.0 - b1)?;
                beta1_t = Some(b1);
            }

            let beta2_t = decay_rate(options.beta2, step, options.correction);
            let eps1 = options.eps1;
            let v = match &mut state.second_moment {
                SecondMoment::Factored { row, col } => {
                    let g_sq = g.map(|x| x * x + eps1);
                    row.mul_scalar_(beta2_t);
                    row.add_scaled_(&g_sq.sum_dim_keepdim(0)?, 1.0 - beta2_t)?;
                    col.mul_scalar_(beta2_t);
                    col.add_scaled_(&g_sq.sum_dim_keepdim(1)?, 1.0 - beta2_t)?;
                    let mut v = Tensor::outer(col, row)?;
                    v.mul_scalar_(1.0 / row.sum());
                    v
                }
                SecondMoment::Full(v) => {
                    v.mul_scalar_(beta2_t);
                    v.addcmul_(1.0 - beta2_t, &g, &g)?;
                    v.add_scalar_((1.0 - beta2_t) * eps1);
                    v.clone()
                }
            };

            let g_eff = match (beta1_t, state.exp_avg.as_ref()) {
                (Some(b1), Some(exp_avg)) => {
                    let correction = 1.0 - b1.powf(step as f32);
                    exp_avg.map(|m| m / correction)
                }
                _ => g,
            };

            let mut u = if options.correction == MomentCorrection::AmsGrad {
                let hat = state
                    .exp_avg_sq_hat
                    .get_or_insert_with(|| Tensor::zeros(&work_shape));
                hat.max_(&v)?;
                let correction = 1.0 - beta2_t.powf(step as f32);
                g_eff.zip_map(hat, |gi, h| gi / ((h / correction).sqrt() + eps1))?
            } else {
                g_eff.zip_map(&v, |gi, vi| gi / vi.sqrt())?
            };

            u.mul_scalar_(1.0 / (u.rms() / options.clipping_threshold).max(1.0));
            if reshaped {
                u.reshape_(tensor.shape())?;
            }
            tensor.add_scaled_(&u, -lr_t)?;

            if options.weight_decay != 0.0 {
                tensor.mul_scalar_(1.0 - options.weight_decay * lr_t);
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
        OptimizerState::Adafactor(StateRecord::capture(&self.param_groups, &self.state))
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        let OptimizerState::Adafactor(record) = state else {
            return Err(state.kind_mismatch("adafactor"));
        };
        self.state = load_record("Adafactor", &self.param_groups, record)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "adafactor_test.rs"]
mod tests;
