use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stepwise_core::{Result, StepwiseError};

/// Training options consumed by the optimizer factory, the schedule builder
/// and the controller.
///
/// Mirrors the command-line surface of the trainer: enumerated choices stay
/// strings here and are parsed into closed enums when used, so an unknown
/// value fails at construction with `InvalidOption`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub optim: String,
    pub learning_rate: f32,
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub adagrad_accumulator_init: f32,
    /// Global gradient-norm threshold; absent or 0 disables clipping.
    pub max_grad_norm: Option<f32>,
    pub decay_method: String,
    pub warmup_steps: u64,
    pub train_steps: u64,
    pub decay_steps: u64,
    pub start_decay_steps: Option<u64>,
    pub learning_rate_decay: f64,
    pub cycles: Option<f64>,
    /// Model size used by the noam schedules.
    pub rnn_size: u64,
    pub reset_optim: String,
    pub train_from: Option<String>,
    pub model_dtype: String,
    /// 0 selects dynamic loss scaling.
    pub loss_scale: f32,
    pub apex_opt_level: String,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            optim: "sgd".to_string(),
            learning_rate: 1.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adagrad_accumulator_init: 0.0,
            max_grad_norm: None,
            decay_method: "none".to_string(),
            warmup_steps: 4000,
            train_steps: 100_000,
            decay_steps: 10_000,
            start_decay_steps: None,
            learning_rate_decay: 0.5,
            cycles: None,
            rnn_size: 512,
            reset_optim: "none".to_string(),
            train_from: None,
            model_dtype: "fp32".to_string(),
            loss_scale: 0.0,
            apex_opt_level: "O1".to_string(),
        }
    }
}

impl TrainOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StepwiseError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StepwiseError::Serialization(e.to_string()))
    }

    pub fn optim_kind(&self) -> Result<OptimKind> {
        self.optim.parse()
    }

    pub fn decay(&self) -> Result<DecayMethod> {
        self.decay_method.parse()
    }

    pub fn reset_policy(&self) -> Result<ResetPolicy> {
        self.reset_optim.parse()
    }

    pub fn dtype(&self) -> Result<ModelDtype> {
        self.model_dtype.parse()
    }

    pub fn betas(&self) -> (f32, f32) {
        (self.adam_beta1, self.adam_beta2)
    }
}

fn invalid(option: &str, value: &str) -> StepwiseError {
    StepwiseError::InvalidOption {
        option: option.to_string(),
        value: value.to_string(),
    }
}

/// Optimizer selected by `optim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimKind {
    Sgd,
    Adagrad,
    Adadelta,
    Adafactor,
    Adam,
    BertAdam,
    SparseAdam,
    FusedAdam,
}

impl FromStr for OptimKind {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sgd" => Ok(OptimKind::Sgd),
            "adagrad" => Ok(OptimKind::Adagrad),
            "adadelta" => Ok(OptimKind::Adadelta),
            "adafactor" => Ok(OptimKind::Adafactor),
            "adam" => Ok(OptimKind::Adam),
            "bertadam" => Ok(OptimKind::BertAdam),
            "sparseadam" => Ok(OptimKind::SparseAdam),
            "fusedadam" => Ok(OptimKind::FusedAdam),
            other => Err(invalid("optim", other)),
        }
    }
}

impl fmt::Display for OptimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimKind::Sgd => "sgd",
            OptimKind::Adagrad => "adagrad",
            OptimKind::Adadelta => "adadelta",
            OptimKind::Adafactor => "adafactor",
            OptimKind::Adam => "adam",
            OptimKind::BertAdam => "bertadam",
            OptimKind::SparseAdam => "sparseadam",
            OptimKind::FusedAdam => "fusedadam",
        };
        f.write_str(name)
    }
}

/// Learning-rate schedule selected by `decay_method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayMethod {
    Noam,
    NoamWd,
    Linear,
    LinearConst,
    Cosine,
    CosineHardRestart,
    CosineWarmupRestart,
    Rsqrt,
    None,
}

impl FromStr for DecayMethod {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "noam" => Ok(DecayMethod::Noam),
            "noamwd" => Ok(DecayMethod::NoamWd),
            "linear" => Ok(DecayMethod::Linear),
            "linearconst" => Ok(DecayMethod::LinearConst),
            "cosine" => Ok(DecayMethod::Cosine),
            "cosine_hard_restart" => Ok(DecayMethod::CosineHardRestart),
            "cosine_warmup_restart" => Ok(DecayMethod::CosineWarmupRestart),
            "rsqrt" => Ok(DecayMethod::Rsqrt),
            "none" | "" => Ok(DecayMethod::None),
            other => Err(invalid("decay_method", other)),
        }
    }
}

/// What to take from a checkpoint when resuming (`reset_optim`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Checkpoint options and the full saved state.
    None,
    /// Ignore the checkpoint.
    All,
    /// Checkpoint options and step counters, fresh accumulators.
    States,
    /// Fresh options, checkpoint counters and accumulators.
    KeepStates,
}

impl FromStr for ResetPolicy {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ResetPolicy::None),
            "all" => Ok(ResetPolicy::All),
            "states" => Ok(ResetPolicy::States),
            "keep_states" => Ok(ResetPolicy::KeepStates),
            other => Err(invalid("reset_optim", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDtype {
    Fp32,
    Fp16,
}

impl FromStr for ModelDtype {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" => Ok(ModelDtype::Fp32),
            "fp16" => Ok(ModelDtype::Fp16),
            other => Err(invalid("model_dtype", other)),
        }
    }
}
