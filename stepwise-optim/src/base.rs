use stepwise_core::{read_param, Result, SharedParameter};

use crate::adadelta::{AdadeltaHyperParams, AdadeltaOptimizer};
use crate::adafactor::{AdafactorHyperParams, AdafactorOptimizer, MomentCorrection};
use crate::adagrad::{AdagradHyperParams, AdagradOptimizer};
use crate::adam::{AdamHyperParams, AdamOptimizer};
use crate::bert_adam::{BertAdamHyperParams, BertAdamOptimizer};
use crate::multiple::MultipleOptimizer;
use crate::optimizer_state::OptimizerState;
use crate::optimizer_trait::Optimizer;
use crate::options::{OptimKind, TrainOptions};
use crate::sgd::{SgdHyperParams, SgdOptimizer};
use crate::sparse_adam::{SparseAdamHyperParams, SparseAdamOptimizer};

/// The closed set of optimizers the controller can drive.
#[derive(Debug)]
pub enum BaseOptimizer {
    Sgd(SgdOptimizer),
    Adagrad(AdagradOptimizer),
    Adadelta(AdadeltaOptimizer),
    Adafactor(AdafactorOptimizer),
    Adam(AdamOptimizer),
    BertAdam(BertAdamOptimizer),
    SparseAdam(SparseAdamOptimizer),
    Multiple(MultipleOptimizer),
}

impl BaseOptimizer {
    pub fn inner(&self) -> &dyn Optimizer {
        match self {
            BaseOptimizer::Sgd(op) => op,
            BaseOptimizer::Adagrad(op) => op,
            BaseOptimizer::Adadelta(op) => op,
            BaseOptimizer::Adafactor(op) => op,
            BaseOptimizer::Adam(op) => op,
            BaseOptimizer::BertAdam(op) => op,
            BaseOptimizer::SparseAdam(op) => op,
            BaseOptimizer::Multiple(op) => op,
        }
    }

    pub fn inner_mut(&mut self) -> &mut dyn Optimizer {
        match self {
            BaseOptimizer::Sgd(op) => op,
            BaseOptimizer::Adagrad(op) => op,
            BaseOptimizer::Adadelta(op) => op,
            BaseOptimizer::Adafactor(op) => op,
            BaseOptimizer::Adam(op) => op,
            BaseOptimizer::BertAdam(op) => op,
            BaseOptimizer::SparseAdam(op) => op,
            BaseOptimizer::Multiple(op) => op,
        }
    }

    /// Short name of the wrapped algorithm, as used in state records.
    pub fn kind(&self) -> &'static str {
        match self {
            BaseOptimizer::Sgd(_) => "sgd",
            BaseOptimizer::Adagrad(_) => "adagrad",
            BaseOptimizer::Adadelta(_) => "adadelta",
            BaseOptimizer::Adafactor(_) => "adafactor",
            BaseOptimizer::Adam(_) => "adam",
            BaseOptimizer::BertAdam(_) => "bert_adam",
            BaseOptimizer::SparseAdam(_) => "sparse_adam",
            BaseOptimizer::Multiple(_) => "multiple",
        }
    }
}

impl Optimizer for BaseOptimizer {
    fn step(&mut self) -> Result<()> {
        self.inner_mut().step()
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.inner_mut().zero_grad()
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.inner_mut().set_learning_rate(lr)
    }

    fn learning_rates(&self) -> Vec<f32> {
        self.inner().learning_rates()
    }

    fn group_params(&self) -> Vec<Vec<SharedParameter>> {
        self.inner().group_params()
    }

    fn state_dict(&self) -> OptimizerState {
        self.inner().state_dict()
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        self.inner_mut().load_state_dict(state)
    }
}

/// Builds the optimizer named by `options.optim` over the parameters that
/// require gradients.
///
/// `sparseadam` splits the parameters by name: anything whose name contains
/// `"embed"` goes to a SparseAdam, the rest to a dense Adam, and the pair is
/// driven as a [`MultipleOptimizer`] in that order.
///
/// # Errors
/// `InvalidOption` for an unknown optimizer name, `ConfigurationError` for
/// hyperparameters the chosen algorithm rejects.
pub fn build_optimizer(params: &[SharedParameter], options: &TrainOptions) -> Result<BaseOptimizer> {
    let kind = options.optim_kind()?;
    let mut trainable = Vec::with_capacity(params.len());
    for param in params {
        if read_param(param, "build_optimizer")?.requires_grad() {
            trainable.push(param.clone());
        }
    }
    log::info!(
        "Building {} over {} of {} parameters",
        kind,
        trainable.len(),
        params.len()
    );

    let lr = options.learning_rate;
    let betas = options.betas();
    let optimizer = match kind {
        OptimKind::Sgd => BaseOptimizer::Sgd(SgdOptimizer::new(trainable, SgdHyperParams::with_lr(lr))?),
        OptimKind::Adagrad => BaseOptimizer::Adagrad(AdagradOptimizer::new(
            trainable,
            AdagradHyperParams {
                lr,
                initial_accumulator_value: options.adagrad_accumulator_init,
                ..Default::default()
            },
        )?),
        OptimKind::Adadelta => BaseOptimizer::Adadelta(AdadeltaOptimizer::new(
            trainable,
            AdadeltaHyperParams {
                lr,
                ..Default::default()
            },
        )?),
        OptimKind::Adafactor => BaseOptimizer::Adafactor(AdafactorOptimizer::new(
            trainable,
            AdafactorHyperParams {
                lr,
                correction: MomentCorrection::NonConstantDecay,
                factorized: true,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?),
        OptimKind::Adam => BaseOptimizer::Adam(AdamOptimizer::new(
            trainable,
            AdamHyperParams {
                lr,
                betas,
                eps: 1e-9,
                ..Default::default()
            },
        )?),
        OptimKind::BertAdam => BaseOptimizer::BertAdam(BertAdamOptimizer::new(
            trainable,
            BertAdamHyperParams {
                lr,
                betas,
                eps: 1e-9,
                ..Default::default()
            },
        )?),
        OptimKind::SparseAdam => build_sparse_adam(trainable, lr, betas)?,
        OptimKind::FusedAdam => {
            log::warn!("fusedadam has no fused kernel here; using Adam with eps 1e-8");
            BaseOptimizer::Adam(AdamOptimizer::new(
                trainable,
                AdamHyperParams {
                    lr,
                    betas,
                    eps: 1e-8,
                    ..Default::default()
                },
            )?)
        }
    };
    Ok(optimizer)
}

fn build_sparse_adam(
    trainable: Vec<SharedParameter>,
    lr: f32,
    betas: (f32, f32),
) -> Result<BaseOptimizer> {
    let mut dense = Vec::new();
    let mut sparse = Vec::new();
    for param in trainable {
        let is_embedding = read_param(&param, "build_optimizer")?
            .name()
            .is_some_and(|name| name.contains("embed"));
        if is_embedding {
            sparse.push(param);
        } else {
            dense.push(param);
        }
    }
    if sparse.is_empty() {
        log::warn!("sparseadam selected but no embedding parameters were found");
    }
    let dense = AdamOptimizer::new(
        dense,
        AdamHyperParams {
            lr,
            betas,
            eps: 1e-8,
            ..Default::default()
        },
    )?;
    let sparse = SparseAdamOptimizer::new(sparse, SparseAdamHyperParams { lr, betas, eps: 1e-8 })?;
    Ok(BaseOptimizer::Multiple(MultipleOptimizer::new(vec![
        BaseOptimizer::Adam(dense),
        BaseOptimizer::SparseAdam(sparse),
    ])))
}
