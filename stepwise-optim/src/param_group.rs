use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stepwise_core::{write_param, Gradient, Result, SharedParameter, StepwiseError, Tensor};

/// Hyperparameter bundle shared by every parameter of a group.
///
/// Each algorithm defines its own bundle (`AdamHyperParams`, ...); the
/// controller only needs to read and overwrite the learning rate.
pub trait HyperParams: Clone + Debug + PartialEq + Serialize + DeserializeOwned {
    fn lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
    /// Checks the bundle, returning `ConfigurationError` on an invalid value.
    fn validate(&self) -> Result<()>;
}

/// A group of parameters optimized with the same hyperparameters.
///
/// Membership is fixed once the optimizer is built.
#[derive(Clone, Debug)]
pub struct ParamGroup<H> {
    pub params: Vec<SharedParameter>,
    pub options: H,
}

impl<H: HyperParams> ParamGroup<H> {
    pub fn new(params: Vec<SharedParameter>, options: H) -> Self {
        ParamGroup { params, options }
    }

    pub fn lr(&self) -> f32 {
        self.options.lr()
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.options.set_lr(lr);
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Walks the parameters of `groups` in group-major order, yielding the flat
/// index that keys per-parameter state.
pub fn flat_params<H>(
    groups: &[ParamGroup<H>],
) -> impl Iterator<Item = (usize, &H, &SharedParameter)> {
    groups
        .iter()
        .flat_map(|g| g.params.iter().map(move |p| (&g.options, p)))
        .enumerate()
        .map(|(i, (options, p))| (i, options, p))
}

/// Validates each group's bundle and warns when there is nothing to optimize.
pub(crate) fn validate_groups<H: HyperParams>(name: &str, groups: &[ParamGroup<H>]) -> Result<()> {
    for group in groups {
        group.options.validate()?;
    }
    if groups.iter().all(ParamGroup::is_empty) {
        log::warn!("{} created with an empty parameter list", name);
    }
    Ok(())
}

/// Zero-fills dense gradients and empties sparse ones for every parameter.
pub(crate) fn zero_grad_groups<H>(groups: &[ParamGroup<H>]) -> Result<()> {
    for group in groups {
        for param in &group.params {
            write_param(param, "zero_grad")?.zero_grad();
        }
    }
    Ok(())
}

/// Returns the dense gradient, or `SparseGradientUnsupported` for `optimizer`.
pub(crate) fn require_dense<'a>(grad: &'a Gradient, optimizer: &str) -> Result<&'a Tensor> {
    match grad {
        Gradient::Dense(t) => Ok(t),
        Gradient::Sparse(_) => Err(StepwiseError::SparseGradientUnsupported {
            optimizer: optimizer.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sgd::SgdHyperParams;
    use stepwise_core::{Parameter, Tensor};

    #[test]
    fn test_flat_params_is_group_major() {
        let p = |v: f32| Parameter::new_unnamed(Tensor::scalar(v)).shared();
        let groups = vec![
            ParamGroup::new(vec![p(0.0), p(1.0)], SgdHyperParams::with_lr(0.1)),
            ParamGroup::new(vec![p(2.0)], SgdHyperParams::with_lr(0.2)),
        ];
        let seen: Vec<(usize, f32, f32)> = flat_params(&groups)
            .map(|(i, h, p)| (i, h.lr, p.read().unwrap().data()[0]))
            .collect();
        assert_eq!(seen, vec![(0, 0.1, 0.0), (1, 0.1, 1.0), (2, 0.2, 2.0)]);
    }
}
