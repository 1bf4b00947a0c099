use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StepwiseError};
use crate::gradient::Gradient;
use crate::tensor::Tensor;

/// Handle through which the training loop and the optimizers share a parameter.
pub type SharedParameter = Arc<RwLock<Parameter>>;

/// A learnable tensor together with the gradient accumulated for it.
///
/// Optimizers mutate the tensor in place but never change its shape. A
/// parameter without a gradient is skipped by every update rule.
#[derive(Clone)]
pub struct Parameter {
    tensor: Tensor,
    name: Option<String>,
    grad: Option<Gradient>,
    requires_grad: bool,
}

impl Parameter {
    pub fn new(tensor: Tensor, name: impl Into<String>) -> Self {
        Parameter {
            tensor,
            name: Some(name.into()),
            grad: None,
            requires_grad: true,
        }
    }

    pub fn new_unnamed(tensor: Tensor) -> Self {
        Parameter {
            tensor,
            name: None,
            grad: None,
            requires_grad: true,
        }
    }

    /// Wraps the parameter in the shared handle optimizers operate on.
    pub fn shared(self) -> SharedParameter {
        Arc::new(RwLock::new(self))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }

    pub fn grad(&self) -> Option<&Gradient> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Gradient> {
        self.grad.as_mut()
    }

    /// Splits the borrow so an update rule can read the gradient while
    /// writing the tensor.
    pub fn tensor_and_grad_mut(&mut self) -> (&mut Tensor, Option<&Gradient>) {
        (&mut self.tensor, self.grad.as_ref())
    }

    /// Replaces the gradient. Its dense shape must match the parameter.
    pub fn set_grad(&mut self, grad: impl Into<Gradient>) -> Result<()> {
        let grad = grad.into();
        self.check_grad_shape(&grad, "set_grad")?;
        self.grad = Some(grad);
        Ok(())
    }

    /// Adds `grad` to the current gradient, or installs it when none is present.
    ///
    /// Sparse into sparse appends rows; any other mix densifies.
    pub fn acc_grad(&mut self, grad: impl Into<Gradient>) -> Result<()> {
        let grad = grad.into();
        self.check_grad_shape(&grad, "acc_grad")?;
        let merged = match (self.grad.take(), grad) {
            (None, incoming) => incoming,
            (Some(Gradient::Sparse(mut current)), Gradient::Sparse(incoming)) => {
                current.extend(&incoming)?;
                Gradient::Sparse(current)
            }
            (Some(current), incoming) => {
                if current.is_sparse() || incoming.is_sparse() {
                    log::debug!(
                        "Densifying gradient of {} while accumulating",
                        self.name.as_deref().unwrap_or("<unnamed>")
                    );
                }
                let mut dense = into_dense(current);
                dense.add_(&into_dense(incoming))?;
                Gradient::Dense(dense)
            }
        };
        self.grad = Some(merged);
        Ok(())
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    /// Zeroes the gradient buffer in place; an absent gradient stays absent.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.zero_();
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    fn check_grad_shape(&self, grad: &Gradient, operation: &str) -> Result<()> {
        if grad.shape() != self.tensor.shape() {
            return Err(StepwiseError::ShapeMismatch {
                expected: self.tensor.shape().to_vec(),
                actual: grad.shape().to_vec(),
                operation: format!("Parameter::{}", operation),
            });
        }
        Ok(())
    }
}

fn into_dense(grad: Gradient) -> Tensor {
    match grad {
        Gradient::Dense(t) => t,
        Gradient::Sparse(s) => s.to_dense(),
    }
}

impl Deref for Parameter {
    type Target = Tensor;

    fn deref(&self) -> &Self::Target {
        &self.tensor
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("shape", &self.tensor.shape())
            .field("has_grad", &self.grad.is_some())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

/// Takes the read lock of a shared parameter, reporting poisoning as `LockError`.
pub fn read_param<'a>(
    param: &'a SharedParameter,
    context: &str,
) -> Result<RwLockReadGuard<'a, Parameter>> {
    param.read().map_err(|e| StepwiseError::LockError {
        lock_type: "read".to_string(),
        reason: format!("Failed to read parameter in {}: {}", context, e),
    })
}

/// Takes the write lock of a shared parameter, reporting poisoning as `LockError`.
pub fn write_param<'a>(
    param: &'a SharedParameter,
    context: &str,
) -> Result<RwLockWriteGuard<'a, Parameter>> {
    param.write().map_err(|e| StepwiseError::LockError {
        lock_type: "write".to_string(),
        reason: format!("Failed to write parameter in {}: {}", context, e),
    })
}

#[cfg(test)]
#[path = "parameter_test.rs"]
mod tests;
