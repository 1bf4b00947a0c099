use stepwise_core::{read_param, write_param, Result, SharedParameter, StepwiseError};

/// Added to the total norm before dividing, so an all-zero gradient never
/// produces an infinite coefficient.
const NORM_EPS: f64 = 1e-6;

/// L2 norm of the gradients of `parameters`, viewed as one concatenated vector.
///
/// Parameters without a gradient contribute nothing; sparse gradients
/// contribute the norm of their dense equivalent.
pub fn total_grad_norm(parameters: &[SharedParameter]) -> Result<f32> {
    let mut total_sq = 0.0f64;
    for param in parameters {
        if let Some(grad) = read_param(param, "total_grad_norm")?.grad() {
            total_sq += grad.norm_sq();
        }
    }
    Ok(total_sq.sqrt() as f32)
}

/// Clips the overall gradient norm of `parameters` in place.
///
/// If the total L2 norm exceeds `max_norm`, every gradient is scaled by
/// `max_norm / (total_norm + 1e-6)`. Returns the norm measured before
/// clipping.
///
/// # Errors
/// `ConfigurationError` if `max_norm` is negative or NaN; `LockError` if a
/// parameter lock is poisoned.
pub fn clip_grad_norm_(parameters: &[SharedParameter], max_norm: f32) -> Result<f32> {
    if max_norm.is_nan() || max_norm < 0.0 {
        return Err(StepwiseError::ConfigurationError(format!(
            "max_norm must be non-negative, got {}",
            max_norm
        )));
    }
    let total_norm = total_grad_norm(parameters)?;
    let clip_coef = (max_norm as f64 / (total_norm as f64 + NORM_EPS)) as f32;
    if clip_coef < 1.0 {
        log::debug!(
            "Clipping gradient norm {:.6} to {} (coefficient {:.6})",
            total_norm,
            max_norm,
            clip_coef
        );
        for param in parameters {
            if let Some(grad) = write_param(param, "clip_grad_norm_")?.grad_mut() {
                grad.scale_(clip_coef);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
#[path = "grad_clipping_test.rs"]
mod tests;
