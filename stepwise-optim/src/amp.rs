use stepwise_core::{Backward, Result, SharedParameter};

/// Loss scaling requested from the mixed-precision library.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossScale {
    Dynamic,
    Static(f32),
}

impl LossScale {
    /// `0` selects dynamic scaling, any other value a fixed scale.
    pub fn from_option(loss_scale: f32) -> Self {
        if loss_scale == 0.0 {
            LossScale::Dynamic
        } else {
            LossScale::Static(loss_scale)
        }
    }
}

/// Narrow interface to an external mixed-precision library.
///
/// The controller only talks to it when the model runs in fp16: once at
/// construction, around every backward pass, and before every step.
pub trait MixedPrecision {
    fn initialize(
        &mut self,
        params: &[SharedParameter],
        opt_level: &str,
        loss_scale: LossScale,
        keep_batchnorm_fp32: Option<bool>,
    ) -> Result<()>;

    /// Runs `scope` with the scaled loss; the library unscales the resulting
    /// gradients when the scope returns.
    fn scale_loss(
        &mut self,
        loss: &dyn Backward,
        scope: &mut dyn FnMut(&dyn Backward) -> Result<()>,
    ) -> Result<()>;

    /// Copies model gradients into the fp32 master parameters.
    fn update_master_grads(&mut self) -> Result<()> {
        Ok(())
    }

    /// The fp32 parameters the optimizer effectively updates.
    fn master_params(&self) -> Vec<SharedParameter>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_loss_scale_is_dynamic() {
        assert_eq!(LossScale::from_option(0.0), LossScale::Dynamic);
        assert_eq!(LossScale::from_option(128.0), LossScale::Static(128.0));
    }
}
