//! Learning-rate decay schedules.
//!
//! Every schedule maps a step index (starting at 1) to a scale factor applied
//! to the base learning rate. The free functions are pure and assume their
//! arguments were validated; [`DecaySchedule`] is the validated, serializable
//! selection the controller holds.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use stepwise_core::{Result, StepwiseError};

use crate::options::{DecayMethod, TrainOptions};

fn warmup_ramp(step: u64, warmup_steps: u64) -> f64 {
    step as f64 / warmup_steps as f64
}

/// Integer number of elapsed decay periods, counting the period that starts
/// at `start_step` as the first.
fn decay_periods(step: u64, decay_steps: u64, start_step: u64) -> i32 {
    let elapsed = (step as i64 - start_step as i64 + decay_steps as i64).max(0);
    (elapsed / decay_steps as i64) as i32
}

pub fn noam_decay(step: u64, warmup_steps: u64, model_size: u64) -> f64 {
    let s = step as f64;
    (model_size as f64).powf(-0.5) * s.powf(-0.5).min(s * (warmup_steps as f64).powf(-1.5))
}

pub fn noamwd_decay(
    step: u64,
    warmup_steps: u64,
    model_size: u64,
    rate: f64,
    decay_steps: u64,
    start_step: u64,
) -> f64 {
    noam_decay(step, warmup_steps, model_size) * exponential_decay(step, rate, decay_steps, start_step)
}

/// Scales by `rate` once every `decay_steps` steps.
pub fn exponential_decay(step: u64, rate: f64, decay_steps: u64, start_step: u64) -> f64 {
    rate.powi(decay_periods(step, decay_steps, start_step))
}

pub fn rsqrt_decay(step: u64, warmup_steps: u64) -> f64 {
    1.0 / (step.max(warmup_steps) as f64).sqrt()
}

/// Ramps from 0 to 1 over the warmup, then down to 0 at `total_steps`.
pub fn linear_decay(step: u64, warmup_steps: u64, total_steps: u64) -> f64 {
    if step < warmup_steps {
        return warmup_ramp(step, warmup_steps);
    }
    ((total_steps as f64 - step as f64) / (total_steps - warmup_steps) as f64).max(0.0)
}

/// Ramps from 0 to 1 over the warmup, then stays at 1.
pub fn linear_constant_decay(step: u64, warmup_steps: u64) -> f64 {
    if step < warmup_steps {
        return warmup_ramp(step, warmup_steps);
    }
    1.0
}

fn progress_after_warmup(step: u64, warmup_steps: u64, total_steps: u64) -> f64 {
    (step as f64 - warmup_steps as f64) / (total_steps - warmup_steps) as f64
}

pub fn cosine_decay(step: u64, warmup_steps: u64, total_steps: u64, cycles: f64) -> f64 {
    if step < warmup_steps {
        return warmup_ramp(step, warmup_steps);
    }
    let progress = progress_after_warmup(step, warmup_steps, total_steps);
    0.5 * (1.0 + (PI * cycles * 2.0 * progress).cos())
}

/// Cosine decay restarted from 1 `cycles` times after the warmup.
pub fn cosine_hard_restart_decay(step: u64, warmup_steps: u64, total_steps: u64, cycles: f64) -> f64 {
    if step < warmup_steps {
        return warmup_ramp(step, warmup_steps);
    }
    let progress = progress_after_warmup(step, warmup_steps, total_steps);
    0.5 * (1.0 + (PI * (cycles * progress).rem_euclid(1.0)).cos())
}

/// Each of the `cycles` periods has its own warmup followed by a cosine decay.
pub fn cosine_warmup_restart_decay(step: u64, warmup_steps: u64, total_steps: u64, cycles: f64) -> f64 {
    let warmup_ratio = warmup_steps as f64 * cycles / total_steps as f64;
    let progress = (step as f64 * cycles / total_steps as f64).rem_euclid(1.0);
    if progress < warmup_ratio {
        return progress / warmup_ratio;
    }
    let progress = (progress - warmup_ratio) / (1.0 - warmup_ratio);
    0.5 * (1.0 + (PI * progress).cos())
}

/// A validated decay schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DecaySchedule {
    Noam {
        warmup_steps: u64,
        model_size: u64,
    },
    NoamWd {
        warmup_steps: u64,
        model_size: u64,
        rate: f64,
        decay_steps: u64,
        start_step: u64,
    },
    Exponential {
        rate: f64,
        decay_steps: u64,
        start_step: u64,
    },
    Rsqrt {
        warmup_steps: u64,
    },
    Linear {
        warmup_steps: u64,
        total_steps: u64,
    },
    LinearConstant {
        warmup_steps: u64,
    },
    Cosine {
        warmup_steps: u64,
        total_steps: u64,
        cycles: f64,
    },
    CosineHardRestart {
        warmup_steps: u64,
        total_steps: u64,
        cycles: f64,
    },
    CosineWarmupRestart {
        warmup_steps: u64,
        total_steps: u64,
        cycles: f64,
    },
}

fn config_error(message: String) -> StepwiseError {
    StepwiseError::ConfigurationError(message)
}

fn check_warmup(warmup_steps: u64, total_steps: u64) -> Result<()> {
    if warmup_steps >= total_steps {
        return Err(config_error(format!(
            "Invalid decay: warmup_steps ({}) must be below train_steps ({})",
            warmup_steps, total_steps
        )));
    }
    Ok(())
}

fn check_model_size(model_size: u64) -> Result<()> {
    if model_size == 0 {
        return Err(config_error("Invalid decay: model size must be positive".to_string()));
    }
    Ok(())
}

fn check_decay_steps(decay_steps: u64) -> Result<()> {
    if decay_steps == 0 {
        return Err(config_error("Invalid decay: decay_steps must be positive".to_string()));
    }
    Ok(())
}

fn check_cycles(cycles: f64) -> Result<()> {
    if cycles.is_nan() || cycles < 0.0 {
        return Err(config_error(format!("Invalid decay: cycles must be non-negative, got {}", cycles)));
    }
    Ok(())
}

impl DecaySchedule {
    pub fn noam(warmup_steps: u64, model_size: u64) -> Result<Self> {
        check_model_size(model_size)?;
        Ok(DecaySchedule::Noam {
            warmup_steps,
            model_size,
        })
    }

    pub fn noamwd(
        warmup_steps: u64,
        model_size: u64,
        rate: f64,
        decay_steps: u64,
        start_step: u64,
    ) -> Result<Self> {
        check_model_size(model_size)?;
        check_decay_steps(decay_steps)?;
        Ok(DecaySchedule::NoamWd {
            warmup_steps,
            model_size,
            rate,
            decay_steps,
            start_step,
        })
    }

    pub fn exponential(rate: f64, decay_steps: u64, start_step: u64) -> Result<Self> {
        check_decay_steps(decay_steps)?;
        Ok(DecaySchedule::Exponential {
            rate,
            decay_steps,
            start_step,
        })
    }

    pub fn rsqrt(warmup_steps: u64) -> Self {
        DecaySchedule::Rsqrt { warmup_steps }
    }

    pub fn linear(warmup_steps: u64, total_steps: u64) -> Result<Self> {
        check_warmup(warmup_steps, total_steps)?;
        Ok(DecaySchedule::Linear {
            warmup_steps,
            total_steps,
        })
    }

    pub fn linear_constant(warmup_steps: u64) -> Self {
        DecaySchedule::LinearConstant { warmup_steps }
    }

    pub fn cosine(warmup_steps: u64, total_steps: u64, cycles: f64) -> Result<Self> {
        check_warmup(warmup_steps, total_steps)?;
        check_cycles(cycles)?;
        Ok(DecaySchedule::Cosine {
            warmup_steps,
            total_steps,
            cycles,
        })
    }

    pub fn cosine_hard_restart(warmup_steps: u64, total_steps: u64, cycles: f64) -> Result<Self> {
        check_warmup(warmup_steps, total_steps)?;
        if cycles.is_nan() || cycles < 1.0 {
            return Err(config_error(format!(
                "Invalid decay: cosine_hard_restart needs cycles >= 1, got {}",
                cycles
            )));
        }
        Ok(DecaySchedule::CosineHardRestart {
            warmup_steps,
            total_steps,
            cycles,
        })
    }

    pub fn cosine_warmup_restart(warmup_steps: u64, total_steps: u64, cycles: f64) -> Result<Self> {
        check_warmup(warmup_steps, total_steps)?;
        check_cycles(cycles)?;
        if cycles * warmup_steps as f64 / total_steps as f64 >= 1.0 {
            return Err(config_error(format!(
                "Invalid decay: {} cycles of {} warmup steps do not fit in {} steps",
                cycles, warmup_steps, total_steps
            )));
        }
        Ok(DecaySchedule::CosineWarmupRestart {
            warmup_steps,
            total_steps,
            cycles,
        })
    }

    /// Builds the schedule selected by `options.decay_method`.
    ///
    /// With no method named, a set `start_decay_steps` selects exponential
    /// decay; otherwise there is no schedule and the base rate is used as is.
    pub fn from_options(options: &TrainOptions) -> Result<Option<Self>> {
        let warmup = options.warmup_steps;
        let total = options.train_steps;
        let schedule = match options.decay()? {
            DecayMethod::Noam => Self::noam(warmup, options.rnn_size)?,
            DecayMethod::NoamWd => Self::noamwd(
                warmup,
                options.rnn_size,
                options.learning_rate_decay,
                options.decay_steps,
                options.start_decay_steps.unwrap_or(0),
            )?,
            DecayMethod::Linear => Self::linear(warmup, total)?,
            DecayMethod::LinearConst => Self::linear_constant(warmup),
            DecayMethod::Cosine => Self::cosine(warmup, total, options.cycles.unwrap_or(0.5))?,
            DecayMethod::CosineHardRestart => {
                Self::cosine_hard_restart(warmup, total, options.cycles.unwrap_or(1.0))?
            }
            DecayMethod::CosineWarmupRestart => {
                Self::cosine_warmup_restart(warmup, total, options.cycles.unwrap_or(1.0))?
            }
            DecayMethod::Rsqrt => Self::rsqrt(warmup),
            DecayMethod::None => match options.start_decay_steps {
                Some(start) => {
                    Self::exponential(options.learning_rate_decay, options.decay_steps, start)?
                }
                None => return Ok(None),
            },
        };
        Ok(Some(schedule))
    }

    /// Scale factor at `step`.
    pub fn scale(&self, step: u64) -> f64 {
        match *self {
            DecaySchedule::Noam {
                warmup_steps,
                model_size,
            } => noam_decay(step, warmup_steps, model_size),
            DecaySchedule::NoamWd {
                warmup_steps,
                model_size,
                rate,
                decay_steps,
                start_step,
            } => noamwd_decay(step, warmup_steps, model_size, rate, decay_steps, start_step),
            DecaySchedule::Exponential {
                rate,
                decay_steps,
                start_step,
            } => exponential_decay(step, rate, decay_steps, start_step),
            DecaySchedule::Rsqrt { warmup_steps } => rsqrt_decay(step, warmup_steps),
            DecaySchedule::Linear {
                warmup_steps,
                total_steps,
            } => linear_decay(step, warmup_steps, total_steps),
            DecaySchedule::LinearConstant { warmup_steps } => linear_constant_decay(step, warmup_steps),
            DecaySchedule::Cosine {
                warmup_steps,
                total_steps,
                cycles,
            } => cosine_decay(step, warmup_steps, total_steps, cycles),
            DecaySchedule::CosineHardRestart {
                warmup_steps,
                total_steps,
                cycles,
            } => cosine_hard_restart_decay(step, warmup_steps, total_steps, cycles),
            DecaySchedule::CosineWarmupRestart {
                warmup_steps,
                total_steps,
                cycles,
            } => cosine_warmup_restart_decay(step, warmup_steps, total_steps, cycles),
        }
    }
}

#[cfg(test)]
#[path = "lr_scheduler_test.rs"]
mod tests;
