use super::*;
use approx::{assert_abs_diff_eq, assert_relative_eq};

#[test]
fn test_linear_endpoints() -> Result<()> {
    let schedule = DecaySchedule::linear(100, 1000)?;
    assert_eq!(schedule.scale(0), 0.0);
    assert_relative_eq!(schedule.scale(50), 0.5);
    assert_relative_eq!(schedule.scale(100), 1.0);
    assert_relative_eq!(schedule.scale(550), 0.5);
    assert_eq!(schedule.scale(1000), 0.0);
    assert_eq!(schedule.scale(5000), 0.0);
    Ok(())
}

#[test]
fn test_linear_constant_holds_after_warmup() {
    let schedule = DecaySchedule::linear_constant(10);
    assert_relative_eq!(schedule.scale(5), 0.5);
    assert_eq!(schedule.scale(10), 1.0);
    assert_eq!(schedule.scale(1_000_000), 1.0);
}

#[test]
fn test_cosine_peaks_after_warmup_and_reaches_zero() -> Result<()> {
    let schedule = DecaySchedule::cosine(100, 1100, 0.5)?;
    assert_relative_eq!(schedule.scale(100), 1.0);
    assert_relative_eq!(schedule.scale(600), 0.5, epsilon = 1e-12);
    assert_abs_diff_eq!(schedule.scale(1100), 0.0, epsilon = 1e-12);
    Ok(())
}

#[test]
fn test_cosine_hard_restart_jumps_back() -> Result<()> {
    let schedule = DecaySchedule::cosine_hard_restart(0, 1000, 2.0)?;
    assert_relative_eq!(schedule.scale(0), 1.0);
    assert!(schedule.scale(499) < 0.01);
    assert_relative_eq!(schedule.scale(500), 1.0, epsilon = 1e-12);
    assert!(DecaySchedule::cosine_hard_restart(0, 1000, 0.5).is_err());
    Ok(())
}

#[test]
fn test_cosine_warmup_restart_ramps_each_cycle() -> Result<()> {
    let schedule = DecaySchedule::cosine_warmup_restart(100, 1000, 2.0)?;
    assert_relative_eq!(schedule.scale(50), 0.5, epsilon = 1e-12);
    assert_relative_eq!(schedule.scale(100), 1.0, epsilon = 1e-12);
    assert_relative_eq!(schedule.scale(550), 0.5, epsilon = 1e-12);
    assert!(DecaySchedule::cosine_warmup_restart(400, 1000, 3.0).is_err());
    Ok(())
}

#[test]
fn test_noam_rises_then_falls() -> Result<()> {
    let schedule = DecaySchedule::noam(4000, 512)?;
    let before = schedule.scale(2000);
    let peak = schedule.scale(4000);
    let after = schedule.scale(8000);
    assert!(before < peak);
    assert!(after < peak);
    assert!(schedule.scale(1) < before);
    Ok(())
}

#[test]
fn test_noam_value_at_warmup() {
    let expected = 512f64.powf(-0.5) * 4000f64.powf(-0.5).min(4000.0 * 4000f64.powf(-1.5));
    assert_relative_eq!(noam_decay(4000, 4000, 512), expected, max_relative = 1e-12);
}

#[test]
fn test_exponential_uses_whole_periods() -> Result<()> {
    let schedule = DecaySchedule::exponential(0.5, 100, 1000)?;
    assert_eq!(schedule.scale(1), 1.0);
    assert_eq!(schedule.scale(999), 1.0);
    assert_eq!(schedule.scale(1000), 0.5);
    assert_eq!(schedule.scale(1099), 0.5);
    assert_eq!(schedule.scale(1100), 0.25);
    Ok(())
}

#[test]
fn test_noamwd_combines_both_factors() -> Result<()> {
    let schedule = DecaySchedule::noamwd(10, 64, 0.5, 100, 0)?;
    assert_relative_eq!(
        schedule.scale(250),
        noam_decay(250, 10, 64) * 0.125,
        max_relative = 1e-12
    );
    Ok(())
}

#[test]
fn test_rsqrt_is_flat_during_warmup() {
    let schedule = DecaySchedule::rsqrt(100);
    assert_relative_eq!(schedule.scale(1), 0.1);
    assert_relative_eq!(schedule.scale(100), 0.1);
    assert_relative_eq!(schedule.scale(400), 0.05);
}

#[test]
fn test_invalid_parameters_are_rejected() {
    for result in [
        DecaySchedule::linear(1000, 1000),
        DecaySchedule::cosine(2000, 1000, 0.5),
        DecaySchedule::noam(4000, 0),
        DecaySchedule::exponential(0.5, 0, 0),
    ] {
        assert!(matches!(result, Err(StepwiseError::ConfigurationError(_))));
    }
}

#[test]
fn test_from_options_selection() -> Result<()> {
    let mut options = TrainOptions::default();
    assert_eq!(DecaySchedule::from_options(&options)?, None);

    options.start_decay_steps = Some(500);
    assert_eq!(
        DecaySchedule::from_options(&options)?,
        Some(DecaySchedule::Exponential {
            rate: 0.5,
            decay_steps: 10_000,
            start_step: 500
        })
    );

    options.decay_method = "cosine".to_string();
    assert_eq!(
        DecaySchedule::from_options(&options)?,
        Some(DecaySchedule::Cosine {
            warmup_steps: 4000,
            total_steps: 100_000,
            cycles: 0.5
        })
    );

    options.decay_method = "linearconst".to_string();
    assert_eq!(
        DecaySchedule::from_options(&options)?,
        Some(DecaySchedule::LinearConstant { warmup_steps: 4000 })
    );

    options.decay_method = "step".to_string();
    assert!(matches!(
        DecaySchedule::from_options(&options),
        Err(StepwiseError::InvalidOption { .. })
    ));
    Ok(())
}

#[test]
fn test_schedule_serializes_with_method_tag() {
    let schedule = DecaySchedule::Rsqrt { warmup_steps: 8 };
    let json = serde_json::to_string(&schedule).unwrap();
    assert_eq!(json, r#"{"method":"rsqrt","warmup_steps":8}"#);
    let back: DecaySchedule = serde_json::from_str(&json).unwrap();
    assert_eq!(back, schedule);
}
