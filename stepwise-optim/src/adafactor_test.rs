use super::*;
use crate::test_utils::{
    assert_vec_f32_eq, init_logger, param_with_grad, set_grad, set_sparse_grad, values,
};
use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use stepwise_core::Parameter;

fn adafactor(lr: f32) -> AdafactorHyperParams {
    AdafactorHyperParams {
        lr,
        ..Default::default()
    }
}

#[test]
fn test_check_shape_classification() {
    assert_eq!(check_shape(&[2, 3, 4]), (true, true));
    assert_eq!(check_shape(&[5, 1]), (true, false));
    assert_eq!(check_shape(&[1, 5]), (true, false));
    assert_eq!(check_shape(&[7]), (false, false));
    assert_eq!(check_shape(&[]), (false, false));
}

#[test]
fn test_factored_shape() {
    assert_eq!(factored_shape(&[2, 3, 4]), [2, 12]);
    // trailing [4, 5]: the first trailing dim joins the columns, the second the rows
    assert_eq!(factored_shape(&[2, 3, 4, 5]), [10, 12]);
    // trailing [4, 5, 6]: split after two dims
    assert_eq!(factored_shape(&[2, 3, 4, 5, 6]), [12, 60]);
}

#[test]
fn test_rank3_parameter_uses_factored_state() -> Result<()> {
    init_logger();
    let mut rng = StdRng::seed_from_u64(42);
    let data = Tensor::randn(&[2, 3, 4], &mut rng).into_vec();
    let grad = Tensor::randn(&[2, 3, 4], &mut rng).into_vec();
    let param = param_with_grad(data, vec![2, 3, 4], grad);

    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], adafactor(0.01))?;
    optimizer.step()?;

    let state = optimizer.state(0).unwrap();
    match &state.second_moment {
        SecondMoment::Factored { row, col } => {
            assert_eq!(row.shape(), &[1, 12]);
            assert_eq!(col.shape(), &[2, 1]);
            assert_eq!(row.shape()[1] * col.shape()[0], 2 * 3 * 4);
        }
        SecondMoment::Full(_) => panic!("rank-3 parameters must be factored"),
    }
    assert_eq!(state.exp_avg.as_ref().map(|m| m.shape().to_vec()), Some(vec![2, 12]));
    assert_eq!(param.read().unwrap().shape(), &[2, 3, 4]);
    Ok(())
}

#[test]
fn test_matrix_first_step_with_uniform_gradient() -> Result<()> {
    let param = param_with_grad(vec![1.0; 4], vec![2, 2], vec![1.0; 4]);
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], adafactor(0.1))?;
    optimizer.step()?;
    // row = [2, 2], col = [2, 2]^T, v = col * row / 4 = 1, u = g; lr_t = 0.1 * rms(p) = 0.1
    assert_vec_f32_eq(&values(&param), &[0.9; 4], 1e-6);
    Ok(())
}

#[test]
fn test_vector_first_step_scales_by_parameter_rms() -> Result<()> {
    let param = param_with_grad(vec![3.0, 4.0], vec![2], vec![1.0, -1.0]);
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], adafactor(0.1))?;
    optimizer.step()?;
    let lr_t = 0.1 * (12.5f32).sqrt();
    assert_vec_f32_eq(&values(&param), &[3.0 - lr_t, 4.0 + lr_t], 1e-5);
    let state = optimizer.state(0).unwrap();
    assert!(matches!(state.second_moment, SecondMoment::Full(_)));
    Ok(())
}

#[test]
fn test_small_parameters_use_eps2_floor() -> Result<()> {
    let param = param_with_grad(vec![0.0, 0.0], vec![2], vec![1.0, 1.0]);
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], adafactor(1.0))?;
    optimizer.step()?;
    assert_vec_f32_eq(&values(&param), &[-1e-3, -1e-3], 1e-7);
    Ok(())
}

#[test]
fn test_update_is_clipped_to_threshold() -> Result<()> {
    let param = param_with_grad(vec![1.0, 1.0], vec![2], vec![1.0, 1.0]);
    let options = AdafactorHyperParams {
        lr: 0.1,
        clipping_threshold: 0.5,
        ..Default::default()
    };
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], options)?;
    optimizer.step()?;
    // u = [1, 1], rms(u) = 1 -> u / 2
    assert_vec_f32_eq(&values(&param), &[0.95, 0.95], 1e-6);
    Ok(())
}

#[test]
fn test_without_factorization_keeps_full_second_moment() -> Result<()> {
    let param = param_with_grad(vec![1.0; 8], vec![2, 2, 2], vec![0.5; 8]);
    let options = AdafactorHyperParams {
        factorized: false,
        beta1: None,
        ..adafactor(0.1)
    };
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], options)?;
    optimizer.step()?;
    let state = optimizer.state(0).unwrap();
    match &state.second_moment {
        SecondMoment::Full(v) => assert_eq!(v.shape(), &[2, 2, 2]),
        SecondMoment::Factored { .. } => panic!("factorization is disabled"),
    }
    assert!(state.exp_avg.is_none());
    Ok(())
}

#[test]
fn test_amsgrad_tracks_maximum() -> Result<()> {
    let param = param_with_grad(vec![1.0, 1.0], vec![2], vec![1.0, 0.5]);
    let options = AdafactorHyperParams {
        correction: MomentCorrection::AmsGrad,
        ..adafactor(0.01)
    };
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], options)?;
    optimizer.step()?;
    optimizer.zero_grad()?;
    optimizer.step()?;
    let state = optimizer.state(0).unwrap();
    let hat = state.exp_avg_sq_hat.as_ref().unwrap();
    let SecondMoment::Full(v) = &state.second_moment else {
        panic!("vector parameters keep a full second moment");
    };
    for (h, vi) in hat.data().iter().zip(v.data()) {
        assert!(h >= vi);
    }
    assert_relative_eq!(hat.data()[0], 0.001, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_weight_decay_shrinks_parameter() -> Result<()> {
    let param = param_with_grad(vec![0.0; 2], vec![2], vec![0.0; 2]);
    {
        let mut guard = param.write().unwrap();
        guard.tensor_mut().fill_(2.0);
    }
    let options = AdafactorHyperParams {
        weight_decay: 0.5,
        beta1: None,
        ..adafactor(0.1)
    };
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], options)?;
    optimizer.step()?;
    // zero gradient -> u = 0; lr_t = 0.2; p *= 1 - 0.5 * 0.2
    assert_vec_f32_eq(&values(&param), &[1.8, 1.8], 1e-6);
    Ok(())
}

#[test]
fn test_adafactor_rejects_sparse() -> Result<()> {
    let param = Parameter::new_unnamed(Tensor::zeros(&[2, 1])).shared();
    set_sparse_grad(&param, vec![0], vec![1.0]);
    let mut optimizer = AdafactorOptimizer::new(vec![param], AdafactorHyperParams::default())?;
    assert!(matches!(
        optimizer.step(),
        Err(StepwiseError::SparseGradientUnsupported { .. })
    ));
    Ok(())
}

#[test]
fn test_momentum_from_beta1() {
    assert_eq!(AdafactorHyperParams::momentum_from(0.0), None);
    assert_eq!(AdafactorHyperParams::momentum_from(0.9), Some(0.9));
}

#[test]
fn test_two_steps_with_non_constant_decay() -> Result<()> {
    init_logger();
    let param = param_with_grad(vec![1.0, 2.0], vec![2], vec![0.2, -0.1]);
    let options = AdafactorHyperParams {
        clipping_threshold: 2.0,
        ..adafactor(0.1)
    };
    let mut optimizer = AdafactorOptimizer::new(vec![param.clone()], options)?;
    optimizer.step()?;
    // beta1_t = beta2_t = 0 at step 1: u = [1, -1], lr_t = 0.1 * rms([1, 2])
    let lr_1 = 0.1 * (2.5f32).sqrt();
    assert_vec_f32_eq(&values(&param), &[1.0 - lr_1, 2.0 + lr_1], 1e-5);

    set_grad(&param, vec![0.1, -0.1], vec![2]);
    optimizer.step()?;
    // beta1_t = 0.9 * 0.1 / 0.19, beta2_t = 0.999 * 0.001 / 0.001999
    let state = optimizer.state(0).unwrap();
    assert_eq!(state.step, 2);
    let exp_avg = state.exp_avg.as_ref().unwrap();
    assert_vec_f32_eq(exp_avg.data(), &[0.147_368_42, -0.1], 1e-6);
    let SecondMoment::Full(v) = &state.second_moment else {
        panic!("vector parameters keep a full second moment");
    };
    assert_vec_f32_eq(v.data(), &[0.024_992_496, 0.01], 1e-6);
    // u = [1.2018459, -1.2892857], rms(u) < 2; lr_t = 0.1 * rms(p after step 1)
    assert_vec_f32_eq(&values(&param), &[0.645_021_2, 2.369_301_6], 1e-5);
    Ok(())
}

fn one_step_state(shape: Vec<usize>, options: AdafactorHyperParams) -> Result<OptimizerState> {
    let numel = shape.iter().product();
    let param = param_with_grad(vec![1.0; numel], shape, vec![0.5; numel]);
    let mut optimizer = AdafactorOptimizer::new(vec![param], options)?;
    optimizer.step()?;
    Ok(optimizer.state_dict())
}

fn load_into(shape: Vec<usize>, options: AdafactorHyperParams, saved: &OptimizerState) -> Result<()> {
    let numel = shape.iter().product();
    let param = param_with_grad(vec![1.0; numel], shape, vec![0.5; numel]);
    let mut optimizer = AdafactorOptimizer::new(vec![param], options)?;
    optimizer.load_state_dict(saved)
}

#[test]
fn test_load_rejects_matrix_state_with_same_numel() -> Result<()> {
    let saved = one_step_state(vec![3, 4], adafactor(0.1))?;
    load_into(vec![3, 4], adafactor(0.1), &saved)?;
    assert!(matches!(
        load_into(vec![2, 6], adafactor(0.1), &saved),
        Err(StepwiseError::StateDictMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_load_checks_factored_view_of_rank3_state() -> Result<()> {
    let saved = one_step_state(vec![2, 3, 4], adafactor(0.1))?;
    load_into(vec![2, 3, 4], adafactor(0.1), &saved)?;
    // same element count, but the working view is [4, 6] instead of [2, 12]
    assert!(matches!(
        load_into(vec![4, 3, 2], adafactor(0.1), &saved),
        Err(StepwiseError::StateDictMismatch(_))
    ));
    let unfactored = AdafactorHyperParams {
        factorized: false,
        ..adafactor(0.1)
    };
    assert!(matches!(
        load_into(vec![2, 3, 4], unfactored, &saved),
        Err(StepwiseError::StateDictMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_working_shape() {
    assert_eq!(working_shape(&[2, 3, 4], true), vec![2, 12]);
    assert_eq!(working_shape(&[2, 3, 4], false), vec![2, 3, 4]);
    assert_eq!(working_shape(&[3, 4], true), vec![3, 4]);
    assert_eq!(working_shape(&[5], true), vec![5]);
}
