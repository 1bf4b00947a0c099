use super::*;
use crate::test_utils::{param_with_grad, set_sparse_grad};
use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use stepwise_core::{Parameter, Tensor};

fn grad_of(param: &SharedParameter) -> Vec<f32> {
    param
        .read()
        .unwrap()
        .grad()
        .and_then(|g| g.as_dense())
        .map(|t| t.data().to_vec())
        .unwrap_or_default()
}

#[test]
fn test_norm_above_threshold_is_scaled_down() -> Result<()> {
    let a = param_with_grad(vec![0.0, 0.0], vec![2], vec![3.0, 0.0]);
    let b = param_with_grad(vec![0.0], vec![1], vec![4.0]);
    let params = vec![a.clone(), b.clone()];

    let norm = clip_grad_norm_(&params, 1.0)?;
    assert_relative_eq!(norm, 5.0, epsilon = 1e-6);
    assert_relative_eq!(total_grad_norm(&params)?, 1.0, epsilon = 1e-5);
    assert_relative_eq!(grad_of(&a)[0], 0.6, epsilon = 1e-5);
    assert_relative_eq!(grad_of(&b)[0], 0.8, epsilon = 1e-5);
    Ok(())
}

#[test]
fn test_norm_below_threshold_is_untouched() -> Result<()> {
    let a = param_with_grad(vec![0.0, 0.0], vec![2], vec![0.3, 0.4]);
    let norm = clip_grad_norm_(&[a.clone()], 1.0)?;
    assert_relative_eq!(norm, 0.5, epsilon = 1e-6);
    assert_eq!(grad_of(&a), vec![0.3, 0.4]);
    Ok(())
}

#[test]
fn test_clipped_norm_never_exceeds_threshold() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    for max_norm in [0.01f32, 0.5, 2.0, 10.0] {
        let params: Vec<SharedParameter> = (0..4)
            .map(|_| {
                let param = Parameter::new_unnamed(Tensor::zeros(&[3, 5])).shared();
                let grad = Tensor::randn(&[3, 5], &mut rng);
                param.write().unwrap().set_grad(grad).unwrap();
                param
            })
            .collect();
        clip_grad_norm_(&params, max_norm)?;
        assert!(total_grad_norm(&params)? <= max_norm + 1e-5);
    }
    Ok(())
}

#[test]
fn test_sparse_and_missing_gradients() -> Result<()> {
    let embedding = Parameter::new(Tensor::zeros(&[3, 2]), "embeddings").shared();
    set_sparse_grad(&embedding, vec![1, 1], vec![3.0, 0.0, 0.0, 4.0]);
    let without_grad = Parameter::new_unnamed(Tensor::zeros(&[2])).shared();

    let norm = total_grad_norm(&[embedding.clone(), without_grad.clone()])?;
    assert_relative_eq!(norm, 5.0, epsilon = 1e-6);

    clip_grad_norm_(&[embedding.clone(), without_grad.clone()], 2.5)?;
    assert_relative_eq!(total_grad_norm(&[embedding])?, 2.5, epsilon = 1e-5);
    assert!(without_grad.read().unwrap().grad().is_none());
    Ok(())
}

#[test]
fn test_negative_threshold_is_rejected() {
    let a = param_with_grad(vec![0.0], vec![1], vec![1.0]);
    assert!(matches!(
        clip_grad_norm_(&[a], -1.0),
        Err(StepwiseError::ConfigurationError(_))
    ));
}
