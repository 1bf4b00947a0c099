#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::SeedableRng;
use stepwise_core::{Parameter, SharedParameter, SparseGradient, Tensor};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn named_param(data: Vec<f32>, shape: Vec<usize>, name: &str) -> SharedParameter {
    Parameter::new(Tensor::new(data, shape).expect("param tensor"), name).shared()
}

pub fn random_param(shape: &[usize], name: &str, seed: u64) -> SharedParameter {
    let mut rng = StdRng::seed_from_u64(seed);
    Parameter::new(Tensor::randn(shape, &mut rng), name).shared()
}

pub fn set_dense_grad(param: &SharedParameter, grad: Vec<f32>) {
    let mut guard = param.write().unwrap();
    let shape = guard.shape().to_vec();
    guard
        .set_grad(Tensor::new(grad, shape).expect("grad tensor"))
        .expect("grad shape");
}

pub fn set_sparse_grad(param: &SharedParameter, indices: Vec<usize>, values: Vec<f32>) {
    let mut guard = param.write().unwrap();
    let dense_shape = guard.shape().to_vec();
    let mut values_shape = vec![indices.len()];
    values_shape.extend_from_slice(&dense_shape[1..]);
    let values = Tensor::new(values, values_shape).expect("sparse values");
    let sparse = SparseGradient::new(indices, values, dense_shape).expect("sparse gradient");
    guard.set_grad(sparse).expect("grad shape");
}

pub fn values(param: &SharedParameter) -> Vec<f32> {
    param.read().unwrap().data().to_vec()
}

pub fn sum_sq(param: &SharedParameter) -> f32 {
    values(param).iter().map(|x| x * x).sum()
}
