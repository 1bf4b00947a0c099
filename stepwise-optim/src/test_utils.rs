use stepwise_core::{Parameter, SharedParameter, SparseGradient, Tensor};

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Helper to create a shared parameter with a dense gradient already attached.
pub(crate) fn param_with_grad(data: Vec<f32>, shape: Vec<usize>, grad: Vec<f32>) -> SharedParameter {
    let param = Parameter::new_unnamed(Tensor::new(data, shape.clone()).expect("param tensor"))
        .shared();
    set_grad(&param, grad, shape);
    param
}

pub(crate) fn set_grad(param: &SharedParameter, grad: Vec<f32>, shape: Vec<usize>) {
    param
        .write()
        .unwrap()
        .set_grad(Tensor::new(grad, shape).expect("grad tensor"))
        .expect("grad shape");
}

pub(crate) fn set_sparse_grad(param: &SharedParameter, indices: Vec<usize>, values: Vec<f32>) {
    let mut guard = param.write().unwrap();
    let dense_shape = guard.shape().to_vec();
    let mut values_shape = vec![indices.len()];
    values_shape.extend_from_slice(&dense_shape[1..]);
    let values = Tensor::new(values, values_shape).expect("sparse values");
    let sparse = SparseGradient::new(indices, values, dense_shape).expect("sparse gradient");
    guard.set_grad(sparse).expect("grad shape");
}

pub(crate) fn values(param: &SharedParameter) -> Vec<f32> {
    param.read().unwrap().data().to_vec()
}

pub(crate) fn assert_vec_f32_eq(a: &[f32], b: &[f32], epsilon: f32) {
    assert_eq!(a.len(), b.len(), "Vector lengths differ: A has {}, B has {}", a.len(), b.len());
    for (i, (val_a, val_b)) in a.iter().zip(b.iter()).enumerate() {
        if (val_a - val_b).abs() > epsilon {
            panic!(
                "Mismatch at index {}: left = {}, right = {}, diff = {}, epsilon = {}",
                i,
                val_a,
                val_b,
                (val_a - val_b).abs(),
                epsilon
            );
        }
    }
}
