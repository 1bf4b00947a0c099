use std::fmt;

use approx::{AbsDiffEq, RelativeEq};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};

/// A dense, contiguous, row-major `f32` tensor.
///
/// Tensors own their buffer. Optimizer state (moment estimates, accumulators)
/// and parameter values are all stored as `Tensor`s and updated in place.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Unchecked wire form; converted through `Tensor::new` so a corrupt
/// checkpoint cannot produce a tensor whose data disagrees with its shape.
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = StepwiseError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Tensor::new(raw.data, raw.shape)
    }
}

impl Tensor {
    /// Creates a tensor from row-major data.
    ///
    /// # Errors
    /// Returns `StepwiseError::TensorCreationError` if `data.len()` does not
    /// match the number of elements described by `shape`.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(StepwiseError::TensorCreationError {
                data_len: data.len(),
                shape,
            });
        }
        Ok(Tensor { shape, data })
    }

    /// Builds a tensor whose length the caller has already checked.
    pub(crate) fn from_parts(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor { shape, data }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let numel = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; numel],
        }
    }

    /// A rank-0 tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Tensor {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(&other.shape)
    }

    /// Samples every element from the standard normal distribution.
    pub fn randn<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        let numel = shape.iter().product();
        let data = (0..numel)
            .map(|_| StandardNormal.sample(&mut *rng))
            .collect();
        Tensor {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Returns a copy of this tensor viewed with a new shape.
    ///
    /// The data is contiguous, so a reshape only reinterprets the element
    /// order; the number of elements must be preserved.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let mut out = self.clone();
        out.reshape_(shape)?;
        Ok(out)
    }

    /// Reinterprets this tensor with a new shape without copying.
    pub fn reshape_(&mut self, shape: &[usize]) -> Result<()> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(StepwiseError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: shape.to_vec(),
                operation: "reshape".to_string(),
            });
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    fn check_same_shape(&self, other: &Tensor, operation: &str) -> Result<()> {
        if self.shape != other.shape {
            return Err(StepwiseError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: other.shape.clone(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    // --- In-place operations ---

    pub fn fill_(&mut self, value: f32) {
        self.data.iter_mut().for_each(|x| *x = value);
    }

    pub fn add_(&mut self, other: &Tensor) -> Result<()> {
        self.add_scaled_(other, 1.0)
    }

    pub fn sub_(&mut self, other: &Tensor) -> Result<()> {
        self.add_scaled_(other, -1.0)
    }

    /// `self += alpha * other`
    pub fn add_scaled_(&mut self, other: &Tensor, alpha: f32) -> Result<()> {
        self.check_same_shape(other, "add_scaled_")?;
        for (x, y) in self.data.iter_mut().zip(&other.data) {
            *x += alpha * y;
        }
        Ok(())
    }

    /// `self += value * a * b`, element-wise.
    pub fn addcmul_(&mut self, value: f32, a: &Tensor, b: &Tensor) -> Result<()> {
        self.check_same_shape(a, "addcmul_")?;
        self.check_same_shape(b, "addcmul_")?;
        for ((x, ai), bi) in self.data.iter_mut().zip(&a.data).zip(&b.data) {
            *x += value * ai * bi;
        }
        Ok(())
    }

    pub fn mul_scalar_(&mut self, scalar: f32) {
        self.data.iter_mut().for_each(|x| *x *= scalar);
    }

    pub fn add_scalar_(&mut self, scalar: f32) {
        self.data.iter_mut().for_each(|x| *x += scalar);
    }

    /// Element-wise maximum with `other`, stored in `self`.
    pub fn max_(&mut self, other: &Tensor) -> Result<()> {
        self.check_same_shape(other, "max_")?;
        for (x, y) in self.data.iter_mut().zip(&other.data) {
            *x = x.max(*y);
        }
        Ok(())
    }

    // --- Value-returning operations ---

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        self.check_same_shape(other, "zip_map")?;
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    pub fn square(&self) -> Tensor {
        self.map(|x| x * x)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_map(other, |a, b| a / b)
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        self.sum() / self.numel() as f32
    }

    /// Root mean square of all elements.
    pub fn rms(&self) -> f32 {
        let sum_sq: f64 = self.data.iter().map(|&x| (x as f64) * (x as f64)).sum();
        (sum_sq / self.numel() as f64).sqrt() as f32
    }

    /// p-norm of the flattened tensor.
    pub fn norm(&self, p: f32) -> f32 {
        let total: f64 = self
            .data
            .iter()
            .map(|&x| (x.abs() as f64).powf(p as f64))
            .sum();
        total.powf(1.0 / p as f64) as f32
    }

    /// Sums a 2-D tensor along `dim`, keeping the reduced dimension with size 1.
    pub fn sum_dim_keepdim(&self, dim: usize) -> Result<Tensor> {
        let (rows, cols) = self.as_matrix("sum_dim_keepdim")?;
        if rows == 0 || cols == 0 {
            return match dim {
                0 => Ok(Tensor::zeros(&[1, cols])),
                1 => Ok(Tensor::zeros(&[rows, 1])),
                _ => Err(StepwiseError::IndexOutOfBounds { index: dim, size: 2 }),
            };
        }
        match dim {
            0 => {
                let mut out = vec![0.0; cols];
                for row in self.data.chunks(cols) {
                    for (acc, x) in out.iter_mut().zip(row) {
                        *acc += x;
                    }
                }
                Tensor::new(out, vec![1, cols])
            }
            1 => {
                let out = self.data.chunks(cols).map(|row| row.iter().sum()).collect();
                Tensor::new(out, vec![rows, 1])
            }
            _ => Err(StepwiseError::IndexOutOfBounds { index: dim, size: 2 }),
        }
    }

    /// Outer product of a column `[rows, 1]` and a row `[1, cols]`.
    pub fn outer(column: &Tensor, row: &Tensor) -> Result<Tensor> {
        let (rows, c1) = column.as_matrix("outer")?;
        let (r1, cols) = row.as_matrix("outer")?;
        if c1 != 1 || r1 != 1 {
            return Err(StepwiseError::ShapeMismatch {
                expected: vec![rows, 1],
                actual: row.shape.clone(),
                operation: "outer".to_string(),
            });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for &c in &column.data {
            data.extend(row.data.iter().map(|&r| c * r));
        }
        Tensor::new(data, vec![rows, cols])
    }

    fn as_matrix(&self, operation: &str) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            _ => Err(StepwiseError::UnsupportedOperation(format!(
                "{} expects a 2-D tensor, got shape {:?}",
                operation, self.shape
            ))),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &self.data)
            .finish()
    }
}

impl AbsDiffEq for Tensor {
    type Epsilon = f32;

    fn default_epsilon() -> f32 {
        f32::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.abs_diff_eq(b, epsilon))
    }
}

impl RelativeEq for Tensor {
    fn default_max_relative() -> f32 {
        f32::EPSILON
    }

    fn relative_eq(&self, other: &Self, epsilon: f32, max_relative: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.relative_eq(b, epsilon, max_relative))
    }
}

#[cfg(test)]
#[path = "tensor_test.rs"]
mod tests;
