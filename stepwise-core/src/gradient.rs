use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};
use crate::tensor::Tensor;

/// A row-sparse gradient, as produced by embedding lookups.
///
/// `values` has shape `[nnz, dense_shape[1..]]`; row `i` of `values` belongs to
/// row `indices[i]` of the dense tensor. Indices may repeat until the gradient
/// is coalesced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSparseGradient")]
pub struct SparseGradient {
    indices: Vec<usize>,
    values: Tensor,
    dense_shape: Vec<usize>,
}

/// Unchecked wire form, validated through `SparseGradient::new`.
#[derive(Deserialize)]
struct RawSparseGradient {
    indices: Vec<usize>,
    values: Tensor,
    dense_shape: Vec<usize>,
}

impl TryFrom<RawSparseGradient> for SparseGradient {
    type Error = StepwiseError;

    fn try_from(raw: RawSparseGradient) -> Result<Self> {
        SparseGradient::new(raw.indices, raw.values, raw.dense_shape)
    }
}

impl SparseGradient {
    pub fn new(indices: Vec<usize>, values: Tensor, dense_shape: Vec<usize>) -> Result<Self> {
        let Some((&rows, trailing)) = dense_shape.split_first() else {
            return Err(StepwiseError::UnsupportedOperation(
                "sparse gradient of a rank-0 tensor".to_string(),
            ));
        };
        let mut expected = vec![indices.len()];
        expected.extend_from_slice(trailing);
        if values.shape() != expected.as_slice() {
            return Err(StepwiseError::ShapeMismatch {
                expected,
                actual: values.shape().to_vec(),
                operation: "SparseGradient::new".to_string(),
            });
        }
        if let Some(&index) = indices.iter().find(|&&i| i >= rows) {
            return Err(StepwiseError::IndexOutOfBounds { index, size: rows });
        }
        Ok(SparseGradient {
            indices,
            values,
            dense_shape,
        })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn dense_shape(&self) -> &[usize] {
        &self.dense_shape
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Number of elements in one dense row.
    pub fn row_width(&self) -> usize {
        self.dense_shape[1..].iter().product()
    }

    /// Values of the `i`-th stored row.
    pub fn row(&self, i: usize) -> &[f32] {
        let width = self.row_width();
        &self.values.data()[i * width..(i + 1) * width]
    }

    /// Sorts the indices and sums the rows of duplicated indices.
    pub fn coalesce(&self) -> SparseGradient {
        let width = self.row_width();
        let mut rows: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        for (i, &index) in self.indices.iter().enumerate() {
            let acc = rows.entry(index).or_insert_with(|| vec![0.0; width]);
            for (a, v) in acc.iter_mut().zip(self.row(i)) {
                *a += v;
            }
        }
        let indices: Vec<usize> = rows.keys().copied().collect();
        let mut values_shape = vec![indices.len()];
        values_shape.extend_from_slice(&self.dense_shape[1..]);
        let data = rows.into_values().flatten().collect();
        SparseGradient {
            indices,
            values: Tensor::from_parts(data, values_shape),
            dense_shape: self.dense_shape.clone(),
        }
    }

    pub fn to_dense(&self) -> Tensor {
        let width = self.row_width();
        let mut dense = Tensor::zeros(&self.dense_shape);
        for (i, &index) in self.indices.iter().enumerate() {
            let target = &mut dense.data_mut()[index * width..(index + 1) * width];
            for (t, v) in target.iter_mut().zip(self.row(i)) {
                *t += v;
            }
        }
        dense
    }

    /// Squared L2 norm of the dense equivalent.
    pub fn norm_sq(&self) -> f64 {
        self.coalesce()
            .values
            .data()
            .iter()
            .map(|&x| (x as f64) * (x as f64))
            .sum()
    }

    pub fn scale_(&mut self, factor: f32) {
        self.values.mul_scalar_(factor);
    }

    /// Drops every stored row; the dense equivalent becomes all zeros.
    pub fn clear(&mut self) {
        let mut values_shape = vec![0];
        values_shape.extend_from_slice(&self.dense_shape[1..]);
        self.indices.clear();
        self.values = Tensor::zeros(&values_shape);
    }

    /// Appends the rows of `other`, which must describe the same dense shape.
    pub fn extend(&mut self, other: &SparseGradient) -> Result<()> {
        if self.dense_shape != other.dense_shape {
            return Err(StepwiseError::ShapeMismatch {
                expected: self.dense_shape.clone(),
                actual: other.dense_shape.clone(),
                operation: "SparseGradient::extend".to_string(),
            });
        }
        self.indices.extend_from_slice(&other.indices);
        let mut data = std::mem::replace(&mut self.values, Tensor::scalar(0.0)).into_vec();
        data.extend_from_slice(other.values.data());
        let mut values_shape = vec![self.indices.len()];
        values_shape.extend_from_slice(&self.dense_shape[1..]);
        self.values = Tensor::new(data, values_shape)?;
        Ok(())
    }
}

/// Gradient attached to a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Gradient {
    Dense(Tensor),
    Sparse(SparseGradient),
}

impl Gradient {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    /// Shape of the dense tensor this gradient describes.
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(t) => t.shape(),
            Gradient::Sparse(s) => s.dense_shape(),
        }
    }

    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Gradient::Dense(t) => Some(t),
            Gradient::Sparse(_) => None,
        }
    }

    /// Squared L2 norm, used by global-norm clipping.
    pub fn norm_sq(&self) -> f64 {
        match self {
            Gradient::Dense(t) => t.data().iter().map(|&x| (x as f64) * (x as f64)).sum(),
            Gradient::Sparse(s) => s.norm_sq(),
        }
    }

    pub fn scale_(&mut self, factor: f32) {
        match self {
            Gradient::Dense(t) => t.mul_scalar_(factor),
            Gradient::Sparse(s) => s.scale_(factor),
        }
    }

    /// Zeroes the gradient while keeping its buffer and layout.
    pub fn zero_(&mut self) {
        match self {
            Gradient::Dense(t) => t.fill_(0.0),
            Gradient::Sparse(s) => s.clear(),
        }
    }
}

impl From<Tensor> for Gradient {
    fn from(tensor: Tensor) -> Self {
        Gradient::Dense(tensor)
    }
}

impl From<SparseGradient> for Gradient {
    fn from(sparse: SparseGradient) -> Self {
        Gradient::Sparse(sparse)
    }
}

#[cfg(test)]
#[path = "gradient_test.rs"]
mod tests;
