//! Symmetric per-row int8 quantization.
//!
//! Each row of `row_len` values is stored as `i8` with one `f32` scale:
//! `scale = max|x| / 127` and `q = round_half_even(x / scale)`, clamped to
//! `[-128, 127]`. All-zero rows keep a zero scale and quantize to zeros.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

const INT8_MAX: f32 = 127.0;

/// Quantizes a single value against `scale`.
pub fn quantize_value(value: f32, scale: f32) -> i8 {
    if scale == 0.0 {
        return 0;
    }
    (value / scale).round_ties_even().clamp(-128.0, 127.0) as i8
}

/// Dot product of two int8 rows accumulated in i32.
pub fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    a.iter().zip(b).map(|(&x, &y)| x as i32 * y as i32).sum()
}

/// Host-side int8 matrix with one scale per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Int8Rows {
    values: Vec<i8>,
    scales: Vec<f32>,
    row_len: usize,
}

impl Int8Rows {
    /// Quantizes `data`, read as consecutive rows of `row_len` values.
    pub fn quantize(data: &[f32], row_len: usize) -> Result<Self, AttentionError> {
        if row_len == 0 || data.len() % row_len != 0 {
            return Err(AttentionError::shape(format!(
                "cannot split {} values into rows of {}",
                data.len(),
                row_len
            )));
        }

        let rows = data.len() / row_len;
        let mut values = Vec::with_capacity(data.len());
        let mut scales = Vec::with_capacity(rows);
        for row in data.chunks_exact(row_len) {
            let max_abs = row.iter().fold(0f32, |acc, x| acc.max(x.abs()));
            let scale = max_abs / INT8_MAX;
            values.extend(row.iter().map(|&x| quantize_value(x, scale)));
            scales.push(scale);
        }

        Ok(Self {
            values,
            scales,
            row_len,
        })
    }

    /// Quantizes a tensor along its last axis.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, AttentionError> {
        let row_len = tensor.dims().last().copied().unwrap_or(0);
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::quantize(&data, row_len)
    }

    pub fn rows(&self) -> usize {
        self.scales.len()
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Quantized values of row `index`, or `None` past the last row.
    pub fn row(&self, index: usize) -> Option<&[i8]> {
        self.values.chunks_exact(self.row_len).nth(index)
    }

    pub fn scale(&self, index: usize) -> Option<f32> {
        self.scales.get(index).copied()
    }

    /// `(values, scale)` for each row in order.
    pub fn iter(&self) -> impl Iterator<Item = (&[i8], f32)> + '_ {
        self.values
            .chunks_exact(self.row_len)
            .zip(self.scales.iter().copied())
    }

    /// Integer dot product of `self[row]` and `other[other_row]`, or `None`
    /// when either row is out of range.
    pub fn dot(&self, row: usize, other: &Int8Rows, other_row: usize) -> Option<i32> {
        Some(dot_i8(self.row(row)?, other.row(other_row)?))
    }

    /// `q * scale` for every element, in row-major order.
    pub fn dequantize(&self) -> Vec<f32> {
        self.values
            .chunks_exact(self.row_len)
            .zip(&self.scales)
            .flat_map(|(row, &scale)| row.iter().map(move |&q| q as f32 * scale))
            .collect()
    }
}
