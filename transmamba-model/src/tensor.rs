use anyhow::Result;
use rayon::prelude::*;

/// Dense row-major f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            anyhow::bail!("Tensor data has {} elements but shape {:?} needs {}", data.len(), shape, expected);
        }
        Ok(Self { data, shape })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self { data: vec![0.0; shape.iter().product()], shape: shape.to_vec() }
    }

    pub fn filled(shape: &[usize], value: f32) -> Self {
        Self { data: vec![value; shape.iter().product()], shape: shape.to_vec() }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Extracts entry `index` of the axis `axis` of a stacked tensor, dropping that axis.
    pub fn unstack(&self, axis: usize, index: usize) -> Result<Tensor> {
        if axis >= self.shape.len() {
            anyhow::bail!("Cannot unstack axis {axis} of a tensor with shape {:?}", self.shape);
        }
        let count = self.shape[axis];
        if index >= count {
            anyhow::bail!("Index {index} out of range for axis {axis} of size {count}");
        }

        let outer = self.shape[..axis].iter().product::<usize>();
        let inner = self.shape[axis + 1..].iter().product::<usize>();

        let mut data = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let start = (o * count + index) * inner;
            data.extend_from_slice(&self.data[start..start + inner]);
        }

        let mut shape = self.shape.clone();
        shape.remove(axis);
        Tensor::new(data, shape)
    }

    /// Inverse of [`Tensor::unstack`]: stacks equally shaped tensors along `axis`.
    pub fn stack(parts: &[Tensor], axis: usize) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            anyhow::bail!("Cannot stack an empty list of tensors");
        };
        if axis > first.shape.len() {
            anyhow::bail!("Cannot stack along axis {axis} for shape {:?}", first.shape);
        }
        if let Some(bad) = parts.iter().find(|t| t.shape != first.shape) {
            anyhow::bail!("Cannot stack shapes {:?} and {:?}", first.shape, bad.shape);
        }

        let outer = first.shape[..axis].iter().product::<usize>();
        let inner = first.shape[axis..].iter().product::<usize>();

        let mut data = Vec::with_capacity(first.numel() * parts.len());
        for o in 0..outer {
            for part in parts {
                data.extend_from_slice(&part.data[o * inner..(o + 1) * inner]);
            }
        }

        let mut shape = first.shape.clone();
        shape.insert(axis, parts.len());
        Tensor::new(data, shape)
    }
}

/// Computes `out = x @ w^T (+ bias)` for a batch of rows.
///
/// `x` is `[rows, n]`, `w` is `[d, n]`, `out` is `[rows, d]`. Rows run in parallel.
pub fn matmul(out: &mut [f32], x: &[f32], w: &[f32], bias: Option<&[f32]>, n: usize, d: usize) {
    debug_assert_eq!(x.len() / n, out.len() / d, "row count mismatch");
    debug_assert_eq!(w.len(), n * d);

    out.par_chunks_mut(d).zip(x.par_chunks(n)).for_each(|(out_row, x_row)| {
        matvec(out_row, x_row, w, n);
        if let Some(bias) = bias {
            out_row.iter_mut().zip(bias).for_each(|(o, &b)| *o += b);
        }
    });
}

/// Single-row matrix-vector product `out[i] = w[i, :] · x`.
#[inline]
pub fn matvec(out: &mut [f32], x: &[f32], w: &[f32], n: usize) {
    out.iter_mut().enumerate().for_each(|(i, o)| {
        *o = w[i * n..(i + 1) * n].iter().zip(x).map(|(&w, &x)| w * x).sum();
    });
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// `ln(1 + e^x)`, linear above a threshold where the exponential would overflow.
#[inline]
pub fn softplus(x: f32) -> f32 {
    if x > 20.0 { x } else { x.exp().ln_1p() }
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}
