//! Reference CPU kernels.
//!
//! Every operation decodes its operands to f32, computes row-parallel with
//! rayon and re-encodes into the first operand's element type. Accelerator
//! buffers are emulated in host memory, so the same kernels serve both
//! device tags.

use rayon::prelude::*;
use stratum_core::{DType, Device, NativeTensor, Result, StratumError};

use crate::numeric::NumericBackend;

/// Row-parallel f32 implementation of [`NumericBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl CpuKernels {
    pub fn new() -> Self {
        Self
    }
}

/// Encode `data` in `like`'s float type (f32 for non-float inputs) on `like`'s device.
fn output_like(like: &NativeTensor, data: &[f32], dims: &[usize]) -> Result<NativeTensor> {
    let dtype = if like.dtype().is_float() {
        like.dtype()
    } else {
        DType::F32
    };
    NativeTensor::from_f32_as(data, dims, dtype, like.device())
}

fn last_dim(t: &NativeTensor) -> Result<usize> {
    t.dims()
        .last()
        .copied()
        .ok_or_else(|| StratumError::ShapeMismatch("expected at least one axis".into()))
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl NumericBackend for CpuKernels {
    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn has_fast_path(&self, device: Device, dtype: DType) -> bool {
        match dtype {
            DType::F32 => true,
            DType::F16 => device.is_accelerator(),
            _ => false,
        }
    }

    fn linear(&self, x: &NativeTensor, w: &NativeTensor, b: Option<&NativeTensor>) -> Result<NativeTensor> {
        let n_in = last_dim(x)?;
        let (n_out, w_in) = match w.dims() {
            [o, i] => (*o, *i),
            _ => {
                return Err(StratumError::ShapeMismatch(format!(
                    "linear weight must be 2-D, got {}",
                    w.shape()
                )))
            }
        };
        if w_in != n_in {
            return Err(StratumError::ShapeMismatch(format!(
                "linear of {} with weight {}",
                x.shape(),
                w.shape()
            )));
        }
        let bias = b.map(|b| b.to_f32_vec());
        if let Some(bias) = &bias {
            if bias.len() != n_out {
                return Err(StratumError::ShapeMismatch(format!(
                    "bias of {} for {n_out} outputs",
                    bias.len()
                )));
            }
        }

        let xs = x.to_f32_vec();
        let ws = w.to_f32_vec();
        let rows = if n_in == 0 { 0 } else { xs.len() / n_in };
        let mut out = vec![0.0f32; rows * n_out];
        if n_out > 0 {
            out.par_chunks_mut(n_out).enumerate().for_each(|(r, row)| {
                let xr = &xs[r * n_in..(r + 1) * n_in];
                for (o, y) in row.iter_mut().enumerate() {
                    let mut acc = dot(xr, &ws[o * n_in..(o + 1) * n_in]);
                    if let Some(bias) = &bias {
                        acc += bias[o];
                    }
                    *y = acc;
                }
            });
        }

        let mut dims = x.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = n_out;
        }
        output_like(x, &out, &dims)
    }

    fn bmm(&self, a: &NativeTensor, b: &NativeTensor) -> Result<NativeTensor> {
        let (n, m, k, p) = match (a.dims(), b.dims()) {
            ([n, m, k], [n2, k2, p]) if n == n2 && k == k2 => (*n, *m, *k, *p),
            _ => {
                return Err(StratumError::ShapeMismatch(format!(
                    "bmm of {} and {}",
                    a.shape(),
                    b.shape()
                )))
            }
        };
        let ad = a.to_f32_vec();
        let bd = b.to_f32_vec();
        let mut out = vec![0.0f32; n * m * p];
        if m * p > 0 {
            out.par_chunks_mut(m * p).enumerate().for_each(|(batch, c)| {
                let a_off = batch * m * k;
                let b_off = batch * k * p;
                for i in 0..m {
                    for q in 0..k {
                        let av = ad[a_off + i * k + q];
                        let b_row = &bd[b_off + q * p..b_off + (q + 1) * p];
                        for (j, bv) in b_row.iter().enumerate() {
                            c[i * p + j] += av * bv;
                        }
                    }
                }
            });
        }
        output_like(a, &out, &[n, m, p])
    }

    fn softmax(&self, x: &NativeTensor) -> Result<NativeTensor> {
        let d = last_dim(x)?;
        let mut data = x.to_f32_vec();
        if d > 0 {
            data.par_chunks_mut(d).for_each(|row| {
                let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for v in row.iter_mut() {
                    *v = (*v - max_val).exp();
                    sum += *v;
                }
                let inv_sum = 1.0 / sum;
                for v in row.iter_mut() {
                    *v *= inv_sum;
                }
            });
        }
        output_like(x, &data, x.dims())
    }

    fn layer_norm(&self, x: &NativeTensor, w: &NativeTensor, b: &NativeTensor, eps: f32) -> Result<NativeTensor> {
        let h = last_dim(x)?;
        let gamma = w.to_f32_vec();
        let beta = b.to_f32_vec();
        if gamma.len() != h || beta.len() != h {
            return Err(StratumError::ShapeMismatch(format!(
                "layer norm over {h} with parameters of {} and {}",
                gamma.len(),
                beta.len()
            )));
        }
        let mut data = x.to_f32_vec();
        if h > 0 {
            data.par_chunks_mut(h).for_each(|row| {
                let mean = row.iter().sum::<f32>() / h as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / h as f32;
                let inv_std = 1.0 / (var + eps).sqrt();
                for (i, v) in row.iter_mut().enumerate() {
                    *v = (*v - mean) * inv_std * gamma[i] + beta[i];
                }
            });
        }
        output_like(x, &data, x.dims())
    }

    fn embedding(&self, ids: &NativeTensor, table: &NativeTensor, padding_idx: Option<usize>) -> Result<NativeTensor> {
        let (vocab, dim) = match table.dims() {
            [v, d] => (*v, *d),
            _ => {
                return Err(StratumError::ShapeMismatch(format!(
                    "embedding table must be 2-D, got {}",
                    table.shape()
                )))
            }
        };
        let rows = table.to_f32_vec();
        let ids_v = ids.to_i64_vec();
        let mut out = vec![0.0f32; ids_v.len() * dim];
        for (slot, &id) in ids_v.iter().enumerate() {
            if id < 0 || id as usize >= vocab {
                return Err(StratumError::ShapeMismatch(format!(
                    "token id {id} outside a table of {vocab}"
                )));
            }
            let id = id as usize;
            if padding_idx == Some(id) {
                continue;
            }
            out[slot * dim..(slot + 1) * dim].copy_from_slice(&rows[id * dim..(id + 1) * dim]);
        }
        let mut dims = ids.dims().to_vec();
        dims.push(dim);
        NativeTensor::from_f32_as(&out, dims, table.dtype(), ids.device())
    }

    fn top_k(&self, x: &NativeTensor, k: usize) -> Result<(NativeTensor, NativeTensor)> {
        let d = last_dim(x)?;
        if k > d {
            return Err(StratumError::ShapeMismatch(format!(
                "top-{k} over an axis of {d}"
            )));
        }
        let data = x.to_f32_vec();
        let rows = if d == 0 { 0 } else { data.len() / d };
        let mut values = Vec::with_capacity(rows * k);
        let mut indices = Vec::with_capacity(rows * k);
        for r in 0..rows {
            let row = &data[r * d..(r + 1) * d];
            let mut order: Vec<usize> = (0..d).collect();
            order.sort_by(|&a, &b| {
                row[b]
                    .partial_cmp(&row[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            for &i in &order[..k] {
                values.push(row[i]);
                indices.push(i as i64);
            }
        }
        let mut dims = x.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = k;
        }
        Ok((
            output_like(x, &values, &dims)?,
            NativeTensor::from_i64(&indices, dims, x.device())?,
        ))
    }

    fn add(&self, a: &NativeTensor, b: &NativeTensor) -> Result<NativeTensor> {
        if a.shape() != b.shape() {
            return Err(StratumError::ShapeMismatch(format!(
                "add of {} and {}",
                a.shape(),
                b.shape()
            )));
        }
        let bd = b.to_f32_vec();
        let mut data = a.to_f32_vec();
        data.par_iter_mut().zip(bd.par_iter()).for_each(|(x, y)| *x += y);
        output_like(a, &data, a.dims())
    }

    fn relu(&self, x: &NativeTensor) -> Result<NativeTensor> {
        let mut data = x.to_f32_vec();
        data.par_iter_mut().for_each(|v| *v = v.max(0.0));
        output_like(x, &data, x.dims())
    }

    fn mul_scalar(&self, x: &NativeTensor, factor: f32) -> Result<NativeTensor> {
        let mut data = x.to_f32_vec();
        data.par_iter_mut().for_each(|v| *v *= factor);
        output_like(x, &data, x.dims())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len(), "length mismatch");
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
        }
    }

    fn t(data: &[f32], dims: &[usize]) -> NativeTensor {
        NativeTensor::from_f32(data, dims, Device::Host).unwrap()
    }

    #[test]
    fn test_fast_path_table() {
        let k = CpuKernels::new();
        assert!(k.has_fast_path(Device::Host, DType::F32));
        assert!(!k.has_fast_path(Device::Host, DType::F16));
        assert!(k.has_fast_path(Device::Accelerator(0), DType::F16));
        assert!(!k.has_fast_path(Device::Accelerator(0), DType::I64));
    }

    #[test]
    fn test_linear_with_bias() {
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        // w = [[1, 0], [1, 1], [0, 2]]
        let w = t(&[1.0, 0.0, 1.0, 1.0, 0.0, 2.0], &[3, 2]);
        let b = t(&[0.5, 0.0, -1.0], &[3]);
        let y = CpuKernels.linear(&x, &w, Some(&b)).unwrap();
        assert_eq!(y.dims(), &[2, 3]);
        assert_close(&y.to_f32_vec(), &[1.5, 3.0, 3.0, 3.5, 7.0, 7.0], 1e-6);
    }

    #[test]
    fn test_linear_keeps_f16() {
        let x = NativeTensor::from_f32_as(&[1.0, 2.0], [1, 2], DType::F16, Device::Accelerator(0)).unwrap();
        let w = NativeTensor::from_f32_as(&[1.0, 1.0], [1, 2], DType::F16, Device::Accelerator(0)).unwrap();
        let y = CpuKernels.linear(&x, &w, None).unwrap();
        assert_eq!(y.dtype(), DType::F16);
        assert_eq!(y.device(), Device::Accelerator(0));
        assert_eq!(y.to_f32_vec(), vec![3.0]);
    }

    #[test]
    fn test_bmm() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 1.0, 0.0, 0.0, 1.0], &[2, 2, 2]);
        let b = t(&[1.0, 1.0, 0.0, 1.0, 5.0, 6.0, 7.0, 8.0], &[2, 2, 2]);
        let c = CpuKernels.bmm(&a, &b).unwrap();
        assert_close(&c.to_f32_vec(), &[1.0, 3.0, 3.0, 7.0, 5.0, 6.0, 7.0, 8.0], 1e-6);
        assert!(CpuKernels.bmm(&a, &t(&[1.0; 6], &[2, 3, 1])).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = t(&[1.0, 2.0, 3.0, -1e4, 0.0, -1e4], &[2, 3]);
        let y = CpuKernels.softmax(&x).unwrap().to_f32_vec();
        assert_close(&[y[0] + y[1] + y[2], y[3] + y[4] + y[5]], &[1.0, 1.0], 1e-5);
        assert!(y[2] > y[1] && y[1] > y[0]);
        assert_close(&y[3..], &[0.0, 1.0, 0.0], 1e-6);
    }

    #[test]
    fn test_layer_norm() {
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);
        let y = CpuKernels
            .layer_norm(&x, &t(&[1.0; 4], &[4]), &t(&[0.0; 4], &[4]), 1e-5)
            .unwrap()
            .to_f32_vec();
        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(y[0] < 0.0 && y[3] > 0.0);
    }

    #[test]
    fn test_embedding_padding_rows_are_zero() {
        let table = t(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0], &[3, 2]);
        let ids = NativeTensor::from_i64(&[2, 0, 1], [1, 3], Device::Host).unwrap();
        let e = CpuKernels.embedding(&ids, &table, Some(0)).unwrap();
        assert_eq!(e.dims(), &[1, 3, 2]);
        assert_eq!(e.to_f32_vec(), vec![3.0, 3.0, 0.0, 0.0, 2.0, 2.0]);
        let bad = NativeTensor::from_i64(&[3], [1], Device::Host).unwrap();
        assert!(CpuKernels.embedding(&bad, &table, None).is_err());
    }

    #[test]
    fn test_top_k() {
        let x = t(&[0.1, 0.5, 0.2, 0.9, 0.3, 0.3, 0.1, 0.0], &[2, 4]);
        let (v, i) = CpuKernels.top_k(&x, 2).unwrap();
        assert_eq!(v.dims(), &[2, 2]);
        assert_close(&v.to_f32_vec(), &[0.9, 0.5, 0.3, 0.3], 1e-6);
        assert_eq!(i.to_i64_vec(), vec![3, 1, 0, 1]);
        assert!(CpuKernels.top_k(&x, 5).is_err());
    }

    #[test]
    fn test_elementwise() {
        let a = t(&[-1.0, 2.0], &[2]);
        let b = t(&[1.0, 1.0], &[2]);
        assert_eq!(CpuKernels.add(&a, &b).unwrap().to_f32_vec(), vec![0.0, 3.0]);
        assert_eq!(CpuKernels.relu(&a).unwrap().to_f32_vec(), vec![0.0, 2.0]);
        assert_eq!(CpuKernels.mul_scalar(&a, 0.5).unwrap().to_f32_vec(), vec![-0.5, 1.0]);
        assert!(CpuKernels.add(&a, &t(&[1.0], &[1])).is_err());
    }
}
