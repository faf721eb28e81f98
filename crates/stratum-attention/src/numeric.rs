//! The numeric capability consumed by the compute stages.
//!
//! Operations take and return native buffers. Results live on the device of
//! the first operand and keep its element type unless stated otherwise.

use stratum_core::{DType, Device, NativeTensor, Result};

pub trait NumericBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `dtype` is computed natively on `device`. Callers without a
    /// fast path stage their operands through f32 host buffers.
    fn has_fast_path(&self, device: Device, dtype: DType) -> bool;

    /// `x @ w^T + b` over the last axis; `w` is `(out, in)`.
    fn linear(&self, x: &NativeTensor, w: &NativeTensor, b: Option<&NativeTensor>) -> Result<NativeTensor>;

    /// `(n, m, k) @ (n, k, p) -> (n, m, p)`.
    fn bmm(&self, a: &NativeTensor, b: &NativeTensor) -> Result<NativeTensor>;

    /// Softmax over the last axis, accumulated in f32.
    fn softmax(&self, x: &NativeTensor) -> Result<NativeTensor>;

    fn layer_norm(&self, x: &NativeTensor, w: &NativeTensor, b: &NativeTensor, eps: f32) -> Result<NativeTensor>;

    /// Row lookup: `ids` of any integer dtype, output `ids.dims + [dim]`.
    /// Ids equal to `padding_idx` produce zero rows.
    fn embedding(&self, ids: &NativeTensor, table: &NativeTensor, padding_idx: Option<usize>) -> Result<NativeTensor>;

    /// The `k` largest entries along the last axis, descending, with their
    /// positions as i64.
    fn top_k(&self, x: &NativeTensor, k: usize) -> Result<(NativeTensor, NativeTensor)>;

    fn add(&self, a: &NativeTensor, b: &NativeTensor) -> Result<NativeTensor>;

    fn relu(&self, x: &NativeTensor) -> Result<NativeTensor>;

    fn mul_scalar(&self, x: &NativeTensor, factor: f32) -> Result<NativeTensor>;
}
