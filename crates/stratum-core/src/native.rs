//! Native tensors: dense row-major byte buffers tagged with a device.
//!
//! A `NativeTensor` is what the memory tiers hand to compute. Storage is
//! reference-counted and shared by cheap clones and reshapes; layout-changing
//! operations (`permute`, `narrow`, `cat`, `read_region`) materialize a new
//! buffer. Region writes go through [`NativeTensor::copy_region_from`].

use std::fmt;
use std::sync::Arc;

use half::f16;
use parking_lot::RwLock;

use crate::region::{self, Region};
use crate::{DType, Device, Result, Shape, StratumError};

#[derive(Clone)]
pub struct NativeTensor {
    storage: Arc<RwLock<Vec<u8>>>,
    shape: Shape,
    dtype: DType,
    device: Device,
    pinned: bool,
}

impl NativeTensor {
    /// Zero-filled tensor.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: Device) -> Self {
        let shape = shape.into();
        let bytes = vec![0u8; dtype.storage_bytes(shape.numel())];
        Self::wrap(bytes, shape, dtype, device)
    }

    /// Wrap raw row-major bytes.
    pub fn from_bytes(
        bytes: Vec<u8>,
        shape: impl Into<Shape>,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let expected = dtype.storage_bytes(shape.numel());
        if bytes.len() != expected {
            return Err(StratumError::ShapeMismatch(format!(
                "{} bytes for {shape} of {dtype}, expected {expected}",
                bytes.len()
            )));
        }
        Ok(Self::wrap(bytes, shape, dtype, device))
    }

    /// Encode `data` as `dtype`.
    pub fn from_f32_as(
        data: &[f32],
        shape: impl Into<Shape>,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        Self::from_bytes(encode_f32(data, dtype), shape, dtype, device)
    }

    pub fn from_f32(data: &[f32], shape: impl Into<Shape>, device: Device) -> Result<Self> {
        Self::from_f32_as(data, shape, DType::F32, device)
    }

    pub fn from_i64(data: &[i64], shape: impl Into<Shape>, device: Device) -> Result<Self> {
        Self::from_bytes(encode_i64(data, DType::I64), shape, DType::I64, device)
    }

    pub fn from_bool(data: &[bool], shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let bytes = data.iter().map(|&b| b as u8).collect();
        Self::from_bytes(bytes, shape, DType::Bool, device)
    }

    fn wrap(bytes: Vec<u8>, shape: Shape, dtype: DType, device: Device) -> Self {
        Self {
            storage: Arc::new(RwLock::new(bytes)),
            shape,
            dtype,
            device,
            pinned: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// Whether this host buffer is page-locked.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether two tensors share one buffer.
    pub fn same_storage(&self, other: &NativeTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.storage.read())
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.storage.write())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.storage.read().clone()
    }

    // =========================================================================
    // Element views
    // =========================================================================

    pub fn to_f32_vec(&self) -> Vec<f32> {
        decode_f32(&self.storage.read(), self.dtype)
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        decode_i64(&self.storage.read(), self.dtype)
    }

    pub fn to_bool_vec(&self) -> Vec<bool> {
        match self.dtype {
            DType::Bool | DType::U8 => self.storage.read().iter().map(|&b| b != 0).collect(),
            _ => self.to_f32_vec().into_iter().map(|v| v != 0.0).collect(),
        }
    }

    /// Convert element type. Same-dtype casts share storage.
    pub fn cast(&self, dtype: DType) -> NativeTensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let bytes = if dtype.is_float() || self.dtype.is_float() && dtype != DType::Bool {
            if dtype.is_float() {
                encode_f32(&self.to_f32_vec(), dtype)
            } else {
                encode_i64(
                    &self.to_f32_vec().iter().map(|&v| v as i64).collect::<Vec<_>>(),
                    dtype,
                )
            }
        } else if dtype == DType::Bool {
            self.to_bool_vec().into_iter().map(|b| b as u8).collect()
        } else {
            encode_i64(&self.to_i64_vec(), dtype)
        };
        Self::wrap(bytes, self.shape.clone(), dtype, self.device)
    }

    /// Move to another device. Same-device moves share storage.
    pub fn to_device(&self, device: Device) -> NativeTensor {
        if device == self.device {
            return self.clone();
        }
        Self::wrap(self.to_bytes(), self.shape.clone(), self.dtype, device)
    }

    /// Tag a freshly allocated host buffer as page-locked.
    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned && self.device.is_host();
        self
    }

    /// Page-locked host copy; pinned tensors and accelerator tensors are returned as is.
    pub fn pin(&self) -> NativeTensor {
        if self.pinned || !self.device.is_host() {
            return self.clone();
        }
        Self::wrap(self.to_bytes(), self.shape.clone(), self.dtype, self.device).with_pinned(true)
    }

    // =========================================================================
    // Layout
    // =========================================================================

    /// Reinterpret with a new shape of equal element count. Shares storage.
    pub fn reshape(&self, dims: &[usize]) -> Result<NativeTensor> {
        let shape = Shape::new(dims);
        if shape.numel() != self.numel() {
            return Err(StratumError::ShapeMismatch(format!(
                "cannot reshape {} into {shape}",
                self.shape
            )));
        }
        let mut out = self.clone();
        out.shape = shape;
        Ok(out)
    }

    /// Reorder axes; `order[i]` is the source axis of output axis `i`.
    pub fn permute(&self, order: &[usize]) -> Result<NativeTensor> {
        let ndim = self.shape.ndim();
        let mut seen = vec![false; ndim];
        if order.len() != ndim || order.iter().any(|&a| a >= ndim || std::mem::replace(&mut seen[a], true)) {
            return Err(StratumError::ShapeMismatch(format!(
                "invalid permutation {order:?} for {}",
                self.shape
            )));
        }
        let src_dims = self.dims();
        let src_strides = self.shape.contiguous_strides();
        let dims: Vec<usize> = order.iter().map(|&a| src_dims[a]).collect();
        let strides: Vec<usize> = order.iter().map(|&a| src_strides[a]).collect();
        let elem = self.dtype.element_size();
        let numel = self.numel();

        let src = self.storage.read();
        let mut out = Vec::with_capacity(src.len());
        if numel > 0 {
            let mut idx = vec![0usize; ndim];
            for _ in 0..numel {
                let off = idx.iter().zip(&strides).map(|(i, s)| i * s).sum::<usize>() * elem;
                out.extend_from_slice(&src[off..off + elem]);
                for axis in (0..ndim).rev() {
                    idx[axis] += 1;
                    if idx[axis] < dims[axis] {
                        break;
                    }
                    idx[axis] = 0;
                }
            }
        }
        drop(src);
        Ok(Self::wrap(out, Shape::from(dims), self.dtype, self.device))
    }

    /// Materialize the sub-tensor selected by `region`.
    pub fn read_region(&self, region: Option<&Region>) -> Result<NativeTensor> {
        let ext = region::extent(region, &self.shape)?;
        let runs = region::byte_runs(region, &self.shape, self.dtype.element_size())?;
        let mut out = vec![0u8; region::run_bytes(&runs)];
        region::pack_runs(&self.storage.read(), &runs, &mut out)?;
        Ok(Self::wrap(out, ext, self.dtype, self.device))
    }

    /// Copy of `len` entries of `axis` starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<NativeTensor> {
        if axis >= self.shape.ndim() {
            return Err(StratumError::ShapeMismatch(format!(
                "axis {axis} out of range for {}",
                self.shape
            )));
        }
        let ranges: Vec<_> = self
            .dims()
            .iter()
            .enumerate()
            .map(|(a, &d)| if a == axis { start..start + len } else { 0..d })
            .collect();
        self.read_region(Some(&Region::span(ranges)))
    }

    /// Concatenate along `axis`. All parts must share dtype, device and the other dims.
    pub fn cat(parts: &[NativeTensor], axis: usize) -> Result<NativeTensor> {
        let first = parts
            .first()
            .ok_or_else(|| StratumError::ShapeMismatch("cat of zero tensors".into()))?;
        if axis >= first.shape.ndim() {
            return Err(StratumError::ShapeMismatch(format!(
                "axis {axis} out of range for {}",
                first.shape
            )));
        }
        let mut total = 0;
        for p in parts {
            if p.dtype != first.dtype {
                return Err(StratumError::DTypeMismatch {
                    expected: first.dtype,
                    got: p.dtype,
                });
            }
            if p.device != first.device {
                return Err(StratumError::DeviceMismatch(format!(
                    "cat of {} and {}",
                    first.device, p.device
                )));
            }
            if p.shape.ndim() != first.shape.ndim()
                || p.dims().iter().zip(first.dims()).enumerate().any(|(a, (x, y))| a != axis && x != y)
            {
                return Err(StratumError::ShapeMismatch(format!(
                    "cat of {} and {} along axis {axis}",
                    first.shape, p.shape
                )));
            }
            total += p.dims()[axis];
        }

        let out = NativeTensor::zeros(first.shape.with_dim(axis, total), first.dtype, first.device);
        let mut offset = 0;
        for p in parts {
            let len = p.dims()[axis];
            let ranges: Vec<_> = out
                .dims()
                .iter()
                .enumerate()
                .map(|(a, &d)| if a == axis { offset..offset + len } else { 0..d })
                .collect();
            out.copy_region_from(Some(&Region::span(ranges)), p, None)?;
            offset += len;
        }
        Ok(out)
    }

    /// Write `src[src_region]` into `self[dst_region]`.
    ///
    /// Dtypes must match and the two extents must agree up to size-1 axes.
    /// Overlapping storage is staged through a temporary buffer.
    pub fn copy_region_from(
        &self,
        dst_region: Option<&Region>,
        src: &NativeTensor,
        src_region: Option<&Region>,
    ) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(StratumError::DTypeMismatch {
                expected: self.dtype,
                got: src.dtype,
            });
        }
        let dst_ext = region::extent(dst_region, &self.shape)?;
        let src_ext = region::extent(src_region, &src.shape)?;
        region::check_extents(&dst_ext, &src_ext)?;

        let elem = self.dtype.element_size();
        let dst_runs = region::byte_runs(dst_region, &self.shape, elem)?;
        let src_runs = region::byte_runs(src_region, &src.shape, elem)?;

        if self.same_storage(src) {
            let mut staged = vec![0u8; region::run_bytes(&src_runs)];
            region::pack_runs(&src.storage.read(), &src_runs, &mut staged)?;
            region::unpack_runs(&mut self.storage.write(), &dst_runs, &staged)
        } else {
            let src_bytes = src.storage.read();
            region::copy_runs(&mut self.storage.write(), &dst_runs, &src_bytes, &src_runs)
        }
    }
}

impl fmt::Debug for NativeTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("pinned", &self.pinned)
            .finish()
    }
}

// =========================================================================
// Element codecs
// =========================================================================

/// Decode native-endian bytes of `dtype` into f32 values.
pub fn decode_f32(bytes: &[u8], dtype: DType) -> Vec<f32> {
    match dtype {
        DType::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(bytes)
            .into_iter()
            .map(f16::to_f32)
            .collect(),
        DType::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
        DType::F64 => bytemuck::pod_collect_to_vec::<u8, f64>(bytes)
            .into_iter()
            .map(|v| v as f32)
            .collect(),
        DType::I32 => bytemuck::pod_collect_to_vec::<u8, i32>(bytes)
            .into_iter()
            .map(|v| v as f32)
            .collect(),
        DType::I64 => bytemuck::pod_collect_to_vec::<u8, i64>(bytes)
            .into_iter()
            .map(|v| v as f32)
            .collect(),
        DType::U8 => bytes.iter().map(|&b| b as f32).collect(),
        DType::Bool => bytes.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
    }
}

/// Encode f32 values as native-endian bytes of `dtype`.
pub fn encode_f32(values: &[f32], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F16 => {
            let h: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
            bytemuck::cast_slice(&h).to_vec()
        }
        DType::F32 => bytemuck::cast_slice(values).to_vec(),
        DType::F64 => {
            let d: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            bytemuck::cast_slice(&d).to_vec()
        }
        DType::I32 | DType::I64 | DType::U8 => encode_i64(
            &values.iter().map(|&v| v as i64).collect::<Vec<_>>(),
            dtype,
        ),
        DType::Bool => values.iter().map(|&v| (v != 0.0) as u8).collect(),
    }
}

fn decode_i64(bytes: &[u8], dtype: DType) -> Vec<i64> {
    match dtype {
        DType::I64 => bytemuck::pod_collect_to_vec::<u8, i64>(bytes),
        DType::I32 => bytemuck::pod_collect_to_vec::<u8, i32>(bytes)
            .into_iter()
            .map(i64::from)
            .collect(),
        DType::U8 | DType::Bool => bytes.iter().map(|&b| b as i64).collect(),
        DType::F16 | DType::F32 | DType::F64 => decode_f32(bytes, dtype)
            .into_iter()
            .map(|v| v as i64)
            .collect(),
    }
}

fn encode_i64(values: &[i64], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::I64 => bytemuck::cast_slice(values).to_vec(),
        DType::I32 => {
            let v: Vec<i32> = values.iter().map(|&v| v as i32).collect();
            bytemuck::cast_slice(&v).to_vec()
        }
        DType::U8 => values.iter().map(|&v| v as u8).collect(),
        DType::Bool => values.iter().map(|&v| (v != 0) as u8).collect(),
        DType::F16 | DType::F32 | DType::F64 => encode_f32(
            &values.iter().map(|&v| v as f32).collect::<Vec<_>>(),
            dtype,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(n: usize, dims: &[usize]) -> NativeTensor {
        let data: Vec<f32> = (0..n).map(|v| v as f32).collect();
        NativeTensor::from_f32(&data, dims, Device::Host).unwrap()
    }

    #[test]
    fn test_from_bytes_checks_length() {
        assert!(NativeTensor::from_bytes(vec![0; 7], [2], DType::F32, Device::Host).is_err());
    }

    #[test]
    fn test_cast_roundtrip_f16() {
        let t = NativeTensor::from_f32(&[1.0, -2.5, 0.25], [3], Device::Host).unwrap();
        let h = t.cast(DType::F16);
        assert_eq!(h.nbytes(), 6);
        assert_eq!(h.cast(DType::F32).to_f32_vec(), vec![1.0, -2.5, 0.25]);
    }

    #[test]
    fn test_cast_float_to_int_and_bool() {
        let t = NativeTensor::from_f32(&[0.0, 3.0, -1.0], [3], Device::Host).unwrap();
        assert_eq!(t.cast(DType::I64).to_i64_vec(), vec![0, 3, -1]);
        assert_eq!(t.cast(DType::Bool).to_bool_vec(), vec![false, true, true]);
        let ids = NativeTensor::from_i64(&[4, 0], [2], Device::Host).unwrap();
        assert_eq!(ids.cast(DType::F32).to_f32_vec(), vec![4.0, 0.0]);
    }

    #[test]
    fn test_permute() {
        let t = arange(6, &[2, 3]);
        let p = t.permute(&[1, 0]).unwrap();
        assert_eq!(p.dims(), &[3, 2]);
        assert_eq!(p.to_f32_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(t.permute(&[0, 0]).is_err());
    }

    #[test]
    fn test_narrow_and_cat() {
        let t = arange(12, &[3, 4]);
        let mid = t.narrow(1, 1, 2).unwrap();
        assert_eq!(mid.to_f32_vec(), vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);
        let left = t.narrow(1, 0, 1).unwrap();
        let right = t.narrow(1, 3, 1).unwrap();
        let joined = NativeTensor::cat(&[left, mid, right], 1).unwrap();
        assert_eq!(joined.to_f32_vec(), t.to_f32_vec());
    }

    #[test]
    fn test_copy_region_same_storage() {
        let t = arange(4, &[4]);
        let alias = t.reshape(&[2, 2]).unwrap();
        t.copy_region_from(Some(&Region::span([0..2])), &alias, Some(&Region::span([1..2])))
            .unwrap();
        assert_eq!(t.to_f32_vec(), vec![2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn test_copy_region_dtype_mismatch() {
        let a = NativeTensor::zeros([2], DType::F16, Device::Host);
        let b = NativeTensor::zeros([2], DType::F32, Device::Host);
        assert!(matches!(
            a.copy_region_from(None, &b, None),
            Err(StratumError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_pin_and_device() {
        let t = arange(3, &[3]);
        assert!(!t.is_pinned());
        let p = t.pin();
        assert!(p.is_pinned());
        assert!(!p.same_storage(&t));
        let acc = t.to_device(Device::Accelerator(0));
        assert!(acc.device().is_accelerator());
        assert!(!acc.pin().is_pinned());
    }
}
