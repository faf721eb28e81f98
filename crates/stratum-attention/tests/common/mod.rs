//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Mutex;

use stratum_core::{DType, Device, NativeTensor, Region, Result, Shape};
use stratum_offload::{
    general_copy, AllocOptions, Backend, CodecConfig, Compression, CopyOutcome, EncodedParts,
    OffloadContext, Payload, TensorHandle,
};

/// Stores tensors unchanged with a unit scale.
pub struct PassThroughCodec;

fn encoded_data(handle: &TensorHandle) -> Result<TensorHandle> {
    match handle.payload()? {
        Payload::Encoded(parts) => Ok(parts.data),
        _ => Ok(handle.clone()),
    }
}

impl Compression for PassThroughCodec {
    fn name(&self) -> &str {
        "pass-through"
    }

    fn allocate(
        &self,
        base: &Backend,
        shape: &Shape,
        dtype: DType,
        config: &CodecConfig,
        opts: &AllocOptions,
    ) -> Result<EncodedParts> {
        Ok(EncodedParts {
            data: base.allocate(shape.dims(), dtype, opts)?,
            scale: base.allocate(&[1], DType::F32, &AllocOptions::default())?,
            config: *config,
        })
    }

    fn compress(&self, base: &Backend, tensor: &NativeTensor, config: &CodecConfig) -> Result<EncodedParts> {
        let device = base.device().unwrap_or(Device::Host);
        Ok(EncodedParts {
            data: TensorHandle::from_native(base, tensor.to_device(device))?,
            scale: TensorHandle::from_native(base, NativeTensor::from_f32(&[1.0], [1], device)?)?,
            config: *config,
        })
    }

    fn decompress(&self, parts: &EncodedParts, _shape: &Shape, _dtype: DType) -> Result<NativeTensor> {
        parts.data.native()
    }

    fn copy(
        &self,
        ctx: &OffloadContext,
        dst: &TensorHandle,
        dst_region: Option<&Region>,
        src: &TensorHandle,
        src_region: Option<&Region>,
    ) -> Result<CopyOutcome> {
        general_copy(ctx, &encoded_data(dst)?, dst_region, &encoded_data(src)?, src_region)
    }
}

/// Stores tensors unchanged with one unit scale per group along
/// `group_dim`, and records the shape of every tensor it encodes.
#[derive(Default)]
pub struct GroupedPassThroughCodec {
    pub encoded: Mutex<Vec<Vec<usize>>>,
}

impl GroupedPassThroughCodec {
    fn groups(dims: &[usize], config: &CodecConfig) -> usize {
        dims.get(config.group_dim)
            .map_or(1, |&n| n.div_ceil(config.group_size.max(1)))
    }

    pub fn encoded_shapes(&self) -> Vec<Vec<usize>> {
        self.encoded.lock().unwrap().clone()
    }
}

impl Compression for GroupedPassThroughCodec {
    fn name(&self) -> &str {
        "grouped-pass-through"
    }

    fn allocate(
        &self,
        base: &Backend,
        shape: &Shape,
        dtype: DType,
        config: &CodecConfig,
        opts: &AllocOptions,
    ) -> Result<EncodedParts> {
        let groups = Self::groups(shape.dims(), config);
        Ok(EncodedParts {
            data: base.allocate(shape.dims(), dtype, opts)?,
            scale: base.allocate(&[groups], DType::F32, &AllocOptions::default())?,
            config: *config,
        })
    }

    fn compress(&self, base: &Backend, tensor: &NativeTensor, config: &CodecConfig) -> Result<EncodedParts> {
        let device = base.device().unwrap_or(Device::Host);
        let groups = Self::groups(tensor.dims(), config);
        self.encoded.lock().unwrap().push(tensor.dims().to_vec());
        Ok(EncodedParts {
            data: TensorHandle::from_native(base, tensor.to_device(device))?,
            scale: TensorHandle::from_native(base, NativeTensor::from_f32(&vec![1.0; groups], [groups], device)?)?,
            config: *config,
        })
    }

    fn decompress(&self, parts: &EncodedParts, _shape: &Shape, _dtype: DType) -> Result<NativeTensor> {
        parts.data.native()
    }

    fn copy(
        &self,
        ctx: &OffloadContext,
        dst: &TensorHandle,
        dst_region: Option<&Region>,
        src: &TensorHandle,
        src_region: Option<&Region>,
    ) -> Result<CopyOutcome> {
        general_copy(ctx, &encoded_data(dst)?, dst_region, &encoded_data(src)?, src_region)
    }
}
