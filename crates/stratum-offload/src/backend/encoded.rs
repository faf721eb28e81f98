use std::sync::Arc;

use stratum_core::{DType, NativeTensor, Result, Shape, StratumError};

use super::{AllocOptions, Backend};
use crate::compression::{CodecConfig, Compression};
use crate::context::OffloadContext;
use crate::handle::{EncodedParts, Payload, TensorHandle};

/// Compressed tensors whose parts live on a base backend.
pub struct EncodedBackend {
    base: Backend,
    codec: Arc<dyn Compression>,
    config: CodecConfig,
}

impl EncodedBackend {
    pub fn new(base: Backend, codec: Arc<dyn Compression>, config: CodecConfig) -> Self {
        Self {
            base,
            codec,
            config,
        }
    }

    pub fn base(&self) -> &Backend {
        &self.base
    }

    pub fn codec(&self) -> &Arc<dyn Compression> {
        &self.codec
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub(crate) fn allocate(
        self: &Arc<Self>,
        shape: &[usize],
        dtype: DType,
        opts: &AllocOptions,
    ) -> Result<TensorHandle> {
        let shape = Shape::new(shape);
        let config = opts.codec.unwrap_or(self.config);
        let parts = self.codec.allocate(&self.base, &shape, dtype, &config, opts)?;
        self.wrap(shape, dtype, parts, opts.name.clone())
    }

    fn wrap(
        self: &Arc<Self>,
        shape: Shape,
        dtype: DType,
        parts: EncodedParts,
        name: Option<String>,
    ) -> Result<TensorHandle> {
        TensorHandle::create(
            Backend::Encoded(self.clone()),
            shape,
            dtype,
            Payload::Encoded(parts),
            name,
            false,
        )
    }

    /// Encode a native tensor with this backend's codec settings.
    pub fn compress(self: &Arc<Self>, tensor: &NativeTensor) -> Result<TensorHandle> {
        self.compress_with(tensor, &self.config)
    }

    pub fn compress_with(
        self: &Arc<Self>,
        tensor: &NativeTensor,
        config: &CodecConfig,
    ) -> Result<TensorHandle> {
        let parts = self.codec.compress(&self.base, tensor, config)?;
        self.wrap(tensor.shape().clone(), tensor.dtype(), parts, None)
    }

    /// Decode into a plain handle on the base backend, or on the host when
    /// the base has no native buffers.
    pub fn decompress(&self, ctx: &OffloadContext, handle: &TensorHandle) -> Result<TensorHandle> {
        let Payload::Encoded(parts) = handle.payload()? else {
            return Err(StratumError::DeviceMismatch(format!(
                "{} is not encoded",
                handle.name()
            )));
        };
        let native = self.decompress_parts(&parts, handle.shape(), handle.dtype())?;
        match self.base.device() {
            Some(device) if device == native.device() => TensorHandle::from_native(&self.base, native),
            _ => TensorHandle::from_native(&ctx.host(), native.to_device(stratum_core::Device::Host)),
        }
    }

    pub(crate) fn decompress_parts(
        &self,
        parts: &EncodedParts,
        shape: &Shape,
        dtype: DType,
    ) -> Result<NativeTensor> {
        let out = self.codec.decompress(parts, shape, dtype)?;
        if out.shape() != shape || out.dtype() != dtype {
            return Err(StratumError::Codec(format!(
                "{} decoded {} {}, expected {shape} {dtype}",
                self.codec.name(),
                out.shape(),
                out.dtype()
            )));
        }
        Ok(out)
    }
}
