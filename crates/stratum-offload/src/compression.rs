//! The compression capability consumed by the encoded tier.
//!
//! Codecs are supplied by the caller. The encoded backend only stores their
//! configuration and routes allocation, (de)compression and encoded copies
//! through the trait.

use serde::{Deserialize, Serialize};
use stratum_core::{DType, NativeTensor, Region, Result, Shape};

use crate::backend::{AllocOptions, Backend};
use crate::context::OffloadContext;
use crate::copy::CopyOutcome;
use crate::handle::{EncodedParts, TensorHandle};

/// Group-wise quantization settings handed to a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub num_bits: u8,
    pub group_size: usize,
    /// Axis along which groups are formed.
    pub group_dim: usize,
    pub symmetric: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            num_bits: 4,
            group_size: 64,
            group_dim: 0,
            symmetric: false,
        }
    }
}

/// A lossy tensor codec.
///
/// Encoded parts are ordinary handles allocated on the base backend the
/// encoded backend wraps.
pub trait Compression: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate empty parts able to hold a tensor of `shape`.
    fn allocate(
        &self,
        base: &Backend,
        shape: &Shape,
        dtype: DType,
        config: &CodecConfig,
        opts: &AllocOptions,
    ) -> Result<EncodedParts>;

    fn compress(
        &self,
        base: &Backend,
        tensor: &NativeTensor,
        config: &CodecConfig,
    ) -> Result<EncodedParts>;

    /// Reconstruct the full tensor; the result lives on the parts' device.
    fn decompress(&self, parts: &EncodedParts, shape: &Shape, dtype: DType) -> Result<NativeTensor>;

    /// Copy where either side is encoded, with the same region contract as
    /// [`general_copy`](crate::copy::general_copy).
    fn copy(
        &self,
        ctx: &OffloadContext,
        dst: &TensorHandle,
        dst_region: Option<&Region>,
        src: &TensorHandle,
        src_region: Option<&Region>,
    ) -> Result<CopyOutcome>;
}
