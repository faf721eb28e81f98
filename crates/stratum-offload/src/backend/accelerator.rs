use std::sync::Arc;

use stratum_core::{DType, Device, NativeTensor, Result, Shape};

use super::{AllocOptions, Backend};
use crate::handle::{Payload, TensorHandle};
use crate::stats::MemTracker;

/// Accelerator memory for one device ordinal.
///
/// Buffers are device-tagged native tensors. Device-native copies complete
/// when issued, so the stream barrier has nothing left to wait for.
#[derive(Debug)]
pub struct AcceleratorBackend {
    ordinal: usize,
    tracker: MemTracker,
}

impl AcceleratorBackend {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            tracker: MemTracker::new(None),
        }
    }

    /// Limit the device to `bytes` of live allocations.
    pub fn with_capacity(ordinal: usize, bytes: usize) -> Self {
        Self {
            ordinal,
            tracker: MemTracker::new(Some(bytes)),
        }
    }

    pub fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    pub fn device(&self) -> Device {
        Device::Accelerator(self.ordinal)
    }

    pub(crate) fn tracker(&self) -> &MemTracker {
        &self.tracker
    }

    pub(crate) fn allocate(
        self: &Arc<Self>,
        shape: &[usize],
        dtype: DType,
        opts: &AllocOptions,
    ) -> Result<TensorHandle> {
        let shape = Shape::new(shape);
        self.tracker
            .reserve(dtype.storage_bytes(shape.numel()), &self.name())?;
        let data = NativeTensor::zeros(shape.clone(), dtype, self.device());
        TensorHandle::create(
            Backend::Accelerator(self.clone()),
            shape,
            dtype,
            Payload::Accelerator(data),
            opts.name.clone(),
            true,
        )
    }

    /// Device-level barrier for copies issued on the primary stream.
    pub fn synchronize(&self) {
        tracing::trace!(device = %self.name(), "stream barrier");
    }
}
