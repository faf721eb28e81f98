use std::sync::Arc;

use stratum_core::{DType, Device, NativeTensor, Result, Shape};

use super::{AllocOptions, Backend};
use crate::handle::{Payload, TensorHandle};
use crate::stats::MemTracker;

/// Host RAM. Allocations are page-locked unless asked otherwise.
#[derive(Debug)]
pub struct HostBackend {
    tracker: MemTracker,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            tracker: MemTracker::new(None),
        }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            tracker: MemTracker::new(Some(bytes)),
        }
    }

    /// Cap live allocations at a fraction of currently available RAM.
    ///
    /// `memory_fraction` is clamped to 0.0–1.0.
    pub fn adaptive(memory_fraction: f32) -> Self {
        let available = available_ram_bytes();
        let budget = (available as f64 * memory_fraction.clamp(0.0, 1.0) as f64) as usize;

        tracing::info!(
            "HostBackend: {:.1} GB available, budgeting {:.1} GB ({:.0}%)",
            available as f64 / 1e9,
            budget as f64 / 1e9,
            memory_fraction * 100.0,
        );

        Self::with_capacity(budget)
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
            .reserve(dtype.storage_bytes(shape.numel()), "cpu")?;
        let pinned = opts.pin_memory.unwrap_or(true);
        let data = NativeTensor::zeros(shape.clone(), dtype, Device::Host).with_pinned(pinned);
        TensorHandle::create(
            Backend::Host(self.clone()),
            shape,
            dtype,
            Payload::Host(data),
            opts.name.clone(),
            true,
        )
    }
}

fn available_ram_bytes() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.available_memory() as usize
}
