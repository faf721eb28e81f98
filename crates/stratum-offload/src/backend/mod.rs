//! Device backends: the owners of each storage tier.
//!
//! `Backend` is a closed sum over the five tiers. Every dispatch on tier is
//! an exhaustive match, so adding a tier is a compile error at each site
//! that has to handle it.

mod accelerator;
mod disk;
mod encoded;
mod host;
mod segmented;

pub use accelerator::AcceleratorBackend;
pub use disk::DiskBackend;
pub use encoded::EncodedBackend;
pub use host::HostBackend;
pub use segmented::SegmentedBackend;

use std::sync::Arc;

use stratum_core::{DType, Device, Result};

use crate::compression::CodecConfig;
use crate::config::CacheSpec;
use crate::handle::TensorHandle;
use crate::stats::{MemStats, MemTracker};
use crate::tier::Tier;

/// Tier-specific allocation options. Options a tier does not use are ignored.
#[derive(Debug, Clone, Default)]
pub struct AllocOptions {
    /// Page-lock host buffers. Host allocations default to pinned.
    pub pin_memory: Option<bool>,
    /// Identity name; a fresh `t_<n>` is used when absent.
    pub name: Option<String>,
    /// Explicit segment lengths for a segmented allocation.
    pub segment_lengths: Option<Vec<usize>>,
    /// Codec settings overriding the encoded backend's default.
    pub codec: Option<CodecConfig>,
}

impl AllocOptions {
    pub fn pinned(mut self, pin: bool) -> Self {
        self.pin_memory = Some(pin);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_segment_lengths(mut self, lengths: Vec<usize>) -> Self {
        self.segment_lengths = Some(lengths);
        self
    }

    pub fn with_codec(mut self, config: CodecConfig) -> Self {
        self.codec = Some(config);
        self
    }
}

#[derive(Clone)]
pub enum Backend {
    Accelerator(Arc<AcceleratorBackend>),
    Host(Arc<HostBackend>),
    Disk(Arc<DiskBackend>),
    Segmented(Arc<SegmentedBackend>),
    Encoded(Arc<EncodedBackend>),
}

impl Backend {
    pub fn tier(&self) -> Tier {
        match self {
            Backend::Accelerator(_) => Tier::Accelerator,
            Backend::Host(_) => Tier::Host,
            Backend::Disk(_) => Tier::Disk,
            Backend::Segmented(_) => Tier::Segmented,
            Backend::Encoded(_) => Tier::Encoded,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Backend::Accelerator(b) => b.name(),
            Backend::Host(_) => "cpu".into(),
            Backend::Disk(_) => "disk".into(),
            Backend::Segmented(_) => "mixed".into(),
            Backend::Encoded(b) => format!("compressed({})", b.base().name()),
        }
    }

    /// Device of the native buffers this backend hands out.
    pub fn device(&self) -> Option<Device> {
        match self {
            Backend::Accelerator(b) => Some(b.device()),
            Backend::Host(_) => Some(Device::Host),
            Backend::Disk(_) | Backend::Segmented(_) | Backend::Encoded(_) => None,
        }
    }

    /// Whether both values refer to the same backend instance.
    pub fn same(&self, other: &Backend) -> bool {
        match (self, other) {
            (Backend::Accelerator(a), Backend::Accelerator(b)) => Arc::ptr_eq(a, b),
            (Backend::Host(a), Backend::Host(b)) => Arc::ptr_eq(a, b),
            (Backend::Disk(a), Backend::Disk(b)) => Arc::ptr_eq(a, b),
            (Backend::Segmented(a), Backend::Segmented(b)) => Arc::ptr_eq(a, b),
            (Backend::Encoded(a), Backend::Encoded(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn allocate(&self, shape: &[usize], dtype: DType, opts: &AllocOptions) -> Result<TensorHandle> {
        match self {
            Backend::Accelerator(b) => b.allocate(shape, dtype, opts),
            Backend::Host(b) => b.allocate(shape, dtype, opts),
            Backend::Disk(b) => b.allocate(shape, dtype, opts),
            Backend::Segmented(b) => b.allocate(shape, dtype, opts),
            Backend::Encoded(b) => b.allocate(shape, dtype, opts),
        }
    }

    /// Allocate one batch's key and value caches.
    pub fn init_cache_one_batch(&self, spec: &CacheSpec) -> Result<(TensorHandle, TensorHandle)> {
        if let Backend::Segmented(b) = self {
            return b.init_cache_one_batch(spec);
        }
        let opts = AllocOptions::default().pinned(false);
        let shape = spec.shape();
        tracing::debug!(backend = %self.name(), ?shape, "allocating kv cache");
        let k = self.allocate(&shape, spec.dtype, &opts)?;
        let v = self.allocate(&shape, spec.dtype, &opts)?;
        Ok((k, v))
    }

    /// Drain outstanding work owned by this backend.
    pub fn synchronize(&self) -> Result<()> {
        match self {
            Backend::Accelerator(b) => {
                b.synchronize();
                Ok(())
            }
            Backend::Host(_) => Ok(()),
            Backend::Disk(b) => b.synchronize(),
            Backend::Segmented(b) => b.synchronize(),
            Backend::Encoded(b) => b.base().synchronize(),
        }
    }

    pub fn mem_stats(&self) -> Option<MemStats> {
        self.tracker().map(MemTracker::stats)
    }

    pub(crate) fn tracker(&self) -> Option<&MemTracker> {
        match self {
            Backend::Accelerator(b) => Some(b.tracker()),
            Backend::Host(b) => Some(b.tracker()),
            Backend::Disk(b) => Some(b.tracker()),
            Backend::Segmented(_) | Backend::Encoded(_) => None,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<Arc<AcceleratorBackend>> for Backend {
    fn from(b: Arc<AcceleratorBackend>) -> Self {
        Backend::Accelerator(b)
    }
}

impl From<Arc<HostBackend>> for Backend {
    fn from(b: Arc<HostBackend>) -> Self {
        Backend::Host(b)
    }
}

impl From<Arc<DiskBackend>> for Backend {
    fn from(b: Arc<DiskBackend>) -> Self {
        Backend::Disk(b)
    }
}

impl From<Arc<SegmentedBackend>> for Backend {
    fn from(b: Arc<SegmentedBackend>) -> Self {
        Backend::Segmented(b)
    }
}

impl From<Arc<EncodedBackend>> for Backend {
    fn from(b: Arc<EncodedBackend>) -> Self {
        Backend::Encoded(b)
    }
}
