//! # stratum-offload
//!
//! Tiered tensor storage with an asynchronous copy engine.
//!
//! A [`TensorHandle`] lives on one of five tiers: accelerator memory, host
//! memory, a disk file, a segmented split across several backends, or a
//! compressed encoding. [`general_copy`] moves any region of one handle into
//! any region of another; transfers that touch disk, or need a pinned relay,
//! run on the disk backend's worker pool until the context is synchronized.

pub mod backend;
pub mod compression;
pub mod config;
pub mod context;
pub mod copy;
pub mod handle;
pub mod link;
mod queue;
pub mod stats;
pub mod tier;

pub use backend::{
    AcceleratorBackend, AllocOptions, Backend, DiskBackend, EncodedBackend, HostBackend,
    SegmentedBackend,
};
pub use compression::{CodecConfig, Compression};
pub use config::{CacheSpec, DiskConfig, SegmentPolicy};
pub use context::OffloadContext;
pub use copy::{general_copy, CopyOutcome};
pub use handle::{EncodedParts, Payload, Segments, TensorHandle};
pub use link::{Link, LinkModel};
pub use queue::{CopyQueue, PendingCopy};
pub use stats::MemStats;
pub use tier::Tier;
