use std::path::{Path, PathBuf};
use std::sync::Arc;

use stratum_core::{npy, DType, Region, Result, Shape};

use super::{AllocOptions, Backend};
use crate::config::DiskConfig;
use crate::copy::CopyOutcome;
use crate::handle::{next_name, Payload, TensorHandle};
use crate::queue::{CopyQueue, CopyTask};
use crate::stats::MemTracker;

/// Files under a root directory, plus the worker pool that moves bytes in and out.
pub struct DiskBackend {
    root: PathBuf,
    queue: CopyQueue,
    tracker: MemTracker,
}

impl DiskBackend {
    /// Create the root directory if needed and start the copy workers.
    pub fn new(config: &DiskConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        let queue = CopyQueue::new(
            config.num_copy_threads,
            config.queue_capacity,
            config.relay_bytes,
        )?;
        tracing::info!(
            root = %config.root.display(),
            threads = config.num_copy_threads,
            "disk backend ready"
        );
        Ok(Self {
            root: config.root.clone(),
            queue,
            tracker: MemTracker::new(config.capacity_bytes),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> &CopyQueue {
        &self.queue
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
        let name = opts.name.clone().unwrap_or_else(next_name);
        let path = self.root.join(&name);
        let bytes = dtype.storage_bytes(shape.numel());
        self.tracker.reserve(bytes, "disk")?;
        if let Err(e) = npy::create_file(&path, dtype, &shape) {
            self.tracker.release(bytes);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        TensorHandle::create(
            Backend::Disk(self.clone()),
            shape,
            dtype,
            Payload::Disk(path),
            Some(name),
            true,
        )
    }

    /// Adopt an existing `.npy` file. Deleting the handle leaves the file in place.
    pub fn open(self: &Arc<Self>, path: &Path) -> Result<TensorHandle> {
        let header = npy::read_header(path)?;
        let handle = TensorHandle::create(
            Backend::Disk(self.clone()),
            header.shape,
            header.dtype,
            Payload::Disk(path.to_path_buf()),
            None,
            false,
        )?;
        handle.set_delete_file(false);
        Ok(handle)
    }

    /// Queue `src[src_region] -> dst[dst_region]` on the worker pool.
    pub fn submit_copy(
        &self,
        dst: &TensorHandle,
        dst_region: Option<&Region>,
        src: &TensorHandle,
        src_region: Option<&Region>,
    ) -> Result<CopyOutcome> {
        let ticket = self.queue.submit(CopyTask {
            dst: dst.clone(),
            dst_region: dst_region.cloned(),
            src: src.clone(),
            src_region: src_region.cloned(),
        })?;
        Ok(CopyOutcome::queued(ticket))
    }

    /// Delete `src` on a worker once `outcome` has completed.
    pub(crate) fn release_after(&self, src: TensorHandle, outcome: CopyOutcome) -> Result<()> {
        self.queue.release_after(src, outcome)
    }

    /// Block until every queued copy has run; report failures since the last call.
    pub fn synchronize(&self) -> Result<()> {
        self.queue.synchronize()
    }

    /// Drain the queue and join the workers. Later submissions fail with `QueueClosed`.
    pub fn close_copy_threads(&self) -> Result<()> {
        self.queue.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::StratumError;

    fn backend(dir: &Path) -> Arc<DiskBackend> {
        Arc::new(DiskBackend::new(&DiskConfig::with_root(dir)).unwrap())
    }

    #[test]
    fn test_allocate_creates_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let disk = backend(dir.path());
        let h = disk
            .allocate(&[3, 4], DType::F16, &AllocOptions::default())
            .unwrap();
        let path = dir.path().join(h.name());
        assert!(path.exists());
        let header = npy::read_header(&path).unwrap();
        assert_eq!(header.shape.dims(), &[3, 4]);
        assert_eq!(header.dtype, DType::F16);
    }

    #[test]
    fn test_capacity_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DiskConfig::with_root(dir.path());
        config.capacity_bytes = Some(64);
        let disk = Arc::new(DiskBackend::new(&config).unwrap());
        let opts = AllocOptions::default().named("too_big");
        let err = disk.allocate(&[32], DType::F32, &opts).unwrap_err();
        assert!(matches!(err, StratumError::Allocation(_)));
        assert!(!dir.path().join("too_big").exists());
        assert_eq!(disk.tracker().stats().current_bytes, 0);

        let fits = disk.allocate(&[16], DType::F32, &AllocOptions::default()).unwrap();
        assert_eq!(disk.tracker().stats().current_bytes, 64);
        fits.delete().unwrap();
        assert_eq!(disk.tracker().stats().current_bytes, 0);
    }

    #[test]
    fn test_failed_file_creation_releases_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let disk = backend(dir.path());
        let opts = AllocOptions::default().named("missing_dir/t");
        assert!(disk.allocate(&[4], DType::F32, &opts).is_err());
        assert_eq!(disk.tracker().stats().current_bytes, 0);
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let disk = backend(dir.path());
        let h = disk.allocate(&[2], DType::F32, &AllocOptions::default()).unwrap();
        let path = dir.path().join(h.name());
        h.delete().unwrap();
        assert!(!path.exists());
        assert_eq!(disk.tracker().stats().current_bytes, 0);
    }

    #[test]
    fn test_open_keeps_file_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let disk = backend(dir.path());
        let path = dir.path().join("weights.npy");
        npy::create_file(&path, DType::F32, &Shape::new(&[5])).unwrap();
        let h = disk.open(&path).unwrap();
        assert_eq!(h.dims(), &[5]);
        h.delete().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let disk = backend(dir.path());
        disk.close_copy_threads().unwrap();
        disk.close_copy_threads().unwrap();
        assert!(disk.queue().is_closed());
    }
}
