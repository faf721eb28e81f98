//! The runtime context: the default host and disk backends, the
//! accelerators in use and the link model, built once and passed by reference.

use std::sync::Arc;

use stratum_core::Result;

use crate::backend::{AcceleratorBackend, Backend, DiskBackend, HostBackend};
use crate::config::DiskConfig;
use crate::link::LinkModel;
use crate::stats::MemStats;

pub struct OffloadContext {
    host: Arc<HostBackend>,
    disk: Arc<DiskBackend>,
    accelerators: Vec<Arc<AcceleratorBackend>>,
    links: LinkModel,
}

impl OffloadContext {
    pub fn new(host: Arc<HostBackend>, disk: Arc<DiskBackend>) -> Self {
        Self {
            host,
            disk,
            accelerators: Vec::new(),
            links: LinkModel::new(),
        }
    }

    /// Unbounded host memory plus a disk backend built from `config`.
    pub fn from_config(config: &DiskConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HostBackend::new()),
            Arc::new(DiskBackend::new(config)?),
        ))
    }

    pub fn with_accelerator(mut self, accelerator: Arc<AcceleratorBackend>) -> Self {
        self.accelerators.push(accelerator);
        self
    }

    pub fn with_links(mut self, links: LinkModel) -> Self {
        self.links = links;
        self
    }

    /// The default host backend.
    pub fn host(&self) -> Backend {
        Backend::Host(self.host.clone())
    }

    /// The default disk backend, which also runs the copy workers.
    pub fn disk(&self) -> &Arc<DiskBackend> {
        &self.disk
    }

    pub fn disk_tier(&self) -> Backend {
        Backend::Disk(self.disk.clone())
    }

    pub fn accelerator(&self, ordinal: usize) -> Option<Backend> {
        self.accelerators
            .iter()
            .find(|a| a.device().ordinal() == Some(ordinal))
            .map(|a| Backend::Accelerator(a.clone()))
    }

    pub fn links(&self) -> &LinkModel {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut LinkModel {
        &mut self.links
    }

    /// Drain the copy workers, then issue a barrier on every accelerator.
    ///
    /// Reports failures of queued copies recorded since the last call.
    pub fn synchronize(&self) -> Result<()> {
        let drained = self.disk.synchronize();
        for accelerator in &self.accelerators {
            accelerator.synchronize();
        }
        drained
    }

    /// Current and peak usage per backend.
    pub fn mem_stats(&self) -> Vec<(String, MemStats)> {
        let mut out: Vec<(String, MemStats)> = self
            .accelerators
            .iter()
            .map(|a| (a.name(), a.tracker().stats()))
            .collect();
        out.push(("cpu".into(), self.host.tracker().stats()));
        out.push(("disk".into(), self.disk.tracker().stats()));
        out
    }
}
