//! f32 host buffers used when the compute device has no fast path for the
//! cache's element type.

use std::sync::atomic::{AtomicUsize, Ordering};

use stratum_core::{DType, Result};
use stratum_offload::{AllocOptions, Backend, TensorHandle};

use crate::config::{ModelShape, OffloadPolicy};

/// A ring of key/value buffer pairs shaped like one batch's cache.
pub struct AttentionWorkspace {
    slots: Vec<(TensorHandle, TensorHandle)>,
    cursor: AtomicUsize,
}

impl AttentionWorkspace {
    /// One pair when attention and MLP are separate layers, two otherwise.
    pub fn new(
        host: &Backend,
        policy: &OffloadPolicy,
        model: &ModelShape,
        prompt_len: usize,
        gen_len: usize,
    ) -> Result<Self> {
        let shape = [
            prompt_len + gen_len - 1,
            policy.gpu_batch_size * model.n_head,
            model.head_dim(),
        ];
        let count = if policy.sep_layer { 1 } else { 2 };
        let opts = AllocOptions::default().pinned(false);
        let slots = (0..count)
            .map(|_| {
                Ok((
                    host.allocate(&shape, DType::F32, &opts)?,
                    host.allocate(&shape, DType::F32, &opts)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(slots = count, ?shape, "attention workspace ready");
        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Advance the ring and return the pair now current.
    pub fn next(&self) -> (TensorHandle, TensorHandle) {
        let n = self.slots.len();
        let prev = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % n))
            .unwrap_or(0);
        self.slots[(prev + 1) % n].clone()
    }

    /// Delete every buffer.
    pub fn release(self) -> Result<()> {
        for (k, v) in self.slots {
            k.delete()?;
            v.delete()?;
        }
        Ok(())
    }
}
