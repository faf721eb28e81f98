use std::sync::Arc;

use stratum_core::{DType, Result, Shape, StratumError};

use super::{AllocOptions, Backend};
use crate::config::{CacheSpec, SegmentPolicy};
use crate::handle::{Payload, Segments, TensorHandle};

/// A tensor split contiguously along one axis across several backends.
///
/// Owns no storage; it holds the split policy and delegates every segment
/// to its sub-backend.
pub struct SegmentedBackend {
    bases: Vec<Backend>,
    axis: usize,
    policy: SegmentPolicy,
}

impl SegmentedBackend {
    /// Segment along axis 1 with one share per base, in order.
    pub fn new(bases: Vec<Backend>, policy: SegmentPolicy) -> Result<Self> {
        if bases.len() != policy.percents.len() {
            return Err(StratumError::ShapeMismatch(format!(
                "{} sub-backends for {} shares",
                bases.len(),
                policy.percents.len()
            )));
        }
        if let Some(b) = bases.iter().find(|b| matches!(b, Backend::Segmented(_))) {
            return Err(StratumError::UnsupportedTierCombination(format!(
                "segmented backend nested in {}",
                b.name()
            )));
        }
        Ok(Self {
            bases,
            axis: 1,
            policy,
        })
    }

    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = axis;
        self
    }

    pub fn bases(&self) -> &[Backend] {
        &self.bases
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn policy(&self) -> &SegmentPolicy {
        &self.policy
    }

    pub(crate) fn allocate(
        self: &Arc<Self>,
        shape: &[usize],
        dtype: DType,
        opts: &AllocOptions,
    ) -> Result<TensorHandle> {
        let shape = Shape::new(shape);
        let axis_len = shape.dim(self.axis).ok_or_else(|| {
            StratumError::ShapeMismatch(format!("segment axis {} of {shape}", self.axis))
        })?;
        let lengths = match &opts.segment_lengths {
            Some(lengths) => lengths.clone(),
            None => self.policy.lengths(axis_len)?,
        };
        if lengths.len() != self.bases.len() || lengths.iter().sum::<usize>() != axis_len {
            return Err(StratumError::ShapeMismatch(format!(
                "segment lengths {lengths:?} do not cover axis {} of {shape}",
                self.axis
            )));
        }

        let sub_opts = AllocOptions {
            pin_memory: opts.pin_memory,
            ..Default::default()
        };
        let mut bounds = Vec::with_capacity(lengths.len() + 1);
        bounds.push(0);
        let mut parts: Vec<Option<TensorHandle>> = Vec::with_capacity(lengths.len());
        for (base, &len) in self.bases.iter().zip(&lengths) {
            bounds.push(bounds[bounds.len() - 1] + len);
            if len == 0 {
                parts.push(None);
                continue;
            }
            let sub_shape = shape.with_dim(self.axis, len);
            match base.allocate(sub_shape.dims(), dtype, &sub_opts) {
                Ok(part) => parts.push(Some(part)),
                Err(e) => {
                    // Undo the segments already allocated.
                    for part in parts.iter().flatten() {
                        if let Err(cleanup) = part.delete() {
                            tracing::warn!("releasing segment {}: {cleanup}", part.name());
                        }
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(?shape, ?bounds, "segmented allocation");

        TensorHandle::create(
            Backend::Segmented(self.clone()),
            shape,
            dtype,
            Payload::Segmented(Segments {
                parts,
                bounds,
                axis: self.axis,
            }),
            opts.name.clone(),
            false,
        )
    }

    /// Key and value caches split by the policy, each share rounded to whole heads.
    pub(crate) fn init_cache_one_batch(
        self: &Arc<Self>,
        spec: &CacheSpec,
    ) -> Result<(TensorHandle, TensorHandle)> {
        let shape = spec.shape();
        let lengths = SegmentPolicy::new(self.policy.percents.clone(), spec.n_head)
            .lengths(shape[self.axis])?;
        let opts = AllocOptions::default()
            .pinned(false)
            .with_segment_lengths(lengths);
        let k = self.allocate(&shape, spec.dtype, &opts)?;
        let v = self.allocate(&shape, spec.dtype, &opts)?;
        Ok((k, v))
    }

    pub fn synchronize(&self) -> Result<()> {
        for base in &self.bases {
            base.synchronize()?;
        }
        Ok(())
    }
}
