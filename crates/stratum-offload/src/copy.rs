//! The copy engine.
//!
//! [`general_copy`] moves `src[src_region]` into `dst[dst_region]` for any
//! pair of tiers. Dispatch, first match wins:
//!
//! 1. `dst` segmented: recurse into each sub-handle its region touches.
//! 2. `src` segmented: the same, from the source side.
//! 3. Either side encoded: the codec's own copy routine.
//! 4. Either side on disk: queue on the disk backend's workers.
//! 5. Accelerator to unpinned host, more than one outer row: queue, so a
//!    worker stages it through its pinned relay.
//! 6. Unpinned host to accelerator: pin the source range, then copy.
//! 7. Anything else: direct device-native copy.
//!
//! Queued cases return immediately; the returned [`CopyOutcome`] (or the
//! context's `synchronize`) is the only way to know they are done.

use std::fs::OpenOptions;
use std::sync::Arc;

use memmap2::MmapMut;
use stratum_core::region::{self, cut_indices, full_ranges, Region};
use stratum_core::{npy, NativeTensor, Result, Shape, StratumError};

use crate::backend::{Backend, DiskBackend};
use crate::context::OffloadContext;
use crate::handle::{Payload, Segments, TensorHandle};
use crate::queue::{CopyTask, PendingCopy};
use crate::tier::Tier;

/// Result of a copy: either done, or a set of queued transfers.
#[derive(Debug, Default)]
pub struct CopyOutcome {
    pending: Vec<PendingCopy>,
}

impl CopyOutcome {
    pub fn complete() -> Self {
        Self::default()
    }

    pub(crate) fn queued(ticket: PendingCopy) -> Self {
        Self {
            pending: vec![ticket],
        }
    }

    pub fn merge(&mut self, other: CopyOutcome) {
        self.pending.extend(other.pending);
    }

    /// Whether nothing was left on a worker queue.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    /// Block until every queued part of this copy has run.
    pub fn wait(self) -> Result<()> {
        let mut count = 0;
        let mut first = None;
        for ticket in self.pending {
            if let Err(e) = ticket.wait() {
                count += 1;
                first.get_or_insert_with(|| match e {
                    StratumError::WorkerTaskFailure { first, .. } => first,
                    other => other.to_string(),
                });
            }
        }
        match first {
            None => Ok(()),
            Some(first) => Err(StratumError::WorkerTaskFailure { count, first }),
        }
    }
}

/// Copy `src[src_region]` into `dst[dst_region]`; `None` means the whole tensor.
pub fn general_copy(
    ctx: &OffloadContext,
    dst: &TensorHandle,
    dst_region: Option<&Region>,
    src: &TensorHandle,
    src_region: Option<&Region>,
) -> Result<CopyOutcome> {
    let dst_payload = dst.payload()?;
    let src_payload = src.payload()?;
    tracing::trace!(dst = %dst.name(), src = %src.name(), "general_copy");

    match (&dst_payload, &src_payload) {
        (Payload::Segmented(_), Payload::Segmented(_)) => Err(StratumError::UnsupportedTierCombination(
            format!("segmented {} into segmented {}", src.name(), dst.name()),
        )),
        (Payload::Segmented(seg), _) => {
            copy_segments(ctx, seg, SegmentSide::Dst, dst, dst_region, src, src_region)
        }
        (_, Payload::Segmented(seg)) => {
            copy_segments(ctx, seg, SegmentSide::Src, dst, dst_region, src, src_region)
        }
        (Payload::Encoded(_), _) | (_, Payload::Encoded(_)) => {
            let enc = match (dst.backend(), src.backend()) {
                (Backend::Encoded(e), _) | (_, Backend::Encoded(e)) => e,
                _ => {
                    return Err(StratumError::DeviceMismatch(
                        "encoded payload without an encoded backend".into(),
                    ))
                }
            };
            enc.codec().copy(ctx, dst, dst_region, src, src_region)
        }
        (_, Payload::Disk(_)) => {
            disk_of(src)?.submit_copy(dst, dst_region, src, src_region)
        }
        (Payload::Disk(_), _) => {
            disk_of(dst)?.submit_copy(dst, dst_region, src, src_region)
        }
        (Payload::Host(d), Payload::Accelerator(_))
            if !d.is_pinned() && outer_extent(src_region, src.shape())? > 1 =>
        {
            ctx.disk().submit_copy(dst, dst_region, src, src_region)
        }
        (Payload::Accelerator(d), Payload::Host(s)) if !s.is_pinned() => {
            let staged = s.read_region(src_region)?.pin();
            d.copy_region_from(dst_region, &staged, None)?;
            Ok(CopyOutcome::complete())
        }
        (
            Payload::Accelerator(d) | Payload::Host(d),
            Payload::Accelerator(s) | Payload::Host(s),
        ) => {
            d.copy_region_from(dst_region, s, src_region)?;
            Ok(CopyOutcome::complete())
        }
    }
}

fn outer_extent(region: Option<&Region>, shape: &Shape) -> Result<usize> {
    Ok(region::extent(region, shape)?.dim(0).unwrap_or(1))
}

fn disk_of(handle: &TensorHandle) -> Result<&Arc<DiskBackend>> {
    match handle.backend() {
        Backend::Disk(d) => Ok(d),
        other => Err(StratumError::DeviceMismatch(format!(
            "disk payload on backend {}",
            other.name()
        ))),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SegmentSide {
    Dst,
    Src,
}

/// Split a copy along the segment axis and recurse once per touched sub-handle.
///
/// The segmented side's range is cut to each segment and re-based to the
/// sub-handle; the other side's range is shifted by the same offset.
fn copy_segments(
    ctx: &OffloadContext,
    seg: &Segments,
    side: SegmentSide,
    dst: &TensorHandle,
    dst_region: Option<&Region>,
    src: &TensorHandle,
    src_region: Option<&Region>,
) -> Result<CopyOutcome> {
    if dst_region.is_some_and(Region::is_gather) || src_region.is_some_and(Region::is_gather) {
        return Err(StratumError::UnsupportedTierCombination(
            "gather through a segmented tensor".into(),
        ));
    }
    let dst_ranges = full_ranges(dst_region, dst.shape())?;
    let src_ranges = full_ranges(src_region, src.shape())?;
    let lens = |r: &[std::ops::Range<usize>]| r.iter().map(|x| x.len()).collect::<Vec<_>>();
    if lens(&dst_ranges) != lens(&src_ranges) {
        return Err(StratumError::ShapeMismatch(format!(
            "segmented copy from extent {:?} into {:?}",
            lens(&src_ranges),
            lens(&dst_ranges)
        )));
    }

    let axis = seg.axis;
    let (seg_ranges, other_ranges) = match side {
        SegmentSide::Dst => (&dst_ranges, &src_ranges),
        SegmentSide::Src => (&src_ranges, &dst_ranges),
    };

    let mut outcome = CopyOutcome::complete();
    for (start, stop, part) in seg.iter() {
        let Some(local) = cut_indices(seg_ranges, axis, start, stop, start) else {
            continue;
        };
        let offset = local[axis].start + start - seg_ranges[axis].start;
        let mut other = other_ranges.clone();
        let base = other_ranges[axis].start + offset;
        other[axis] = base..base + local[axis].len();

        let local = Region::Span(local);
        let other = Region::Span(other);
        let sub = match side {
            SegmentSide::Dst => general_copy(ctx, part, Some(&local), src, Some(&other))?,
            SegmentSide::Src => general_copy(ctx, dst, Some(&other), part, Some(&local))?,
        };
        outcome.merge(sub);
    }
    Ok(outcome)
}

// =========================================================================
// Worker-side execution
// =========================================================================

/// A worker's pinned staging buffer, allocated on first use.
pub(crate) struct Relay {
    buf: Vec<u8>,
    capacity: usize,
}

impl Relay {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
        }
    }

    fn staging(&mut self, bytes: usize) -> Result<&mut [u8]> {
        if bytes > self.capacity {
            return Err(StratumError::Allocation(format!(
                "transfer of {bytes} bytes exceeds the {}-byte pinned relay",
                self.capacity
            )));
        }
        if self.buf.is_empty() {
            tracing::trace!(bytes = self.capacity, "allocating pinned relay");
            self.buf = vec![0u8; self.capacity];
        }
        Ok(&mut self.buf[..bytes])
    }
}

/// Bytes of one copy endpoint as a worker sees them.
enum View {
    Native(NativeTensor),
    Mapped { map: MmapMut, offset: usize, len: usize },
}

impl View {
    fn open(handle: &TensorHandle) -> Result<View> {
        match handle.payload()? {
            Payload::Accelerator(t) | Payload::Host(t) => Ok(View::Native(t)),
            Payload::Disk(path) => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                // SAFETY: disk-tier files are private to their backend and only
                // written through mappings like this one.
                let map = unsafe { MmapMut::map_mut(&file)? };
                let header = npy::decode_header(&map)?;
                if header.shape != *handle.shape() || header.dtype != handle.dtype() {
                    return Err(StratumError::Format(format!(
                        "{} holds {} {}, handle {} expects {} {}",
                        path.display(),
                        header.shape,
                        header.dtype,
                        handle.name(),
                        handle.shape(),
                        handle.dtype()
                    )));
                }
                let len = header.payload_bytes();
                if header.data_offset + len > map.len() {
                    return Err(StratumError::Format(format!("{} is truncated", path.display())));
                }
                Ok(View::Mapped {
                    map,
                    offset: header.data_offset,
                    len,
                })
            }
            other => Err(StratumError::UnsupportedTierCombination(format!(
                "{} handle {} reached a copy worker",
                other.tier(),
                handle.name()
            ))),
        }
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            View::Native(t) => t.with_bytes(f),
            View::Mapped { map, offset, len } => f(&map[*offset..*offset + *len]),
        }
    }

    fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self {
            View::Native(t) => t.with_bytes_mut(f),
            View::Mapped { map, offset, len } => f(&mut map[*offset..*offset + *len]),
        }
    }

    fn flush(&self) -> Result<()> {
        if let View::Mapped { map, .. } = self {
            map.flush()?;
        }
        Ok(())
    }
}

/// Run one queued copy on the calling worker thread.
pub(crate) fn execute_copy(task: &CopyTask, relay: &mut Relay) -> Result<()> {
    let (dst, src) = (&task.dst, &task.src);
    if dst.dtype() != src.dtype() {
        return Err(StratumError::DTypeMismatch {
            expected: dst.dtype(),
            got: src.dtype(),
        });
    }
    let dst_region = task.dst_region.as_ref();
    let src_region = task.src_region.as_ref();
    region::check_extents(
        &region::extent(dst_region, dst.shape())?,
        &region::extent(src_region, src.shape())?,
    )?;

    let mut dst_view = View::open(dst)?;
    let src_view = View::open(src)?;

    if let (View::Native(d), View::Native(s)) = (&dst_view, &src_view) {
        if d.same_storage(s) {
            return d.copy_region_from(dst_region, s, src_region);
        }
    }

    let elem = dst.dtype().element_size();
    let dst_runs = region::byte_runs(dst_region, dst.shape(), elem)?;
    let src_runs = region::byte_runs(src_region, src.shape(), elem)?;

    if dst.tier() == Tier::Accelerator || src.tier() == Tier::Accelerator {
        let stage = relay.staging(region::run_bytes(&src_runs))?;
        src_view.with_bytes(|s| region::pack_runs(s, &src_runs, &mut *stage))?;
        dst_view.with_bytes_mut(|d| region::unpack_runs(d, &dst_runs, &*stage))?;
    } else {
        src_view.with_bytes(|s| {
            dst_view.with_bytes_mut(|d| region::copy_runs(d, &dst_runs, s, &src_runs))
        })?;
    }
    dst_view.flush()
}
