//! `TensorHandle`: a tensor descriptor bound to the tier that owns its bytes.
//!
//! A handle carries shape, dtype, the owning backend and a tier-specific
//! payload. Clones share one payload slot, so `delete` through any clone
//! invalidates all of them and every later access is a `UseAfterDelete`.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use stratum_core::region::{self, Region};
use stratum_core::{npy, DType, Device, NativeTensor, Result, Shape, StratumError};

use crate::backend::{AllocOptions, Backend};
use crate::compression::CodecConfig;
use crate::context::OffloadContext;
use crate::copy::{general_copy, CopyOutcome};
use crate::tier::Tier;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Fresh identity name, `t_<n>`, unique within the process.
pub fn next_name() -> String {
    format!("t_{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Tier-specific storage behind a handle.
#[derive(Clone)]
pub enum Payload {
    Accelerator(NativeTensor),
    Host(NativeTensor),
    /// Path of the backing file inside the disk backend's root.
    Disk(PathBuf),
    Segmented(Segments),
    Encoded(EncodedParts),
}

impl Payload {
    pub fn tier(&self) -> Tier {
        match self {
            Payload::Accelerator(_) => Tier::Accelerator,
            Payload::Host(_) => Tier::Host,
            Payload::Disk(_) => Tier::Disk,
            Payload::Segmented(_) => Tier::Segmented,
            Payload::Encoded(_) => Tier::Encoded,
        }
    }
}

/// Sub-handles of a segmented tensor.
///
/// `bounds` has one more entry than `parts`, starts at 0 and ends at the
/// axis length. A zero-length segment has no sub-handle.
#[derive(Clone)]
pub struct Segments {
    pub parts: Vec<Option<TensorHandle>>,
    pub bounds: Vec<usize>,
    pub axis: usize,
}

impl Segments {
    /// `(start, stop, sub-handle)` for every non-empty segment.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &TensorHandle)> {
        self.parts
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|h| (self.bounds[i], self.bounds[i + 1], h)))
    }
}

/// Payload and scales of a compressed tensor.
#[derive(Clone)]
pub struct EncodedParts {
    pub data: TensorHandle,
    pub scale: TensorHandle,
    pub config: CodecConfig,
}

struct HandleInner {
    name: String,
    shape: Shape,
    dtype: DType,
    backend: Backend,
    payload: RwLock<Option<Payload>>,
    delete_file: AtomicBool,
    /// Whether the bytes count against the backend's memory tracker.
    tracked: bool,
}

#[derive(Clone)]
pub struct TensorHandle {
    inner: Arc<HandleInner>,
}

impl TensorHandle {
    pub(crate) fn create(
        backend: Backend,
        shape: Shape,
        dtype: DType,
        payload: Payload,
        name: Option<String>,
        tracked: bool,
    ) -> Result<Self> {
        if payload.tier() != backend.tier() {
            return Err(StratumError::DeviceMismatch(format!(
                "{} payload for a {} backend",
                payload.tier(),
                backend.tier()
            )));
        }
        match &payload {
            Payload::Accelerator(t) | Payload::Host(t) => {
                if t.shape() != &shape || t.dtype() != dtype {
                    return Err(StratumError::ShapeMismatch(format!(
                        "buffer {} of {} for a handle of {shape} {dtype}",
                        t.shape(),
                        t.dtype()
                    )));
                }
                if Some(t.device()) != backend.device() {
                    return Err(StratumError::DeviceMismatch(format!(
                        "buffer on {} for backend {}",
                        t.device(),
                        backend.name()
                    )));
                }
            }
            Payload::Segmented(seg) => {
                let axis_len = shape.dim(seg.axis).ok_or_else(|| {
                    StratumError::ShapeMismatch(format!("segment axis {} of {shape}", seg.axis))
                })?;
                if seg.bounds.len() != seg.parts.len() + 1
                    || seg.bounds.first() != Some(&0)
                    || seg.bounds.last() != Some(&axis_len)
                    || seg.bounds.windows(2).any(|w| w[0] > w[1])
                {
                    return Err(StratumError::ShapeMismatch(format!(
                        "segment bounds {:?} do not partition axis {} of {shape}",
                        seg.bounds, seg.axis
                    )));
                }
            }
            Payload::Disk(_) | Payload::Encoded(_) => {}
        }
        Ok(Self {
            inner: Arc::new(HandleInner {
                name: name.unwrap_or_else(next_name),
                shape,
                dtype,
                backend,
                payload: RwLock::new(Some(payload)),
                delete_file: AtomicBool::new(true),
                tracked,
            }),
        })
    }

    /// Wrap an existing native buffer. The bytes are not charged to the backend.
    pub fn from_native(backend: &Backend, tensor: NativeTensor) -> Result<Self> {
        let payload = match backend.tier() {
            Tier::Accelerator => Payload::Accelerator(tensor.clone()),
            Tier::Host => Payload::Host(tensor.clone()),
            other => {
                return Err(StratumError::DeviceMismatch(format!(
                    "native buffer cannot live on the {other} tier"
                )))
            }
        };
        Self::create(
            backend.clone(),
            tensor.shape().clone(),
            tensor.dtype(),
            payload,
            None,
            false,
        )
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn tier(&self) -> Tier {
        self.inner.backend.tier()
    }

    /// Logical size in bytes.
    pub fn nbytes(&self) -> usize {
        self.inner.dtype.storage_bytes(self.inner.shape.numel())
    }

    /// Whether two handles are the same tensor.
    pub fn same(&self, other: &TensorHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.payload.read().is_none()
    }

    /// Whether `delete` removes the backing file of a disk handle.
    pub fn set_delete_file(&self, delete: bool) {
        self.inner.delete_file.store(delete, Ordering::Release);
    }

    pub fn payload(&self) -> Result<Payload> {
        self.inner
            .payload
            .read()
            .clone()
            .ok_or_else(|| StratumError::UseAfterDelete(self.inner.name.clone()))
    }

    /// The native buffer of an accelerator or host handle.
    pub fn native(&self) -> Result<NativeTensor> {
        match self.payload()? {
            Payload::Accelerator(t) | Payload::Host(t) => Ok(t),
            other => Err(StratumError::DeviceMismatch(format!(
                "{} is on the {} tier, not in memory",
                self.inner.name,
                other.tier()
            ))),
        }
    }

    /// Device of a native handle.
    pub fn device(&self) -> Option<Device> {
        self.inner.backend.device()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release the payload. Disk files are removed unless `set_delete_file(false)`.
    pub fn delete(&self) -> Result<()> {
        let payload = self
            .inner
            .payload
            .write()
            .take()
            .ok_or_else(|| StratumError::UseAfterDelete(self.inner.name.clone()))?;
        tracing::trace!(name = %self.inner.name, tier = %payload.tier(), "delete");

        match payload {
            Payload::Accelerator(_) | Payload::Host(_) => self.release_bytes(),
            Payload::Disk(path) => {
                if self.inner.delete_file.load(Ordering::Acquire) && path.exists() {
                    std::fs::remove_file(&path)?;
                }
                self.release_bytes();
            }
            Payload::Segmented(seg) => {
                for part in seg.parts.iter().flatten() {
                    part.delete()?;
                }
            }
            Payload::Encoded(parts) => {
                parts.data.delete()?;
                parts.scale.delete()?;
            }
        }
        Ok(())
    }

    fn release_bytes(&self) {
        if self.inner.tracked {
            if let Some(tracker) = self.inner.backend.tracker() {
                tracker.release(self.nbytes());
            }
        }
    }

    /// Allocate on `dst` and copy `self[src_region]` into it.
    pub fn copy(
        &self,
        ctx: &OffloadContext,
        dst: &Backend,
        src_region: Option<&Region>,
    ) -> Result<TensorHandle> {
        Ok(self.copy_tracked(ctx, dst, src_region)?.0)
    }

    fn copy_tracked(
        &self,
        ctx: &OffloadContext,
        dst: &Backend,
        src_region: Option<&Region>,
    ) -> Result<(TensorHandle, CopyOutcome)> {
        let ext = region::extent(src_region, self.shape())?;
        let out = dst.allocate(ext.dims(), self.dtype(), &AllocOptions::default())?;
        let outcome = general_copy(ctx, &out, None, self, src_region)?;
        Ok((out, outcome))
    }

    /// Copy unless `dst` already owns this handle; the flag reports whether a copy happened.
    pub fn smart_copy(
        &self,
        ctx: &OffloadContext,
        dst: &Backend,
        src_region: Option<&Region>,
    ) -> Result<(TensorHandle, bool)> {
        if self.backend().same(dst) {
            return Ok((self.clone(), false));
        }
        Ok((self.copy(ctx, dst, src_region)?, true))
    }

    /// Copy to `dst` and delete this handle. Same-backend moves return `self`.
    ///
    /// Never blocks on a queued transfer: the source is then released by a
    /// copy worker after the transfer has run, so it is gone once
    /// `ctx.synchronize()` returns. A failed transfer keeps the source.
    pub fn move_to(&self, ctx: &OffloadContext, dst: &Backend) -> Result<TensorHandle> {
        if self.backend().same(dst) {
            return Ok(self.clone());
        }
        let (out, outcome) = self.copy_tracked(ctx, dst, None)?;
        if outcome.is_complete() {
            self.delete()?;
        } else {
            ctx.disk().release_after(self.clone(), outcome)?;
        }
        Ok(out)
    }

    /// Fill this handle from a native buffer of the same shape and dtype.
    pub fn load_from_buffer(&self, ctx: &OffloadContext, data: &NativeTensor) -> Result<CopyOutcome> {
        if data.dtype() != self.dtype() {
            return Err(StratumError::DTypeMismatch {
                expected: self.dtype(),
                got: data.dtype(),
            });
        }
        if data.numel() != self.shape().numel() {
            return Err(StratumError::ShapeMismatch(format!(
                "loading {} into {}",
                data.shape(),
                self.shape()
            )));
        }
        match self.payload()? {
            Payload::Disk(path) => {
                let header = npy::encode_header(self.dtype(), self.shape());
                let mut file = OpenOptions::new().write(true).open(&path)?;
                file.seek(SeekFrom::Start(header.len() as u64))?;
                data.with_bytes(|b| file.write_all(b))?;
                Ok(CopyOutcome::complete())
            }
            Payload::Encoded(parts) => {
                let Backend::Encoded(enc) = self.backend() else {
                    return Err(StratumError::DeviceMismatch(format!(
                        "{} carries an encoded payload on a plain backend",
                        self.name()
                    )));
                };
                let staged = enc.compress_with(&data.reshape(self.dims())?, &parts.config)?;
                general_copy(ctx, self, None, &staged, None)
            }
            _ => {
                let src = TensorHandle::from_native(
                    &ctx.host(),
                    data.reshape(self.dims())?.to_device(Device::Host),
                )?;
                general_copy(ctx, self, None, &src, None)
            }
        }
    }

    /// Fill this handle from an `.npy` file.
    pub fn load_from_file(&self, ctx: &OffloadContext, path: &Path) -> Result<CopyOutcome> {
        if let Payload::Disk(own) = self.payload()? {
            let header = npy::read_header(path)?;
            if header.dtype != self.dtype() || header.shape != *self.shape() {
                return Err(StratumError::ShapeMismatch(format!(
                    "{} holds {} {}, handle is {} {}",
                    path.display(),
                    header.shape,
                    header.dtype,
                    self.shape(),
                    self.dtype()
                )));
            }
            std::fs::copy(path, own)?;
            return Ok(CopyOutcome::complete());
        }
        let data = npy::read_file(path)?;
        self.load_from_buffer(ctx, &data)
    }

    /// Read the full contents into a native buffer, whatever the tier.
    ///
    /// Disk contents are read as stored; callers synchronize pending writes first.
    pub fn materialize(&self, ctx: &OffloadContext) -> Result<NativeTensor> {
        match self.payload()? {
            Payload::Accelerator(t) | Payload::Host(t) => Ok(t),
            Payload::Disk(path) => {
                let t = npy::read_file(&path)?;
                if t.shape() != self.shape() || t.dtype() != self.dtype() {
                    return Err(StratumError::Format(format!(
                        "{} no longer matches handle {}",
                        path.display(),
                        self.name()
                    )));
                }
                Ok(t)
            }
            Payload::Encoded(parts) => match self.backend() {
                Backend::Encoded(enc) => enc.decompress_parts(&parts, self.shape(), self.dtype()),
                other => Err(StratumError::DeviceMismatch(format!(
                    "encoded payload on backend {}",
                    other.name()
                ))),
            },
            Payload::Segmented(_) => {
                let out = NativeTensor::zeros(self.shape().clone(), self.dtype(), Device::Host);
                let dst = TensorHandle::from_native(&ctx.host(), out.clone())?;
                general_copy(ctx, &dst, None, self, None)?.wait()?;
                Ok(out)
            }
        }
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("name", &self.inner.name)
            .field("shape", &self.inner.shape)
            .field("dtype", &self.inner.dtype)
            .field("backend", &self.inner.backend.name())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl fmt::Display for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorHandle(name={}, shape={}, dtype={}, device={})",
            self.inner.name,
            self.inner.shape,
            self.inner.dtype,
            self.inner.backend.name()
        )
    }
}
