//! The device a stage computes on, and the weight bundles stages consume.

use std::sync::Arc;

use stratum_core::{DType, Device, NativeTensor, Result, StratumError};
use stratum_offload::{Backend, OffloadContext, Payload, TensorHandle};

use crate::numeric::NumericBackend;

/// Weights of one self-attention layer.
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub w_q: TensorHandle,
    pub b_q: Option<TensorHandle>,
    pub w_k: TensorHandle,
    pub b_k: Option<TensorHandle>,
    pub w_v: TensorHandle,
    pub b_v: Option<TensorHandle>,
    pub w_out: TensorHandle,
    pub b_out: Option<TensorHandle>,
    pub w_ln: TensorHandle,
    pub b_ln: TensorHandle,
}

/// Weights of one feed-forward layer.
#[derive(Debug, Clone)]
pub struct MlpWeights {
    pub wi: TensorHandle,
    pub bi: TensorHandle,
    pub wo: TensorHandle,
    pub bo: TensorHandle,
    pub w_ln: TensorHandle,
    pub b_ln: TensorHandle,
}

/// A native backend paired with the kernels that run on it.
#[derive(Clone)]
pub struct ComputeDevice {
    backend: Backend,
    numeric: Arc<dyn NumericBackend>,
}

impl ComputeDevice {
    /// `backend` must hand out native buffers (Accelerator or Host).
    pub fn new(backend: Backend, numeric: Arc<dyn NumericBackend>) -> Result<Self> {
        if backend.device().is_none() {
            return Err(StratumError::DeviceMismatch(format!(
                "cannot compute on the {} backend",
                backend.name()
            )));
        }
        Ok(Self { backend, numeric })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn numeric(&self) -> &dyn NumericBackend {
        self.numeric.as_ref()
    }

    pub fn device(&self) -> Device {
        self.backend.device().unwrap_or(Device::Host)
    }

    pub fn has_fast_path(&self, dtype: DType) -> bool {
        self.numeric.has_fast_path(self.device(), dtype)
    }

    /// Native view of an operand already resident on this device.
    pub fn operand(&self, handle: &TensorHandle) -> Result<NativeTensor> {
        let t = handle.native()?;
        if t.device() != self.device() {
            return Err(StratumError::DeviceMismatch(format!(
                "{} is on {}, computing on {}",
                handle.name(),
                t.device(),
                self.device()
            )));
        }
        Ok(t)
    }

    /// Native view of a weight; encoded weights are decompressed onto this device.
    pub fn weight(&self, ctx: &OffloadContext, handle: &TensorHandle) -> Result<NativeTensor> {
        match handle.payload()? {
            Payload::Encoded(_) => Ok(handle.materialize(ctx)?.to_device(self.device())),
            _ => self.operand(handle),
        }
    }

    pub fn optional_weight(
        &self,
        ctx: &OffloadContext,
        handle: Option<&TensorHandle>,
    ) -> Result<Option<NativeTensor>> {
        handle.map(|h| self.weight(ctx, h)).transpose()
    }

    /// Hand a computed buffer back as a handle on this device.
    pub fn wrap(&self, tensor: NativeTensor) -> Result<TensorHandle> {
        TensorHandle::from_native(&self.backend, tensor.to_device(self.device()))
    }
}

impl std::fmt::Debug for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeDevice")
            .field("backend", &self.backend.name())
            .field("numeric", &self.numeric.name())
            .finish()
    }
}

/// Delete the inputs whose donation flag is set.
pub(crate) fn donate(inputs: &[(&TensorHandle, bool)]) -> Result<()> {
    for (handle, donated) in inputs {
        if *donated {
            handle.delete()?;
        }
    }
    Ok(())
}
