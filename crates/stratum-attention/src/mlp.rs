//! Feed-forward block: layer norm, linear, relu, linear, residual.

use stratum_core::Result;
use stratum_offload::{OffloadContext, TensorHandle};

use crate::device::{donate, ComputeDevice, MlpWeights};

impl ComputeDevice {
    pub fn mlp(
        &self,
        ctx: &OffloadContext,
        inputs: &TensorHandle,
        weights: &MlpWeights,
        eps: f32,
        donate_input: bool,
    ) -> Result<TensorHandle> {
        let wi = self.weight(ctx, &weights.wi)?;
        let bi = self.weight(ctx, &weights.bi)?;
        let wo = self.weight(ctx, &weights.wo)?;
        let bo = self.weight(ctx, &weights.bo)?;
        let w_ln = self.weight(ctx, &weights.w_ln)?;
        let b_ln = self.weight(ctx, &weights.b_ln)?;
        let x = self.operand(inputs)?;

        let numeric = self.numeric();
        let out = numeric.layer_norm(&x, &w_ln, &b_ln, eps)?;
        let out = numeric.relu(&numeric.linear(&out, &wi, Some(&bi))?)?;
        let out = numeric.linear(&out, &wo, Some(&bo))?;
        let out = numeric.add(&out, &x)?;

        donate(&[(inputs, donate_input)])?;
        self.wrap(out)
    }
}
