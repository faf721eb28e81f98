//! Token/position embedding, the output head and attention-mask helpers.

use rand::Rng;
use stratum_core::{DType, NativeTensor, Result, StratumError};
use stratum_offload::{OffloadContext, TensorHandle};

use crate::config::ModelShape;
use crate::device::{donate, ComputeDevice};

/// Below this temperature sampling degenerates to arg-max.
const MIN_TEMPERATURE: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct EmbeddingWeights {
    pub w_token: TensorHandle,
    pub w_pos: TensorHandle,
}

#[derive(Debug, Clone)]
pub struct OutputWeights {
    pub w_ln: TensorHandle,
    pub b_ln: TensorHandle,
    /// Tied with the input token table.
    pub w_token: TensorHandle,
}

/// Position ids: the running count of real tokens, `+ 1`, with padding at 1.
///
/// `mask` is `(batch, total)`; the trailing `len` columns are returned.
pub fn positions_from_mask(mask: &[bool], batch: usize, total: usize, len: usize) -> Result<Vec<i64>> {
    if len > total || mask.len() != batch * total {
        return Err(StratumError::ShapeMismatch(format!(
            "{len} positions from a ({batch}, {total}) mask"
        )));
    }
    let past = total - len;
    let mut out = Vec::with_capacity(batch * len);
    for row in mask.chunks(total) {
        let mut count = 0i64;
        for (j, &keep) in row.iter().enumerate() {
            count += keep as i64;
            if j >= past {
                out.push(if keep { count + 1 } else { 1 });
            }
        }
    }
    Ok(out)
}

impl ComputeDevice {
    /// `token_ids != pad_token_id`, as a bool mask of the same shape.
    pub fn gen_attention_mask(
        &self,
        token_ids: &TensorHandle,
        pad_token_id: usize,
        donate_ids: bool,
    ) -> Result<TensorHandle> {
        let ids = self.operand(token_ids)?;
        let keep: Vec<bool> = ids
            .to_i64_vec()
            .into_iter()
            .map(|id| id != pad_token_id as i64)
            .collect();
        let mask = NativeTensor::from_bool(&keep, ids.dims(), self.device())?;
        donate(&[(token_ids, donate_ids)])?;
        self.wrap(mask)
    }

    /// Append one column of ones to a `(batch, len)` mask.
    pub fn extend_attention_mask(&self, mask: &TensorHandle, donate_mask: bool) -> Result<TensorHandle> {
        let m = self.operand(mask)?;
        let [batch, _] = m.dims() else {
            return Err(StratumError::ShapeMismatch(format!(
                "attention mask must be 2-D, got {}",
                m.shape()
            )));
        };
        let ones = NativeTensor::from_f32_as(&vec![1.0; *batch], [*batch, 1], m.dtype(), m.device())?;
        let extended = NativeTensor::cat(&[m.clone(), ones], 1)?;
        donate(&[(mask, donate_mask)])?;
        self.wrap(extended)
    }

    /// Token plus position embedding of `(batch, s)` ids.
    ///
    /// The mask covers the cached prefix as well; only the positions of the
    /// new tokens are embedded.
    pub fn input_embed(
        &self,
        ctx: &OffloadContext,
        inputs: &TensorHandle,
        attention_mask: &TensorHandle,
        weights: &EmbeddingWeights,
        model: &ModelShape,
        donate_flags: [bool; 2],
    ) -> Result<TensorHandle> {
        let w_token = self.weight(ctx, &weights.w_token)?;
        let w_pos = self.weight(ctx, &weights.w_pos)?;
        let ids = self.operand(inputs)?;
        let mask = self.operand(attention_mask)?;
        let (&[batch, len], &[mask_batch, total]) = (ids.dims(), mask.dims()) else {
            return Err(StratumError::ShapeMismatch(format!(
                "ids {} and mask {} must both be 2-D",
                ids.shape(),
                mask.shape()
            )));
        };
        if batch != mask_batch {
            return Err(StratumError::ShapeMismatch(format!(
                "{batch} id rows for {mask_batch} mask rows"
            )));
        }

        let numeric = self.numeric();
        let token_embed = numeric.embedding(&ids, &w_token, Some(model.pad_token_id))?;
        let positions = positions_from_mask(&mask.to_bool_vec(), batch, total, len)?;
        let positions = NativeTensor::from_i64(&positions, [batch, len], self.device())?;
        let pos_embed = numeric.embedding(&positions, &w_pos, None)?;
        let out = numeric.add(&token_embed, &pos_embed)?;

        donate(&[(inputs, donate_flags[0]), (attention_mask, donate_flags[1])])?;
        self.wrap(out)
    }

    /// Next token per sequence: `(batch, 1)` i64 ids.
    ///
    /// Samples from `softmax(logits / temperature)` when `do_sample` is set
    /// and the temperature is not negligible; otherwise takes the arg-max.
    #[allow(clippy::too_many_arguments)]
    pub fn output_embed<R: Rng + ?Sized>(
        &self,
        ctx: &OffloadContext,
        inputs: &TensorHandle,
        weights: &OutputWeights,
        model: &ModelShape,
        donate_input: bool,
        do_sample: bool,
        temperature: f32,
        rng: &mut R,
    ) -> Result<TensorHandle> {
        let w_token = self.weight(ctx, &weights.w_token)?;
        let w_ln = self.weight(ctx, &weights.w_ln)?;
        let b_ln = self.weight(ctx, &weights.b_ln)?;
        let x = self.operand(inputs)?;
        let &[batch, seq, _] = x.dims() else {
            return Err(StratumError::ShapeMismatch(format!(
                "hidden states must be (batch, seq, hidden), got {}",
                x.shape()
            )));
        };
        if seq == 0 {
            return Err(StratumError::ShapeMismatch("no positions to decode".into()));
        }

        let numeric = self.numeric();
        let hidden = numeric.layer_norm(&x, &w_ln, &b_ln, model.layer_norm_eps)?;
        donate(&[(inputs, donate_input)])?;

        let last = numeric.linear(&hidden.narrow(1, seq - 1, 1)?, &w_token, None)?;
        let sample = do_sample && temperature >= MIN_TEMPERATURE;
        let scores = if sample {
            numeric.softmax(&numeric.mul_scalar(&last.cast(DType::F32), 1.0 / temperature)?)?
        } else {
            last
        };

        let vocab = w_token.dims()[0];
        let scores = scores.to_f32_vec();
        let ids: Vec<i64> = scores
            .chunks(vocab.max(1))
            .take(batch)
            .map(|row| {
                let id = if sample { categorical(row, rng) } else { argmax(row) };
                id as i64
            })
            .collect();
        tracing::trace!(batch, sample, "output tokens selected");
        self.wrap(NativeTensor::from_i64(&ids, [batch, 1], self.device())?)
    }
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn categorical<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_count_real_tokens() {
        // Left padding: [pad, pad, a, b] -> [1, 1, 2, 3]
        let mask = [false, false, true, true, true, true, true, true];
        let pos = positions_from_mask(&mask, 2, 4, 4).unwrap();
        assert_eq!(pos, vec![1, 1, 2, 3, 2, 3, 4, 5]);
    }

    #[test]
    fn test_positions_skip_cached_prefix() {
        let mask = [false, true, true, true, true];
        assert_eq!(positions_from_mask(&mask, 1, 5, 1).unwrap(), vec![5]);
        assert!(positions_from_mask(&mask, 1, 5, 6).is_err());
    }

    #[test]
    fn test_argmax_and_categorical() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(categorical(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
    }
}
