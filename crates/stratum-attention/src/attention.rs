//! Self-attention over a tiered KV cache.
//!
//! Prefill attends causally over the whole prompt and emits the cache in
//! `(seq, batch*heads, head_dim)` layout. Decode handles one new position
//! per sequence and picks a path from the cache's tier and the policy:
//!
//! - Dense: full history; staged through the f32 workspace when the compute
//!   device has no fast path for the cache's element type.
//! - Sparse: scores over the full key history, then only the top-scoring
//!   value rows are gathered from wherever the value cache lives.
//! - Split: a cache segmented into an accelerator part and a host part is
//!   attended on each device separately and the results concatenated.
//!
//! The new key/value row is returned, never written into the cache.

use std::sync::Arc;

use stratum_core::{DType, Device, GatherIndex, NativeTensor, Region, Result, StratumError};
use stratum_offload::{
    general_copy, AllocOptions, EncodedBackend, OffloadContext, Payload, TensorHandle, Tier,
};

use crate::config::{ModelShape, OffloadPolicy};
use crate::device::{donate, AttentionWeights, ComputeDevice};
use crate::numeric::NumericBackend;
use crate::planner::{AttentionPlanner, NoPlanning};
use crate::workspace::AttentionWorkspace;

/// Score given to masked positions before the softmax.
const MASKED_SCORE: f32 = -1e4;

// =========================================================================
// Requests and results
// =========================================================================

/// Inputs of the speculative index predictor.
#[derive(Debug, Clone)]
pub struct Speculation {
    pub partial_w_q: TensorHandle,
    pub partial_k_cache: TensorHandle,
}

/// One decode step.
#[derive(Debug, Clone)]
pub struct DecodeRequest<'a> {
    /// `(batch, 1, hidden)`.
    pub inputs: &'a TensorHandle,
    /// `(batch, len)` bool, covering the cached history and the new position.
    pub attention_mask: &'a TensorHandle,
    pub k_cache: &'a TensorHandle,
    pub v_cache: &'a TensorHandle,
    /// Receives the rows gathered by sparse decode; a temporary buffer on
    /// the compute device is used when absent.
    pub v_staging: Option<&'a TensorHandle>,
    pub speculation: Option<Speculation>,
    /// Delete `inputs` / `attention_mask` once consumed.
    pub donate: [bool; 2],
}

#[derive(Debug)]
pub struct PrefillOutput {
    /// `(batch, seq, hidden)`, residual included.
    pub hidden: TensorHandle,
    /// `(seq, batch*heads, head_dim)`, encoded when cache compression is on.
    pub k_cache: TensorHandle,
    pub v_cache: TensorHandle,
    /// Query/key projection weights after skewing, on warmup runs.
    pub skewed: Option<(NativeTensor, NativeTensor)>,
    pub partial_weight_index: Option<NativeTensor>,
}

#[derive(Debug)]
pub struct DecodeOutput {
    /// `(batch, 1, hidden)`.
    pub hidden: TensorHandle,
    /// `(n, batch*heads, head_dim)` rows for the scheduler to store at
    /// cache rows `cache_start..cache_start + n`. `n` is 1 unless the cache
    /// is compressed in groups along the sequence axis, in which case the
    /// whole group holding the new position is handed back re-encoded.
    pub k_new: TensorHandle,
    pub v_new: TensorHandle,
    pub cache_start: usize,
    /// Positions predicted for the next step by the speculation routine.
    pub prefetch: Option<NativeTensor>,
}

/// How a decode step attends over its cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodePath {
    Dense,
    /// Keep `floor(sparsity * history)` positions.
    Sparse(f32),
    Split,
}

struct Resolved {
    w_q: NativeTensor,
    b_q: Option<NativeTensor>,
    w_k: NativeTensor,
    b_k: Option<NativeTensor>,
    w_v: NativeTensor,
    b_v: Option<NativeTensor>,
    w_out: NativeTensor,
    b_out: Option<NativeTensor>,
    w_ln: NativeTensor,
    b_ln: NativeTensor,
}

// =========================================================================
// Engine
// =========================================================================

pub struct AttentionEngine {
    device: ComputeDevice,
    model: ModelShape,
    policy: OffloadPolicy,
    planner: Arc<dyn AttentionPlanner>,
    workspace: Option<AttentionWorkspace>,
    cache_codec: Option<Arc<EncodedBackend>>,
}

impl AttentionEngine {
    pub fn new(device: ComputeDevice, model: ModelShape, policy: OffloadPolicy) -> Result<Self> {
        model.validate()?;
        policy.validate()?;
        Ok(Self {
            device,
            model,
            policy,
            planner: Arc::new(NoPlanning),
            workspace: None,
            cache_codec: None,
        })
    }

    pub fn with_planner(mut self, planner: Arc<dyn AttentionPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_workspace(mut self, workspace: AttentionWorkspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Encoded backend used for the emitted cache when compression is enabled.
    pub fn with_cache_codec(mut self, codec: Arc<EncodedBackend>) -> Self {
        self.cache_codec = Some(codec);
        self
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }

    pub fn policy(&self) -> &OffloadPolicy {
        &self.policy
    }

    pub fn take_workspace(&mut self) -> Option<AttentionWorkspace> {
        self.workspace.take()
    }

    fn n_head(&self) -> usize {
        self.model.n_head
    }

    fn head_dim(&self) -> usize {
        self.model.head_dim()
    }

    fn numeric(&self) -> &dyn NumericBackend {
        self.device.numeric()
    }

    fn resolve(&self, ctx: &OffloadContext, w: &AttentionWeights) -> Result<Resolved> {
        let d = &self.device;
        Ok(Resolved {
            w_q: d.weight(ctx, &w.w_q)?,
            b_q: d.optional_weight(ctx, w.b_q.as_ref())?,
            w_k: d.weight(ctx, &w.w_k)?,
            b_k: d.optional_weight(ctx, w.b_k.as_ref())?,
            w_v: d.weight(ctx, &w.w_v)?,
            b_v: d.optional_weight(ctx, w.b_v.as_ref())?,
            w_out: d.weight(ctx, &w.w_out)?,
            b_out: d.optional_weight(ctx, w.b_out.as_ref())?,
            w_ln: d.weight(ctx, &w.w_ln)?,
            b_ln: d.weight(ctx, &w.b_ln)?,
        })
    }

    /// `(batch, seq, hidden)` hidden states of this model.
    fn hidden_dims(&self, x: &NativeTensor) -> Result<(usize, usize)> {
        match x.dims() {
            &[b, s, h] if h == self.model.hidden => Ok((b, s)),
            _ => Err(StratumError::ShapeMismatch(format!(
                "hidden states {} for a hidden size of {}",
                x.shape(),
                self.model.hidden
            ))),
        }
    }

    fn mask_dims(mask: &NativeTensor, batch: usize) -> Result<usize> {
        match mask.dims() {
            &[b, len] if b == batch => Ok(len),
            _ => Err(StratumError::ShapeMismatch(format!(
                "attention mask {} for a batch of {batch}",
                mask.shape()
            ))),
        }
    }

    /// Hand a cache tensor back, encoded when cache compression is on.
    fn store_cache(&self, t: NativeTensor) -> Result<TensorHandle> {
        if !self.policy.compress_cache {
            return self.device.wrap(t);
        }
        let codec = self.cache_codec.as_ref().ok_or_else(|| {
            StratumError::Codec("cache compression enabled without an encoded backend".into())
        })?;
        codec.compress_with(&t, &self.policy.comp_cache_config)
    }

    /// First cache row covered by the rows a decode step hands back.
    fn cache_start(&self, src_s: usize) -> usize {
        let new_row = src_s - 1;
        let config = &self.policy.comp_cache_config;
        if self.policy.compress_cache && config.group_dim == 0 && config.group_size > 0 {
            new_row / config.group_size * config.group_size
        } else {
            new_row
        }
    }

    // =========================================================================
    // Prefill
    // =========================================================================

    /// Causal attention over a full prompt.
    ///
    /// On `warmup` the planner skews the query/key weights; otherwise, when
    /// a partial weight ratio is configured, it produces the partial-weight
    /// index used by later speculation.
    pub fn prefill(
        &self,
        ctx: &OffloadContext,
        inputs: &TensorHandle,
        attention_mask: &TensorHandle,
        weights: &AttentionWeights,
        donate_flags: [bool; 2],
        warmup: bool,
    ) -> Result<PrefillOutput> {
        let w = self.resolve(ctx, weights)?;
        let x = self.device.operand(inputs)?;
        let (b, s) = self.hidden_dims(&x)?;
        let mask = self.device.operand(attention_mask)?;
        if Self::mask_dims(&mask, b)? != s {
            return Err(StratumError::ShapeMismatch(format!(
                "prefill of {s} positions with a mask of {}",
                mask.shape()
            )));
        }
        let (n_head, head_dim) = (self.n_head(), self.head_dim());
        let numeric = self.numeric();

        let hidden = numeric.layer_norm(&x, &w.w_ln, &w.b_ln, self.model.layer_norm_eps)?;
        let reformed = self.planner.reform_hidden_states(&hidden)?;
        let q = numeric.linear(&reformed, &w.w_q, w.b_q.as_ref())?;
        let k = numeric.linear(&reformed, &w.w_k, w.b_k.as_ref())?;
        let v = numeric.linear(&hidden, &w.w_v, w.b_v.as_ref())?;

        let partial_weight_index = match (warmup, self.policy.partial_weight_ratio) {
            (false, Some(ratio)) => self.planner.partial_weight_index(&q, n_head, head_dim, ratio)?,
            _ => None,
        };
        let skewed = if warmup {
            let heads = [b, s, n_head, head_dim];
            Some(self.planner.skew(
                &q.reshape(&heads)?,
                &k.reshape(&heads)?,
                &w.w_q,
                &w.w_k,
                n_head,
                head_dim,
            )?)
        } else {
            None
        };

        let scaling = (head_dim as f32).powf(-0.5);
        let q = numeric.mul_scalar(&split_heads(&q, n_head)?, scaling)?;
        let k = split_heads(&k, n_head)?;
        let v = split_heads(&v, n_head)?;

        // (b*n_head, s, s)
        let scores = numeric.bmm(&q, &k.permute(&[0, 2, 1])?)?;
        let padding = mask.to_bool_vec();
        let mut keep = Vec::with_capacity(b * s * s);
        for bi in 0..b {
            for i in 0..s {
                keep.extend((0..s).map(|j| padding[bi * s + j] && j <= i));
            }
        }
        let probs = numeric.softmax(&mask_scores(&scores, &keep, b, n_head)?)?;
        let value = merge_heads(&numeric.bmm(&probs, &v)?, b, n_head)?;
        let value = numeric.linear(&value, &w.w_out, w.b_out.as_ref())?;
        let value = numeric.add(&value, &x)?;

        donate(&[(inputs, donate_flags[0]), (attention_mask, donate_flags[1])])?;
        tracing::debug!(batch = b, seq = s, warmup, "prefill attention");

        Ok(PrefillOutput {
            hidden: self.device.wrap(value)?,
            k_cache: self.store_cache(k.permute(&[1, 0, 2])?)?,
            v_cache: self.store_cache(v.permute(&[1, 0, 2])?)?,
            skewed,
            partial_weight_index,
        })
    }

    // =========================================================================
    // Decode
    // =========================================================================

    /// The path `decode` takes for this key cache under the current policy.
    pub fn select_path(&self, k_cache: &TensorHandle) -> Result<DecodePath> {
        let sparsity = self.policy.attn_sparsity;
        match (k_cache.tier(), self.policy.is_dense()) {
            (Tier::Segmented, true) => Ok(DecodePath::Split),
            (Tier::Accelerator | Tier::Host | Tier::Encoded, true) => Ok(DecodePath::Dense),
            (Tier::Accelerator | Tier::Host, false) => Ok(DecodePath::Sparse(sparsity)),
            (tier, _) => Err(StratumError::UnsupportedTierCombination(format!(
                "decode over a {tier} key cache with sparsity {sparsity}"
            ))),
        }
    }

    /// Attend one new position per sequence over the cached history.
    pub fn decode(
        &self,
        ctx: &OffloadContext,
        request: &DecodeRequest<'_>,
        weights: &AttentionWeights,
    ) -> Result<DecodeOutput> {
        let path = self.select_path(request.k_cache)?;
        self.decode_with(ctx, path, request, weights)
    }

    /// `decode` along an explicitly chosen path.
    pub fn decode_with(
        &self,
        ctx: &OffloadContext,
        path: DecodePath,
        request: &DecodeRequest<'_>,
        weights: &AttentionWeights,
    ) -> Result<DecodeOutput> {
        let w = self.resolve(ctx, weights)?;
        let x = self.device.operand(request.inputs)?;
        let (b, tgt_s) = self.hidden_dims(&x)?;
        if tgt_s != 1 {
            return Err(StratumError::ShapeMismatch(format!(
                "decode takes one position per sequence, got {tgt_s}"
            )));
        }
        let mask = self.device.operand(request.attention_mask)?;
        let mask_len = Self::mask_dims(&mask, b)?;
        let cache_len = request.k_cache.dims().first().copied().unwrap_or(0);
        let src_s = mask_len.min(cache_len + 1);
        if src_s == 0 {
            return Err(StratumError::ShapeMismatch("decode with an empty attention mask".into()));
        }
        let numeric = self.numeric();

        let hidden = numeric.layer_norm(&x, &w.w_ln, &w.b_ln, self.model.layer_norm_eps)?;
        let reformed = self.planner.reform_hidden_states(&hidden)?;

        let (prefetch, (q, k_new, v_new)) = match &request.speculation {
            Some(spec) => {
                let partial_w_q = self.device.weight(ctx, &spec.partial_w_q)?;
                let partial_k = spec.partial_k_cache.materialize(ctx)?;
                let (prefetch, projected) = rayon::join(
                    || {
                        self.planner.speculate(
                            &reformed,
                            &partial_w_q,
                            &partial_k,
                            self.n_head(),
                            self.policy.alpha,
                            self.policy.max_num_kv,
                        )
                    },
                    || self.project_step(&w, &reformed, &hidden, b),
                );
                (prefetch?, projected?)
            }
            None => (None, self.project_step(&w, &reformed, &hidden, b)?),
        };

        let keep = mask.narrow(1, 0, src_s)?.to_bool_vec();
        tracing::debug!(?path, batch = b, src_s, "decode attention");
        let value = match path {
            DecodePath::Dense => self.dense_attention(ctx, request, &q, &k_new, &v_new, &keep, b, src_s)?,
            DecodePath::Sparse(sparsity) => {
                self.sparse_attention(ctx, request, &q, &k_new, &v_new, &keep, b, src_s, sparsity)?
            }
            DecodePath::Split => self.split_attention(request, &q, &k_new, &v_new, &keep, b, src_s)?,
        };

        let value = merge_heads(&value, b, self.n_head())?;
        let value = numeric.linear(&value, &w.w_out, w.b_out.as_ref())?;
        let value = numeric.add(&value, &x)?;

        donate(&[
            (request.inputs, request.donate[0]),
            (request.attention_mask, request.donate[1]),
        ])?;

        let cache_start = self.cache_start(src_s);
        let (k_new, v_new) = if cache_start + 1 < src_s {
            (
                append_row(cached_range(ctx, request.k_cache, cache_start, src_s - 1)?, &k_new)?,
                append_row(cached_range(ctx, request.v_cache, cache_start, src_s - 1)?, &v_new)?,
            )
        } else {
            (k_new, v_new)
        };

        Ok(DecodeOutput {
            hidden: self.device.wrap(value)?,
            k_new: self.store_cache(k_new)?,
            v_new: self.store_cache(v_new)?,
            cache_start,
            prefetch,
        })
    }

    /// Scaled queries `(b*n_head, 1, head_dim)` plus the new key and value
    /// rows `(1, b*n_head, head_dim)`.
    fn project_step(
        &self,
        w: &Resolved,
        reformed: &NativeTensor,
        hidden: &NativeTensor,
        b: usize,
    ) -> Result<(NativeTensor, NativeTensor, NativeTensor)> {
        let numeric = self.numeric();
        let (n_head, head_dim) = (self.n_head(), self.head_dim());
        let q = numeric.linear(reformed, &w.w_q, w.b_q.as_ref())?;
        let k = numeric.linear(reformed, &w.w_k, w.b_k.as_ref())?;
        let v = numeric.linear(hidden, &w.w_v, w.b_v.as_ref())?;
        let q = numeric.mul_scalar(&split_heads(&q, n_head)?, (head_dim as f32).powf(-0.5))?;
        let row = [1, b * n_head, head_dim];
        Ok((q, k.reshape(&row)?, v.reshape(&row)?))
    }

    #[allow(clippy::too_many_arguments)]
    fn dense_attention(
        &self,
        ctx: &OffloadContext,
        request: &DecodeRequest<'_>,
        q: &NativeTensor,
        k_new: &NativeTensor,
        v_new: &NativeTensor,
        keep: &[bool],
        b: usize,
        src_s: usize,
    ) -> Result<NativeTensor> {
        let k = append_row(cached_rows(ctx, request.k_cache, src_s - 1)?, k_new)?;
        let v = append_row(cached_rows(ctx, request.v_cache, src_s - 1)?, v_new)?;
        let numeric = self.numeric();

        if self.device.has_fast_path(q.dtype()) {
            return attention_value(numeric, q, &k, &v, keep, b, self.n_head());
        }

        let (k, v) = match &self.workspace {
            Some(ws) => {
                let (wk, wv) = ws.next();
                (stage_rows(&wk, &k)?, stage_rows(&wv, &v)?)
            }
            None => (to_host_f32(&k), to_host_f32(&v)),
        };
        tracing::debug!(dtype = %q.dtype(), "dense decode staged through f32 host buffers");
        let out = attention_value(numeric, &to_host_f32(q), &k, &v, keep, b, self.n_head())?;
        Ok(out.cast(q.dtype()).to_device(q.device()))
    }

    #[allow(clippy::too_many_arguments)]
    fn sparse_attention(
        &self,
        ctx: &OffloadContext,
        request: &DecodeRequest<'_>,
        q: &NativeTensor,
        k_new: &NativeTensor,
        v_new: &NativeTensor,
        keep: &[bool],
        b: usize,
        src_s: usize,
        sparsity: f32,
    ) -> Result<NativeTensor> {
        let numeric = self.numeric();
        let k = append_row(cached_rows(ctx, request.k_cache, src_s - 1)?, k_new)?;
        let (q_c, k_c, v_new_c) = if self.device.has_fast_path(q.dtype()) {
            (q.clone(), k, v_new.clone())
        } else {
            (to_host_f32(q), to_host_f32(&k), to_host_f32(v_new))
        };

        // (b*n_head, 1, src_s)
        let probs = attention_weights(numeric, &q_c, &k_c, keep, b, self.n_head())?;
        let history = src_s - 1;
        let topk = ((sparsity * history as f32).floor() as usize).min(history);
        let current = probs.narrow(2, history, 1)?;

        let (weights, values) = if topk == 0 {
            (current, v_new_c)
        } else {
            let (top_w, top_i) = numeric.top_k(&probs.narrow(2, 0, history)?, topk)?;
            let gathered = self.gather_values(ctx, request, &top_i, topk)?;
            let gathered = gathered.cast(v_new_c.dtype()).to_device(v_new_c.device());
            (
                NativeTensor::cat(&[top_w, current], 2)?,
                NativeTensor::cat(&[gathered, v_new_c], 0)?,
            )
        };
        tracing::trace!(history, topk, "sparse decode selection");

        let out = numeric.bmm(&weights, &values.permute(&[1, 0, 2])?)?;
        Ok(out.cast(q.dtype()).to_device(q.device()))
    }

    /// Fetch the selected value rows `(topk, b*n_head, head_dim)` through
    /// the staging buffer.
    fn gather_values(
        &self,
        ctx: &OffloadContext,
        request: &DecodeRequest<'_>,
        top_i: &NativeTensor,
        topk: usize,
    ) -> Result<NativeTensor> {
        let home = request.v_cache;
        let bh = top_i.dims().first().copied().unwrap_or(0);
        let ranked = top_i.to_i64_vec();
        // top_i is (bh, 1, topk); the gather wants rank-major order.
        let mut indices = Vec::with_capacity(topk * bh);
        for r in 0..topk {
            indices.extend((0..bh).map(|c| ranked[c * topk + r] as usize));
        }
        let index = GatherIndex::new(indices, topk, bh)?;

        let (staging, temporary) = match request.v_staging {
            Some(s) => (s.clone(), false),
            None => {
                let mut dims = home.dims().to_vec();
                if let Some(rows) = dims.first_mut() {
                    *rows = topk + 1;
                }
                let s = self
                    .device
                    .backend()
                    .allocate(&dims, home.dtype(), &AllocOptions::default())?;
                (s, true)
            }
        };
        gather_rows(ctx, home, &staging, index)?;
        let rows = staging.native()?.narrow(0, 0, topk)?;
        if temporary {
            staging.delete()?;
        }
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    fn split_attention(
        &self,
        request: &DecodeRequest<'_>,
        q: &NativeTensor,
        k_new: &NativeTensor,
        v_new: &NativeTensor,
        keep: &[bool],
        b: usize,
        src_s: usize,
    ) -> Result<NativeTensor> {
        let n_head = self.n_head();
        let numeric = self.numeric();
        let bh = b * n_head;
        let (k_acc, k_host) = split_parts(request.k_cache, bh)?;
        let (v_acc, v_host) = split_parts(request.v_cache, bh)?;
        let seg = k_acc.dims()[1];
        if seg % n_head != 0 || v_acc.dims()[1] != seg {
            return Err(StratumError::ShapeMismatch(format!(
                "accelerator segment of {seg} rows does not hold whole sequences of {n_head} heads"
            )));
        }
        let b_acc = seg / n_head;
        let history = src_s - 1;
        let dtype = q.dtype();
        let acc_dev = k_acc.device();

        let on_acc = |t: NativeTensor| t.cast(dtype).to_device(acc_dev);
        let hist = |t: &NativeTensor| -> Result<Option<NativeTensor>> {
            if history == 0 {
                Ok(None)
            } else {
                t.narrow(0, 0, history).map(Some)
            }
        };

        let value_acc = attention_value(
            numeric,
            &on_acc(q.narrow(0, 0, seg)?),
            &append_row(hist(&k_acc)?, &on_acc(k_new.narrow(1, 0, seg)?))?,
            &append_row(hist(&v_acc)?, &on_acc(v_new.narrow(1, 0, seg)?))?,
            &keep[..b_acc * src_s],
            b_acc,
            n_head,
        )?;

        let rest = bh - seg;
        let value_host = attention_value(
            numeric,
            &to_host_f32(&q.narrow(0, seg, rest)?),
            &append_row(hist(&k_host)?, &to_host_f32(&k_new.narrow(1, seg, rest)?))?,
            &append_row(hist(&v_host)?, &to_host_f32(&v_new.narrow(1, seg, rest)?))?,
            &keep[b_acc * src_s..],
            b - b_acc,
            n_head,
        )?;

        let device = self.device.device();
        NativeTensor::cat(
            &[
                value_acc.cast(dtype).to_device(device),
                value_host.cast(dtype).to_device(device),
            ],
            0,
        )
    }
}

// =========================================================================
// Gather primitive
// =========================================================================

/// Copy `home[index]` into the leading `index.rows()` rows of `staging` and
/// wait until the rows are readable.
pub fn gather_rows(
    ctx: &OffloadContext,
    home: &TensorHandle,
    staging: &TensorHandle,
    index: GatherIndex,
) -> Result<()> {
    let dst = Region::span([0..index.rows(), 0..index.cols()]);
    general_copy(ctx, staging, Some(&dst), home, Some(&Region::gather(index)))?.wait()?;
    home.backend().synchronize()
}

// =========================================================================
// Helpers
// =========================================================================

/// `(b, s, n_head*head_dim)` to `(b*n_head, s, head_dim)`.
fn split_heads(x: &NativeTensor, n_head: usize) -> Result<NativeTensor> {
    let &[b, s, h] = x.dims() else {
        return Err(StratumError::ShapeMismatch(format!("expected (b, s, h), got {}", x.shape())));
    };
    let head_dim = h / n_head;
    x.reshape(&[b, s, n_head, head_dim])?
        .permute(&[0, 2, 1, 3])?
        .reshape(&[b * n_head, s, head_dim])
}

/// Inverse of [`split_heads`].
fn merge_heads(x: &NativeTensor, b: usize, n_head: usize) -> Result<NativeTensor> {
    let &[_, s, head_dim] = x.dims() else {
        return Err(StratumError::ShapeMismatch(format!("expected (b*h, s, d), got {}", x.shape())));
    };
    x.reshape(&[b, n_head, s, head_dim])?
        .permute(&[0, 2, 1, 3])?
        .reshape(&[b, s, n_head * head_dim])
}

/// Replace masked scores. `scores` is `(b*n_head, tgt, src)`, `keep` is `(b, tgt, src)`.
fn mask_scores(scores: &NativeTensor, keep: &[bool], b: usize, n_head: usize) -> Result<NativeTensor> {
    let &[bh, tgt, src] = scores.dims() else {
        return Err(StratumError::ShapeMismatch(format!("scores of {}", scores.shape())));
    };
    let plane = tgt * src;
    if bh != b * n_head || keep.len() != b * plane {
        return Err(StratumError::ShapeMismatch(format!(
            "mask of {} entries for scores {}",
            keep.len(),
            scores.shape()
        )));
    }
    let mut data = scores.to_f32_vec();
    if plane > 0 {
        for (row, chunk) in data.chunks_mut(plane).enumerate() {
            let bi = row / n_head;
            for (v, &k) in chunk.iter_mut().zip(&keep[bi * plane..(bi + 1) * plane]) {
                if !k {
                    *v = MASKED_SCORE;
                }
            }
        }
    }
    NativeTensor::from_f32_as(&data, scores.dims(), scores.dtype(), scores.device())
}

/// Softmax weights `(b*n_head, 1, s)` of `q` against keys `(s, b*n_head, head_dim)`.
fn attention_weights(
    numeric: &dyn NumericBackend,
    q: &NativeTensor,
    k: &NativeTensor,
    keep: &[bool],
    b: usize,
    n_head: usize,
) -> Result<NativeTensor> {
    let scores = numeric.bmm(q, &k.permute(&[1, 2, 0])?)?;
    numeric.softmax(&mask_scores(&scores, keep, b, n_head)?)
}

/// Attention output `(b*n_head, 1, head_dim)`.
fn attention_value(
    numeric: &dyn NumericBackend,
    q: &NativeTensor,
    k: &NativeTensor,
    v: &NativeTensor,
    keep: &[bool],
    b: usize,
    n_head: usize,
) -> Result<NativeTensor> {
    let probs = attention_weights(numeric, q, k, keep, b, n_head)?;
    numeric.bmm(&probs, &v.permute(&[1, 0, 2])?)
}

/// The first `len` cached rows as a native buffer.
fn cached_rows(ctx: &OffloadContext, cache: &TensorHandle, len: usize) -> Result<Option<NativeTensor>> {
    cached_range(ctx, cache, 0, len)
}

/// Cache rows `start..stop`, or `None` when the range is empty.
fn cached_range(
    ctx: &OffloadContext,
    cache: &TensorHandle,
    start: usize,
    stop: usize,
) -> Result<Option<NativeTensor>> {
    if stop <= start {
        return Ok(None);
    }
    let full = match cache.payload()? {
        Payload::Accelerator(t) | Payload::Host(t) => t,
        Payload::Encoded(_) => cache.materialize(ctx)?,
        other => {
            return Err(StratumError::UnsupportedTierCombination(format!(
                "attention reads {} directly from the {} tier",
                cache.name(),
                other.tier()
            )))
        }
    };
    full.narrow(0, start, stop - start).map(Some)
}

/// History rows followed by the new row, in the new row's dtype and device.
fn append_row(history: Option<NativeTensor>, new: &NativeTensor) -> Result<NativeTensor> {
    match history {
        None => Ok(new.clone()),
        Some(h) => NativeTensor::cat(&[h.cast(new.dtype()).to_device(new.device()), new.clone()], 0),
    }
}

fn to_host_f32(t: &NativeTensor) -> NativeTensor {
    t.cast(DType::F32).to_device(Device::Host)
}

/// Write `rows` into the leading rows of a workspace buffer and read them back.
fn stage_rows(buffer: &TensorHandle, rows: &NativeTensor) -> Result<NativeTensor> {
    let target = buffer.native()?;
    let len = rows.dims()[0];
    target.copy_region_from(Some(&Region::span([0..len])), &to_host_f32(rows), None)?;
    target.narrow(0, 0, len)
}

/// Native accelerator and host parts of a two-way split cache.
fn split_parts(cache: &TensorHandle, bh: usize) -> Result<(NativeTensor, NativeTensor)> {
    let unsupported = || {
        StratumError::UnsupportedTierCombination(format!(
            "split attention needs {} segmented into one accelerator and one host part",
            cache.name()
        ))
    };
    let Payload::Segmented(seg) = cache.payload()? else {
        return Err(unsupported());
    };
    if seg.axis != 1 || seg.bounds.last() != Some(&bh) {
        return Err(unsupported());
    }
    match seg.parts.as_slice() {
        [Some(acc), Some(host)] if acc.tier() == Tier::Accelerator && host.tier() == Tier::Host => {
            Ok((acc.native()?, host.native()?))
        }
        _ => Err(unsupported()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heads_round_trip() {
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let x = NativeTensor::from_f32(&data, [2, 3, 4], Device::Host).unwrap();
        let heads = split_heads(&x, 2).unwrap();
        assert_eq!(heads.dims(), &[4, 3, 2]);
        // batch 0, head 1, position 0 -> features 2..4 of row 0
        assert_eq!(heads.narrow(0, 1, 1).unwrap().to_f32_vec()[..2], [2.0, 3.0]);
        assert_eq!(merge_heads(&heads, 2, 2).unwrap().to_f32_vec(), data);
    }

    #[test]
    fn test_mask_scores() {
        let scores = NativeTensor::from_f32(&[1.0; 8], [4, 1, 2], Device::Host).unwrap();
        // batch 0 keeps both positions, batch 1 only the second
        let masked = mask_scores(&scores, &[true, true, false, true], 2, 2).unwrap();
        assert_eq!(
            masked.to_f32_vec(),
            vec![1.0, 1.0, 1.0, 1.0, MASKED_SCORE, 1.0, MASKED_SCORE, 1.0]
        );
        assert!(mask_scores(&scores, &[true; 3], 2, 2).is_err());
    }

    #[test]
    fn test_append_row_without_history() {
        let new = NativeTensor::from_f32(&[1.0, 2.0], [1, 1, 2], Device::Host).unwrap();
        assert!(append_row(None, &new).unwrap().same_storage(&new));
        let hist = NativeTensor::from_f32_as(&[0.0, 0.5], [1, 1, 2], DType::F16, Device::Host).unwrap();
        let both = append_row(Some(hist), &new).unwrap();
        assert_eq!(both.dtype(), DType::F32);
        assert_eq!(both.to_f32_vec(), vec![0.0, 0.5, 1.0, 2.0]);
    }
}
