//! Hooks for attention planning: weight skewing, partial-weight index
//! generation and speculative prefetch of cache positions.
//!
//! Every hook has a pass-through default, so a planner only overrides the
//! stages it cares about.

use stratum_core::{NativeTensor, Result};

pub trait AttentionPlanner: Send + Sync {
    /// Rewrite the normalized hidden states before the query/key projections.
    fn reform_hidden_states(&self, hidden: &NativeTensor) -> Result<NativeTensor> {
        Ok(hidden.clone())
    }

    /// Transform the query/key projection weights. Called once, during warmup.
    fn skew(
        &self,
        _q: &NativeTensor,
        _k: &NativeTensor,
        w_q: &NativeTensor,
        w_k: &NativeTensor,
        _n_head: usize,
        _head_dim: usize,
    ) -> Result<(NativeTensor, NativeTensor)> {
        Ok((w_q.clone(), w_k.clone()))
    }

    /// Column index of the partial query projection, from prefill queries.
    fn partial_weight_index(
        &self,
        _q: &NativeTensor,
        _n_head: usize,
        _head_dim: usize,
        _ratio: f32,
    ) -> Result<Option<NativeTensor>> {
        Ok(None)
    }

    /// Predict the cache positions the next decode step will need.
    ///
    /// Runs concurrently with the decode projections; the result is only
    /// returned to the caller.
    fn speculate(
        &self,
        _hidden: &NativeTensor,
        _partial_w_q: &NativeTensor,
        _partial_k_cache: &NativeTensor,
        _n_head: usize,
        _alpha: f32,
        _max_num_kv: usize,
    ) -> Result<Option<NativeTensor>> {
        Ok(None)
    }
}

/// Leaves weights and hidden states untouched and never speculates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlanning;

impl AttentionPlanner for NoPlanning {}
