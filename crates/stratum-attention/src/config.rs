//! Offload policy and model geometry.

use std::path::Path;

use serde::{Deserialize, Serialize};
use stratum_core::{DType, Result, StratumError};
use stratum_offload::{CacheSpec, CodecConfig, SegmentPolicy};

/// Where the KV cache lives and how attention is computed over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadPolicy {
    /// Sequences per accelerator batch.
    pub gpu_batch_size: usize,
    pub num_gpu_batches: usize,

    /// Cache split across accelerator, host and disk, in percent.
    pub cache_gpu_percent: f64,
    pub cache_cpu_percent: f64,
    pub cache_disk_percent: f64,

    /// Fraction of the history attended to during decode; `>= 1.0` is dense.
    pub attn_sparsity: f32,

    pub compress_cache: bool,
    pub comp_cache_config: CodecConfig,

    /// Attention and MLP run as separate layers, so one workspace suffices.
    pub sep_layer: bool,

    /// Column ratio kept by the partial query projection used for speculation.
    pub partial_weight_ratio: Option<f32>,
    /// Score threshold handed to the speculation routine.
    pub alpha: f32,
    /// Upper bound on speculated positions.
    pub max_num_kv: usize,

    pub temperature: f32,
    pub do_sample: bool,
}

impl Default for OffloadPolicy {
    fn default() -> Self {
        Self {
            gpu_batch_size: 1,
            num_gpu_batches: 1,
            cache_gpu_percent: 100.0,
            cache_cpu_percent: 0.0,
            cache_disk_percent: 0.0,
            attn_sparsity: 1.0,
            compress_cache: false,
            comp_cache_config: CodecConfig {
                group_dim: 2,
                ..CodecConfig::default()
            },
            sep_layer: true,
            partial_weight_ratio: None,
            alpha: 4.0,
            max_num_kv: 400,
            temperature: 1.0,
            do_sample: false,
        }
    }
}

impl OffloadPolicy {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let policy: Self = serde_json::from_str(&text)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gpu_batch_size == 0 || self.num_gpu_batches == 0 {
            return Err(StratumError::ShapeMismatch("batch sizes must be positive".into()));
        }
        let shares = [
            self.cache_gpu_percent,
            self.cache_cpu_percent,
            self.cache_disk_percent,
        ];
        if shares.iter().any(|p| !(0.0..=100.0).contains(p)) {
            return Err(StratumError::ShapeMismatch(format!(
                "cache percentages {shares:?} must lie in [0, 100]"
            )));
        }
        let total: f64 = shares.iter().sum();
        if (total - 100.0).abs() > 1e-6 {
            return Err(StratumError::ShapeMismatch(format!(
                "cache percentages sum to {total}, expected 100"
            )));
        }
        if self.attn_sparsity.is_nan() || self.attn_sparsity <= 0.0 {
            return Err(StratumError::ShapeMismatch(format!(
                "attention sparsity {} must be positive",
                self.attn_sparsity
            )));
        }
        if let Some(ratio) = self.partial_weight_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(StratumError::ShapeMismatch(format!(
                    "partial weight ratio {ratio} must lie in (0, 1]"
                )));
            }
        }
        if self.temperature < 0.0 {
            return Err(StratumError::ShapeMismatch(format!(
                "negative temperature {}",
                self.temperature
            )));
        }
        Ok(())
    }

    pub fn is_dense(&self) -> bool {
        self.attn_sparsity >= 1.0
    }

    /// Split of the cache's batch*heads axis, rounded to whole heads.
    pub fn segment_policy(&self, n_head: usize) -> SegmentPolicy {
        SegmentPolicy::new(
            vec![
                self.cache_gpu_percent,
                self.cache_cpu_percent,
                self.cache_disk_percent,
            ],
            n_head,
        )
    }

    /// Cache geometry for one accelerator batch.
    pub fn cache_spec(&self, model: &ModelShape, prompt_len: usize, gen_len: usize) -> CacheSpec {
        CacheSpec {
            prompt_len,
            gen_len,
            batch_size: self.gpu_batch_size,
            n_head: model.n_head,
            hidden: model.hidden,
            dtype: DType::F16,
        }
    }
}

/// Transformer geometry shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelShape {
    pub n_head: usize,
    pub hidden: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub pad_token_id: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

impl ModelShape {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let shape: Self = serde_json::from_str(&text)?;
        shape.validate()?;
        Ok(shape)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden / self.n_head
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.hidden % self.n_head != 0 {
            return Err(StratumError::ShapeMismatch(format!(
                "hidden size {} is not divisible into {} heads",
                self.hidden, self.n_head
            )));
        }
        if self.pad_token_id >= self.vocab_size {
            return Err(StratumError::ShapeMismatch(format!(
                "pad token {} outside a vocabulary of {}",
                self.pad_token_id, self.vocab_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelShape {
        ModelShape {
            n_head: 4,
            hidden: 32,
            vocab_size: 50,
            max_seq_len: 16,
            pad_token_id: 1,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn test_default_policy_is_valid() {
        let p = OffloadPolicy::default();
        p.validate().unwrap();
        assert!(p.is_dense());
    }

    #[test]
    fn test_percentages_must_sum_to_100() {
        let p = OffloadPolicy {
            cache_gpu_percent: 50.0,
            cache_cpu_percent: 30.0,
            cache_disk_percent: 10.0,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_policy_from_json() {
        let json = r#"{ "gpu_batch_size": 4, "cache_gpu_percent": 50,
                        "cache_cpu_percent": 50, "attn_sparsity": 0.5 }"#;
        let p: OffloadPolicy = serde_json::from_str(json).unwrap();
        p.validate().unwrap();
        assert_eq!(p.gpu_batch_size, 4);
        assert!(!p.is_dense());
        assert_eq!(p.max_num_kv, 400);
    }

    #[test]
    fn test_cache_spec_and_segments() {
        let p = OffloadPolicy {
            gpu_batch_size: 3,
            cache_gpu_percent: 50.0,
            cache_cpu_percent: 50.0,
            ..Default::default()
        };
        let m = model();
        let spec = p.cache_spec(&m, 8, 4);
        assert_eq!(spec.shape(), [11, 12, 8]);
        // 12 * 0.5 = 6 -> 4 whole heads; host takes the remaining 8.
        assert_eq!(p.segment_policy(m.n_head).lengths(12).unwrap(), vec![4, 8, 0]);
    }

    #[test]
    fn test_model_shape_validation() {
        model().validate().unwrap();
        let bad = ModelShape { hidden: 30, ..model() };
        assert!(bad.validate().is_err());
        let json = r#"{ "n_head": 2, "hidden": 8, "vocab_size": 10, "max_seq_len": 4, "pad_token_id": 0 }"#;
        let m: ModelShape = serde_json::from_str(json).unwrap();
        assert_eq!(m.layer_norm_eps, 1e-5);
        assert_eq!(m.head_dim(), 4);
    }
}
