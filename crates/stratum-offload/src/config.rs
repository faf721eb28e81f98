//! Configuration for the storage tiers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stratum_core::{DType, Result, StratumError};

/// Configuration for the disk tier and its copy workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Directory holding one `.npy`-layout file per disk tensor.
    pub root: PathBuf,

    /// Number of background copy threads.
    pub num_copy_threads: usize,

    /// Bound on queued copy tasks; submissions wait once it is reached.
    pub queue_capacity: usize,

    /// Size of each worker's pinned staging buffer. A single transfer
    /// touching the accelerator may not exceed it.
    pub relay_bytes: usize,

    /// Bytes the disk tier may hold; `None` means unbounded.
    pub capacity_bytes: Option<usize>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("stratum_offload"),
            num_copy_threads: 4,
            queue_capacity: 1024,
            relay_bytes: 64 << 20,
            capacity_bytes: None,
        }
    }
}

impl DiskConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Geometry of one batch's key or value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub prompt_len: usize,
    pub gen_len: usize,
    pub batch_size: usize,
    pub n_head: usize,
    pub hidden: usize,
    pub dtype: DType,
}

impl CacheSpec {
    pub fn head_dim(&self) -> usize {
        self.hidden / self.n_head
    }

    /// `(seq, batch*heads, head_dim)`; the last generated token never needs a slot.
    pub fn shape(&self) -> [usize; 3] {
        [
            self.prompt_len + self.gen_len - 1,
            self.batch_size * self.n_head,
            self.head_dim(),
        ]
    }
}

/// How a segmented backend divides its designated axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPolicy {
    /// Share of the axis per sub-backend, in percent.
    pub percents: Vec<f64>,
    /// Every segment except the remainder one is rounded down to a multiple of this.
    pub round_to: usize,
}

impl SegmentPolicy {
    pub fn new(percents: Vec<f64>, round_to: usize) -> Self {
        Self {
            percents,
            round_to: round_to.max(1),
        }
    }

    /// Segment lengths for an axis of `total` entries.
    ///
    /// The last segment with a non-zero share takes the remainder, so the
    /// lengths always sum to `total`.
    pub fn lengths(&self, total: usize) -> Result<Vec<usize>> {
        let absorber = self
            .percents
            .iter()
            .rposition(|&p| p > 0.0)
            .ok_or_else(|| StratumError::ShapeMismatch("segment policy has no non-zero share".into()))?;
        let round = self.round_to.max(1);
        let mut lengths = vec![0usize; self.percents.len()];
        let mut used = 0usize;
        for (i, &p) in self.percents.iter().enumerate() {
            if i == absorber || p <= 0.0 {
                continue;
            }
            let raw = (total as f64 * p / 100.0) as usize;
            lengths[i] = raw / round * round;
            used += lengths[i];
        }
        lengths[absorber] = total.checked_sub(used).ok_or_else(|| {
            StratumError::ShapeMismatch(format!("segment shares exceed an axis of {total}"))
        })?;
        Ok(lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths_exact_split() {
        let p = SegmentPolicy::new(vec![50.0, 30.0, 20.0], 1);
        assert_eq!(p.lengths(100).unwrap(), vec![50, 30, 20]);
    }

    #[test]
    fn test_lengths_round_to_heads() {
        let p = SegmentPolicy::new(vec![50.0, 50.0, 0.0], 12);
        // 96 * 0.5 = 48 (already a multiple of 12); the host segment absorbs the rest.
        assert_eq!(p.lengths(96).unwrap(), vec![48, 48, 0]);
        let p = SegmentPolicy::new(vec![30.0, 30.0, 40.0], 8);
        // 64 * 0.3 = 19 -> 16
        assert_eq!(p.lengths(64).unwrap(), vec![16, 16, 32]);
    }

    #[test]
    fn test_lengths_all_zero() {
        let p = SegmentPolicy::new(vec![0.0, 0.0], 1);
        assert!(p.lengths(10).is_err());
    }

    #[test]
    fn test_cache_spec_shape() {
        let spec = CacheSpec {
            prompt_len: 8,
            gen_len: 4,
            batch_size: 2,
            n_head: 4,
            hidden: 32,
            dtype: DType::F16,
        };
        assert_eq!(spec.shape(), [11, 8, 8]);
    }

    #[test]
    fn test_disk_config_defaults_from_partial_json() {
        let cfg: DiskConfig = serde_json::from_str(r#"{"num_copy_threads": 2}"#).unwrap();
        assert_eq!(cfg.num_copy_threads, 2);
        assert_eq!(cfg.queue_capacity, 1024);
    }
}
