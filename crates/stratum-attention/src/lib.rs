//! # stratum-attention
//!
//! Transformer stages that compute over tiered tensors.
//!
//! Provides:
//! - `AttentionEngine`: causal prefill and dense, sparse or split decode
//!   over a KV cache on any supported tier, with speculative prefetch
//! - Feed-forward, embedding and output stages on a `ComputeDevice`
//! - `NumericBackend` and `AttentionPlanner`, the capabilities the stages
//!   consume, plus `CpuKernels` as the reference numeric backend
//! - `OffloadPolicy` / `ModelShape` configuration

pub mod attention;
pub mod config;
pub mod device;
pub mod embed;
pub mod kernels;
pub mod mlp;
pub mod numeric;
pub mod planner;
pub mod workspace;

pub use attention::{
    gather_rows, AttentionEngine, DecodeOutput, DecodePath, DecodeRequest, PrefillOutput,
    Speculation,
};
pub use config::{ModelShape, OffloadPolicy};
pub use device::{AttentionWeights, ComputeDevice, MlpWeights};
pub use embed::{positions_from_mask, EmbeddingWeights, OutputWeights};
pub use kernels::CpuKernels;
pub use numeric::NumericBackend;
pub use planner::{AttentionPlanner, NoPlanning};
pub use workspace::AttentionWorkspace;
