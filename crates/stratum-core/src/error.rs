use crate::DType;

/// Errors raised by tiered storage, the copy engine and the compute stages.
#[derive(Debug, thiserror::Error)]
pub enum StratumError {
    /// A backend could not satisfy an allocation request.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Regions, shapes or segment lengths disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("unsupported dtype {0} for this operation")]
    UnsupportedDType(DType),

    /// A tensor sits on a different device or tier than the operation requires.
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    /// A handle was used after `delete` released its payload.
    #[error("use after delete: {0}")]
    UseAfterDelete(String),

    /// A copy or attention path was asked to combine tiers it cannot serve.
    #[error("unsupported tier combination: {0}")]
    UnsupportedTierCombination(String),

    /// Background copy tasks failed since the last synchronize.
    #[error("{count} background copy task(s) failed; first: {first}")]
    WorkerTaskFailure { count: usize, first: String },

    /// The disk copy queue was shut down before the submission.
    #[error("copy queue is closed")]
    QueueClosed,

    #[error("format error: {0}")]
    Format(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
