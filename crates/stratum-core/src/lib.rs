//! # stratum-core
//!
//! Foundation types for tiered tensor storage.
//!
//! Provides:
//! - Element types and device tags
//! - `Region`: interval and gather selections, flattened to byte runs
//! - `NativeTensor`: a dense buffer compute can read directly
//! - The `.npy` layout used by disk-tier files
//! - `StratumError`, shared by every stratum crate

pub mod dtype;
pub mod device;
pub mod shape;
pub mod region;
pub mod native;
pub mod npy;
pub mod error;

pub use dtype::DType;
pub use device::Device;
pub use shape::Shape;
pub use region::{GatherIndex, Region};
pub use native::NativeTensor;
pub use error::StratumError;

pub type Result<T> = std::result::Result<T, StratumError>;
