use std::fmt;

use stratum_core::{Result, StratumError};

/// Where a `TensorHandle` lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Accelerator,
    Host,
    Disk,
    /// Split along one axis across several backends.
    Segmented,
    /// Compressed payload plus scales.
    Encoded,
}

impl Tier {
    /// Parse a tier name as used in configuration files.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" | "accelerator" => Ok(Tier::Accelerator),
            "cpu" | "host" => Ok(Tier::Host),
            "disk" => Ok(Tier::Disk),
            "mixed" | "segmented" => Ok(Tier::Segmented),
            "compressed" | "encoded" => Ok(Tier::Encoded),
            other => Err(StratumError::Format(format!("unknown tier '{other}'"))),
        }
    }

    /// Whether handles on this tier hold a native buffer compute can read.
    pub fn is_native(&self) -> bool {
        matches!(self, Tier::Accelerator | Tier::Host)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Accelerator => write!(f, "accelerator"),
            Tier::Host => write!(f, "host"),
            Tier::Disk => write!(f, "disk"),
            Tier::Segmented => write!(f, "segmented"),
            Tier::Encoded => write!(f, "encoded"),
        }
    }
}
