use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, StratumError};

/// Element types a tiered tensor can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer (token ids, gather indices)
    I64,
    /// 8-bit unsigned integer (encoded payloads)
    U8,
    /// One byte per element, 0 or 1 (attention masks)
    Bool,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I32 | DType::I64 | DType::U8)
    }

    /// The `.npy` type descriptor for this dtype.
    pub fn npy_descr(&self) -> &'static str {
        match self {
            DType::F16 => "<f2",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::U8 => "|u1",
            DType::Bool => "|b1",
        }
    }

    /// Parse a `.npy` type descriptor.
    pub fn from_npy_descr(descr: &str) -> Result<Self> {
        match descr {
            "<f2" => Ok(DType::F16),
            "<f4" => Ok(DType::F32),
            "<f8" => Ok(DType::F64),
            "<i4" => Ok(DType::I32),
            "<i8" => Ok(DType::I64),
            "|u1" | "<u1" => Ok(DType::U8),
            "|b1" => Ok(DType::Bool),
            other => Err(StratumError::Format(format!(
                "unsupported npy descr '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
            DType::U8 => write!(f, "u8"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::F16.element_size(), 2);
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::I64.element_size(), 8);
        assert_eq!(DType::Bool.element_size(), 1);
        assert_eq!(DType::F16.storage_bytes(10), 20);
    }

    #[test]
    fn test_npy_descr_roundtrip() {
        for dt in [
            DType::F16,
            DType::F32,
            DType::F64,
            DType::I32,
            DType::I64,
            DType::U8,
            DType::Bool,
        ] {
            assert_eq!(DType::from_npy_descr(dt.npy_descr()).unwrap(), dt);
        }
        assert!(DType::from_npy_descr(">f4").is_err());
    }

    #[test]
    fn test_classification() {
        assert!(DType::F16.is_float());
        assert!(!DType::I64.is_float());
        assert!(DType::U8.is_integer());
        assert!(!DType::Bool.is_integer());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::F16), "f16");
        assert_eq!(format!("{}", DType::Bool), "bool");
    }
}
