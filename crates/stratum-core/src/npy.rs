//! `.npy` v1.0 layout for disk-tier files.
//!
//! A disk tensor is a header (magic, version, little-endian header length and
//! a Python-literal dict) padded to a 64-byte boundary, followed by the raw
//! row-major payload. Keeping the payload aligned lets workers map it directly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::{DType, Device, NativeTensor, Result, Shape, StratumError};

pub const MAGIC: &[u8; 6] = b"\x93NUMPY";
const ALIGN: usize = 64;

/// Parsed `.npy` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: DType,
    pub shape: Shape,
    /// Byte offset of the payload from the start of the file.
    pub data_offset: usize,
}

impl NpyHeader {
    pub fn payload_bytes(&self) -> usize {
        self.dtype.storage_bytes(self.shape.numel())
    }
}

/// Serialize a v1.0 header for `dtype` and `shape`.
pub fn encode_header(dtype: DType, shape: &Shape) -> Vec<u8> {
    let dims = match shape.dims() {
        [] => "()".to_string(),
        [d] => format!("({d},)"),
        ds => format!(
            "({})",
            ds.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {dims}, }}",
        dtype.npy_descr()
    );
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let pad = (ALIGN - unpadded % ALIGN) % ALIGN;
    dict.extend(std::iter::repeat(' ').take(pad));
    dict.push('\n');

    let mut out = Vec::with_capacity(unpadded + pad);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out
}

/// Parse the header at the start of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<NpyHeader> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(StratumError::Format("missing npy magic".into()));
    }
    let (len, start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(StratumError::Format("truncated npy header".into()));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(StratumError::Format(format!("unsupported npy version {v}"))),
    };
    let end = start + len;
    let dict = bytes
        .get(start..end)
        .ok_or_else(|| StratumError::Format("truncated npy header".into()))?;
    let dict = std::str::from_utf8(dict)
        .map_err(|e| StratumError::Format(format!("npy header is not utf-8: {e}")))?;

    let descr = quoted_value(dict, "descr")?;
    if field(dict, "fortran_order")?.starts_with("True") {
        return Err(StratumError::Format("fortran-ordered npy files are not supported".into()));
    }
    let shape_src = field(dict, "shape")?;
    let close = shape_src
        .find(')')
        .ok_or_else(|| StratumError::Format("unterminated npy shape".into()))?;
    let dims = shape_src[..close]
        .trim_start_matches('(')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| StratumError::Format(format!("bad npy dimension '{s}'")))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NpyHeader {
        dtype: DType::from_npy_descr(descr)?,
        shape: Shape::from(dims),
        data_offset: end,
    })
}

fn field<'a>(dict: &'a str, key: &str) -> Result<&'a str> {
    let pat = format!("'{key}':");
    let at = dict
        .find(&pat)
        .ok_or_else(|| StratumError::Format(format!("npy header lacks '{key}'")))?;
    Ok(dict[at + pat.len()..].trim_start())
}

fn quoted_value<'a>(dict: &'a str, key: &str) -> Result<&'a str> {
    let rest = field(dict, key)?;
    let rest = rest
        .strip_prefix('\'')
        .ok_or_else(|| StratumError::Format(format!("npy '{key}' is not a string")))?;
    let close = rest
        .find('\'')
        .ok_or_else(|| StratumError::Format(format!("unterminated npy '{key}'")))?;
    Ok(&rest[..close])
}

/// Create a zero-filled file of the given dtype and shape; returns its header.
pub fn create_file(path: &Path, dtype: DType, shape: &Shape) -> Result<NpyHeader> {
    let header = encode_header(dtype, shape);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&header)?;
    let payload = dtype.storage_bytes(shape.numel());
    file.set_len((header.len() + payload) as u64)?;
    Ok(NpyHeader {
        dtype,
        shape: shape.clone(),
        data_offset: header.len(),
    })
}

/// Read only the header of a file.
pub fn read_header(path: &Path) -> Result<NpyHeader> {
    let mut file = File::open(path)?;
    let mut prefix = vec![0u8; 12];
    file.read_exact(&mut prefix)?;
    if &prefix[..6] != MAGIC {
        return Err(StratumError::Format("missing npy magic".into()));
    }
    let len = match prefix[6] {
        1 => u16::from_le_bytes([prefix[8], prefix[9]]) as usize + 10,
        _ => u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as usize + 12,
    };
    if len < 12 {
        return Err(StratumError::Format("truncated npy header".into()));
    }
    let mut head = prefix;
    head.resize(len, 0);
    file.read_exact(&mut head[12..])?;
    decode_header(&head)
}

/// Write a host tensor as a complete file.
pub fn write_file(path: &Path, tensor: &NativeTensor) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&encode_header(tensor.dtype(), tensor.shape()))?;
    tensor.with_bytes(|b| file.write_all(b))?;
    Ok(())
}

/// Read a complete file into a host tensor.
pub fn read_file(path: &Path) -> Result<NativeTensor> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let header = decode_header(&bytes)?;
    let payload = bytes
        .get(header.data_offset..header.data_offset + header.payload_bytes())
        .ok_or_else(|| StratumError::Format(format!("{} is truncated", path.display())))?
        .to_vec();
    NativeTensor::from_bytes(payload, header.shape, header.dtype, Device::Host)
}
