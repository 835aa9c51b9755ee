//! Minimal NumPy `.npy` tensor container support.
//!
//! Voice presets and the type-embedding table ship as plain `.npy` files:
//! a 6-byte magic signature, a version byte pair selecting a 2-byte (v1) or
//! 4-byte (v2/v3) little-endian header length, an ASCII header dictionary
//! (`descr`, `fortran_order`, `shape`), then the raw little-endian payload.
//!
//! Only C-order float payloads are accepted: `<f4` natively, `<f8` downcast
//! to f32. Everything else is a data-format error, not a fallback.

use crate::error::{LyrebirdError, Result};
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// A shaped f32 tensor read from (or destined for) a `.npy` container.
///
/// Returned tensors are read-only snapshots; callers must not rely on
/// in-place mutation being visible across loads.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(LyrebirdError::DataFormat(format!(
                "shape {:?} implies {} elements but payload has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of scalar elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of dimension `axis`, or a data-format error if out of range.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.shape.get(axis).copied().ok_or_else(|| {
            LyrebirdError::DataFormat(format!(
                "axis {} out of range for shape {:?}",
                axis, self.shape
            ))
        })
    }
}

/// Read and parse one tensor file.
pub fn read_tensor(path: &Path) -> Result<TensorData> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            LyrebirdError::NotFound(format!("tensor file {} is missing", path.display()))
        }
        _ => LyrebirdError::Io(format!("failed reading tensor {}: {}", path.display(), e)),
    })?;
    parse(&bytes).map_err(|e| match e {
        LyrebirdError::DataFormat(msg) => {
            LyrebirdError::DataFormat(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Parse a `.npy` payload from memory.
pub fn parse(bytes: &[u8]) -> Result<TensorData> {
    if bytes.len() < 10 {
        return Err(LyrebirdError::DataFormat("container too small".to_string()));
    }
    if &bytes[0..6] != MAGIC {
        return Err(LyrebirdError::DataFormat(
            "invalid magic signature".to_string(),
        ));
    }

    let major = bytes[6];
    let (header_len, header_offset) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(LyrebirdError::DataFormat(
                    "truncated v2 header length".to_string(),
                ));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (len, 12)
        }
        other => {
            return Err(LyrebirdError::DataFormat(format!(
                "unsupported container version {other}"
            )));
        }
    };

    let header_end = header_offset + header_len;
    if bytes.len() < header_end {
        return Err(LyrebirdError::DataFormat(
            "header length exceeds payload size".to_string(),
        ));
    }
    let header = std::str::from_utf8(&bytes[header_offset..header_end])
        .map_err(|_| LyrebirdError::DataFormat("header is not valid ascii".to_string()))?;

    let descr = header_field(header, "descr")
        .ok_or_else(|| LyrebirdError::DataFormat("header missing 'descr'".to_string()))?;
    let fortran = header_field(header, "fortran_order")
        .ok_or_else(|| LyrebirdError::DataFormat("header missing 'fortran_order'".to_string()))?;
    let shape = header_shape(header)
        .ok_or_else(|| LyrebirdError::DataFormat("header missing 'shape'".to_string()))?;

    if fortran != "False" {
        return Err(LyrebirdError::DataFormat(
            "fortran-order payloads are not supported".to_string(),
        ));
    }

    let item_count: usize = shape.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d).ok_or_else(|| {
            LyrebirdError::DataFormat(format!("shape {shape:?} overflows element count"))
        })
    })?;

    let payload = &bytes[header_end..];
    let data = match descr {
        "<f4" => {
            if payload.len() != item_count * 4 {
                return Err(LyrebirdError::DataFormat(format!(
                    "expected {} payload bytes, got {}",
                    item_count * 4,
                    payload.len()
                )));
            }
            payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
        // 64-bit payloads are downcast on load; the pipeline is f32 throughout.
        "<f8" => {
            if payload.len() != item_count * 8 {
                return Err(LyrebirdError::DataFormat(format!(
                    "expected {} payload bytes, got {}",
                    item_count * 8,
                    payload.len()
                )));
            }
            payload
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect()
        }
        other => {
            return Err(LyrebirdError::DataFormat(format!(
                "unsupported element type '{other}', expected '<f4' or '<f8'"
            )));
        }
    };

    TensorData::new(shape, data)
}

/// Serialize a tensor as a `<f4` container (v1 header, v2 if the header
/// dictionary overflows the v1 length field).
pub fn to_bytes(tensor: &TensorData) -> Vec<u8> {
    let dict = header_dict(tensor.shape());
    let v1_capable = dict.len() + 1 + 64 <= u16::MAX as usize;
    let prefix_len = if v1_capable { 10 } else { 12 };

    // Pad with spaces so the payload starts 64-byte aligned, newline last.
    let unpadded = prefix_len + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(prefix_len + header_len + tensor.len() * 4);
    out.extend_from_slice(MAGIC);
    if v1_capable {
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header_len as u16).to_le_bytes());
    } else {
        out.extend_from_slice(&[2, 0]);
        out.extend_from_slice(&(header_len as u32).to_le_bytes());
    }
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    for value in tensor.data() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Write one tensor file.
pub fn write_tensor(path: &Path, tensor: &TensorData) -> Result<()> {
    std::fs::write(path, to_bytes(tensor)).map_err(|e| {
        LyrebirdError::Io(format!("failed writing tensor {}: {}", path.display(), e))
    })
}

fn header_dict(shape: &[usize]) -> String {
    let dims = match shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", shape[0]),
        _ => format!(
            "({})",
            shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {dims}, }}")
}

fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();

    if let Some(stripped) = rest.strip_prefix('\'') {
        let end = stripped.find('\'')?;
        return Some(&stripped[..end]);
    }
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(&stripped[..end]);
    }

    let end = rest.find([',', '}']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn header_shape(header: &str) -> Option<Vec<usize>> {
    let marker = "'shape':";
    let start = header.find(marker)? + marker.len();
    let rest = header[start..].trim_start();
    let tuple_start = rest.find('(')?;
    let tuple_rest = &rest[tuple_start + 1..];
    let tuple_end = tuple_rest.find(')')?;

    let mut shape = Vec::new();
    for part in tuple_rest[..tuple_end].split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        shape.push(trimmed.parse::<usize>().ok()?);
    }
    Some(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tensor() -> TensorData {
        TensorData::new(vec![2, 3], vec![0.0, 1.5, -2.25, 3.0, f32::MIN, f32::MAX]).unwrap()
    }

    #[test]
    fn v1_round_trip_is_exact() {
        let tensor = sample_tensor();
        let bytes = to_bytes(&tensor);
        assert_eq!(&bytes[0..6], MAGIC);
        assert_eq!(bytes[6], 1);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, tensor);
    }

    #[test]
    fn v2_header_round_trip_is_exact() {
        let tensor = sample_tensor();
        let dict = header_dict(tensor.shape());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[2, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u32).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        for value in tensor.data() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, tensor);
    }

    #[test]
    fn f8_payload_is_downcast() {
        let values = [0.5f64, -1.25, 1e-3];
        let dict = "{'descr': '<f8', 'fortran_order': False, 'shape': (3,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.shape(), &[3]);
        assert_eq!(parsed.data(), &[0.5f32, -1.25, 1e-3]);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.npy");
        let tensor = TensorData::new(vec![1, 2, 4], (0..8).map(|i| i as f32 * 0.5).collect())
            .unwrap();
        write_tensor(&path, &tensor).unwrap();
        assert_eq!(read_tensor(&path).unwrap(), tensor);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = parse(b"\x93NUMPZ\x01\x00\x00\x00").unwrap_err();
        assert!(matches!(err, LyrebirdError::DataFormat(_)));
    }

    #[test]
    fn rejects_unsupported_dtype() {
        let dict = "{'descr': '<i8', 'fortran_order': False, 'shape': (1,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(&1i64.to_le_bytes());
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported element type"));
    }

    #[test]
    fn rejects_truncated_payload() {
        let tensor = sample_tensor();
        let mut bytes = to_bytes(&tensor);
        bytes.truncate(bytes.len() - 4);
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, LyrebirdError::DataFormat(_)));
    }

    #[test]
    fn rejects_fortran_order() {
        let dict = "{'descr': '<f4', 'fortran_order': True, 'shape': (1,), }";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.push(b'\n');
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn shape_length_mismatch_is_rejected() {
        assert!(TensorData::new(vec![2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = read_tensor(Path::new("/nonexistent/none.npy")).unwrap_err();
        assert!(matches!(err, LyrebirdError::NotFound(_)));
    }
}
