//! Binary layout of engine files:
//!
//! ```text
//! magic (8 bytes) | header length (u64 LE) | JSON header | payload
//! ```

use std::{fs, path::Path};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StrokeSegError, StrokeSegResult};

pub const MAGIC_LEN: usize = 8;

/// Serialises `header` and appends `payload`.
pub fn encode<H: Serialize>(
    magic: &[u8; MAGIC_LEN],
    header: &H,
    payload: &[u8],
) -> StrokeSegResult<Vec<u8>> {
    let header = serde_json::to_vec(header)
        .map_err(|e| StrokeSegError::serialization("artifact header", e))?;

    let mut bytes = Vec::with_capacity(MAGIC_LEN + 8 + header.len() + payload.len());
    bytes.extend_from_slice(magic);
    bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Splits `bytes` into its header and payload.
///
/// `path` only labels errors.
pub fn decode<H: DeserializeOwned>(
    magic: &[u8; MAGIC_LEN],
    bytes: &[u8],
    path: &Path,
) -> StrokeSegResult<(H, Vec<u8>)> {
    let malformed = |reason: String| StrokeSegError::ArtifactFormat {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < MAGIC_LEN + 8 {
        return Err(malformed(format!("file is only {} bytes", bytes.len())));
    }
    let (found, rest) = bytes.split_at(MAGIC_LEN);
    if found != magic {
        return Err(malformed(format!(
            "bad magic {:?}, expected {:?}",
            String::from_utf8_lossy(found),
            String::from_utf8_lossy(magic)
        )));
    }

    let (len_bytes, rest) = rest.split_at(8);
    let mut len = [0u8; 8];
    len.copy_from_slice(len_bytes);
    let header_len = usize::try_from(u64::from_le_bytes(len))
        .ok()
        .filter(|&n| n <= rest.len())
        .ok_or_else(|| malformed("header length exceeds file size".to_owned()))?;

    let (header, payload) = rest.split_at(header_len);
    let header = serde_json::from_slice(header)
        .map_err(|e| malformed(format!("invalid header: {e}")))?;
    Ok((header, payload.to_vec()))
}

/// Reads a file and decodes it.
pub fn read<H: DeserializeOwned>(
    magic: &[u8; MAGIC_LEN],
    path: &Path,
) -> StrokeSegResult<(H, Vec<u8>)> {
    let bytes = fs::read(path).map_err(|e| StrokeSegError::io(path, e))?;
    decode(magic, &bytes, path)
}

pub fn f32_to_le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn u16_to_le_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn u16_from_le_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const MAGIC: &[u8; MAGIC_LEN] = b"TESTMAG1";

    #[test]
    fn rejects_wrong_magic_and_truncation() {
        let bytes = encode(MAGIC, &vec![1u32, 2, 3], &[9, 9]).unwrap();
        let path = PathBuf::from("mem");

        let (header, payload): (Vec<u32>, _) = decode(MAGIC, &bytes, &path).unwrap();
        assert_eq!(header, vec![1, 2, 3]);
        assert_eq!(payload, vec![9, 9]);

        assert!(matches!(
            decode::<Vec<u32>>(b"OTHERMAG", &bytes, &path),
            Err(StrokeSegError::ArtifactFormat { .. })
        ));
        assert!(matches!(
            decode::<Vec<u32>>(MAGIC, &bytes[..MAGIC_LEN + 10], &path),
            Err(StrokeSegError::ArtifactFormat { .. })
        ));
    }

    #[test]
    fn little_endian_helpers() {
        let values = [1.5f32, -0.0, f32::MIN_POSITIVE];
        assert_eq!(f32_from_le_bytes(&f32_to_le_bytes(&values)), values);
        assert_eq!(f32_to_le_bytes(&[1.0])[..], [0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(u16_from_le_bytes(&u16_to_le_bytes(&[0x3C00, 7])), [0x3C00, 7]);
    }
}
