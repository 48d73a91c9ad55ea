//! Header-less on-disk tensor layout.
//!
//! A tensor occupies exactly `numel * dtype.size_in_bytes()` bytes starting at
//! its bound offset, elements in row-major order and little-endian byte order.
//! Several tensors may share one file as long as their regions are disjoint;
//! the file carries no metadata, so the reader must already know the shape and
//! dtype.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::errors::{OffloadError, Result};

/// Number of bytes a tensor of `shape` and `dtype` occupies on file.
pub fn byte_len(shape: &[usize], dtype: DType) -> Result<u64> {
    ensure_supported(dtype)?;
    shape
        .iter()
        .try_fold(dtype.size_in_bytes() as u64, |acc, &dim| {
            acc.checked_mul(dim as u64)
        })
        .ok_or_else(|| {
            OffloadError::InvalidBinding(format!(
                "tensor of shape {shape:?} and dtype {dtype:?} overflows the addressable file size"
            ))
        })
}

pub fn ensure_supported(dtype: DType) -> Result<()> {
    match dtype {
        DType::U8
        | DType::U32
        | DType::I64
        | DType::BF16
        | DType::F16
        | DType::F32
        | DType::F64 => Ok(()),
        #[allow(unreachable_patterns)]
        other => Err(OffloadError::UnsupportedDType(other)),
    }
}

/// Serialises a tensor into its flat little-endian byte image.
pub fn encode(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match flat.dtype() {
        DType::U8 => flat.to_vec1::<u8>()?,
        DType::U32 => to_le(flat.to_vec1::<u32>()?, u32::to_le_bytes),
        DType::I64 => to_le(flat.to_vec1::<i64>()?, i64::to_le_bytes),
        DType::BF16 => to_le(flat.to_vec1::<bf16>()?, bf16::to_le_bytes),
        DType::F16 => to_le(flat.to_vec1::<f16>()?, f16::to_le_bytes),
        DType::F32 => to_le(flat.to_vec1::<f32>()?, f32::to_le_bytes),
        DType::F64 => to_le(flat.to_vec1::<f64>()?, f64::to_le_bytes),
        #[allow(unreachable_patterns)]
        other => return Err(OffloadError::UnsupportedDType(other)),
    };
    Ok(bytes)
}

/// Rebuilds a tensor from a byte image produced by [`encode`].
pub fn decode(bytes: &[u8], dtype: DType, shape: &[usize], device: &Device) -> Result<Tensor> {
    let expected = byte_len(shape, dtype)?;
    if bytes.len() as u64 != expected {
        return Err(OffloadError::shape_mismatch(format!(
            "expected {expected} bytes for shape {shape:?} {dtype:?}, got {}",
            bytes.len()
        )));
    }
    let tensor = match dtype {
        DType::U8 => Tensor::from_vec(bytes.to_vec(), shape, device)?,
        DType::U32 => Tensor::from_vec(from_le(bytes, u32::from_le_bytes), shape, device)?,
        DType::I64 => Tensor::from_vec(from_le(bytes, i64::from_le_bytes), shape, device)?,
        DType::BF16 => Tensor::from_vec(from_le(bytes, bf16::from_le_bytes), shape, device)?,
        DType::F16 => Tensor::from_vec(from_le(bytes, f16::from_le_bytes), shape, device)?,
        DType::F32 => Tensor::from_vec(from_le(bytes, f32::from_le_bytes), shape, device)?,
        DType::F64 => Tensor::from_vec(from_le(bytes, f64::from_le_bytes), shape, device)?,
        #[allow(unreachable_patterns)]
        other => return Err(OffloadError::UnsupportedDType(other)),
    };
    Ok(tensor)
}

/// Writes `bytes` at `offset`, creating the file if needed. Bytes outside the
/// region are left untouched.
pub fn write_region(path: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|err| OffloadError::io(path, err))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| OffloadError::io(path, err))?;
    file.write_all(bytes)
        .map_err(|err| OffloadError::io(path, err))?;
    log::debug!(
        "offload write path={} offset={} bytes={}",
        path.display(),
        offset,
        bytes.len()
    );
    Ok(())
}

/// Reads exactly `len` bytes starting at `offset`.
pub fn read_region(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| OffloadError::io(path, err))?;
    let available = file
        .metadata()
        .map_err(|err| OffloadError::io(path, err))?
        .len();
    let end = offset.checked_add(len).ok_or_else(|| {
        OffloadError::InvalidBinding(format!("region {offset}+{len} overflows u64"))
    })?;
    if available < end {
        return Err(OffloadError::shape_mismatch(format!(
            "file {} holds {available} bytes, region [{offset}..{end}) is out of bounds",
            path.display()
        )));
    }
    let len = usize::try_from(len).map_err(|_| {
        OffloadError::InvalidBinding(format!("region length {len} exceeds the address space"))
    })?;
    let mut bytes = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| OffloadError::io(path, err))?;
    file.read_exact(&mut bytes)
        .map_err(|err| OffloadError::io(path, err))?;
    log::debug!(
        "offload read path={} offset={} bytes={}",
        path.display(),
        offset,
        len
    );
    Ok(bytes)
}

fn to_le<T, const N: usize>(values: Vec<T>, convert: fn(T) -> [u8; N]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * N);
    for value in values {
        out.extend_from_slice(&convert(value));
    }
    out
}

fn from_le<T, const N: usize>(bytes: &[u8], convert: fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            convert(raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn byte_len_matches_numel_times_element_size() {
        assert_eq!(byte_len(&[4, 4], DType::F32).unwrap(), 64);
        assert_eq!(byte_len(&[3, 5], DType::BF16).unwrap(), 30);
        assert_eq!(byte_len(&[], DType::F64).unwrap(), 8);
        assert!(byte_len(&[usize::MAX, usize::MAX], DType::F32).is_err());
    }

    #[test]
    fn encoding_is_little_endian_and_header_less() {
        let tensor = Tensor::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let bytes = encode(&tensor).unwrap();
        let mut expected = 1.0f32.to_le_bytes().to_vec();
        expected.extend_from_slice(&(-2.0f32).to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode(&[0u8; 7], DType::F32, &[2], &Device::Cpu).unwrap_err();
        assert!(matches!(err, OffloadError::ShapeMismatch(_)));
    }

    #[test]
    fn regions_at_disjoint_offsets_do_not_clobber_each_other() {
        let file = NamedTempFile::new().unwrap();
        write_region(file.path(), 0, &[1, 2, 3, 4]).unwrap();
        write_region(file.path(), 8, &[9, 9]).unwrap();
        write_region(file.path(), 4, &[5, 6, 7, 8]).unwrap();

        assert_eq!(read_region(file.path(), 0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(read_region(file.path(), 4, 4).unwrap(), vec![5, 6, 7, 8]);
        assert_eq!(read_region(file.path(), 8, 2).unwrap(), vec![9, 9]);
    }

    #[test]
    fn short_file_is_reported_as_shape_mismatch() {
        let file = NamedTempFile::new().unwrap();
        write_region(file.path(), 0, &[0u8; 12]).unwrap();
        let err = read_region(file.path(), 8, 8).unwrap_err();
        assert!(matches!(err, OffloadError::ShapeMismatch(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_region(&dir.path().join("absent.bin"), 0, 4).unwrap_err();
        assert!(matches!(err, OffloadError::Io { .. }));
    }
}
