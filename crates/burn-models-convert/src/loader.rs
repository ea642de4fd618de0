//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use burn_models_core::precision::PrecisionMode;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Rank mismatch for {name}: expected rank {expected}, got shape {actual:?}")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: Vec<usize>,
    },
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A memory-mapped safetensors file
///
/// The header is parsed once on open; tensor bytes are decoded on demand.
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
    metadata: HashMap<String, String>,
}

impl SafeTensorFile {
    /// Open and map a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let (header_len, header) = SafeTensors::read_metadata(&mmap)?;
        let data_start = 8 + header_len;

        let tensors = header
            .tensors()
            .into_iter()
            .map(|(name, info)| {
                let (begin, end) = info.data_offsets;
                let info = TensorInfo {
                    dtype: info.dtype,
                    shape: info.shape.clone(),
                    start: data_start + begin,
                    end: data_start + end,
                };
                (name, info)
            })
            .collect();
        let metadata = header.metadata().clone().unwrap_or_default();

        Ok(Self {
            mmap,
            tensors,
            metadata,
        })
    }

    /// All tensor names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    /// Free-form `__metadata__` entries from the header
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn info(&self, name: &str) -> Result<&TensorInfo, LoadError> {
        self.tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))
    }

    /// Decode a tensor's values to f32, whatever its stored float type
    pub fn read_f32(&self, name: &str) -> Result<Vec<f32>, LoadError> {
        let info = self.info(name)?;
        let bytes = &self.mmap[info.start..info.end];

        // mmap data may be unaligned, so decode byte-wise
        let values = match info.dtype {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                });
            }
        };
        Ok(values)
    }

    /// Load a tensor as f32, converting from fp16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self.info(name)?;
        if info.shape.len() != D {
            return Err(LoadError::RankMismatch {
                name: name.to_string(),
                expected: D,
                actual: info.shape.clone(),
            });
        }

        let values = self.read_f32(name)?;
        let data = TensorData::new(values, info.shape.clone());
        Ok(Tensor::from_data(data, device))
    }

    /// Load a tensor and check it against an expected shape
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self.info(name)?;
        if info.shape.as_slice() != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: info.shape.clone(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }

    /// Load a tensor rounded to the given compute precision
    ///
    /// Values are stored on device as f32 but carry only the precision the
    /// mode allows, matching what a half-precision pipeline would see.
    pub fn load_with_precision<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        precision: PrecisionMode,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self.info(name)?;
        if info.shape.as_slice() != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: info.shape.clone(),
            });
        }

        let mut values = self.read_f32(name)?;
        precision.round_slice(&mut values);
        Ok(Tensor::from_data(TensorData::new(values, expected_shape), device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{StorageDtype, TensorEntry, write_safetensors};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn sample_file(dtype: StorageDtype) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let entries = vec![
            TensorEntry::new("a.weight", vec![2, 3], vec![0.5, -1.0, 2.0, 0.25, 3.0, -0.125]),
            TensorEntry::new("a.bias", vec![2], vec![1.0, 1.0 / 3.0]),
        ];
        let mut meta = std::collections::BTreeMap::new();
        meta.insert("format".to_string(), "pt".to_string());
        write_safetensors(&path, &entries, dtype, Some(&meta)).unwrap();
        (dir, path)
    }

    #[test]
    fn test_open_and_inspect() {
        let (_dir, path) = sample_file(StorageDtype::F32);
        let file = SafeTensorFile::open(&path).unwrap();

        assert_eq!(file.names(), vec!["a.bias", "a.weight"]);
        assert_eq!(file.shape("a.weight"), Some(&[2, 3][..]));
        assert_eq!(file.dtype("a.bias"), Some(Dtype::F32));
        assert_eq!(file.metadata().get("format").map(String::as_str), Some("pt"));
        assert!(!file.contains("missing"));
    }

    #[test]
    fn test_load_f16_file() {
        let (_dir, path) = sample_file(StorageDtype::F16);
        let file = SafeTensorFile::open(&path).unwrap();
        let device = Default::default();

        let tensor = file.load_f32::<TestBackend, 2>("a.weight", &device).unwrap();
        assert_eq!(tensor.dims(), [2, 3]);
        // All values are exactly representable in f16
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![0.5, -1.0, 2.0, 0.25, 3.0, -0.125]);
    }

    #[test]
    fn test_shape_and_rank_errors() {
        let (_dir, path) = sample_file(StorageDtype::F32);
        let file = SafeTensorFile::open(&path).unwrap();
        let device = Default::default();

        let rank = file.load_f32::<TestBackend, 1>("a.weight", &device);
        assert!(matches!(rank, Err(LoadError::RankMismatch { .. })));

        let shape = file.load_f32_checked::<TestBackend, 2>("a.weight", [3, 2], &device);
        assert!(matches!(shape, Err(LoadError::ShapeMismatch { .. })));

        let missing = file.load_f32::<TestBackend, 1>("nope", &device);
        assert!(matches!(missing, Err(LoadError::TensorNotFound(_))));
    }

    #[test]
    fn test_precision_rounding() {
        let (_dir, path) = sample_file(StorageDtype::F32);
        let file = SafeTensorFile::open(&path).unwrap();
        let device = Default::default();

        let full = file
            .load_with_precision::<TestBackend, 1>("a.bias", [2], PrecisionMode::Fp32, &device)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let half = file
            .load_with_precision::<TestBackend, 1>("a.bias", [2], PrecisionMode::Fp16, &device)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        assert_eq!(full[1], 1.0 / 3.0);
        assert_ne!(half[1], 1.0 / 3.0);
        assert!((half[1] - 1.0 / 3.0).abs() < 1e-3);
    }
}
