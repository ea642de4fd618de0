//! Write tensors to .safetensors files

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use safetensors::Dtype;
use safetensors::tensor::View;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor {name} has {len} values but shape {shape:?}")]
    LengthMismatch {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },

    #[error("Tensor data error: {0}")]
    Data(String),
}

/// On-disk element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageDtype {
    #[default]
    F32,
    F16,
    BF16,
}

impl StorageDtype {
    fn dtype(self) -> Dtype {
        match self {
            StorageDtype::F32 => Dtype::F32,
            StorageDtype::F16 => Dtype::F16,
            StorageDtype::BF16 => Dtype::BF16,
        }
    }

    fn encode(self, values: &[f32]) -> Vec<u8> {
        match self {
            StorageDtype::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            StorageDtype::F16 => values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                .collect(),
            StorageDtype::BF16 => values
                .iter()
                .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
                .collect(),
        }
    }
}

/// A named tensor ready to be written
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorEntry {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            values,
        }
    }

    /// Copy a device tensor back to host
    pub fn from_tensor<B: Backend, const D: usize>(
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<Self, WriteError> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| WriteError::Data(format!("{e:?}")))?;
        Ok(Self::new(name, shape, values))
    }
}

struct Encoded {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl View for &Encoded {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Write tensors to a safetensors file
///
/// Values are converted to `dtype` on the way out. Tensor order in the file
/// follows safetensors' own layout rules, not the order of `tensors`.
pub fn write_safetensors(
    path: impl AsRef<Path>,
    tensors: &[TensorEntry],
    dtype: StorageDtype,
    metadata: Option<&BTreeMap<String, String>>,
) -> Result<(), WriteError> {
    let mut encoded = Vec::with_capacity(tensors.len());
    for entry in tensors {
        let expected: usize = entry.shape.iter().product();
        if expected != entry.values.len() {
            return Err(WriteError::LengthMismatch {
                name: entry.name.clone(),
                shape: entry.shape.clone(),
                len: entry.values.len(),
            });
        }
        encoded.push((
            entry.name.clone(),
            Encoded {
                dtype: dtype.dtype(),
                shape: entry.shape.clone(),
                bytes: dtype.encode(&entry.values),
            },
        ));
    }

    let info: Option<HashMap<String, String>> =
        metadata.map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    let views = encoded.iter().map(|(name, tensor)| (name.as_str(), tensor));
    safetensors::serialize_to_file(views, &info, path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SafeTensorFile;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![TensorEntry::new("bad", vec![2, 2], vec![1.0; 3])];
        let result = write_safetensors(dir.path().join("x.safetensors"), &entries, StorageDtype::F32, None);
        assert!(matches!(result, Err(WriteError::LengthMismatch { len: 3, .. })));
    }

    #[test]
    fn test_bf16_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bf16.safetensors");
        let device = Default::default();

        let tensor = Tensor::<TestBackend, 1>::from_floats([1.0, 1.001, -2.5], &device);
        let entry = TensorEntry::from_tensor("t", tensor).unwrap();
        write_safetensors(&path, &[entry], StorageDtype::BF16, None).unwrap();

        let file = SafeTensorFile::open(&path).unwrap();
        assert_eq!(file.dtype("t"), Some(Dtype::BF16));
        assert!(file.metadata().is_empty());

        let values = file.read_f32("t").unwrap();
        // bf16 keeps 8 mantissa bits, so 1.001 collapses onto 1.0
        assert_eq!(values, vec![1.0, 1.0, -2.5]);
    }
}
