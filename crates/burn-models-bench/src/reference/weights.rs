//! Weight sources for the reference models
//!
//! Models ask a [`WeightSource`] for each tensor by name. Seeded sources
//! synthesise deterministic values from the model name; file sources read a
//! safetensors file written by `export` or by any compatible tool.

use std::path::Path;

use burn::prelude::*;
use burn_models_convert::{LoadError, SafeTensorFile, TensorEntry};
use burn_models_core::{Attention, Conv2dLayer, DynLinear, GroupNorm, LayerNorm, PrecisionMode};
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

use crate::error::Result;

/// How a seeded source fills a tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`
    Uniform { fan_in: usize },
    Zeros,
    Ones,
}

pub trait WeightSource {
    /// Row-major values of `name`, which must have `shape`
    fn values(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Vec<f32>>;
}

/// FNV-1a, used for stable seeds and token ids
pub(crate) fn hash_name(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Deterministic synthetic weights
///
/// Each tensor is seeded from the model seed and its own name, so values do
/// not depend on construction order.
#[derive(Debug, Clone)]
pub struct SeededWeights {
    seed: u64,
    precision: PrecisionMode,
}

impl SeededWeights {
    pub fn new(model: &str, precision: PrecisionMode) -> Self {
        Self {
            seed: hash_name(model),
            precision,
        }
    }
}

impl WeightSource for SeededWeights {
    fn values(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Vec<f32>> {
        let len = shape.iter().product();
        let mut values = match init {
            Init::Zeros => vec![0.0; len],
            Init::Ones => vec![1.0; len],
            Init::Uniform { fan_in } => {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                let mut rng = StdRng::seed_from_u64(self.seed ^ hash_name(name));
                (0..len).map(|_| dist.sample(&mut rng)).collect()
            }
        };
        self.precision.round_slice(&mut values);
        Ok(values)
    }
}

/// Weights read from a safetensors file
pub struct FileWeights {
    file: SafeTensorFile,
    precision: PrecisionMode,
}

impl FileWeights {
    pub fn open(path: impl AsRef<Path>, precision: PrecisionMode) -> Result<Self> {
        Ok(Self {
            file: SafeTensorFile::open(path)?,
            precision,
        })
    }

    pub fn file(&self) -> &SafeTensorFile {
        &self.file
    }
}

impl WeightSource for FileWeights {
    fn values(&mut self, name: &str, shape: &[usize], _init: Init) -> Result<Vec<f32>> {
        let actual = self
            .file
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;
        if actual != shape {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: actual.to_vec(),
            }
            .into());
        }

        let mut values = self.file.read_f32(name)?;
        self.precision.round_slice(&mut values);
        Ok(values)
    }
}

/// Passes values through and keeps a copy of each, for export
pub struct RecordingWeights<S> {
    inner: S,
    entries: Vec<TensorEntry>,
}

impl<S: WeightSource> RecordingWeights<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            entries: Vec::new(),
        }
    }

    pub fn into_entries(self) -> Vec<TensorEntry> {
        self.entries
    }
}

impl<S: WeightSource> WeightSource for RecordingWeights<S> {
    fn values(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Vec<f32>> {
        let values = self.inner.values(name, shape, init)?;
        self.entries
            .push(TensorEntry::new(name, shape.to_vec(), values.clone()));
        Ok(values)
    }
}

/// Builds layers from a weight source onto a device
pub(crate) struct LayerBuilder<'a, B: Backend> {
    source: &'a mut dyn WeightSource,
    device: &'a B::Device,
}

impl<'a, B: Backend> LayerBuilder<'a, B> {
    pub fn new(source: &'a mut dyn WeightSource, device: &'a B::Device) -> Self {
        Self { source, device }
    }

    pub fn tensor<const D: usize>(&mut self, name: &str, shape: [usize; D], init: Init) -> Result<Tensor<B, D>> {
        let values = self.source.values(name, &shape, init)?;
        Ok(Tensor::from_data(TensorData::new(values, shape), self.device))
    }

    pub fn linear(&mut self, prefix: &str, in_features: usize, out_features: usize, bias: bool) -> Result<DynLinear<B>> {
        let init = Init::Uniform { fan_in: in_features };
        let weight = self.tensor(&format!("{prefix}.weight"), [out_features, in_features], init)?;
        let bias = if bias {
            Some(self.tensor(&format!("{prefix}.bias"), [out_features], init)?)
        } else {
            None
        };
        Ok(DynLinear::new(weight, bias))
    }

    pub fn conv(
        &mut self,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
    ) -> Result<Conv2dLayer<B>> {
        let init = Init::Uniform {
            fan_in: in_channels * kernel * kernel,
        };
        let weight = self.tensor(
            &format!("{prefix}.weight"),
            [out_channels, in_channels, kernel, kernel],
            init,
        )?;
        let bias = self.tensor(&format!("{prefix}.bias"), [out_channels], init)?;
        Ok(Conv2dLayer::new(weight, Some(bias), stride, kernel / 2))
    }

    pub fn group_norm(&mut self, prefix: &str, groups: usize, channels: usize) -> Result<GroupNorm<B>> {
        let weight = self.tensor(&format!("{prefix}.weight"), [channels], Init::Ones)?;
        let bias = self.tensor(&format!("{prefix}.bias"), [channels], Init::Zeros)?;
        Ok(GroupNorm::from_parts(groups, weight, bias))
    }

    pub fn layer_norm(&mut self, prefix: &str, size: usize) -> Result<LayerNorm<B>> {
        let weight = self.tensor(&format!("{prefix}.weight"), [size], Init::Ones)?;
        let bias = self.tensor(&format!("{prefix}.bias"), [size], Init::Zeros)?;
        Ok(LayerNorm::from_parts(weight, bias))
    }

    /// Attention with `to_q`/`to_k`/`to_v`/`to_out` projections
    pub fn attention(&mut self, prefix: &str, dim: usize, context_dim: usize, heads: usize) -> Result<Attention<B>> {
        Ok(Attention::new(
            self.linear(&format!("{prefix}.to_q"), dim, dim, false)?,
            self.linear(&format!("{prefix}.to_k"), context_dim, dim, false)?,
            self.linear(&format!("{prefix}.to_v"), context_dim, dim, false)?,
            self.linear(&format!("{prefix}.to_out"), dim, dim, true)?,
            heads,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_weights_are_stable() {
        let mut a = SeededWeights::new("model-a", PrecisionMode::Fp32);
        let mut b = SeededWeights::new("model-a", PrecisionMode::Fp32);
        let mut c = SeededWeights::new("model-b", PrecisionMode::Fp32);

        let init = Init::Uniform { fan_in: 16 };
        let first = a.values("w", &[4, 4], init).unwrap();
        // Construction order does not matter
        let _ = b.values("other", &[8], init).unwrap();
        assert_eq!(first, b.values("w", &[4, 4], init).unwrap());
        assert_ne!(first, c.values("w", &[4, 4], init).unwrap());
        assert!(first.iter().all(|v| v.abs() <= 0.25));
    }

    #[test]
    fn test_constant_inits() {
        let mut source = SeededWeights::new("m", PrecisionMode::Fp16);
        assert_eq!(source.values("z", &[3], Init::Zeros).unwrap(), vec![0.0; 3]);
        assert_eq!(source.values("o", &[2, 2], Init::Ones).unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_recording() {
        let mut source = RecordingWeights::new(SeededWeights::new("m", PrecisionMode::Fp32));
        let values = source.values("x.weight", &[2, 3], Init::Uniform { fan_in: 3 }).unwrap();
        let entries = source.into_entries();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x.weight");
        assert_eq!(entries[0].shape, vec![2, 3]);
        assert_eq!(entries[0].values, values);
    }
}
