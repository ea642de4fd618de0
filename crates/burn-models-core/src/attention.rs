//! Attention with selectable computation strategy
//!
//! Standard attention materializes the full `[n, m]` score matrix per head.
//! Memory-efficient attention processes queries in chunks so the peak score
//! buffer is `[chunk, m]`; sliced attention processes heads in groups.
//! All strategies compute the same result up to floating point reordering.

use std::fmt;

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::linear::DynLinear;
use crate::lora::LoraModel;
use crate::quantization::QuantConfig;

/// Attention implementation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AttentionStrategy {
    /// Materializes the full attention matrix
    #[default]
    Standard,
    /// Chunked queries
    MemoryEfficient,
    /// Heads processed in groups
    Sliced,
}

impl AttentionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AttentionStrategy::Standard => "standard",
            AttentionStrategy::MemoryEfficient => "memory_efficient",
            AttentionStrategy::Sliced => "sliced",
        }
    }
}

/// Configuration for attention computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttentionConfig {
    pub strategy: AttentionStrategy,
    /// Query chunk size for memory-efficient attention
    pub chunk_size: usize,
    /// Heads per slice for sliced attention
    pub slice_size: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            strategy: AttentionStrategy::Standard,
            chunk_size: 1024,
            slice_size: 1,
        }
    }
}

impl AttentionConfig {
    pub fn standard() -> Self {
        Self::default()
    }

    pub fn memory_efficient(chunk_size: usize) -> Self {
        Self {
            strategy: AttentionStrategy::MemoryEfficient,
            chunk_size: chunk_size.max(1),
            ..Self::default()
        }
    }

    pub fn sliced(slice_size: usize) -> Self {
        Self {
            strategy: AttentionStrategy::Sliced,
            slice_size: slice_size.max(1),
            ..Self::default()
        }
    }
}

impl fmt::Display for AttentionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.strategy {
            AttentionStrategy::Standard => write!(f, "standard"),
            AttentionStrategy::MemoryEfficient => write!(f, "memory_efficient(chunk={})", self.chunk_size),
            AttentionStrategy::Sliced => write!(f, "sliced(heads={})", self.slice_size),
        }
    }
}

/// Compute attention on `[batch, heads, seq, head_dim]` tensors
pub fn compute_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    config: &AttentionConfig,
) -> Tensor<B, 4> {
    match config.strategy {
        AttentionStrategy::Standard => standard_attention(q, k, v),
        AttentionStrategy::MemoryEfficient => memory_efficient_attention(q, k, v, config.chunk_size),
        AttentionStrategy::Sliced => sliced_attention(q, k, v, config.slice_size),
    }
}

/// softmax(Q @ K^T / sqrt(d)) @ V
fn standard_attention<B: Backend>(q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, _, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.5);

    let attn = q.matmul(k.transpose()) * scale;
    softmax(attn, 3).matmul(v)
}

fn memory_efficient_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    chunk_size: usize,
) -> Tensor<B, 4> {
    let [batch, heads, seq_len, head_dim] = q.dims();

    if seq_len <= chunk_size {
        return standard_attention(q, k, v);
    }

    let k_t = k.transpose();
    let scale = (head_dim as f64).powf(-0.5);
    let outputs: Vec<_> = (0..seq_len)
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(seq_len);
            let q_chunk = q.clone().slice([0..batch, 0..heads, start..end, 0..head_dim]);
            let attn = q_chunk.matmul(k_t.clone()) * scale;
            softmax(attn, 3).matmul(v.clone())
        })
        .collect();

    Tensor::cat(outputs, 2)
}

fn sliced_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    slice_size: usize,
) -> Tensor<B, 4> {
    let [batch, heads, seq_len, head_dim] = q.dims();
    let [_, _, kv_len, _] = k.dims();

    if heads <= slice_size {
        return standard_attention(q, k, v);
    }

    let outputs: Vec<_> = (0..heads)
        .step_by(slice_size)
        .map(|start| {
            let end = (start + slice_size).min(heads);
            let q_slice = q.clone().slice([0..batch, start..end, 0..seq_len, 0..head_dim]);
            let k_slice = k.clone().slice([0..batch, start..end, 0..kv_len, 0..head_dim]);
            let v_slice = v.clone().slice([0..batch, start..end, 0..kv_len, 0..head_dim]);
            standard_attention(q_slice, k_slice, v_slice)
        })
        .collect();

    Tensor::cat(outputs, 1)
}

/// Multi-head attention over token sequences
///
/// Self-attention when no context is given, cross-attention otherwise.
#[derive(Debug, Clone)]
pub struct Attention<B: Backend> {
    pub to_q: DynLinear<B>,
    pub to_k: DynLinear<B>,
    pub to_v: DynLinear<B>,
    pub to_out: DynLinear<B>,
    pub num_heads: usize,
    pub config: AttentionConfig,
}

impl<B: Backend> Attention<B> {
    pub fn new(
        to_q: DynLinear<B>,
        to_k: DynLinear<B>,
        to_v: DynLinear<B>,
        to_out: DynLinear<B>,
        num_heads: usize,
    ) -> Self {
        Self {
            to_q,
            to_k,
            to_v,
            to_out,
            num_heads,
            config: AttentionConfig::default(),
        }
    }

    /// `x`: [batch, seq, dim], `context`: [batch, ctx_seq, ctx_dim]
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let [batch, seq, _] = x.dims();
        let context = context.unwrap_or_else(|| x.clone());

        let q = self.split_heads(self.to_q.forward(x));
        let k = self.split_heads(self.to_k.forward(context.clone()));
        let v = self.split_heads(self.to_v.forward(context));

        let out = compute_attention(q, k, v, &self.config);
        let inner = self.to_q.out_features();
        let out = out.swap_dims(1, 2).reshape([batch, seq, inner]);
        self.to_out.forward(out)
    }

    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, seq, inner] = x.dims();
        x.reshape([batch, seq, self.num_heads, inner / self.num_heads])
            .swap_dims(1, 2)
    }

    /// Named projections, for LoRA fusion and quantization
    pub fn projections_mut(&mut self) -> [(&'static str, &mut DynLinear<B>); 4] {
        [
            ("to_q", &mut self.to_q),
            ("to_k", &mut self.to_k),
            ("to_v", &mut self.to_v),
            ("to_out", &mut self.to_out),
        ]
    }

    /// Fuse LoRA weights stored under `{prefix}.{projection}`
    pub fn fuse_lora(&mut self, prefix: &str, lora: &LoraModel<B>) -> usize {
        let scale = lora.scale;
        let mut fused = 0;
        for (name, layer) in self.projections_mut() {
            if let Some(weight) = lora.linear(&format!("{prefix}.{name}")) {
                if layer.fuse_lora(weight, scale) {
                    fused += 1;
                }
            }
        }
        fused
    }

    pub fn quantize(&mut self, config: &QuantConfig) -> usize {
        let mut converted = 0;
        for (_, layer) in self.projections_mut() {
            if layer.quantize(config) {
                converted += 1;
            }
        }
        converted
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            to_q: self.to_q.to_device(device),
            to_k: self.to_k.to_device(device),
            to_v: self.to_v.to_device(device),
            to_out: self.to_out.to_device(device),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn random_qkv(seq: usize) -> [Tensor<TestBackend, 4>; 3] {
        let device = Default::default();
        let dist = Distribution::Normal(0.0, 1.0);
        [
            Tensor::random([1, 4, seq, 8], dist, &device),
            Tensor::random([1, 4, seq, 8], dist, &device),
            Tensor::random([1, 4, seq, 8], dist, &device),
        ]
    }

    #[test]
    fn test_strategies_agree() {
        let [q, k, v] = random_qkv(37);
        let standard = compute_attention(q.clone(), k.clone(), v.clone(), &AttentionConfig::standard());

        for config in [AttentionConfig::memory_efficient(8), AttentionConfig::sliced(3)] {
            let other = compute_attention(q.clone(), k.clone(), v.clone(), &config);
            assert_eq!(other.dims(), [1, 4, 37, 8]);
            let max_diff: f32 = (standard.clone() - other).abs().max().into_scalar().elem();
            assert!(max_diff < 1e-5, "{config}: max diff {max_diff}");
        }
    }

    #[test]
    fn test_cross_attention_shape() {
        let device = Default::default();
        let linear = |out: usize, inp: usize| {
            DynLinear::new(
                Tensor::<TestBackend, 2>::random([out, inp], Distribution::Normal(0.0, 0.1), &device),
                None,
            )
        };
        let attn = Attention::new(linear(16, 16), linear(16, 12), linear(16, 12), linear(16, 16), 2);

        let x = Tensor::<TestBackend, 3>::ones([2, 10, 16], &device);
        let context = Tensor::<TestBackend, 3>::ones([2, 5, 12], &device);
        assert_eq!(attn.forward(x, Some(context)).dims(), [2, 10, 16]);
    }

    #[test]
    fn test_config_display() {
        assert_eq!(AttentionConfig::memory_efficient(64).to_string(), "memory_efficient(chunk=64)");
        assert_eq!(AttentionConfig::standard().strategy.name(), "standard");
    }
}
