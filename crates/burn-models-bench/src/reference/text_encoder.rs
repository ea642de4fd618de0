//! Reference prompt encoder
//!
//! A hashing tokenizer feeding a single pre-norm transformer layer.

use burn::prelude::*;
use burn::tensor::activation::gelu;
use burn_models_core::{Attention, DynLinear, LayerNorm, LoraModel};
use serde::{Deserialize, Serialize};

use super::blocks::fuse_linear;
use super::weights::{Init, LayerBuilder, WeightSource, hash_name};
use crate::components::TextEncoder;
use crate::error::Result;

const BOS: usize = 0;
const EOS: usize = 1;
const FIRST_WORD_ID: usize = 2;

/// Contents of `text_encoder/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextEncoderConfig {
    pub vocab_size: usize,
    pub max_length: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Width of the returned context, matching the denoiser's cross-attention
    pub context_dim: usize,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 4096,
            max_length: 16,
            hidden_size: 32,
            num_heads: 2,
            context_dim: 32,
        }
    }
}

impl TextEncoderConfig {
    /// Lowercased alphanumeric words hashed into the vocabulary, wrapped in
    /// BOS/EOS and padded with EOS to `max_length`
    pub fn tokenize(&self, prompt: &str) -> Vec<usize> {
        let words = self.vocab_size.saturating_sub(FIRST_WORD_ID).max(1);
        let mut ids = vec![BOS];
        ids.extend(
            prompt
                .split(|c: char| !c.is_alphanumeric())
                .filter(|word| !word.is_empty())
                .map(|word| FIRST_WORD_ID + (hash_name(&word.to_lowercase()) % words as u64) as usize)
                .take(self.max_length.saturating_sub(2)),
        );
        ids.resize(self.max_length, EOS);
        ids
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceTextEncoder<B: Backend> {
    config: TextEncoderConfig,
    token_embedding: Tensor<B, 2>,
    position_embedding: Tensor<B, 2>,
    norm1: LayerNorm<B>,
    attn: Attention<B>,
    norm2: LayerNorm<B>,
    fc1: DynLinear<B>,
    fc2: DynLinear<B>,
    final_norm: LayerNorm<B>,
    proj: DynLinear<B>,
    device: B::Device,
}

impl<B: Backend> ReferenceTextEncoder<B> {
    pub fn new(config: TextEncoderConfig, source: &mut dyn WeightSource, device: &B::Device) -> Result<Self> {
        let mut b = LayerBuilder::<B>::new(source, device);
        let hidden = config.hidden_size;
        let embed_init = Init::Uniform { fan_in: hidden };

        Ok(Self {
            token_embedding: b.tensor("embeddings.token", [config.vocab_size, hidden], embed_init)?,
            position_embedding: b.tensor("embeddings.position", [config.max_length, hidden], embed_init)?,
            norm1: b.layer_norm("encoder.norm1", hidden)?,
            attn: b.attention("encoder.attn", hidden, hidden, config.num_heads)?,
            norm2: b.layer_norm("encoder.norm2", hidden)?,
            fc1: b.linear("encoder.fc1", hidden, hidden * 4, true)?,
            fc2: b.linear("encoder.fc2", hidden * 4, hidden, true)?,
            final_norm: b.layer_norm("final_norm", hidden)?,
            proj: b.linear("proj", hidden, config.context_dim, false)?,
            device: device.clone(),
            config,
        })
    }

    pub fn config(&self) -> &TextEncoderConfig {
        &self.config
    }
}

impl<B: Backend> TextEncoder<B> for ReferenceTextEncoder<B> {
    fn encode(&self, prompts: &[String]) -> Tensor<B, 3> {
        let len = self.config.max_length;
        let hidden = self.config.hidden_size;
        let ids: Vec<i64> = prompts
            .iter()
            .flat_map(|prompt| self.config.tokenize(prompt))
            .map(|id| id as i64)
            .collect();

        let ids = Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [prompts.len() * len]), &self.device);
        let h = self
            .token_embedding
            .clone()
            .select(0, ids)
            .reshape([prompts.len(), len, hidden])
            + self.position_embedding.clone().unsqueeze_dim::<3>(0);

        let h = h.clone() + self.attn.forward(self.norm1.forward(h), None);
        let h = h.clone() + self.fc2.forward(gelu(self.fc1.forward(self.norm2.forward(h))));
        self.proj.forward(self.final_norm.forward(h))
    }

    fn context_dim(&self) -> usize {
        self.config.context_dim
    }

    fn fuse_lora(&mut self, lora: &LoraModel<B>) -> usize {
        self.attn.fuse_lora("text_encoder.encoder.attn", lora)
            + fuse_linear(&mut self.fc1, "text_encoder.encoder.fc1", lora)
            + fuse_linear(&mut self.fc2, "text_encoder.encoder.fc2", lora)
            + fuse_linear(&mut self.proj, "text_encoder.proj", lora)
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn TextEncoder<B>> {
        let encoder = *self;
        Box::new(Self {
            token_embedding: encoder.token_embedding.to_device(device),
            position_embedding: encoder.position_embedding.to_device(device),
            norm1: encoder.norm1.to_device(device),
            attn: encoder.attn.to_device(device),
            norm2: encoder.norm2.to_device(device),
            fc1: encoder.fc1.to_device(device),
            fc2: encoder.fc2.to_device(device),
            final_norm: encoder.final_norm.to_device(device),
            proj: encoder.proj.to_device(device),
            device: device.clone(),
            config: encoder.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::weights::SeededWeights;
    use burn_models_core::PrecisionMode;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tokenize() {
        let config = TextEncoderConfig::default();
        let ids = config.tokenize("A photo of an Astronaut");
        assert_eq!(ids.len(), 16);
        assert_eq!(ids[0], BOS);
        assert_eq!(&ids[6..], &[EOS; 10]);
        assert_eq!(config.tokenize("astronaut")[1], ids[5]);

        let long = "word ".repeat(40);
        let ids = config.tokenize(&long);
        assert_eq!(ids.len(), 16);
        assert_eq!(ids[15], EOS);
    }

    #[test]
    fn test_encode_shape_and_prompt_sensitivity() {
        let device = Default::default();
        let mut source = SeededWeights::new("test-text-encoder", PrecisionMode::Fp32);
        let encoder =
            ReferenceTextEncoder::<TestBackend>::new(TextEncoderConfig::default(), &mut source, &device).unwrap();

        let prompts = vec!["a red cube".to_string(), String::new()];
        let context = encoder.encode(&prompts);
        assert_eq!(context.dims(), [2, 16, 32]);

        let rows = context.into_data().to_vec::<f32>().unwrap();
        let (cond, uncond) = rows.split_at(16 * 32);
        assert_ne!(cond, uncond);
    }
}
