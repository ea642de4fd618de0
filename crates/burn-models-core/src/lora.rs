//! LoRA (Low-Rank Adaptation) weights
//!
//! A LoRA stores, per target layer, a `down` projection to a small rank and
//! an `up` projection back. Fusing adds `scale * alpha / rank * (up @ down)`
//! to the base weight; after fusion the adapter no longer exists separately.

use burn::prelude::*;
use std::collections::HashMap;

/// LoRA weight pair for a linear layer
#[derive(Debug, Clone)]
pub struct LoraWeight<B: Backend> {
    /// Down projection: [rank, in_features]
    pub lora_down: Tensor<B, 2>,
    /// Up projection: [out_features, rank]
    pub lora_up: Tensor<B, 2>,
    /// Alpha scaling factor
    pub alpha: f32,
    /// Rank of the LoRA matrices
    pub rank: usize,
}

impl<B: Backend> LoraWeight<B> {
    pub fn new(lora_down: Tensor<B, 2>, lora_up: Tensor<B, 2>, alpha: f32) -> Self {
        let rank = lora_down.dims()[0];
        Self {
            lora_down,
            lora_up,
            alpha,
            rank,
        }
    }

    /// Delta weight: scale * alpha / rank * (up @ down)
    pub fn compute_delta(&self, scale: f32) -> Tensor<B, 2> {
        let effective_scale = scale * self.alpha / self.rank as f32;
        self.lora_up.clone().matmul(self.lora_down.clone()) * effective_scale
    }
}

/// LoRA weights for convolutional layers
#[derive(Debug, Clone)]
pub struct LoraConvWeight<B: Backend> {
    /// Down projection [rank, in_ch, kh, kw]
    pub lora_down: Tensor<B, 4>,
    /// Up projection [out_ch, rank, 1, 1]
    pub lora_up: Tensor<B, 4>,
    pub alpha: f32,
    pub rank: usize,
}

impl<B: Backend> LoraConvWeight<B> {
    pub fn new(lora_down: Tensor<B, 4>, lora_up: Tensor<B, 4>, alpha: f32) -> Self {
        let rank = lora_down.dims()[0];
        Self {
            lora_down,
            lora_up,
            alpha,
            rank,
        }
    }

    /// Delta weight in conv layout [out_ch, in_ch, kh, kw]
    pub fn compute_delta(&self, scale: f32) -> Tensor<B, 4> {
        let effective_scale = scale * self.alpha / self.rank as f32;

        let [rank, in_ch, kh, kw] = self.lora_down.dims();
        let [out_ch, _, _, _] = self.lora_up.dims();

        let down_flat = self.lora_down.clone().reshape([rank, in_ch * kh * kw]);
        let up_flat = self.lora_up.clone().reshape([out_ch, rank]);

        (up_flat.matmul(down_flat) * effective_scale).reshape([out_ch, in_ch, kh, kw])
    }
}

/// Either linear or conv LoRA weight
#[derive(Debug, Clone)]
pub enum LoraWeightType<B: Backend> {
    Linear(LoraWeight<B>),
    Conv(LoraConvWeight<B>),
}

/// Collection of LoRA weights keyed by target layer name
///
/// Names use dotted module paths with a component prefix, e.g.
/// `unet.mid.attn1.to_q` or `text_encoder.proj`.
#[derive(Debug, Clone)]
pub struct LoraModel<B: Backend> {
    pub weights: HashMap<String, LoraWeightType<B>>,
    /// Global scale applied when fusing
    pub scale: f32,
}

impl<B: Backend> LoraModel<B> {
    pub fn new(scale: f32) -> Self {
        Self {
            weights: HashMap::new(),
            scale,
        }
    }

    pub fn add_linear(&mut self, name: String, weight: LoraWeight<B>) {
        self.weights.insert(name, LoraWeightType::Linear(weight));
    }

    pub fn add_conv(&mut self, name: String, weight: LoraConvWeight<B>) {
        self.weights.insert(name, LoraWeightType::Conv(weight));
    }

    pub fn get(&self, name: &str) -> Option<&LoraWeightType<B>> {
        self.weights.get(name)
    }

    /// Linear weight for a layer, if present
    pub fn linear(&self, name: &str) -> Option<&LoraWeight<B>> {
        match self.weights.get(name) {
            Some(LoraWeightType::Linear(w)) => Some(w),
            _ => None,
        }
    }

    /// Conv weight for a layer, if present
    pub fn conv(&self, name: &str) -> Option<&LoraConvWeight<B>> {
        match self.weights.get(name) {
            Some(LoraWeightType::Conv(w)) => Some(w),
            _ => None,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    /// Sorted layer names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.weights.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale;
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        let weights = self
            .weights
            .into_iter()
            .map(|(name, w)| {
                let w = match w {
                    LoraWeightType::Linear(l) => LoraWeightType::Linear(LoraWeight {
                        lora_down: l.lora_down.to_device(device),
                        lora_up: l.lora_up.to_device(device),
                        ..l
                    }),
                    LoraWeightType::Conv(c) => LoraWeightType::Conv(LoraConvWeight {
                        lora_down: c.lora_down.to_device(device),
                        lora_up: c.lora_up.to_device(device),
                        ..c
                    }),
                };
                (name, w)
            })
            .collect();
        Self {
            weights,
            scale: self.scale,
        }
    }
}
