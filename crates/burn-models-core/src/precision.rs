//! Numeric precision for loaded weights
//!
//! Burn fixes the element type of a tensor at compile time through the
//! backend, so reduced precision is applied when weights are loaded: every
//! value is rounded onto the fp16 or bf16 grid before it becomes a tensor.
//! The arithmetic that follows keeps the backend's float type.

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};

/// Precision mode for model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionMode {
    /// Full 32-bit precision
    Fp32,
    /// 16-bit half precision (default for diffusion weights)
    #[default]
    Fp16,
    /// 16-bit brain floating point
    Bf16,
}

impl PrecisionMode {
    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Fp16 => "fp16",
            PrecisionMode::Bf16 => "bf16",
        }
    }

    /// Memory used relative to fp32
    pub fn memory_savings(&self) -> f32 {
        match self {
            PrecisionMode::Fp32 => 1.0,
            PrecisionMode::Fp16 | PrecisionMode::Bf16 => 0.5,
        }
    }

    /// Bytes per stored element
    pub fn bytes_per_element(&self) -> usize {
        match self {
            PrecisionMode::Fp32 => 4,
            PrecisionMode::Fp16 | PrecisionMode::Bf16 => 2,
        }
    }

    /// Round a single value onto this precision's grid
    pub fn round(&self, value: f32) -> f32 {
        match self {
            PrecisionMode::Fp32 => value,
            PrecisionMode::Fp16 => f16::from_f32(value).to_f32(),
            PrecisionMode::Bf16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Round every value in place
    pub fn round_slice(&self, values: &mut [f32]) {
        if *self == PrecisionMode::Fp32 {
            return;
        }
        for v in values.iter_mut() {
            *v = self.round(*v);
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PrecisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(PrecisionMode::Fp32),
            "fp16" | "f16" | "float16" | "half" => Ok(PrecisionMode::Fp16),
            "bf16" | "bfloat16" => Ok(PrecisionMode::Bf16),
            other => Err(format!("unknown precision `{other}` (expected fp32, fp16 or bf16)")),
        }
    }
}
