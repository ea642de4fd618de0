//! Optional backend registry
//!
//! Optional backends are compiled in through cargo features and can be
//! switched off at runtime with `BURN_MODELS_BENCH_DISABLE`, a comma-separated
//! list of tags. Detection runs once per process.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Environment variable listing backend tags to disable
pub const DISABLE_ENV: &str = "BURN_MODELS_BENCH_DISABLE";

/// An optional acceleration backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendTag {
    /// Chunked attention that never materialises the full score matrix
    MemoryEfficientAttention,
    /// Fused GroupNorm + SiLU kernels and burn's fusion decorator
    KernelFusion,
    /// Low-rank adapter fusion into base weights
    AdapterFusion,
}

impl BackendTag {
    pub const ALL: [BackendTag; 3] = [
        BackendTag::MemoryEfficientAttention,
        BackendTag::KernelFusion,
        BackendTag::AdapterFusion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackendTag::MemoryEfficientAttention => "memory-efficient-attention",
            BackendTag::KernelFusion => "kernel-fusion",
            BackendTag::AdapterFusion => "adapter-fusion",
        }
    }

    fn compiled_in(self) -> bool {
        match self {
            BackendTag::MemoryEfficientAttention => cfg!(feature = "memory-efficient-attention"),
            BackendTag::KernelFusion => cfg!(feature = "fusion"),
            BackendTag::AdapterFusion => cfg!(feature = "lora"),
        }
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendTag::ALL
            .into_iter()
            .find(|tag| tag.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown backend tag '{s}'"))
    }
}

/// The set of optional backends available to this process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    tags: BTreeSet<BackendTag>,
}

impl Capabilities {
    /// Compiled-in backends minus those disabled through the environment
    pub fn detect() -> Self {
        let disabled = std::env::var(DISABLE_ENV).ok();
        Self::detect_with(disabled.as_deref())
    }

    fn detect_with(disabled: Option<&str>) -> Self {
        let mut removed = BTreeSet::new();
        for name in disabled.unwrap_or_default().split(',').filter(|s| !s.trim().is_empty()) {
            match name.parse::<BackendTag>() {
                Ok(tag) => {
                    removed.insert(tag);
                }
                Err(e) => warn!("{DISABLE_ENV}: {e}, ignoring"),
            }
        }

        let caps = Self::from_tags(
            BackendTag::ALL
                .into_iter()
                .filter(|tag| tag.compiled_in() && !removed.contains(tag)),
        );
        debug!("detected backends: {caps}");
        caps
    }

    /// Process-wide registry, detected on first use
    pub fn global() -> &'static Capabilities {
        static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();
        CAPABILITIES.get_or_init(Self::detect)
    }

    pub fn from_tags(tags: impl IntoIterator<Item = BackendTag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }

    /// Every optional backend
    pub fn all() -> Self {
        Self::from_tags(BackendTag::ALL)
    }

    pub fn has(&self, tag: BackendTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = BackendTag> + '_ {
        self.tags.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.tags.iter().map(|t| t.name()).collect();
        f.write_str(&names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names_round_trip() {
        for tag in BackendTag::ALL {
            assert_eq!(tag.to_string().parse::<BackendTag>(), Ok(tag));
        }
        assert_eq!(" Kernel-Fusion ".parse::<BackendTag>(), Ok(BackendTag::KernelFusion));
        assert!("xformers".parse::<BackendTag>().is_err());
    }

    #[test]
    fn test_disable_list() {
        let all = Capabilities::detect_with(None);
        let reduced = Capabilities::detect_with(Some("adapter-fusion, bogus,"));

        assert!(!reduced.has(BackendTag::AdapterFusion));
        for tag in all.tags().filter(|t| *t != BackendTag::AdapterFusion) {
            assert!(reduced.has(tag));
        }
    }

    #[test]
    fn test_compiled_features() {
        let caps = Capabilities::detect_with(None);
        assert_eq!(
            caps.has(BackendTag::MemoryEfficientAttention),
            cfg!(feature = "memory-efficient-attention")
        );
        assert_eq!(caps.has(BackendTag::KernelFusion), cfg!(feature = "fusion"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Capabilities::default().to_string(), "none");
        assert_eq!(
            Capabilities::from_tags([BackendTag::AdapterFusion, BackendTag::MemoryEfficientAttention])
                .to_string(),
            "memory-efficient-attention, adapter-fusion"
        );
    }
}
