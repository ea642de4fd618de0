//! Process-wide runtime options
//!
//! The fusion toggle only ever goes one way. Compiled modules read it when
//! they are compiled, so disabling fusion after the first compilation does not
//! reach modules that were already compiled.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct RuntimeOptions {
    fusion_disabled: AtomicBool,
    sealed: AtomicBool,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static RuntimeOptions {
        static OPTIONS: OnceLock<RuntimeOptions> = OnceLock::new();
        OPTIONS.get_or_init(RuntimeOptions::new)
    }

    /// Turn off kernel fusion for every later compilation
    pub fn disable_fusion(&self) {
        if self.fusion_disabled.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_sealed() {
            warn!("kernel fusion disabled after compilation; already compiled modules keep it");
        } else {
            info!("kernel fusion disabled for this process");
        }
    }

    pub fn fusion_enabled(&self) -> bool {
        !self.fusion_disabled.load(Ordering::SeqCst)
    }

    /// Mark that a compilation has read the options
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disable_is_one_way() {
        let options = RuntimeOptions::new();
        assert!(options.fusion_enabled());

        options.disable_fusion();
        options.disable_fusion();
        assert!(!options.fusion_enabled());
    }

    #[test]
    fn test_disable_after_seal() {
        let options = RuntimeOptions::new();
        options.seal();
        assert!(options.is_sealed());

        options.disable_fusion();
        assert!(!options.fusion_enabled());
    }
}
