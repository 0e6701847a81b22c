//! Bridge configuration.

use crate::marshal::MAX_DECODE_BYTES;

/// Configuration for a bridge and every instance it creates.
///
/// Controls memory limits, optional fuel metering and the async and
/// finalization machinery.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum linear memory pages (1 page = 64 KiB).
    /// Default: 1024 pages = 64 MiB.
    pub max_memory_pages: u32,

    /// Wasmtime fuel limit (instruction metering). `None` disables metering.
    pub fuel_limit: Option<u64>,

    /// Cumulative decoded bytes before the text decoder is re-created.
    pub decoder_threshold: u64,

    /// Sweep the closure finalization registry after microtask drains.
    pub enable_finalizers: bool,

    /// Upper bound on jobs run by one microtask drain.
    pub max_microtasks: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_memory_pages: 1024, // 64 MiB
            fuel_limit: None,
            decoder_threshold: MAX_DECODE_BYTES,
            enable_finalizers: true,
            max_microtasks: 1_000_000,
        }
    }
}

impl BridgeConfig {
    /// Linear memory ceiling in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * crate::memory::PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_memory_pages, 1024);
        assert_eq!(config.max_memory_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.fuel_limit, None);
        assert_eq!(config.decoder_threshold, 2_146_435_072);
        assert!(config.enable_finalizers);
        assert_eq!(config.max_microtasks, 1_000_000);
    }
}
