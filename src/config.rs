use std::path::{Path, PathBuf};

use crate::codec::CodecId;

/// Configuration for one column region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Region name, also the overflow file prefix.
    name: String,

    /// Compression codec for this region's values (default: lz4).
    codec: CodecId,

    /// Directory for the overflow store. Without one the region keeps
    /// everything in memory and eviction has nowhere to spill.
    overflow_dir: Option<PathBuf>,
}

impl RegionConfig {
    /// Create a new config for the named region.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codec: CodecId::DEFAULT,
            overflow_dir: None,
        }
    }

    /// Set the compression codec.
    pub fn codec(mut self, codec: CodecId) -> Self {
        self.codec = codec;
        self
    }

    /// Set the overflow directory.
    pub fn overflow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overflow_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn codec_id(&self) -> CodecId {
        self.codec
    }

    pub(crate) fn overflow_path(&self) -> Option<&Path> {
        self.overflow_dir.as_deref()
    }

    /// The same config without an overflow directory.
    pub fn overflow_dir_cleared(mut self) -> Self {
        self.overflow_dir = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegionConfig::new("orders");
        assert_eq!(config.name(), "orders");
        assert_eq!(config.codec_id(), CodecId::Lz4);
        assert!(config.overflow_path().is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = RegionConfig::new("orders")
            .codec(CodecId::Zstd)
            .overflow_dir("/tmp/orders-overflow");

        assert_eq!(config.codec_id(), CodecId::Zstd);
        assert_eq!(
            config.overflow_path(),
            Some(Path::new("/tmp/orders-overflow"))
        );
        assert!(config.overflow_dir_cleared().overflow_path().is_none());
    }
}
