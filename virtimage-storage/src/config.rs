//! Configuration for the image backend layer.
//!
//! Supports loading from YAML files with sensible defaults. Only the keys
//! this layer consumes are defined here; the surrounding service owns the
//! rest of its configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StorageError};

/// Default root directory for per-instance image directories.
pub const DEFAULT_INSTANCES_PATH: &str = "/var/lib/virtimage/instances";

/// Default volume group holding instance logical volumes.
pub const DEFAULT_VOLUME_GROUP: &str = "virtimage-volumes";

/// Image backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Storage backend for instance disk images: `raw`, `qcow`, `lvm`, or
    /// `legacy` (which defers to `use_cow_images`).
    pub local_images_type: String,

    /// In `legacy` mode, whether instance images are copy-on-write.
    pub use_cow_images: bool,

    /// Volume group holding instance logical volumes (`lvm` backend only).
    pub lvm_volume_group: String,

    /// Root directory for per-instance image directories (file backends).
    pub instances_path: PathBuf,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            local_images_type: "legacy".to_string(),
            use_cow_images: true,
            lvm_volume_group: DEFAULT_VOLUME_GROUP.to_string(),
            instances_path: PathBuf::from(DEFAULT_INSTANCES_PATH),
        }
    }
}

impl ImagesConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| {
            StorageError::Configuration(format!("{}: {}", path.display(), e))
        })
    }

    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ImagesConfig::default();
        assert_eq!(config.local_images_type, "legacy");
        assert!(config.use_cow_images);
        assert_eq!(config.instances_path, PathBuf::from(DEFAULT_INSTANCES_PATH));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ImagesConfig =
            serde_yaml::from_str("local_images_type: lvm\nlvm_volume_group: vg0\n").unwrap();
        assert_eq!(config.local_images_type, "lvm");
        assert_eq!(config.lvm_volume_group, "vg0");
        assert!(config.use_cow_images);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = ImagesConfig::load_or_default(Path::new("/nonexistent/images.yaml")).unwrap();
        assert_eq!(config.local_images_type, "legacy");
    }
}
