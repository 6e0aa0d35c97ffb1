//! Module for application configuration settings.
//!
//! What to mount comes from the command line. How to mount it may additionally be tuned through
//! a TOML configuration file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use compressfs::codec::Codec;
use compressfs::fs::OpenPolicy;

fn default_fs_name() -> String {
    "compressfs".to_owned()
}

const fn default_attr_ttl_secs() -> u64 {
    1
}

const MAX_ATTR_TTL_SECS: u64 = 3600;

/// Mount-time options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfig {
    /// The filesystem name shown in the mount table.
    #[serde(default = "default_fs_name")]
    pub fs_name: String,

    /// Let users other than the mounting user access the filesystem.
    #[serde(default)]
    pub allow_other: bool,

    /// How long the kernel may cache attributes and entries, in seconds.
    #[serde(default = "default_attr_ttl_secs")]
    pub attr_ttl_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: default_fs_name(),
            allow_other: false,
            attr_ttl_secs: default_attr_ttl_secs(),
        }
    }
}

/// The cache configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// How concurrent opens of the same file are arbitrated.
    #[serde(default)]
    pub open_policy: OpenPolicy,
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The directory holding compressed files.
    #[serde(skip)]
    pub backend: PathBuf,

    /// The mount point for the filesystem.
    #[serde(skip)]
    pub mount_point: PathBuf,

    /// The codec the backend was populated with.
    #[serde(skip, default = "default_codec")]
    pub codec: Codec,

    #[serde(default)]
    pub mount: MountConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

const fn default_codec() -> Codec {
    Codec::Zlib
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// A configuration with default tunables for mounting `backend` at `mount_point`.
    #[must_use]
    pub fn new(backend: PathBuf, mount_point: PathBuf, codec: Codec) -> Self {
        Self {
            backend,
            mount_point,
            codec,
            mount: MountConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.backend.is_dir() {
            errors.push(format!(
                "Backend '{}' is not an existing directory.",
                self.backend.display()
            ));
        }

        if let (Ok(backend), Ok(mount_point)) =
            (self.backend.canonicalize(), self.mount_point.canonicalize())
        {
            if mount_point.starts_with(&backend) {
                errors.push(format!(
                    "Mount point '{}' must not be inside the backend '{}'.",
                    self.mount_point.display(),
                    self.backend.display()
                ));
            }
        }

        if self.mount.fs_name.is_empty() || self.mount.fs_name.contains(',') {
            errors.push(format!(
                "Filesystem name '{}' must be non-empty and must not contain commas.",
                self.mount.fs_name
            ));
        }

        if self.mount.attr_ttl_secs > MAX_ATTR_TTL_SECS {
            errors.push(format!(
                "Attribute TTL of {}s exceeds the maximum of {MAX_ATTR_TTL_SECS}s.",
                self.mount.attr_ttl_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Loads the tunables from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build the configuration for one mount, reading tunables from `config_path` if given.
    pub fn load(
        backend: PathBuf,
        mount_point: PathBuf,
        codec: Codec,
        config_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let tunables = match config_path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::new(PathBuf::new(), PathBuf::new(), codec),
        };

        let config = Self {
            backend,
            mount_point,
            codec,
            ..tunables
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn tunables_parse_from_kebab_case_toml() {
        let config: Config = toml::from_str(
            r#"
            [mount]
            fs-name = "archive"
            allow-other = true

            [cache]
            open-policy = "shared"
            "#,
        )
        .unwrap();

        assert_eq!(config.mount.fs_name, "archive");
        assert!(config.mount.allow_other);
        assert_eq!(config.mount.attr_ttl_secs, 1);
        assert_eq!(config.cache.open_policy, OpenPolicy::Shared);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mount, MountConfig::default());
        assert_eq!(config.cache.open_policy, OpenPolicy::Exclusive);
    }

    #[test]
    fn validation_reports_every_problem() {
        let backend = tempfile::tempdir().unwrap();
        let mut config = Config::new(
            backend.path().to_path_buf(),
            backend.path().join("mnt"),
            Codec::Gzip,
        );
        std::fs::create_dir(&config.mount_point).unwrap();
        config.mount.fs_name = String::new();
        config.mount.attr_ttl_secs = 10_000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn missing_backend_is_invalid() {
        let config = Config::new(
            PathBuf::from("/definitely/not/here"),
            PathBuf::from("/tmp/mnt"),
            Codec::Lzw,
        );
        assert!(config.validate().is_err());
    }
}
