// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Proxy configuration.
//!
//! A proxy is identified by a name; its files live in one directory per
//! name. Configuration can be built in code, loaded from a JSON file, and
//! overridden from the environment (`FILEPROXY_DIR`, `FILEPROXY_MAX_BYTES`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default storage budget: 512 MiB.
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

/// Default number of concurrent tasks a single session may carry.
pub const DEFAULT_MAX_TASKS_PER_SESSION: usize = 4;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Configuration for one [`DownloadProxy`](crate::DownloadProxy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy name. Also the leaf name of the default directory.
    pub identifier: String,
    /// Target directory holding the materialized files. Left out of a
    /// config file, it is derived from `identifier`.
    #[serde(default)]
    pub directory: PathBuf,
    /// Total on-disk budget in bytes.
    pub max_bytes: u64,
    /// Concurrent transfers allowed per transport session.
    pub max_tasks_per_session: usize,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// How long to wait for the cross-process directory lock.
    pub lock_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl ProxyConfig {
    /// Create a configuration with defaults for the given proxy name.
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            directory: Self::default_directory(&identifier),
            identifier,
            max_bytes: DEFAULT_MAX_BYTES,
            max_tasks_per_session: DEFAULT_MAX_TASKS_PER_SESSION,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }

    /// `<cache dir>/fileproxy/<identifier>`, falling back to the working directory.
    pub fn default_directory(identifier: &str) -> PathBuf {
        dirs::cache_dir()
            .map(|c| c.join("fileproxy").join(identifier))
            .unwrap_or_else(|| PathBuf::from(".fileproxy").join(identifier))
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_tasks_per_session(mut self, max_tasks: usize) -> Self {
        self.max_tasks_per_session = max_tasks;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Staging area for bodies in transit: a hidden sibling of `directory`,
    /// so partial files never count against the budget.
    pub fn temp_directory(&self) -> PathBuf {
        let name = self
            .directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.identifier.clone());
        self.directory.with_file_name(format!(".{}-partial", name))
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ProxyConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config.validated())
    }

    /// Save the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize config to JSON")?;
        fs::write(path, content).with_context(|| format!("Failed to write config: {:?}", path))
    }

    /// Apply `FILEPROXY_DIR` and `FILEPROXY_MAX_BYTES` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("FILEPROXY_DIR") {
            if !dir.is_empty() {
                self.directory = PathBuf::from(dir);
            }
        }
        if let Ok(raw) = std::env::var("FILEPROXY_MAX_BYTES") {
            match raw.parse::<u64>() {
                Ok(bytes) => self.max_bytes = bytes,
                Err(_) => tracing::warn!(
                    "CONFIG | ignoring FILEPROXY_MAX_BYTES={:?}: not a byte count",
                    raw
                ),
            }
        }
        self.validated()
    }

    /// Clamp values that would make the proxy unusable.
    pub fn validated(mut self) -> Self {
        if self.max_tasks_per_session == 0 {
            tracing::warn!("CONFIG | max_tasks_per_session=0 is not usable, clamped to 1");
            self.max_tasks_per_session = 1;
        }
        if self.identifier.is_empty() {
            tracing::warn!("CONFIG | empty identifier replaced with \"default\"");
            self.identifier = "default".to_string();
        }
        if self.directory.as_os_str().is_empty() {
            self.directory = Self::default_directory(&self.identifier);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::new("images");
        assert_eq!(config.identifier, "images");
        assert!(config.directory.ends_with("images"));
        assert_eq!(config.max_tasks_per_session, DEFAULT_MAX_TASKS_PER_SESSION);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_temp_directory_is_sibling() {
        let config = ProxyConfig::new("x").with_directory("/cache/fileproxy/images");
        assert_eq!(
            config.temp_directory(),
            PathBuf::from("/cache/fileproxy/.images-partial")
        );
    }

    #[test]
    fn test_zero_tasks_clamped() {
        let config = ProxyConfig::new("x").with_max_tasks_per_session(0).validated();
        assert_eq!(config.max_tasks_per_session, 1);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("proxy.json");
        let config = ProxyConfig::new("videos")
            .with_directory(temp_dir.path().join("videos"))
            .with_max_bytes(1024);

        config.save(&path).expect("save should succeed");
        let loaded = ProxyConfig::load(&path).expect("load should succeed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("proxy.json");
        fs::write(&path, r#"{"identifier": "docs", "max_bytes": 10}"#).unwrap();

        let loaded = ProxyConfig::load(&path).expect("load should succeed");
        assert_eq!(loaded.identifier, "docs");
        assert_eq!(loaded.max_bytes, 10);
        assert_eq!(loaded.max_tasks_per_session, DEFAULT_MAX_TASKS_PER_SESSION);
        assert!(loaded.directory.ends_with("docs"));
    }

    #[test]
    fn test_files_without_directory_do_not_share_one() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let docs = temp_dir.path().join("docs.json");
        let media = temp_dir.path().join("media.json");
        fs::write(&docs, r#"{"identifier": "docs"}"#).unwrap();
        fs::write(&media, r#"{"identifier": "media"}"#).unwrap();

        let docs = ProxyConfig::load(&docs).expect("load should succeed");
        let media = ProxyConfig::load(&media).expect("load should succeed");
        assert_ne!(docs.directory, media.directory);
        assert_eq!(media.directory, ProxyConfig::default_directory("media"));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("proxy.json");
        fs::write(&path, "not json").unwrap();
        assert!(ProxyConfig::load(&path).is_err());
    }
}
