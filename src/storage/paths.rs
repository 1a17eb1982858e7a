// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! URL → local path mapping.
//!
//! File names are the hex SHA-256 of the full URL, plus the extension of the
//! URL's last path segment when it has a short alphanumeric one. Distinct
//! URLs never share a name.

use std::path::{Path, PathBuf};

use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{ProxyError, ProxyResult};

const MAX_EXTENSION_LEN: usize = 8;

/// Maps remote URLs into one target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPaths {
    directory: PathBuf,
}

impl LocalPaths {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Canonical local path for `url`, whether or not the file exists.
    pub fn local_path(&self, url: &Url) -> ProxyResult<PathBuf> {
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(ProxyError::InvalidUrl(url.to_string()));
        }
        let digest = Sha256::digest(url.as_str().as_bytes());
        let mut name = hex::encode(digest);
        if let Some(ext) = extension(url) {
            name.push('.');
            name.push_str(&ext);
        }
        Ok(self.directory.join(name))
    }

    /// Local path for `url` if a regular file is already there.
    pub fn existing(&self, url: &Url) -> Option<PathBuf> {
        self.local_path(url).ok().filter(|p| p.is_file())
    }
}

fn extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// `file://` URL for a local path. Relative paths are resolved against the
/// working directory.
pub fn file_url(path: &Path) -> ProxyResult<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| ProxyError::io("Failed to read working directory", e))?
            .join(path)
    };
    Url::from_file_path(&absolute)
        .map_err(|_| ProxyError::InvalidUrl(absolute.display().to_string()))
}
