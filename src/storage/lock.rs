// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-process lock for the target directory.
//!
//! The lock file sits next to the directory (`<dir>.lock`), never inside it,
//! so it does not count against the budget and survives `remove_all`.
//! Within one process, callers serialize on a mutex first; this lock only
//! fences other processes sharing the same directory.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{ProxyError, ProxyResult};

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct DirectoryLock {
    file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Lock file path for a target directory.
    pub fn path_for(directory: &Path) -> PathBuf {
        let mut name = directory
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "fileproxy".into());
        name.push(".lock");
        directory.with_file_name(name)
    }

    /// Acquire an exclusive lock, retrying until `timeout` expires.
    pub fn acquire(path: &Path, timeout: Duration) -> ProxyResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::io("Failed to create directory for lock file", e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ProxyError::io(format!("Failed to open lock file {:?}", path), e))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(ProxyError::io(
                            format!(
                                "Timed out waiting for directory lock {:?} after {:?}. \
                                 Another process may be modifying the directory",
                                path, timeout
                            ),
                            e,
                        ));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(ProxyError::io(
                        format!("Failed to acquire directory lock {:?}", path),
                        e,
                    ));
                }
            }
        }
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("DIRECTORY_UNLOCK_FAILED | lock={:?} error={}", self.path, e);
        }
    }
}
