// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Storage budget and validated eviction for the target directory.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use super::lock::DirectoryLock;
use super::paths::LocalPaths;
use crate::error::{ProxyError, ProxyResult};
use crate::locks::resilient_lock;

/// Enforces the byte budget and fences directory mutations.
#[derive(Debug)]
pub struct StorageGuard {
    paths: LocalPaths,
    max_bytes: u64,
    lock_path: PathBuf,
    lock_timeout: Duration,
    /// In-process side of the directory fence.
    mutation: Mutex<()>,
}

/// Both halves of the directory fence. Field order drops the file lock first.
struct MutationGuard<'a> {
    _file: DirectoryLock,
    _local: MutexGuard<'a, ()>,
}

impl StorageGuard {
    pub fn new(paths: LocalPaths, max_bytes: u64, lock_timeout: Duration) -> Self {
        let lock_path = DirectoryLock::path_for(paths.directory());
        Self {
            paths,
            max_bytes,
            lock_path,
            lock_timeout,
            mutation: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &LocalPaths {
        &self.paths
    }

    /// Create the target directory if needed.
    pub fn prepare(&self) -> ProxyResult<()> {
        fs::create_dir_all(self.paths.directory())
            .map_err(|e| ProxyError::io("Failed to create target directory", e))
    }

    fn fence(&self) -> ProxyResult<MutationGuard<'_>> {
        let local = resilient_lock(&self.mutation);
        let file = DirectoryLock::acquire(&self.lock_path, self.lock_timeout)?;
        Ok(MutationGuard {
            _file: file,
            _local: local,
        })
    }

    /// Regular files (and links to them) currently in the target directory.
    pub fn files(&self) -> ProxyResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.paths.directory()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProxyError::io("Failed to list target directory", e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ProxyError::io("Failed to read directory entry", e))?;
            if entry
                .file_type()
                .map(|t| t.is_file() || t.is_symlink())
                .unwrap_or(false)
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Bytes consumed by the target directory.
    pub fn total_bytes(&self) -> ProxyResult<u64> {
        let mut total = 0u64;
        for path in self.files()? {
            let size = fs::metadata(&path)
                .map(|m| m.len())
                .map_err(|_| ProxyError::FileSizeUnavailable { path: path.clone() })?;
            total = total.saturating_add(size);
        }
        Ok(total)
    }

    /// Fail with `BudgetExceeded` when nothing is left of the budget.
    ///
    /// Returns the bytes still available.
    pub fn check_budget(&self) -> ProxyResult<u64> {
        let used = self.total_bytes()?;
        let available = self.max_bytes as i128 - used as i128;
        if available <= 0 {
            tracing::warn!(
                "BUDGET_EXCEEDED | dir={:?} used={} max={}",
                self.paths.directory(),
                used,
                self.max_bytes
            );
            return Err(ProxyError::BudgetExceeded {
                deficit: (-available) as u64,
            });
        }
        Ok(available as u64)
    }

    /// Delete `path` if `validate` approves of its modification time.
    ///
    /// Declining is not an error. Returns whether the file was deleted.
    /// `validate` runs outside the directory fence.
    pub fn remove<F>(&self, path: &Path, validate: F) -> ProxyResult<bool>
    where
        F: Fn(&Path, DateTime<Utc>) -> bool,
    {
        let Some(modified) = modified_at(path)? else {
            return Ok(false);
        };
        if !validate(path, modified) {
            tracing::debug!("FILE_KEPT | path={:?} modified={}", path, modified);
            return Ok(false);
        }

        let _fence = self.fence()?;
        // The file may have been replaced while the validator ran.
        if modified_at(path)? != Some(modified) {
            tracing::debug!("FILE_CHANGED | path={:?} skipped", path);
            return Ok(false);
        }
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::info!("FILE_REMOVED | path={:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProxyError::io(format!("Failed to remove {:?}", path), e)),
        }
    }

    /// Apply [`remove`](Self::remove) to every file. Returns the number deleted.
    pub fn remove_all<F>(&self, validate: F) -> ProxyResult<usize>
    where
        F: Fn(&Path, DateTime<Utc>) -> bool,
    {
        self.remove_all_except(&HashSet::new(), validate)
    }

    /// Apply [`remove`](Self::remove) to every file not in `keep`.
    pub fn remove_all_except<F>(&self, keep: &HashSet<PathBuf>, validate: F) -> ProxyResult<usize>
    where
        F: Fn(&Path, DateTime<Utc>) -> bool,
    {
        let mut removed = 0;
        for path in self.files()? {
            if keep.contains(&path) {
                continue;
            }
            if self.remove(&path, &validate)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Move a finished download into place, replacing any previous file.
    pub fn store(&self, temporary: &Path, destination: &Path) -> ProxyResult<()> {
        let _fence = self.fence()?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProxyError::io("Failed to create target directory", e))?;
        }
        if fs::rename(temporary, destination).is_err() {
            // Cross-device: copy then drop the original.
            fs::copy(temporary, destination)
                .map_err(|e| ProxyError::io("Failed to move download into place", e))?;
            let _ = fs::remove_file(temporary);
        }
        tracing::debug!("FILE_STORED | path={:?}", destination);
        Ok(())
    }
}

/// Modification time, or `None` if the file does not exist.
fn modified_at(path: &Path) -> ProxyResult<Option<DateTime<Utc>>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ProxyError::io(format!("Failed to stat {:?}", path), e)),
    };
    let modified: SystemTime = metadata
        .modified()
        .map_err(|e| ProxyError::io(format!("Modification time unavailable for {:?}", path), e))?;
    Ok(Some(DateTime::<Utc>::from(modified)))
}
