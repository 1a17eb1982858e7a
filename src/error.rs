// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for fileproxy.
//!
//! Only recoverable conditions live here. Internal invariant violations
//! (duplicate session identifiers, calls after `invalidate()`) panic instead.

use std::path::PathBuf;

/// Errors returned by the proxy, the storage guard, and the transports.
#[derive(Debug)]
pub enum ProxyError {
    /// The URL cannot be mapped to a local path.
    InvalidUrl(String),
    /// Starting another download would exceed the storage budget.
    BudgetExceeded {
        /// Bytes over budget (0 when usage sits exactly at the limit).
        deficit: u64,
    },
    /// The filesystem did not report a size for an entry.
    FileSizeUnavailable { path: PathBuf },
    /// Server answered outside 200-299.
    HttpStatus(u16),
    /// Network or protocol failure reported by the transport.
    Transport(String),
    /// The task was cancelled before it finished.
    Cancelled,
    /// The session carrying the task was invalidated.
    SessionInvalidated(String),
    /// Filesystem failure.
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl ProxyError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if the caller can free space and retry.
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. })
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(url) => write!(f, "Invalid URL: {}", url),
            Self::BudgetExceeded { deficit } => {
                write!(f, "Download budget exceeded by {} bytes", deficit)
            }
            Self::FileSizeUnavailable { path } => {
                write!(f, "File size unavailable for {}", path.display())
            }
            Self::HttpStatus(code) => write!(f, "Unexpected HTTP status {}", code),
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::Cancelled => write!(f, "Download cancelled"),
            Self::SessionInvalidated(id) => write!(f, "Session {} was invalidated", id),
            Self::Io { context, source } => write!(f, "{}: {}", context, source),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result alias used across the crate.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_budget_display() {
        let err = ProxyError::BudgetExceeded { deficit: 42 };
        assert_eq!(err.to_string(), "Download budget exceeded by 42 bytes");
        assert!(err.is_budget_exceeded());
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = ProxyError::io(
            "Failed to move download",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().starts_with("Failed to move download"));
        assert!(err.source().is_some());
        assert!(!err.is_budget_exceeded());
    }

    #[test]
    fn test_http_status_display() {
        assert_eq!(ProxyError::HttpStatus(404).to_string(), "Unexpected HTTP status 404");
    }
}
