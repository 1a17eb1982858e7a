// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Observer interface implemented by the embedding application.

use std::path::Path;

use chrono::{DateTime, Utc};
use reqwest::Url;

use crate::error::ProxyError;
use crate::transport::{AuthChallenge, ChallengeDisposition};

/// Receives transfer events and answers policy questions.
///
/// Every method has a safe default. Callbacks for different sessions may
/// arrive interleaved on different threads.
pub trait ProxyObserver: Send + Sync {
    /// The server asked for credentials.
    fn on_challenge(&self, _url: &Url, _challenge: &AuthChallenge) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }

    fn on_progress(
        &self,
        _url: &Url,
        _bytes_written: u64,
        _total_written: u64,
        _total_expected: Option<u64>,
    ) {
    }

    /// `url` is now available at `local_path`.
    fn on_success(&self, _url: &Url, _local_path: &Path) {}

    /// A task ended with a transport error, or its URL could not be mapped.
    fn on_error(&self, _url: Option<&Url>, _error: Option<&ProxyError>) {}

    /// A finished download was rejected (HTTP status, move failure).
    fn on_failure(&self, _url: &Url, _error: &ProxyError) {}

    /// May the file at `url` (a `file://` URL) be deleted? Defaults to never.
    fn validate_removal(&self, _url: &Url, _modified_at: DateTime<Utc>) -> bool {
        false
    }

    fn allows_cellular_access(&self) -> bool {
        false
    }

    fn is_discretionary(&self) -> bool {
        true
    }
}

/// Observer that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProxyObserver for NoopObserver {}
