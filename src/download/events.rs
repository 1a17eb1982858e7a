// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport events → observer callbacks.
//!
//! Runs on whatever thread the transport emits from. Events reaching an
//! invalidated proxy are dropped; a dropped challenge reply means default
//! handling.

use std::path::Path;

use reqwest::Url;

use super::manager::ProxyInner;
use crate::error::ProxyError;
use crate::transport::{ChallengeDisposition, EventHandler, SessionEvent};

impl EventHandler for ProxyInner {
    fn handle_event(&self, session: &str, event: SessionEvent) {
        if !self.is_active() {
            tracing::debug!("EVENT_IGNORED | session={} proxy invalidated", session);
            return;
        }

        match event {
            SessionEvent::Progress {
                url,
                bytes_written,
                total_written,
                total_expected,
                ..
            } => {
                if self.enforce_cellular_policy(session) {
                    return;
                }
                if let Some(observer) = self.observer() {
                    observer.on_progress(&url, bytes_written, total_written, total_expected);
                }
            }
            SessionEvent::Challenge {
                url,
                challenge,
                reply,
                ..
            } => {
                let disposition = self
                    .observer()
                    .map(|o| o.on_challenge(&url, &challenge))
                    .unwrap_or_default();
                tracing::debug!(
                    "AUTH_CHALLENGE | session={} url={} scheme={} answer={}",
                    session,
                    url,
                    challenge.scheme,
                    disposition_label(&disposition)
                );
                // The transport may have given up waiting.
                let _ = reply.send(disposition);
            }
            SessionEvent::DownloadFinished {
                url,
                status,
                location,
                ..
            } => self.finish_download(url.as_ref(), status, &location),
            SessionEvent::Completed { task, url, error } => {
                let Some(error) = error else {
                    return;
                };
                tracing::warn!(
                    "DOWNLOAD_ERROR | session={} task={} url={:?} error={}",
                    session,
                    task,
                    url.as_ref().map(Url::as_str),
                    error
                );
                if let Some(observer) = self.observer() {
                    observer.on_error(url.as_ref(), Some(&error));
                }
            }
            SessionEvent::SessionInvalid { error } => {
                match &error {
                    Some(e) => tracing::warn!("SESSION_INVALID | session={} error={}", session, e),
                    None => tracing::debug!("SESSION_INVALID | session={}", session),
                }
                self.registry.remove([session]);
            }
            SessionEvent::AllEventsDelivered => {
                tracing::info!("SESSION_EVENTS_DELIVERED | session={}", session);
                self.registry.remove([session]);
            }
        }
    }
}

impl ProxyInner {
    /// Retire `session` if it may use cellular data and the observer no
    /// longer allows it. Returns whether it was retired.
    fn enforce_cellular_policy(&self, session: &str) -> bool {
        let Some(current) = self.registry.get(session) else {
            return false;
        };
        if current.handle.config().allows_cellular_access && !self.allows_cellular_access() {
            tracing::warn!(
                "SESSION_CELLULAR_REVOKED | session={} retiring mid-transfer",
                session
            );
            self.registry.remove([session]);
            return true;
        }
        false
    }

    /// Move a finished body into place and tell the observer how it went.
    fn finish_download(&self, url: Option<&Url>, status: u16, location: &Path) {
        let observer = self.observer();

        let Some(url) = url else {
            tracing::warn!("DOWNLOAD_REJECTED | reason=no originating url");
            if let Some(observer) = &observer {
                observer.on_error(None, None);
            }
            return;
        };
        let destination = match self.storage.paths().local_path(url) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("DOWNLOAD_REJECTED | url={} error={}", url, e);
                if let Some(observer) = &observer {
                    observer.on_error(None, Some(&e));
                }
                return;
            }
        };
        if !(200..300).contains(&status) {
            let error = ProxyError::HttpStatus(status);
            tracing::warn!("DOWNLOAD_REJECTED | url={} status={}", url, status);
            if let Some(observer) = &observer {
                observer.on_failure(url, &error);
            }
            return;
        }

        match self.storage.store(location, &destination) {
            Ok(()) => {
                tracing::info!("DOWNLOAD_COMPLETE | url={} path={:?}", url, destination);
                if let Some(observer) = &observer {
                    observer.on_success(url, &destination);
                }
            }
            Err(e) => {
                tracing::error!("DOWNLOAD_STORE_FAILED | url={} error={}", url, e);
                if let Some(observer) = &observer {
                    observer.on_failure(url, &e);
                }
            }
        }
    }
}

/// Log label that never includes credentials.
fn disposition_label(disposition: &ChallengeDisposition) -> &'static str {
    match disposition {
        ChallengeDisposition::PerformDefaultHandling => "default",
        ChallengeDisposition::UseCredential(_) => "credential",
        ChallengeDisposition::CancelAuthenticationChallenge => "cancel",
        ChallengeDisposition::RejectProtectionSpace => "reject",
    }
}
