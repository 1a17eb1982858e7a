// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transport abstraction.
//!
//! A [`Transport`] creates [`TransportSession`]s. Each session runs download
//! tasks on its own workers and reports everything that happens to them as a
//! [`SessionEvent`] through the session's [`EventSink`]. The proxy never sees
//! transport-specific callback shapes, only this enum.
//!
//! ```text
//! ┌──────────────┐ start_download ┌──────────────────┐
//! │ DownloadProxy│───────────────▶│ TransportSession │
//! │ (EventHandler│◀───────────────│ (worker tasks)   │
//! └──────────────┘  SessionEvent  └──────────────────┘
//! ```
//!
//! Two implementations ship with the crate: [`http::HttpTransport`] (reqwest)
//! and [`memory::MemoryTransport`] (scripted, in-process).

pub mod http;
pub mod memory;

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::Url;
use tokio::sync::oneshot;

use crate::error::ProxyError;

/// Identifier of a download task, unique within its transport.
pub type TaskId = u64;

/// An in-flight task as reported live by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    /// URL of the originating request.
    pub url: Url,
}

/// Optional per-task hints passed through to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskHints {
    pub expected_bytes_to_send: Option<u64>,
    pub expected_bytes_to_receive: Option<u64>,
    /// Do not begin the transfer before this instant.
    pub earliest_begin: Option<DateTime<Utc>>,
}

/// A request to fetch `url` into a temporary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Url,
    pub hints: TaskHints,
}

/// Configuration a session was created with. Sessions echo it back so the
/// proxy can compare it against the current observer policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub identifier: String,
    /// Named session expected to outlive the requesting process.
    pub background: bool,
    pub allows_cellular_access: bool,
    pub is_discretionary: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Where the transport writes bodies before they are handed over.
    pub temp_directory: PathBuf,
}

/// Authentication challenge raised by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Scheme from `WWW-Authenticate` (e.g. `Basic`).
    pub scheme: String,
    pub realm: Option<String>,
    /// Credentials already rejected for this task.
    pub previous_failures: u32,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value such as `Basic realm="files"`.
    pub fn parse(header: &str, previous_failures: u32) -> Option<Self> {
        let header = header.trim();
        if header.is_empty() {
            return None;
        }
        let (scheme, params) = match header.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (header, ""),
        };
        let realm = params.split(',').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            if key.trim().eq_ignore_ascii_case("realm") {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        });
        Some(Self {
            scheme: scheme.to_string(),
            realm,
            previous_failures,
        })
    }
}

/// User/password pair answered to a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

/// How the transport should proceed after a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChallengeDisposition {
    /// Let the transport do what it would do without a handler.
    #[default]
    PerformDefaultHandling,
    UseCredential(Credential),
    /// Abort the task.
    CancelAuthenticationChallenge,
    /// Decline this protection space; the response is delivered as-is.
    RejectProtectionSpace,
}

/// Everything a session can report about its tasks and itself.
#[derive(Debug)]
pub enum SessionEvent {
    /// A chunk of body was written.
    Progress {
        task: TaskId,
        url: Url,
        bytes_written: u64,
        total_written: u64,
        total_expected: Option<u64>,
    },
    /// The server asked for credentials. The transport waits on `reply`;
    /// dropping it means default handling.
    Challenge {
        task: TaskId,
        url: Url,
        challenge: AuthChallenge,
        reply: oneshot::Sender<ChallengeDisposition>,
    },
    /// The body is complete at `location`. The file is only guaranteed to
    /// exist until the handler returns.
    DownloadFinished {
        task: TaskId,
        url: Option<Url>,
        status: u16,
        location: PathBuf,
    },
    /// The task ended, with or without an error.
    Completed {
        task: TaskId,
        url: Option<Url>,
        error: Option<ProxyError>,
    },
    /// The session can no longer carry tasks.
    SessionInvalid { error: Option<ProxyError> },
    /// A background session has delivered every pending event.
    AllEventsDelivered,
}

/// Receiver of session events. Implemented by the proxy.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, session: &str, event: SessionEvent);
}

/// Per-session handle used by transports to deliver events.
///
/// Holds the handler weakly, so a transport outliving its proxy just drops
/// events.
#[derive(Clone)]
pub struct EventSink {
    session: String,
    handler: Weak<dyn EventHandler>,
}

impl EventSink {
    pub fn new(session: impl Into<String>, handler: Weak<dyn EventHandler>) -> Self {
        Self {
            session: session.into(),
            handler,
        }
    }

    /// A sink that discards everything.
    pub fn detached(session: impl Into<String>) -> Self {
        let handler: Weak<dyn EventHandler> = Weak::<DetachedHandler>::new();
        Self::new(session, handler)
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Deliver an event on the calling thread.
    pub fn emit(&self, event: SessionEvent) {
        match self.handler.upgrade() {
            Some(handler) => handler.handle_event(&self.session, event),
            None => tracing::debug!(
                "EVENT_DROPPED | session={} event={:?}",
                self.session,
                event
            ),
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("session", &self.session)
            .field("attached", &(self.handler.strong_count() > 0))
            .finish()
    }
}

struct DetachedHandler;

impl EventHandler for DetachedHandler {
    fn handle_event(&self, _session: &str, _event: SessionEvent) {}
}

/// Factory for transport sessions.
pub trait Transport: Send + Sync {
    fn create_session(&self, config: SessionConfig, events: EventSink)
        -> Arc<dyn TransportSession>;
}

/// One transport session carrying zero or more download tasks.
pub trait TransportSession: Send + Sync {
    fn identifier(&self) -> &str;

    fn config(&self) -> &SessionConfig;

    /// Live list of in-flight tasks. Never cached by callers.
    fn tasks(&self) -> BoxFuture<'_, Vec<TaskInfo>>;

    /// Start fetching `request.url`. Returns immediately.
    fn start_download(&self, request: DownloadRequest) -> TaskId;

    fn cancel_task(&self, task: TaskId);

    /// Cancel every task and refuse new ones.
    fn invalidate_and_cancel(&self);
}
