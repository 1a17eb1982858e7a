// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted in-process transport.
//!
//! Tasks never make progress on their own: the owner drives them with
//! [`MemoryTransport::progress`], [`MemoryTransport::finish`] and friends.
//! Events are emitted on the calling thread, outside of any transport lock.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use reqwest::Url;
use tokio::sync::oneshot;

use super::{
    AuthChallenge, ChallengeDisposition, DownloadRequest, EventSink, SessionConfig, SessionEvent,
    TaskId, TaskInfo, Transport, TransportSession,
};
use crate::error::{ProxyError, ProxyResult};
use crate::locks::resilient_lock;

/// Transport whose sessions only change state when told to.
pub struct MemoryTransport {
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    next_task: Arc<AtomicU64>,
    /// Where finished bodies are staged before being handed to the proxy.
    scratch: PathBuf,
}

impl MemoryTransport {
    pub fn new(scratch: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            next_task: Arc::new(AtomicU64::new(1)),
            scratch: scratch.into(),
        })
    }

    /// Every session ever created, invalidated ones included.
    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        resilient_lock(&self.sessions).clone()
    }

    /// Sessions that still accept tasks.
    pub fn live_sessions(&self) -> Vec<Arc<MemorySession>> {
        self.sessions()
            .into_iter()
            .filter(|s| !s.is_invalidated())
            .collect()
    }

    pub fn session(&self, identifier: &str) -> Option<Arc<MemorySession>> {
        self.sessions()
            .into_iter()
            .rev()
            .find(|s| s.config.identifier == identifier)
    }

    /// In-flight tasks for `url` across all sessions.
    pub fn tasks_for(&self, url: &Url) -> usize {
        self.sessions()
            .iter()
            .map(|s| s.snapshot().iter().filter(|t| &t.url == url).count())
            .sum()
    }

    pub fn total_tasks(&self) -> usize {
        self.sessions().iter().map(|s| s.task_count()).sum()
    }

    /// Total `start_download` calls across all sessions.
    pub fn started(&self) -> usize {
        self.sessions().iter().map(|s| s.started()).sum()
    }

    fn locate(&self, url: &Url) -> Option<(Arc<MemorySession>, TaskId)> {
        self.sessions().into_iter().find_map(|session| {
            let task = session.snapshot().into_iter().find(|t| &t.url == url)?;
            Some((session, task.id))
        })
    }

    /// Report progress on the first task fetching `url`.
    pub fn progress(&self, url: &Url, bytes_written: u64, total_expected: Option<u64>) -> bool {
        let Some((session, task)) = self.locate(url) else {
            return false;
        };
        let total_written = session.record_written(task, bytes_written);
        session.events.emit(SessionEvent::Progress {
            task,
            url: url.clone(),
            bytes_written,
            total_written,
            total_expected,
        });
        true
    }

    /// Complete the first task fetching `url` with the given status and body.
    ///
    /// Returns `Ok(false)` when no such task exists.
    pub fn finish(&self, url: &Url, status: u16, body: &[u8]) -> ProxyResult<bool> {
        let Some((session, task)) = self.locate(url) else {
            return Ok(false);
        };
        fs::create_dir_all(&self.scratch)
            .map_err(|e| ProxyError::io("Failed to create scratch directory", e))?;
        let location = self.scratch.join(format!("task-{}.download", task));
        fs::write(&location, body).map_err(|e| ProxyError::io("Failed to stage body", e))?;

        session.take_task(task);
        session.events.emit(SessionEvent::DownloadFinished {
            task,
            url: Some(url.clone()),
            status,
            location: location.clone(),
        });
        if location.exists() {
            let _ = fs::remove_file(&location);
        }
        session.events.emit(SessionEvent::Completed {
            task,
            url: Some(url.clone()),
            error: None,
        });
        Ok(true)
    }

    /// Fail the first task fetching `url`.
    pub fn fail(&self, url: &Url, error: ProxyError) -> bool {
        let Some((session, task)) = self.locate(url) else {
            return false;
        };
        session.take_task(task);
        session.events.emit(SessionEvent::Completed {
            task,
            url: Some(url.clone()),
            error: Some(error),
        });
        true
    }

    /// Raise an authentication challenge on the first task fetching `url`
    /// and return the handler's answer.
    pub fn challenge(&self, url: &Url, challenge: AuthChallenge) -> Option<ChallengeDisposition> {
        let (session, task) = self.locate(url)?;
        let (reply, mut answer) = oneshot::channel();
        session.events.emit(SessionEvent::Challenge {
            task,
            url: url.clone(),
            challenge,
            reply,
        });
        Some(answer.try_recv().unwrap_or_default())
    }

    /// Invalidate a session from the transport side (lost credentials etc).
    pub fn invalidate_session(&self, identifier: &str, error: Option<ProxyError>) -> bool {
        let Some(session) = self.session(identifier) else {
            return false;
        };
        session.shutdown();
        session.events.emit(SessionEvent::SessionInvalid { error });
        true
    }

    /// Signal that a background session delivered all of its events.
    pub fn deliver_all_events(&self, identifier: &str) -> bool {
        let Some(session) = self.session(identifier) else {
            return false;
        };
        session.events.emit(SessionEvent::AllEventsDelivered);
        true
    }
}

impl Transport for MemoryTransport {
    fn create_session(
        &self,
        config: SessionConfig,
        events: EventSink,
    ) -> Arc<dyn TransportSession> {
        let session = Arc::new(MemorySession {
            config,
            events,
            tasks: Mutex::new(IndexMap::new()),
            next_task: Arc::clone(&self.next_task),
            started: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            invalidated: AtomicBool::new(false),
        });
        resilient_lock(&self.sessions).push(Arc::clone(&session));
        session
    }
}

struct MemoryTask {
    info: TaskInfo,
    request: DownloadRequest,
    written: u64,
}

/// Session created by [`MemoryTransport`].
pub struct MemorySession {
    config: SessionConfig,
    events: EventSink,
    tasks: Mutex<IndexMap<TaskId, MemoryTask>>,
    next_task: Arc<AtomicU64>,
    started: AtomicUsize,
    peak: AtomicUsize,
    invalidated: AtomicBool,
}

impl MemorySession {
    pub fn session_config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Vec<TaskInfo> {
        resilient_lock(&self.tasks)
            .values()
            .map(|t| t.info.clone())
            .collect()
    }

    /// Requests of the tasks currently in flight, hints included.
    pub fn requests(&self) -> Vec<DownloadRequest> {
        resilient_lock(&self.tasks)
            .values()
            .map(|t| t.request.clone())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        resilient_lock(&self.tasks).len()
    }

    /// Highest number of simultaneous tasks this session ever carried.
    pub fn peak_tasks(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    fn record_written(&self, task: TaskId, bytes: u64) -> u64 {
        let mut tasks = resilient_lock(&self.tasks);
        match tasks.get_mut(&task) {
            Some(entry) => {
                entry.written += bytes;
                entry.written
            }
            None => bytes,
        }
    }

    fn take_task(&self, task: TaskId) -> Option<TaskInfo> {
        resilient_lock(&self.tasks)
            .shift_remove(&task)
            .map(|t| t.info)
    }

    fn shutdown(&self) -> Vec<TaskInfo> {
        self.invalidated.store(true, Ordering::SeqCst);
        resilient_lock(&self.tasks)
            .drain(..)
            .map(|(_, t)| t.info)
            .collect()
    }
}

impl TransportSession for MemorySession {
    fn identifier(&self) -> &str {
        &self.config.identifier
    }

    fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn tasks(&self) -> BoxFuture<'_, Vec<TaskInfo>> {
        let snapshot = self.snapshot();
        Box::pin(async move {
            // Let sibling queries interleave like a real transport would.
            tokio::task::yield_now().await;
            snapshot
        })
    }

    fn start_download(&self, request: DownloadRequest) -> TaskId {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        if self.is_invalidated() {
            self.events.emit(SessionEvent::Completed {
                task: id,
                url: Some(request.url),
                error: Some(ProxyError::SessionInvalidated(self.config.identifier.clone())),
            });
            return id;
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        let info = TaskInfo {
            id,
            url: request.url.clone(),
        };
        let mut tasks = resilient_lock(&self.tasks);
        tasks.insert(
            id,
            MemoryTask {
                info,
                request,
                written: 0,
            },
        );
        self.peak.fetch_max(tasks.len(), Ordering::SeqCst);
        id
    }

    fn cancel_task(&self, task: TaskId) {
        if let Some(info) = self.take_task(task) {
            self.events.emit(SessionEvent::Completed {
                task,
                url: Some(info.url),
                error: Some(ProxyError::Cancelled),
            });
        }
    }

    fn invalidate_and_cancel(&self) {
        if self.invalidated.load(Ordering::SeqCst) {
            return;
        }
        for info in self.shutdown() {
            self.events.emit(SessionEvent::Completed {
                task: info.id,
                url: Some(info.url),
                error: Some(ProxyError::Cancelled),
            });
        }
        self.events.emit(SessionEvent::SessionInvalid { error: None });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(identifier: &str, temp: &std::path::Path) -> SessionConfig {
        SessionConfig {
            identifier: identifier.to_string(),
            background: false,
            allows_cellular_access: false,
            is_discretionary: true,
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            temp_directory: temp.to_path_buf(),
        }
    }

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            url: Url::parse(url).unwrap(),
            hints: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_tasks_reflect_starts_and_cancels() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let transport = MemoryTransport::new(temp_dir.path());
        let session = transport.create_session(
            config("s1", temp_dir.path()),
            EventSink::detached("s1"),
        );

        let a = session.start_download(request("http://host/a"));
        session.start_download(request("http://host/b"));
        assert_eq!(session.tasks().await.len(), 2);

        session.cancel_task(a);
        let remaining = session.tasks().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url.as_str(), "http://host/b");
        assert_eq!(transport.sessions()[0].peak_tasks(), 2);
    }

    #[tokio::test]
    async fn test_invalidated_session_refuses_tasks() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let transport = MemoryTransport::new(temp_dir.path());
        let session = transport.create_session(
            config("s1", temp_dir.path()),
            EventSink::detached("s1"),
        );
        session.start_download(request("http://host/a"));
        session.invalidate_and_cancel();

        session.start_download(request("http://host/b"));
        assert!(session.tasks().await.is_empty());
        assert!(transport.live_sessions().is_empty());
        assert_eq!(transport.started(), 1);
    }

    #[test]
    fn test_finish_without_task_is_noop() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let transport = MemoryTransport::new(temp_dir.path());
        let url = Url::parse("http://host/missing").unwrap();
        assert!(!transport.finish(&url, 200, b"x").unwrap());
        assert!(!transport.fail(&url, ProxyError::Cancelled));
        assert!(!transport.progress(&url, 1, None));
    }
}
