// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! reqwest-backed transport.
//!
//! Each session owns one `reqwest::Client`; each download runs on its own
//! tokio task and streams the body into `<temp_directory>/<session>-<task>.download`.
//! The temporary file is removed once the `DownloadFinished` handler returns,
//! so the handler must move it if it wants to keep it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use indexmap::IndexMap;
use reqwest::{StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{
    AuthChallenge, ChallengeDisposition, Credential, DownloadRequest, EventSink, SessionConfig,
    SessionEvent, TaskId, TaskInfo, Transport, TransportSession,
};
use crate::error::{ProxyError, ProxyResult};
use crate::locks::resilient_lock;

/// Attempts with caller-supplied credentials before the 401 is delivered as-is.
const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Transport that fetches over HTTP(S) with reqwest.
#[derive(Debug, Default)]
pub struct HttpTransport {
    next_task: Arc<AtomicU64>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            next_task: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Transport for HttpTransport {
    fn create_session(
        &self,
        config: SessionConfig,
        events: EventSink,
    ) -> Arc<dyn TransportSession> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(
                    "HTTP_CLIENT | session={} builder failed ({}), using defaults",
                    config.identifier,
                    e
                );
                reqwest::Client::new()
            });

        tracing::debug!(
            "HTTP_SESSION_CREATED | session={} background={} cellular={}",
            config.identifier,
            config.background,
            config.allows_cellular_access
        );

        Arc::new(HttpSession {
            shared: Arc::new(HttpShared {
                config,
                events,
                client,
                tasks: Mutex::new(IndexMap::new()),
                invalidated: AtomicBool::new(false),
            }),
            next_task: Arc::clone(&self.next_task),
        })
    }
}

struct RunningTask {
    info: TaskInfo,
    handle: Option<JoinHandle<()>>,
}

struct HttpShared {
    config: SessionConfig,
    events: EventSink,
    client: reqwest::Client,
    tasks: Mutex<IndexMap<TaskId, RunningTask>>,
    invalidated: AtomicBool,
}

/// Session created by [`HttpTransport`].
pub struct HttpSession {
    shared: Arc<HttpShared>,
    next_task: Arc<AtomicU64>,
}

impl HttpShared {
    fn temp_path(&self, task: TaskId) -> PathBuf {
        self.config
            .temp_directory
            .join(format!("{}-{}.download", self.config.identifier, task))
    }

    /// Ask the event handler how to answer a challenge.
    async fn ask_challenge(
        &self,
        task: TaskId,
        url: &Url,
        challenge: AuthChallenge,
    ) -> ChallengeDisposition {
        let (reply, answer) = oneshot::channel();
        self.events.emit(SessionEvent::Challenge {
            task,
            url: url.clone(),
            challenge,
            reply,
        });
        answer.await.unwrap_or_default()
    }

    /// Fetch the body into a temporary file. Returns the status and location.
    async fn fetch(&self, task: TaskId, request: &DownloadRequest) -> ProxyResult<(u16, PathBuf)> {
        let url = &request.url;
        let mut credential: Option<Credential> = None;
        let mut failures = 0u32;

        let response = loop {
            let mut builder = self.client.get(url.clone());
            if let Some(c) = &credential {
                builder = builder.basic_auth(&c.user, Some(&c.password));
            }
            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Transport(format!("Request timed out: {}", e))
                } else if e.is_connect() {
                    ProxyError::Transport(format!("Cannot connect: {}", e))
                } else {
                    ProxyError::Transport(e.to_string())
                }
            })?;

            if response.status() != StatusCode::UNAUTHORIZED || failures >= MAX_AUTH_ATTEMPTS {
                break response;
            }
            let Some(challenge) = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| AuthChallenge::parse(v, failures))
            else {
                break response;
            };

            match self.ask_challenge(task, url, challenge).await {
                ChallengeDisposition::UseCredential(c) => {
                    credential = Some(c);
                    failures += 1;
                }
                ChallengeDisposition::CancelAuthenticationChallenge => {
                    return Err(ProxyError::Cancelled);
                }
                ChallengeDisposition::PerformDefaultHandling
                | ChallengeDisposition::RejectProtectionSpace => break response,
            }
        };

        let status = response.status().as_u16();
        let total_expected = response.content_length();
        let location = self.temp_path(task);

        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::io("Failed to create temp directory", e))?;
        }
        let mut file = tokio::fs::File::create(&location)
            .await
            .map_err(|e| ProxyError::io("Failed to create temp file", e))?;

        let mut stream = response.bytes_stream();
        let mut total_written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProxyError::Transport(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ProxyError::io("Failed to write temp file", e))?;
            total_written += chunk.len() as u64;
            self.events.emit(SessionEvent::Progress {
                task,
                url: url.clone(),
                bytes_written: chunk.len() as u64,
                total_written,
                total_expected,
            });
        }
        file.flush()
            .await
            .map_err(|e| ProxyError::io("Failed to flush temp file", e))?;

        Ok((status, location))
    }

    async fn run(self: Arc<Self>, task: TaskId, request: DownloadRequest) {
        if let Some(begin) = request.hints.earliest_begin {
            if let Ok(wait) = (begin - Utc::now()).to_std() {
                tracing::debug!(
                    "HTTP_TASK_DEFERRED | session={} task={} wait={:?}",
                    self.config.identifier,
                    task,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
        }

        let url = request.url.clone();
        let result = self.fetch(task, &request).await;

        // Cancelled tasks were already removed and reported by cancel_task.
        if resilient_lock(&self.tasks).shift_remove(&task).is_none() {
            if let Ok((_, location)) = result {
                let _ = tokio::fs::remove_file(location).await;
            }
            return;
        }

        match result {
            Ok((status, location)) => {
                let event = SessionEvent::DownloadFinished {
                    task,
                    url: Some(url.clone()),
                    status,
                    location: location.clone(),
                };
                // The handler may wait on the storage file lock.
                let shared = Arc::clone(&self);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || shared.events.emit(event)).await
                {
                    tracing::warn!(
                        "HTTP_TASK_FINISH_HANDLER | session={} task={} error={}",
                        self.config.identifier,
                        task,
                        e
                    );
                }
                if tokio::fs::try_exists(&location).await.unwrap_or(false) {
                    let _ = tokio::fs::remove_file(&location).await;
                }
                self.events.emit(SessionEvent::Completed {
                    task,
                    url: Some(url),
                    error: None,
                });
            }
            Err(error) => {
                tracing::debug!(
                    "HTTP_TASK_FAILED | session={} task={} error={}",
                    self.config.identifier,
                    task,
                    error
                );
                let _ = tokio::fs::remove_file(self.temp_path(task)).await;
                self.events.emit(SessionEvent::Completed {
                    task,
                    url: Some(url),
                    error: Some(error),
                });
            }
        }
    }
}

impl TransportSession for HttpSession {
    fn identifier(&self) -> &str {
        &self.shared.config.identifier
    }

    fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    fn tasks(&self) -> BoxFuture<'_, Vec<TaskInfo>> {
        let snapshot: Vec<TaskInfo> = resilient_lock(&self.shared.tasks)
            .values()
            .map(|t| t.info.clone())
            .collect();
        Box::pin(async move { snapshot })
    }

    fn start_download(&self, request: DownloadRequest) -> TaskId {
        let task = self.next_task.fetch_add(1, Ordering::SeqCst);
        if self.shared.invalidated.load(Ordering::SeqCst) {
            self.shared.events.emit(SessionEvent::Completed {
                task,
                url: Some(request.url),
                error: Some(ProxyError::SessionInvalidated(
                    self.shared.config.identifier.clone(),
                )),
            });
            return task;
        }

        let info = TaskInfo {
            id: task,
            url: request.url.clone(),
        };
        // Spawn while holding the table so the task cannot finish before it is registered.
        let mut tasks = resilient_lock(&self.shared.tasks);
        let handle = tokio::spawn(Arc::clone(&self.shared).run(task, request));
        tasks.insert(
            task,
            RunningTask {
                info,
                handle: Some(handle),
            },
        );
        tracing::debug!(
            "HTTP_TASK_STARTED | session={} task={}",
            self.shared.config.identifier,
            task
        );
        task
    }

    fn cancel_task(&self, task: TaskId) {
        let removed = resilient_lock(&self.shared.tasks).shift_remove(&task);
        if let Some(mut running) = removed {
            if let Some(handle) = running.handle.take() {
                handle.abort();
            }
            self.shared.events.emit(SessionEvent::Completed {
                task,
                url: Some(running.info.url),
                error: Some(ProxyError::Cancelled),
            });
        }
    }

    fn invalidate_and_cancel(&self) {
        if self.shared.invalidated.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<RunningTask> = resilient_lock(&self.shared.tasks)
            .drain(..)
            .map(|(_, t)| t)
            .collect();
        for mut running in drained {
            if let Some(handle) = running.handle.take() {
                handle.abort();
            }
            self.shared.events.emit(SessionEvent::Completed {
                task: running.info.id,
                url: Some(running.info.url),
                error: Some(ProxyError::Cancelled),
            });
        }
        tracing::debug!(
            "HTTP_SESSION_INVALIDATED | session={}",
            self.shared.config.identifier
        );
        self.shared
            .events
            .emit(SessionEvent::SessionInvalid { error: None });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventHandler;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use std::sync::Weak;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Forwards events (minus challenge replies) into a channel.
    struct ChannelHandler {
        tx: mpsc::UnboundedSender<String>,
        credential: Option<Credential>,
    }

    impl EventHandler for ChannelHandler {
        fn handle_event(&self, _session: &str, event: SessionEvent) {
            let line = match event {
                SessionEvent::Progress { total_written, .. } => format!("progress:{}", total_written),
                SessionEvent::Challenge { reply, challenge, .. } => {
                    let disposition = match &self.credential {
                        Some(c) if challenge.previous_failures == 0 => {
                            ChallengeDisposition::UseCredential(c.clone())
                        }
                        _ => ChallengeDisposition::PerformDefaultHandling,
                    };
                    let _ = reply.send(disposition);
                    format!("challenge:{}", challenge.scheme)
                }
                SessionEvent::DownloadFinished { status, location, .. } => {
                    let body = std::fs::read_to_string(&location).unwrap_or_default();
                    format!("finished:{}:{}", status, body)
                }
                SessionEvent::Completed { error, .. } => match error {
                    Some(e) => format!("completed-error:{}", e),
                    None => "completed".to_string(),
                },
                SessionEvent::SessionInvalid { .. } => "invalid".to_string(),
                SessionEvent::AllEventsDelivered => "all-delivered".to_string(),
            };
            let _ = self.tx.send(line);
        }
    }

    async fn serve() -> Url {
        let app = Router::new()
            .route("/hello.txt", get(|| async { "hello world" }))
            .route("/missing", get(|| async { (AxumStatus::NOT_FOUND, "nope") }))
            .route(
                "/private",
                get(|headers: axum::http::HeaderMap| async move {
                    // "user:secret" in base64
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Basic dXNlcjpzZWNyZXQ=");
                    if authorized {
                        (AxumStatus::OK, [("www-authenticate", "")], "secret body")
                    } else {
                        (
                            AxumStatus::UNAUTHORIZED,
                            [("www-authenticate", "Basic realm=\"files\"")],
                            "",
                        )
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    fn session_config(temp: &std::path::Path) -> SessionConfig {
        SessionConfig {
            identifier: "http-test".to_string(),
            background: false,
            allows_cellular_access: false,
            is_discretionary: true,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            temp_directory: temp.to_path_buf(),
        }
    }

    async fn collect_until_done(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(Some(line)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            let done = line.starts_with("completed");
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }

    #[tokio::test]
    async fn test_download_streams_into_temp_file() {
        let base = serve().await;
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler { tx, credential: None });
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;

        let transport = HttpTransport::new();
        let session = transport.create_session(
            session_config(temp_dir.path()),
            EventSink::new("http-test", weak),
        );
        session.start_download(DownloadRequest {
            url: base.join("hello.txt").unwrap(),
            hints: Default::default(),
        });

        let lines = collect_until_done(&mut rx).await;
        assert!(lines.iter().any(|l| l.starts_with("progress:")));
        assert!(lines.contains(&"finished:200:hello world".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("completed"));
        assert!(session.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_delivered_not_raised() {
        let base = serve().await;
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler { tx, credential: None });
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;

        let session = HttpTransport::new().create_session(
            session_config(temp_dir.path()),
            EventSink::new("http-test", weak),
        );
        session.start_download(DownloadRequest {
            url: base.join("missing").unwrap(),
            hints: Default::default(),
        });

        let lines = collect_until_done(&mut rx).await;
        assert!(lines.contains(&"finished:404:nope".to_string()));
    }

    #[tokio::test]
    async fn test_challenge_answered_with_credentials() {
        let base = serve().await;
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler {
            tx,
            credential: Some(Credential {
                user: "user".to_string(),
                password: "secret".to_string(),
            }),
        });
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;

        let session = HttpTransport::new().create_session(
            session_config(temp_dir.path()),
            EventSink::new("http-test", weak),
        );
        session.start_download(DownloadRequest {
            url: base.join("private").unwrap(),
            hints: Default::default(),
        });

        let lines = collect_until_done(&mut rx).await;
        assert!(lines.contains(&"challenge:Basic".to_string()));
        assert!(lines.contains(&"finished:200:secret body".to_string()));
    }

    /// Blocks in `DownloadFinished` the way a contended storage lock would.
    struct SlowFinishHandler {
        ticks: Arc<AtomicU64>,
        ticks_during_finish: AtomicU64,
        done: mpsc::UnboundedSender<()>,
    }

    impl EventHandler for SlowFinishHandler {
        fn handle_event(&self, _session: &str, event: SessionEvent) {
            match event {
                SessionEvent::DownloadFinished { .. } => {
                    let before = self.ticks.load(Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(300));
                    let after = self.ticks.load(Ordering::SeqCst);
                    self.ticks_during_finish.store(after - before, Ordering::SeqCst);
                }
                SessionEvent::Completed { .. } => {
                    let _ = self.done.send(());
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_slow_finish_handler_does_not_stall_runtime() {
        let base = serve().await;
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let ticks = Arc::new(AtomicU64::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let (done, mut done_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(SlowFinishHandler {
            ticks,
            ticks_during_finish: AtomicU64::new(0),
            done,
        });
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;

        let session = HttpTransport::new().create_session(
            session_config(temp_dir.path()),
            EventSink::new("http-test", weak),
        );
        session.start_download(DownloadRequest {
            url: base.join("hello.txt").unwrap(),
            hints: Default::default(),
        });

        tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
            .await
            .expect("download did not complete")
            .unwrap();
        ticker.abort();
        // The single-threaded test runtime kept running while the handler blocked.
        assert!(handler.ticks_during_finish.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_invalidate_cancels_deferred_task() {
        let base = serve().await;
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler { tx, credential: None });
        let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;

        let session = HttpTransport::new().create_session(
            session_config(temp_dir.path()),
            EventSink::new("http-test", weak),
        );
        session.start_download(DownloadRequest {
            url: base.join("hello.txt").unwrap(),
            hints: crate::transport::TaskHints {
                earliest_begin: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            },
        });
        assert_eq!(session.tasks().await.len(), 1);

        session.invalidate_and_cancel();
        assert!(session.tasks().await.is_empty());

        let first = rx.recv().await.unwrap();
        assert_eq!(first, "completed-error:Download cancelled");
        assert_eq!(rx.recv().await.unwrap(), "invalid");
    }
}
