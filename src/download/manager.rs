// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The download proxy: public operations over sessions and storage.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::Url;

use super::observer::ProxyObserver;
use super::types::ProxyState;
use crate::config::ProxyConfig;
use crate::error::ProxyResult;
use crate::locks::resilient_lock;
use crate::session::{find_reusable, FinishCallback, Session, SessionRef, SessionRegistry};
use crate::storage::{file_url, LocalPaths, StorageGuard};
use crate::transport::http::HttpTransport;
use crate::transport::{
    DownloadRequest, EventHandler, EventSink, SessionConfig, TaskHints, TaskInfo, Transport,
    TransportSession,
};

/// Resolves URLs to local files, downloading them in the background.
///
/// `resolve` hands back a `file://` URL when the file is already on disk and
/// the remote URL otherwise, starting a transfer if one is not already
/// running. Completion is reported later through the [`ProxyObserver`].
///
/// Cloning is cheap; clones share the same sessions and directory.
///
/// # Panics
///
/// Every operation panics once [`invalidate`](Self::invalidate) has been
/// called.
#[derive(Clone)]
pub struct DownloadProxy {
    inner: Arc<ProxyInner>,
}

/// Shared state behind a [`DownloadProxy`]. Also the event handler of every
/// session it creates.
pub(super) struct ProxyInner {
    pub(super) config: ProxyConfig,
    pub(super) registry: SessionRegistry,
    pub(super) storage: StorageGuard,
    transport: Arc<dyn Transport>,
    observer: Weak<dyn ProxyObserver>,
    state: Mutex<ProxyState>,
    /// Held from selection until the task is started, so two resolves of
    /// the same URL cannot both see it as not in flight.
    start_gate: tokio::sync::Mutex<()>,
    session_counter: AtomicU64,
    me: Weak<ProxyInner>,
}

impl DownloadProxy {
    /// Create a proxy over `transport`.
    ///
    /// The observer is held weakly: once the caller drops it, callbacks are
    /// skipped and policy questions get their default answers.
    pub fn new<O>(
        config: ProxyConfig,
        transport: Arc<dyn Transport>,
        observer: &Arc<O>,
    ) -> ProxyResult<Self>
    where
        O: ProxyObserver + 'static,
    {
        let config = config.validated();
        let observer = Arc::downgrade(observer);
        let observer: Weak<dyn ProxyObserver> = observer;
        let storage = StorageGuard::new(
            LocalPaths::new(&config.directory),
            config.max_bytes,
            config.lock_timeout(),
        );
        storage.prepare()?;

        tracing::info!(
            "PROXY_CREATED | proxy={} dir={:?} max_bytes={} max_tasks={}",
            config.identifier,
            config.directory,
            config.max_bytes,
            config.max_tasks_per_session
        );

        let inner = Arc::new_cyclic(|me| ProxyInner {
            config,
            registry: SessionRegistry::new(),
            storage,
            transport,
            observer,
            state: Mutex::new(ProxyState::Active),
            start_gate: tokio::sync::Mutex::new(()),
            session_counter: AtomicU64::new(0),
            me: me.clone(),
        });
        Ok(Self { inner })
    }

    /// Create a proxy downloading over HTTP(S).
    pub fn with_http_transport<O>(config: ProxyConfig, observer: &Arc<O>) -> ProxyResult<Self>
    where
        O: ProxyObserver + 'static,
    {
        Self::new(config, Arc::new(HttpTransport::new()), observer)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ProxyState {
        *resilient_lock(&self.inner.state)
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<SessionRef> {
        self.inner.registry.list()
    }

    /// Where `url` is (or would be) stored.
    pub fn local_path(&self, url: &Url) -> ProxyResult<PathBuf> {
        self.inner.storage.paths().local_path(url)
    }

    /// Bytes currently consumed by the target directory.
    pub fn total_bytes(&self) -> ProxyResult<u64> {
        self.inner.ensure_active();
        self.inner.storage.total_bytes()
    }

    /// Resolve `url`, starting a download when it is not local yet.
    pub async fn resolve(&self, url: &Url) -> ProxyResult<Url> {
        self.resolve_with(url, true, None).await
    }

    /// Resolve `url` to a local `file://` URL if the file exists, otherwise
    /// return `url` itself.
    ///
    /// With `start_download` set, a missing file is fetched in the
    /// background unless a transfer for it is already running. `hints` are
    /// passed to the transport untouched. Does not wait for the transfer.
    ///
    /// Fails with `InvalidUrl` when `url` has no local mapping and with
    /// `BudgetExceeded` when the directory is full.
    pub async fn resolve_with(
        &self,
        url: &Url,
        start_download: bool,
        hints: Option<TaskHints>,
    ) -> ProxyResult<Url> {
        let inner = &self.inner;
        inner.ensure_active();

        let local = inner.storage.paths().local_path(url)?;
        if local.is_file() {
            tracing::debug!("RESOLVE_LOCAL | url={} path={:?}", url, local);
            return file_url(&local);
        }
        if !start_download {
            return Ok(url.clone());
        }
        inner.storage.check_budget()?;

        let _gate = inner.start_gate.lock().await;
        inner.ensure_active();
        // Finished while we waited for the gate.
        if local.is_file() {
            return file_url(&local);
        }

        let snapshot = inner.registry.list();
        let selection = find_reusable(&snapshot, url, inner.config.max_tasks_per_session).await;
        if selection.skip {
            tracing::debug!("DOWNLOAD_SKIPPED | url={} already in flight", url);
            return Ok(url.clone());
        }

        let session = inner.choose_session(selection.candidate.as_deref());
        if !selection.unused.is_empty() {
            let reclaimed = inner.registry.remove(&selection.unused);
            tracing::debug!("SESSION_RECLAIMED | count={}", reclaimed);
        }

        let task = session.handle.start_download(DownloadRequest {
            url: url.clone(),
            hints: hints.unwrap_or_default(),
        });
        tracing::info!(
            "DOWNLOAD_STARTED | url={} session={} task={}",
            url,
            session.identifier,
            task
        );
        Ok(url.clone())
    }

    /// Take ownership of a named session delivered by a relaunch.
    ///
    /// An existing session with that identifier is upgraded in place;
    /// otherwise a background session is created. `on_finish` runs exactly
    /// once, when the session is retired.
    pub fn handle_background_session_event(
        &self,
        identifier: &str,
        on_finish: impl FnOnce() + Send + 'static,
    ) {
        self.inner.ensure_active();
        let on_finish: FinishCallback = Box::new(on_finish);
        if let Err(on_finish) = self.inner.registry.upgrade(identifier, on_finish) {
            let handle = self.inner.create_handle(identifier.to_string(), true);
            self.inner.registry.add(Session::background(handle, on_finish));
        }
    }

    /// Cancel every in-flight task fetching `url`. Returns how many were
    /// cancelled.
    pub async fn cancel(&self, url: &Url) -> usize {
        self.inner.ensure_active();
        let mut cancelled = 0;
        for (handle, tasks) in self.inner.in_flight().await {
            for task in tasks.iter().filter(|t| &t.url == url) {
                handle.cancel_task(task.id);
                cancelled += 1;
            }
        }
        tracing::info!("DOWNLOAD_CANCELLED | url={} tasks={}", url, cancelled);
        cancelled
    }

    /// Whether some session is currently fetching `url`.
    pub async fn is_downloading(&self, url: &Url) -> bool {
        self.inner.ensure_active();
        self.inner
            .in_flight()
            .await
            .iter()
            .any(|(_, tasks)| tasks.iter().any(|t| &t.url == url))
    }

    /// In-flight tasks across all sessions.
    pub async fn task_count(&self) -> usize {
        self.inner.ensure_active();
        self.inner
            .in_flight()
            .await
            .iter()
            .map(|(_, tasks)| tasks.len())
            .sum()
    }

    /// Delete the local file for `url` if the observer approves.
    ///
    /// Returns the former path when the file was deleted, `None` when there
    /// was no file, the observer declined, or deletion failed.
    pub fn remove_file(&self, url: &Url) -> Option<PathBuf> {
        let inner = &self.inner;
        inner.ensure_active();
        let path = inner.storage.paths().existing(url)?;
        match inner
            .storage
            .remove(&path, |p, modified| inner.validate_removal(p, modified))
        {
            Ok(true) => Some(path),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!("FILE_REMOVE_FAILED | url={} error={}", url, e);
                None
            }
        }
    }

    /// Offer every local file for removal. Returns how many were deleted.
    pub fn remove_all(&self) -> ProxyResult<usize> {
        let inner = &self.inner;
        inner.ensure_active();
        let removed = inner
            .storage
            .remove_all(|p, modified| inner.validate_removal(p, modified))?;
        tracing::info!("FILES_REMOVED | proxy={} count={}", inner.config.identifier, removed);
        Ok(removed)
    }

    /// Offer every local file except those of `keep` for removal. URLs with
    /// no local file are ignored.
    pub fn remove_all_except<'a, I>(&self, keep: I) -> ProxyResult<usize>
    where
        I: IntoIterator<Item = &'a Url>,
    {
        let inner = &self.inner;
        inner.ensure_active();
        let keep: HashSet<PathBuf> = keep
            .into_iter()
            .filter_map(|url| inner.storage.paths().existing(url))
            .collect();
        let removed = inner
            .storage
            .remove_all_except(&keep, |p, modified| inner.validate_removal(p, modified))?;
        tracing::info!(
            "FILES_REMOVED | proxy={} count={} kept={}",
            inner.config.identifier,
            removed,
            keep.len()
        );
        Ok(removed)
    }

    /// Retire every session and shut the proxy down for good.
    ///
    /// # Panics
    ///
    /// When called on an already invalidated proxy.
    pub fn invalidate(&self) {
        let previous = std::mem::replace(
            &mut *resilient_lock(&self.inner.state),
            ProxyState::Invalidated,
        );
        if previous == ProxyState::Invalidated {
            panic!(
                "PROXY_INVALIDATED | proxy={} invalidated twice",
                self.inner.config.identifier
            );
        }
        let retired = self.inner.registry.remove_all();
        tracing::info!(
            "PROXY_INVALIDATED | proxy={} sessions={}",
            self.inner.config.identifier,
            retired
        );
    }
}

impl std::fmt::Debug for DownloadProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadProxy")
            .field("identifier", &self.inner.config.identifier)
            .field("state", &self.state())
            .field("sessions", &self.inner.registry.len())
            .finish()
    }
}

impl ProxyInner {
    pub(super) fn is_active(&self) -> bool {
        *resilient_lock(&self.state) == ProxyState::Active
    }

    pub(super) fn ensure_active(&self) {
        if !self.is_active() {
            panic!(
                "PROXY_INVALIDATED | proxy={} used after invalidate()",
                self.config.identifier
            );
        }
    }

    pub(super) fn observer(&self) -> Option<Arc<dyn ProxyObserver>> {
        self.observer.upgrade()
    }

    pub(super) fn allows_cellular_access(&self) -> bool {
        self.observer()
            .map(|o| o.allows_cellular_access())
            .unwrap_or(false)
    }

    fn is_discretionary(&self) -> bool {
        self.observer().map(|o| o.is_discretionary()).unwrap_or(true)
    }

    /// Ask the observer whether the file at `path` may go. No observer, no
    /// deletion.
    fn validate_removal(&self, path: &Path, modified: DateTime<Utc>) -> bool {
        let Some(observer) = self.observer() else {
            return false;
        };
        match file_url(path) {
            Ok(url) => observer.validate_removal(&url, modified),
            Err(e) => {
                tracing::warn!("FILE_URL_FAILED | path={:?} error={}", path, e);
                false
            }
        }
    }

    /// Use the selected candidate, or a fresh transient session when there
    /// is none, it vanished, or it no longer matches the cellular policy.
    fn choose_session(&self, candidate: Option<&str>) -> SessionRef {
        if let Some(identifier) = candidate {
            match self.registry.get(identifier) {
                Some(session)
                    if session.handle.config().allows_cellular_access
                        == self.allows_cellular_access() =>
                {
                    return session;
                }
                Some(_) => {
                    tracing::info!(
                        "SESSION_POLICY_CHANGED | session={} cellular policy changed, retiring",
                        identifier
                    );
                    self.registry.remove([identifier]);
                }
                None => tracing::debug!(
                    "SESSION_GONE | session={} retired during selection",
                    identifier
                ),
            }
        }
        let identifier = self.next_session_identifier();
        let handle = self.create_handle(identifier, false);
        self.registry.add(Session::transient(handle))
    }

    fn next_session_identifier(&self) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}.{}-{:08x}", self.config.identifier, n, rand::random::<u32>())
    }

    fn session_config(&self, identifier: String, background: bool) -> SessionConfig {
        SessionConfig {
            identifier,
            background,
            allows_cellular_access: self.allows_cellular_access(),
            is_discretionary: self.is_discretionary(),
            connect_timeout: self.config.connect_timeout(),
            request_timeout: self.config.request_timeout(),
            temp_directory: self.config.temp_directory(),
        }
    }

    fn create_handle(&self, identifier: String, background: bool) -> Arc<dyn TransportSession> {
        let handler: Weak<dyn EventHandler> = self.me.clone();
        let events = EventSink::new(identifier.clone(), handler);
        self.transport
            .create_session(self.session_config(identifier, background), events)
    }

    /// Query every session's tasks concurrently.
    async fn in_flight(&self) -> Vec<(Arc<dyn TransportSession>, Vec<TaskInfo>)> {
        let handles = self.registry.handles();
        let replies = join_all(handles.iter().map(|h| h.tasks())).await;
        handles.into_iter().zip(replies).collect()
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        // Settle background obligations of a proxy dropped without invalidate().
        if self.is_active() {
            self.registry.remove_all();
        }
    }
}
