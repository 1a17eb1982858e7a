// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Concurrency tests for fileproxy
//!
//! Many resolves racing on a multi-threaded runtime must still honour
//! deduplication and per-session capacity, and callbacks that re-enter the
//! proxy must not deadlock.
//!
//! # Running with ThreadSanitizer
//!
//! ```bash
//! RUSTFLAGS="-Z sanitizer=thread" cargo +nightly test --target x86_64-unknown-linux-gnu --test concurrency_test
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Url;
use tempfile::TempDir;
use tokio::time::timeout;

use fileproxy::{DownloadProxy, MemoryTransport, NoopObserver, ProxyConfig};

// Test configuration
const CONCURRENCY_LEVEL: usize = 64;
const DISTINCT_URLS: usize = 40;
const MAX_TASKS: usize = 3;
const TEST_TIMEOUT_SECS: u64 = 30;

fn setup(max_tasks: usize) -> (TempDir, Arc<MemoryTransport>, DownloadProxy) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let transport = MemoryTransport::new(temp_dir.path().join("scratch"));
    let config = ProxyConfig::new("race")
        .with_directory(temp_dir.path().join("files"))
        .with_max_tasks_per_session(max_tasks);
    let observer = Arc::new(NoopObserver);
    let proxy = DownloadProxy::new(config, transport.clone(), &observer).unwrap();
    (temp_dir, transport, proxy)
}

fn url(n: usize) -> Url {
    Url::parse(&format!("https://cdn.test/assets/{}.png", n)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_of_one_url_start_one_task() {
    let (_dir, transport, proxy) = setup(MAX_TASKS);
    let target = url(0);

    let handles: Vec<_> = (0..CONCURRENCY_LEVEL)
        .map(|_| {
            let proxy = proxy.clone();
            let target = target.clone();
            tokio::spawn(async move { proxy.resolve(&target).await })
        })
        .collect();

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), join_all(handles))
        .await
        .expect("resolves timed out");
    for result in results {
        assert_eq!(result.expect("task panicked").unwrap(), target);
    }

    assert_eq!(transport.tasks_for(&target), 1);
    assert_eq!(transport.started(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_urls_respect_capacity() {
    let (_dir, transport, proxy) = setup(MAX_TASKS);

    let handles: Vec<_> = (0..DISTINCT_URLS)
        .map(|n| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.resolve(&url(n)).await })
        })
        .collect();

    let results = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), join_all(handles))
        .await
        .expect("resolves timed out");
    assert!(results.into_iter().all(|r| r.expect("task panicked").is_ok()));

    assert_eq!(transport.started(), DISTINCT_URLS);
    assert_eq!(proxy.task_count().await, DISTINCT_URLS);
    let sessions = transport.live_sessions();
    assert!(sessions.len() >= DISTINCT_URLS.div_ceil(MAX_TASKS));
    for session in sessions {
        assert!(
            session.peak_tasks() <= MAX_TASKS,
            "session {} carried {} tasks",
            session.session_config().identifier,
            session.peak_tasks()
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completions_interleaved_with_resolves() {
    let (_dir, transport, proxy) = setup(MAX_TASKS);

    for n in 0..DISTINCT_URLS {
        proxy.resolve(&url(n)).await.unwrap();
    }

    let finisher = {
        let transport = Arc::clone(&transport);
        tokio::task::spawn_blocking(move || {
            for n in 0..DISTINCT_URLS {
                transport.finish(&url(n), 200, b"png").unwrap();
            }
        })
    };
    let resolvers: Vec<_> = (0..DISTINCT_URLS)
        .map(|n| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.resolve(&url(n)).await })
        })
        .collect();

    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        finisher.await.expect("finisher panicked");
        for r in join_all(resolvers).await {
            r.expect("task panicked").unwrap();
        }
    })
    .await
    .expect("timed out");

    // Every URL is local now; none may be fetched twice at once.
    for n in 0..DISTINCT_URLS {
        assert!(transport.tasks_for(&url(n)) <= 1);
        assert_eq!(proxy.resolve(&url(n)).await.unwrap().scheme(), "file");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_background_callback_may_reenter_proxy() {
    let (_dir, transport, proxy) = setup(MAX_TASKS);
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let inner = proxy.clone();
    let seen = Arc::clone(&observed);
    proxy.handle_background_session_event("relaunch", move || {
        // Runs after the registry lock is released.
        seen.store(inner.session_count(), Ordering::SeqCst);
    });

    let delivered = tokio::task::spawn_blocking(move || transport.deliver_all_events("relaunch"));
    assert!(timeout(Duration::from_secs(TEST_TIMEOUT_SECS), delivered)
        .await
        .expect("callback deadlocked")
        .unwrap());
    assert_eq!(observed.load(Ordering::SeqCst), 0);
}
