// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fileproxy - local-or-remote file resolution with background downloads
//!
//! Ask for a URL, get the local copy if there is one, otherwise the remote
//! URL while a background transfer fetches it.
//!
//! # Core Modules
//!
//! - [`download`] - The [`DownloadProxy`] facade and the observer interface
//! - [`session`] - Transport sessions, their registry, and reuse selection
//! - [`storage`] - URL → path mapping, storage budget, validated eviction
//! - [`transport`] - Transport abstraction with HTTP and in-memory backends
//! - [`config`] - Proxy configuration (JSON file + environment)
//! - [`error`] - Error type shared by all of the above
//! - [`locks`] - Poison-resilient mutex helpers

pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::ProxyConfig;
pub use download::{
    format_bytes, DownloadProxy, NoopObserver, ProxyObserver, ProxyState, TransferProgress,
};
pub use error::{ProxyError, ProxyResult};
pub use session::{FinishCallback, SessionRef};
pub use transport::http::HttpTransport;
pub use transport::memory::MemoryTransport;
pub use transport::{
    AuthChallenge, ChallengeDisposition, Credential, TaskHints, Transport, TransportSession,
};
