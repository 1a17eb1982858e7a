// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download proxy.
//!
//! Callers ask for a URL and get back either the local copy or the remote
//! URL while a background transfer works on producing the local copy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ select  ┌─────────────────┐
//! │ DownloadProxy   │────────▶│ SessionRegistry │
//! │ (resolve, ...)  │         │ + selector      │
//! └────────┬────────┘         └────────┬────────┘
//!          │                           │ start_download
//!          ▼                           ▼
//! ┌─────────────────┐  store  ┌─────────────────┐
//! │ StorageGuard    │◀────────│ Transport       │
//! │ (budget, evict) │ events  │ sessions        │
//! └─────────────────┘         └────────┬────────┘
//!                                      │ SessionEvent
//!                                      ▼
//!                             ┌─────────────────┐
//!                             │ ProxyObserver   │
//!                             └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fileproxy::{DownloadProxy, NoopObserver, ProxyConfig};
//! use reqwest::Url;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let observer = Arc::new(NoopObserver);
//! let proxy = DownloadProxy::with_http_transport(ProxyConfig::new("images"), &observer)?;
//!
//! let url = Url::parse("https://example.com/cat.png")?;
//! // Remote URL now, file:// URL once the transfer has landed.
//! let resolved = proxy.resolve(&url).await?;
//! println!("{}", resolved);
//!
//! proxy.invalidate();
//! # Ok(())
//! # }
//! ```

mod events;
pub mod manager;
pub mod observer;
pub mod types;

pub use manager::DownloadProxy;
pub use observer::{NoopObserver, ProxyObserver};
pub use types::{format_bytes, ProxyState, TransferProgress};
