// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk side of the proxy: where files live, how much space they take,
//! and when they may be deleted.

pub mod guard;
pub mod lock;
pub mod paths;

pub use guard::StorageGuard;
pub use lock::DirectoryLock;
pub use paths::{file_url, LocalPaths};
