// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session selection.
//!
//! Given a snapshot of the registry, query every transient session's
//! in-flight tasks concurrently, then fold the replies (in registry order)
//! into a [`Selection`]:
//!
//! | reply                               | effect                      |
//! |-------------------------------------|-----------------------------|
//! | URL already in flight               | `skip = true`               |
//! | task count >= max                   | session is full, ignored    |
//! | first session with room             | becomes `candidate`         |
//! | idle session after a candidate      | added to `unused`           |
//!
//! Background sessions are never candidates. The selector does not touch
//! the registry; reclaiming `unused` is the caller's job.

use futures_util::future::join_all;
use reqwest::Url;

use super::SessionRef;
use crate::transport::TaskInfo;

/// Outcome of [`find_reusable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Session to start the download on, if any has room.
    pub candidate: Option<String>,
    /// Idle sessions beyond the candidate, safe to retire.
    pub unused: Vec<String>,
    /// Some session is already fetching the URL.
    pub skip: bool,
}

impl Selection {
    fn observe(mut self, session: &SessionRef, tasks: &[TaskInfo], url: &Url, max_tasks: usize) -> Self {
        if tasks.iter().any(|t| &t.url == url) {
            self.skip = true;
        } else if tasks.len() >= max_tasks {
            // Full: not a candidate, not idle either.
        } else if self.candidate.is_none() {
            self.candidate = Some(session.identifier.clone());
        } else if tasks.is_empty() {
            self.unused.push(session.identifier.clone());
        }
        self
    }
}

/// Pick a transient session able to take a download of `url`.
pub async fn find_reusable(sessions: &[SessionRef], url: &Url, max_tasks: usize) -> Selection {
    let transient: Vec<&SessionRef> = sessions.iter().filter(|s| !s.background).collect();
    let replies = join_all(transient.iter().map(|s| s.handle.tasks())).await;

    let selection = transient
        .into_iter()
        .zip(replies)
        .fold(Selection::default(), |acc, (session, tasks)| {
            acc.observe(session, &tasks, url, max_tasks)
        });

    tracing::debug!(
        "SESSION_SELECTION | url={} candidate={:?} unused={} skip={}",
        url,
        selection.candidate,
        selection.unused.len(),
        selection.skip
    );
    selection
}
