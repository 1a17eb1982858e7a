// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session registry.
//!
//! Owns the identifier → [`Session`] map. Every read and write goes through
//! one mutex; nothing slow runs while it is held. Sessions leaving the map
//! are collected under the lock and retired (transport invalidated,
//! completion callback fired) after it is released, so callbacks may call
//! back into the registry.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use super::{FinishCallback, Session, SessionRef};
use crate::locks::resilient_lock;
use crate::transport::TransportSession;

/// Insertion-ordered map of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<IndexMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// # Panics
    ///
    /// If a session with the same identifier is already registered. That is
    /// an internal invariant violation, not a runtime condition.
    pub fn add(&self, session: Session) -> SessionRef {
        let snapshot = session.to_ref();
        let mut sessions = resilient_lock(&self.sessions);
        if sessions.contains_key(session.identifier()) {
            panic!(
                "SESSION_DUPLICATE | session={} is already registered",
                session.identifier()
            );
        }
        tracing::info!(
            "SESSION_CREATED | session={} background={} total={}",
            snapshot.identifier,
            snapshot.background,
            sessions.len() + 1
        );
        sessions.insert(snapshot.identifier.clone(), session);
        snapshot
    }

    /// Remove and retire the given sessions. Unknown identifiers are ignored.
    ///
    /// Returns how many sessions were removed.
    pub fn remove<I, S>(&self, identifiers: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<Session> = {
            let mut sessions = resilient_lock(&self.sessions);
            identifiers
                .into_iter()
                .filter_map(|id| sessions.shift_remove(id.as_ref()))
                .collect()
        };
        let count = removed.len();
        for session in removed {
            session.retire();
        }
        count
    }

    /// Remove and retire every session.
    pub fn remove_all(&self) -> usize {
        let removed: Vec<Session> = resilient_lock(&self.sessions)
            .drain(..)
            .map(|(_, s)| s)
            .collect();
        let count = removed.len();
        for session in removed {
            session.retire();
        }
        count
    }

    /// Attach a completion callback to an existing session.
    ///
    /// When no such session exists the callback is handed back untouched so
    /// the caller can create one. A transient session becomes background. A
    /// session that was already background has its previous callback fired
    /// immediately before the new one takes over.
    pub fn upgrade(&self, identifier: &str, on_finish: FinishCallback) -> Result<(), FinishCallback> {
        let superseded = {
            let mut sessions = resilient_lock(&self.sessions);
            match sessions.get_mut(identifier) {
                Some(session) => session.attach_finish(on_finish),
                None => return Err(on_finish),
            }
        };
        match superseded {
            Some(previous) => {
                tracing::warn!(
                    "SESSION_UPGRADE_SUPERSEDED | session={} already had a completion \
                     handler; settling the previous one",
                    identifier
                );
                previous();
            }
            None => tracing::info!("SESSION_UPGRADED | session={}", identifier),
        }
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<SessionRef> {
        resilient_lock(&self.sessions)
            .get(identifier)
            .map(Session::to_ref)
    }

    /// Snapshot of all sessions in registration order.
    pub fn list(&self) -> Vec<SessionRef> {
        resilient_lock(&self.sessions)
            .values()
            .map(Session::to_ref)
            .collect()
    }

    /// Snapshot of the transport handles.
    pub fn handles(&self) -> Vec<Arc<dyn TransportSession>> {
        resilient_lock(&self.sessions)
            .values()
            .map(|s| Arc::clone(s.handle()))
            .collect()
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::handle;
    use crate::transport::memory::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> FinishCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_add_and_list_in_order() {
        let transport = MemoryTransport::new("unused");
        let registry = SessionRegistry::new();
        registry.add(Session::transient(handle(&transport, "a")));
        registry.add(Session::transient(handle(&transport, "b")));

        let ids: Vec<_> = registry.list().into_iter().map(|s| s.identifier).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.handles().len(), 2);
        assert!(registry.get("a").is_some());
    }

    #[test]
    #[should_panic(expected = "SESSION_DUPLICATE")]
    fn test_duplicate_add_panics() {
        let transport = MemoryTransport::new("unused");
        let registry = SessionRegistry::new();
        registry.add(Session::transient(handle(&transport, "a")));
        registry.add(Session::transient(handle(&transport, "a")));
    }

    #[test]
    fn test_remove_is_idempotent_and_retires() {
        let transport = MemoryTransport::new("unused");
        let registry = SessionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.add(Session::background(
            handle(&transport, "bg"),
            counting_callback(&calls),
        ));
        registry.add(Session::transient(handle(&transport, "t")));

        assert_eq!(registry.remove(["bg", "missing"]), 1);
        assert_eq!(registry.remove(["bg"]), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert!(transport.session("bg").unwrap().is_invalidated());
        assert!(!transport.session("t").unwrap().is_invalidated());
    }

    #[test]
    fn test_upgrade_absent_returns_callback() {
        let registry = SessionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let returned = registry.upgrade("nope", counting_callback(&calls));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // The caller gets the obligation back.
        returned.expect_err("absent session must not be upgraded")();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upgrade_transient_keeps_handle() {
        let transport = MemoryTransport::new("unused");
        let registry = SessionRegistry::new();
        registry.add(Session::transient(handle(&transport, "t")));
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(registry.upgrade("t", counting_callback(&calls)).is_ok());
        let session = registry.get("t").unwrap();
        assert!(session.background);
        assert_eq!(transport.sessions().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.remove_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upgrade_background_settles_previous_callback() {
        let transport = MemoryTransport::new("unused");
        let registry = SessionRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.add(Session::background(
            handle(&transport, "bg"),
            counting_callback(&first),
        ));

        assert!(registry.upgrade("bg", counting_callback(&second)).is_ok());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        registry.remove(["bg"]);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_registry() {
        let transport = MemoryTransport::new("unused");
        let registry = Arc::new(SessionRegistry::new());
        let inner = Arc::clone(&registry);
        registry.add(Session::background(
            handle(&transport, "bg"),
            Box::new(move || {
                // Would deadlock if called under the lock.
                assert_eq!(inner.len(), 0);
            }),
        ));
        registry.remove(["bg"]);
    }
}
