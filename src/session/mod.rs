// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sessions and their bookkeeping.
//!
//! A [`Session`] wraps one transport session. It is either *transient*
//! (created to serve in-process requests) or *background* (claimed by a
//! relaunch event and owning a completion callback that must run exactly
//! once). The callback lives inside the variant, so a background session
//! can never exist without one.
//!
//! - [`registry`] - the identifier → session map, behind one mutex
//! - [`selector`] - picks a reusable session for a URL

pub mod registry;
pub mod selector;

use std::sync::Arc;

use crate::transport::TransportSession;

pub use registry::SessionRegistry;
pub use selector::{find_reusable, Selection};

/// Completion obligation of a background session.
pub type FinishCallback = Box<dyn FnOnce() + Send + 'static>;

/// A registered transport session.
pub enum Session {
    /// Must survive independently of the requesting process.
    Background {
        identifier: String,
        handle: Arc<dyn TransportSession>,
        on_finish: FinishCallback,
    },
    /// Serves in-process requests only.
    Transient {
        identifier: String,
        handle: Arc<dyn TransportSession>,
    },
}

impl Session {
    pub fn transient(handle: Arc<dyn TransportSession>) -> Self {
        Session::Transient {
            identifier: handle.identifier().to_string(),
            handle,
        }
    }

    pub fn background(handle: Arc<dyn TransportSession>, on_finish: FinishCallback) -> Self {
        Session::Background {
            identifier: handle.identifier().to_string(),
            handle,
            on_finish,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            Session::Background { identifier, .. } | Session::Transient { identifier, .. } => {
                identifier
            }
        }
    }

    pub fn handle(&self) -> &Arc<dyn TransportSession> {
        match self {
            Session::Background { handle, .. } | Session::Transient { handle, .. } => handle,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Session::Background { .. })
    }

    /// Cheap snapshot without the completion callback.
    pub fn to_ref(&self) -> SessionRef {
        SessionRef {
            identifier: self.identifier().to_string(),
            handle: Arc::clone(self.handle()),
            background: self.is_background(),
        }
    }

    /// Attach a completion callback, turning a transient session into a
    /// background one in place. For a session that already had one, the old
    /// callback is handed back so the caller can settle it.
    pub(crate) fn attach_finish(&mut self, on_finish: FinishCallback) -> Option<FinishCallback> {
        if let Session::Background {
            on_finish: existing,
            ..
        } = self
        {
            return Some(std::mem::replace(existing, on_finish));
        }
        let identifier = self.identifier().to_string();
        let handle = Arc::clone(self.handle());
        *self = Session::Background {
            identifier,
            handle,
            on_finish,
        };
        None
    }

    /// Invalidate the transport session and settle the completion obligation.
    ///
    /// Must not be called while holding the registry lock.
    pub(crate) fn retire(self) {
        match self {
            Session::Background {
                identifier,
                handle,
                on_finish,
            } => {
                handle.invalidate_and_cancel();
                tracing::info!("SESSION_RETIRED | session={} kind=background", identifier);
                on_finish();
            }
            Session::Transient { identifier, handle } => {
                handle.invalidate_and_cancel();
                tracing::info!("SESSION_RETIRED | session={} kind=transient", identifier);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identifier", &self.identifier())
            .field("background", &self.is_background())
            .finish()
    }
}

/// Snapshot of a registered session, safe to use outside the registry lock.
#[derive(Clone)]
pub struct SessionRef {
    pub identifier: String,
    pub handle: Arc<dyn TransportSession>,
    pub background: bool,
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRef")
            .field("identifier", &self.identifier)
            .field("background", &self.background)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::handle;
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_attach_finish_upgrades_transient() {
        let transport = MemoryTransport::new("unused");
        let mut session = Session::transient(handle(&transport, "s1"));
        assert!(!session.is_background());

        let previous = session.attach_finish(Box::new(|| {}));
        assert!(previous.is_none());
        assert!(session.is_background());
        assert_eq!(session.identifier(), "s1");
    }

    #[test]
    fn test_retire_runs_callback_once() {
        let transport = MemoryTransport::new("unused");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let session = Session::background(
            handle(&transport, "bg"),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        session.retire();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(transport.sessions()[0].is_invalidated());
    }
}
