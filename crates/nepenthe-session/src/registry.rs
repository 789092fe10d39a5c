//! The session registry: every live session, keyed by id.
//!
//! # Concurrency note
//!
//! Connection tasks insert and remove their own sessions while extensions
//! and the server read snapshots, so the map sits behind a lock. It is a
//! std `RwLock`: no operation here awaits, and the guard never escapes a
//! method. Callers iterate over a [`snapshot`](SessionRegistry::snapshot),
//! never over the live map, so sessions can come and go while they do.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::{Session, SessionError, SessionId};

/// Registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session under its id.
    ///
    /// # Errors
    /// [`SessionError::AlreadyRegistered`] if the id is taken. Ids are
    /// random, so the caller draws a new one and retries.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let id = session.id();
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyRegistered(id));
        }
        sessions.insert(id, session);
        tracing::debug!(session = %id, live = sessions.len(), "session registered");
        Ok(())
    }

    /// Removes a session. Returns it if it was present.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let removed = sessions.remove(&id);
        if removed.is_some() {
            tracing::debug!(session = %id, live = sessions.len(), "session unregistered");
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live session at this instant, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }
}
