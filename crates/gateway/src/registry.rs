use std::time::Instant;

use dashmap::{DashMap, mapref::entry::Entry};

/// A live session or call and its transport handle.
#[derive(Debug)]
pub struct Session<T> {
    pub id: String,
    pub transport: T,
    pub created_at: Instant,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session {0} already exists")]
pub struct AlreadyExists(pub String);

/// Live sessions keyed by id. At most one connected entry per id.
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    sessions: DashMap<String, Session<T>>,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a connected session. A disconnected leftover under the same id
    /// is replaced; a connected one is left untouched.
    pub fn register(&self, id: &str, transport: T) -> Result<(), AlreadyExists> {
        let session = Session {
            id: id.to_string(),
            transport,
            created_at: Instant::now(),
            connected: true,
        };
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) if entry.get().connected => Err(AlreadyExists(id.to_string())),
            Entry::Occupied(mut entry) => {
                entry.insert(session);
                Ok(())
            },
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            },
        }
    }

    pub fn deregister(&self, id: &str) -> Option<Session<T>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Remove the session only if its transport satisfies `matches`.
    pub fn deregister_if(&self, id: &str, matches: impl Fn(&T) -> bool) -> Option<Session<T>> {
        self.sessions
            .remove_if(id, |_, s| matches(&s.transport))
            .map(|(_, s)| s)
    }

    /// Whether a session exists under `id` and its transport satisfies
    /// `matches`, connected or not.
    pub fn peek(&self, id: &str, matches: impl Fn(&T) -> bool) -> bool {
        self.sessions.get(id).is_some_and(|s| matches(&s.transport))
    }

    pub fn mark_disconnected(&self, id: &str) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.connected = false;
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.sessions.get(id).is_some_and(|s| s.connected)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Session<T>> {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.deregister(id)).collect()
    }
}

impl<T: Clone> ConnectionRegistry<T> {
    /// Clone of the transport of a connected session.
    pub fn get(&self, id: &str) -> Option<T> {
        self.sessions
            .get(id)
            .filter(|s| s.connected)
            .map(|s| s.transport.clone())
    }
}
