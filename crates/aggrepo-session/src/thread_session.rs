//! Per-thread memo of query results.
//!
//! Each thread gets its own map from criteria fingerprint to the ordered key
//! strings the query resolved to. Entries are validated against the identity
//! map on every read, so a memo never serves an aggregate that has left the
//! cache. Whole sessions expire once idle longer than the configured lifetime.

use std::collections::HashMap;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ThreadSession {
    touched: Instant,
    results: HashMap<String, Vec<String>>,
}

impl ThreadSession {
    fn new(now: Instant) -> Self {
        Self {
            touched: now,
            results: HashMap::new(),
        }
    }

    pub fn touched(&self) -> Instant {
        self.touched
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ThreadSessions {
    sessions: HashMap<ThreadId, ThreadSession>,
}

impl ThreadSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `keys` for `fingerprint` in `thread`'s session.
    pub fn store(&mut self, thread: ThreadId, fingerprint: &str, keys: Vec<String>, now: Instant) {
        let session = self
            .sessions
            .entry(thread)
            .or_insert_with(|| ThreadSession::new(now));
        session.touched = now;
        session.results.insert(fingerprint.to_string(), keys);
    }

    /// Keys memoized for `fingerprint`, if any. Does not validate or touch.
    pub fn lookup(&self, thread: ThreadId, fingerprint: &str) -> Option<&[String]> {
        self.sessions
            .get(&thread)?
            .results
            .get(fingerprint)
            .map(Vec::as_slice)
    }

    /// Forget one memoized result.
    pub fn forget(&mut self, thread: ThreadId, fingerprint: &str) {
        if let Some(session) = self.sessions.get_mut(&thread) {
            session.results.remove(fingerprint);
        }
    }

    pub fn touch(&mut self, thread: ThreadId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&thread) {
            session.touched = now;
        }
    }

    pub fn remove(&mut self, thread: ThreadId) -> bool {
        self.sessions.remove(&thread).is_some()
    }

    pub fn get(&self, thread: ThreadId) -> Option<&ThreadSession> {
        self.sessions.get(&thread)
    }

    /// Drop sessions idle longer than `lifetime`. Returns how many went.
    pub fn expire(&mut self, now: Instant, lifetime: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.touched) <= lifetime);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
