//! Multi-turn conversation state.
//!
//! [`ConversationManager`] owns every session. A session moves through
//! [`SessionState::Empty`] (never seen) → [`SessionState::Active`] (first
//! append) → [`SessionState::Evicted`] (idle past the TTL, pushed out by the
//! session cap, or removed explicitly). Appending to an evicted id starts a
//! fresh session.
//!
//! The session map sits behind an `RwLock`; each session record has its own
//! `Mutex`, so appends to different sessions never contend on one record.
//! No lock is held across an `.await`: every method here is synchronous.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::{debug, info};

use crate::error::{RagError, Result};
use crate::models::Message;
use crate::tokens::TokenCounter;

const TOMBSTONE_CAPACITY: usize = 1024;

/// Source of "now" for TTL decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Messages kept per session; older ones are dropped on append.
    pub max_messages: usize,
    /// Idle time after which a session is purged.
    pub ttl: Duration,
    /// Live sessions allowed before the oldest idle one is evicted.
    pub max_sessions: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            ttl: Duration::from_secs(60 * 60),
            max_sessions: 1000,
        }
    }
}

/// Lifecycle state of a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Active,
    Evicted,
}

/// Bounds applied when reading history for a prompt. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryWindow {
    pub max_messages: Option<usize>,
    pub max_tokens: Option<usize>,
}

struct Session {
    messages: VecDeque<Message>,
    last_active: DateTime<Utc>,
    /// Set under the record's lock when it leaves the session map. A caller
    /// still holding the `Arc` must not write to it.
    retired: bool,
}

pub struct ConversationManager {
    config: ConversationConfig,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    evicted: Mutex<LruCache<String, ()>>,
}

impl ConversationManager {
    pub fn new(config: ConversationConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ConversationConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.max_messages == 0 {
            return Err(RagError::Configuration(
                "conversation.max_messages must be at least 1".to_string(),
            ));
        }
        if config.max_sessions == 0 {
            return Err(RagError::Configuration(
                "conversation.max_sessions must be at least 1".to_string(),
            ));
        }
        let ttl = chrono::Duration::from_std(config.ttl)
            .map_err(|e| RagError::Configuration(format!("conversation.ttl: {}", e)))?;
        let capacity = NonZeroUsize::new(TOMBSTONE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            config,
            ttl,
            clock,
            sessions: RwLock::new(HashMap::new()),
            evicted: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Append a message, creating the session on first use.
    pub fn append(&self, session_id: &str, message: Message) -> Result<()> {
        if session_id.trim().is_empty() {
            return Err(RagError::InvalidRequest(
                "session id must not be empty".to_string(),
            ));
        }
        let now = self.clock.now();
        loop {
            let session = match self.live_session(session_id, now) {
                Some(session) => session,
                None => self.create_session(session_id, now),
            };

            let mut session = session.lock().unwrap();
            // Evicted between the lookup and the lock: look it up again.
            if session.retired {
                continue;
            }
            session.messages.push_back(message);
            while session.messages.len() > self.config.max_messages {
                session.messages.pop_front();
            }
            session.last_active = now;
            return Ok(());
        }
    }

    /// Most recent messages of a session, oldest first, within `window`.
    ///
    /// Walks backwards from the newest message and stops at the first one
    /// that would exceed either bound. Unknown or evicted sessions yield an
    /// empty history.
    pub fn history(
        &self,
        session_id: &str,
        window: HistoryWindow,
        counter: &dyn TokenCounter,
    ) -> Vec<Message> {
        let now = self.clock.now();
        let Some(session) = self.live_session(session_id, now) else {
            return Vec::new();
        };
        let mut session = session.lock().unwrap();
        if session.retired {
            return Vec::new();
        }
        session.last_active = now;

        let max_messages = window.max_messages.unwrap_or(usize::MAX);
        let mut tokens = 0usize;
        let mut picked = Vec::new();
        for message in session.messages.iter().rev() {
            if picked.len() >= max_messages {
                break;
            }
            if let Some(max_tokens) = window.max_tokens {
                let cost = counter.count(&message.content);
                if tokens + cost > max_tokens {
                    break;
                }
                tokens += cost;
            }
            picked.push(message.clone());
        }
        picked.reverse();
        picked
    }

    pub fn state(&self, session_id: &str) -> SessionState {
        let now = self.clock.now();
        if self.live_session(session_id, now).is_some() {
            return SessionState::Active;
        }
        if self.evicted.lock().unwrap().contains(session_id) {
            SessionState::Evicted
        } else {
            SessionState::Empty
        }
    }

    /// Drop a session explicitly. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.remove(session_id) {
                Some(session) => {
                    session.lock().unwrap().retired = true;
                    true
                }
                None => false,
            }
        };
        if removed {
            self.tombstone(session_id);
            debug!(session_id, "Removed conversation session");
        }
        removed
    }

    /// Purge every session idle beyond the TTL. Returns how many were purged.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let mut sessions = self.sessions.write().unwrap();
            // Decide and retire under the record's own lock so an append that
            // just refreshed `last_active` is never swept.
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| {
                    let mut session = s.lock().unwrap();
                    let expired = self.is_expired(&session, now);
                    session.retired |= expired;
                    expired
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            expired
        };
        for id in &expired {
            self.tombstone(id);
        }
        if !expired.is_empty() {
            info!(purged = expired.len(), "Evicted expired conversation sessions");
        }
        expired.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Look up a session, purging it first if its TTL has passed.
    fn live_session(&self, session_id: &str, now: DateTime<Utc>) -> Option<Arc<Mutex<Session>>> {
        let session = self.sessions.read().unwrap().get(session_id).cloned()?;
        let expired = self.is_expired(&session.lock().unwrap(), now);
        if !expired {
            return Some(session);
        }

        let mut sessions = self.sessions.write().unwrap();
        // Only remove the record we inspected; a concurrent append may have
        // replaced it already.
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            {
                let mut record = session.lock().unwrap();
                if !self.is_expired(&record, now) {
                    drop(record);
                    return Some(session);
                }
                record.retired = true;
            }
            sessions.remove(session_id);
            drop(sessions);
            self.tombstone(session_id);
            debug!(session_id, "Conversation session expired");
        }
        None
    }

    fn create_session(&self, session_id: &str, now: DateTime<Utc>) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(existing) = sessions.get(session_id) {
            return existing.clone();
        }
        let session = Arc::new(Mutex::new(Session {
            messages: VecDeque::new(),
            last_active: now,
            retired: false,
        }));
        sessions.insert(session_id.to_string(), session.clone());

        let mut displaced = Vec::new();
        while sessions.len() > self.config.max_sessions {
            let oldest = sessions
                .iter()
                .filter(|(id, _)| id.as_str() != session_id)
                .map(|(id, s)| (id.clone(), s.lock().unwrap().last_active))
                .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            match oldest {
                Some((id, _)) => {
                    if let Some(session) = sessions.remove(&id) {
                        session.lock().unwrap().retired = true;
                    }
                    displaced.push(id);
                }
                None => break,
            }
        }
        drop(sessions);

        self.evicted.lock().unwrap().pop(session_id);
        for id in displaced {
            debug!(session_id = %id, "Evicted idle session over capacity");
            self.tombstone(&id);
        }
        session
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now - session.last_active > self.ttl
    }

    fn tombstone(&self, session_id: &str) {
        self.evicted.lock().unwrap().put(session_id.to_string(), ());
    }
}
