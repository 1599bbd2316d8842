use crate::models::BackendModel;
use dashmap::DashMap;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};

/// Mutable part of a conversation. Guarded per conversation so a first turn's
/// backend chat creation is never duplicated by a concurrent turn.
#[derive(Debug, Clone)]
pub struct SessionState {
    backend_chat_id: Option<String>,
    active_model: BackendModel,
    requested_model: String,
}

impl SessionState {
    pub fn backend_chat_id(&self) -> Option<&str> {
        self.backend_chat_id.as_deref()
    }

    pub fn active_model(&self) -> BackendModel {
        self.active_model
    }

    pub fn requested_model(&self) -> &str {
        &self.requested_model
    }

    /// Binds the backend chat. A conversation is bound exactly once.
    pub fn record_backend_chat(&mut self, chat_id: impl Into<String>) {
        debug_assert!(
            self.backend_chat_id.is_none(),
            "backend chat id is assigned once per conversation"
        );
        if self.backend_chat_id.is_none() {
            self.backend_chat_id = Some(chat_id.into());
        }
    }

    pub fn set_model(&mut self, model: BackendModel, requested_model: impl Into<String>) {
        self.active_model = model;
        self.requested_model = requested_model.into();
    }
}

/// What `GET /sessions` shows. Copied out of [`SessionState`] whenever a
/// [`SessionGuard`] is released, so listing never waits on a turn in flight.
#[derive(Debug, Clone)]
struct Listing {
    requested_model: String,
    has_backend_chat: bool,
}

#[derive(Debug)]
pub struct SessionEntry {
    id: String,
    created_at: f64,
    state: Mutex<SessionState>,
    listing: RwLock<Listing>,
}

impl SessionEntry {
    fn new(id: String, model: BackendModel, requested_model: &str) -> Self {
        Self {
            id,
            created_at: now_secs_f64(),
            state: Mutex::new(SessionState {
                backend_chat_id: None,
                active_model: model,
                requested_model: requested_model.to_string(),
            }),
            listing: RwLock::new(Listing {
                requested_model: requested_model.to_string(),
                has_backend_chat: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    /// Exclusive access to the state; may be held across backend calls.
    pub async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            entry: self,
            state: self.state.lock().await,
        }
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    fn summary(&self) -> SessionSummary {
        let listing = match self.listing.read() {
            Ok(listing) => listing.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            model: listing.requested_model,
            has_anuneko_chat: listing.has_backend_chat,
        }
    }

    fn publish(&self, state: &SessionState) {
        let listing = Listing {
            requested_model: state.requested_model.clone(),
            has_backend_chat: state.backend_chat_id.is_some(),
        };
        match self.listing.write() {
            Ok(mut slot) => *slot = listing,
            Err(poisoned) => *poisoned.into_inner() = listing,
        }
    }
}

/// Lock on one conversation. Dropping it republishes the listing fields.
pub struct SessionGuard<'a> {
    entry: &'a SessionEntry,
    state: MutexGuard<'a, SessionState>,
}

impl Deref for SessionGuard<'_> {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.entry.publish(&self.state);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: f64,
    pub model: String,
    pub has_anuneko_chat: bool,
}

/// Conversation id -> session. Entries live until explicitly removed.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<String, Arc<SessionEntry>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for a known `conversation_id`. An absent, blank or
    /// unknown id gets a fresh session under a new UUID. The flag reports
    /// whether a new session was created.
    pub fn resolve(
        &self,
        conversation_id: Option<&str>,
        requested_model: &str,
        model: BackendModel,
    ) -> (Arc<SessionEntry>, bool) {
        if let Some(requested) = conversation_id.map(str::trim).filter(|id| !id.is_empty()) {
            if let Some(entry) = self.inner.get(requested) {
                return (entry.value().clone(), false);
            }
            tracing::debug!(requested = %requested, "unknown session id, issuing a new one");
        }
        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(SessionEntry::new(id.clone(), model, requested_model));
        self.inner.insert(id, entry.clone());
        tracing::debug!(session_id = %entry.id(), model = %model, "session created");
        (entry, true)
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner.get(conversation_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, conversation_id: &str) -> bool {
        let removed = self.inner.remove(conversation_id).is_some();
        if removed {
            tracing::debug!(session_id = %conversation_id, "session removed");
        }
        removed
    }

    /// Summaries sorted by creation time. Reads the published listing only.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self.inner.iter().map(|e| e.value().summary()).collect();
        out.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn now_secs_f64() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
