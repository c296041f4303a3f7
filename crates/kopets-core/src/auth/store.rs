//! Keyed, durable storage of every session logged in on this host.
//!
//! The store keeps at most one session active. Every mutation writes the
//! whole document through to a [`SessionBackend`]; persistence failures are
//! logged and never surface to callers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::session::{Session, SessionSummary, UserSnapshot};

/// Session file name in the cache directory
pub const SESSIONS_FILE: &str = "sessions.json";

/// Where the serialized session document lives between runs.
pub trait SessionBackend: Send + Sync {
    /// Read the stored document, `None` if nothing was ever written
    fn load(&self) -> Result<Option<String>>;

    /// Replace the stored document
    fn store(&self, contents: &str) -> Result<()>;
}

/// JSON file on disk, the default for real hosts.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Backend for `sessions.json` inside the given cache directory
    pub fn in_dir(cache_dir: &Path) -> Self {
        Self::new(cache_dir.join(SESSIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionBackend for FileBackend {
    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session file {}", self.path.display()))?;
        Ok(Some(contents))
    }

    fn store(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write session file {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process backend for tests and hosts that should forget on exit.
#[derive(Default)]
pub struct MemoryBackend {
    contents: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend with a document, as if written by an earlier run
    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(Some(contents.into())),
        }
    }
}

impl SessionBackend for MemoryBackend {
    fn load(&self) -> Result<Option<String>> {
        Ok(self
            .contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn store(&self, contents: &str) -> Result<()> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }
}

/// Persisted shape of one session; the key is the map key around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    access_token: String,
    refresh_token: String,
    user: UserSnapshot,
    last_activity: DateTime<Utc>,
    #[serde(default)]
    is_active: bool,
}

impl SessionRecord {
    fn from_session(session: &Session) -> Self {
        Self {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            user: session.user.clone(),
            last_activity: session.last_activity,
            is_active: session.is_active,
        }
    }

    fn into_session(self, key: String) -> Session {
        Session {
            key,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user: self.user,
            last_activity: self.last_activity,
            is_active: self.is_active,
        }
    }
}

pub struct SessionStore {
    sessions: Mutex<BTreeMap<String, Session>>,
    backend: Box<dyn SessionBackend>,
}

impl SessionStore {
    /// Open the store, loading whatever the backend holds.
    ///
    /// Unreadable or corrupt data loads as an empty store; corrupt entries
    /// are dropped individually.
    pub fn open(backend: Box<dyn SessionBackend>) -> Self {
        let sessions = match backend.load() {
            Ok(Some(contents)) => decode(&contents),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load sessions, starting empty");
                BTreeMap::new()
            }
        };
        debug!(count = sessions.len(), "Sessions loaded");

        Self {
            sessions: Mutex::new(sessions),
            backend,
        }
    }

    /// Store backed by `sessions.json` in the given cache directory
    pub fn open_in_dir(cache_dir: &Path) -> Self {
        Self::open(Box::new(FileBackend::in_dir(cache_dir)))
    }

    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryBackend::new()))
    }

    /// All sessions, most recently active first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    /// Token-free listing, most recently active first
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.list().iter().map(Session::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.lock().get(key).cloned()
    }

    pub fn get_active(&self) -> Option<Session> {
        self.lock().values().find(|s| s.is_active).cloned()
    }

    /// Access token of the active session, if any
    pub fn active_access_token(&self) -> Option<String> {
        self.lock()
            .values()
            .find(|s| s.is_active)
            .map(|s| s.access_token.clone())
    }

    /// Insert or replace a session by key.
    ///
    /// An existing key keeps its active flag. Otherwise the session becomes
    /// active only when no session is active yet.
    pub fn save(&self, session: Session) {
        let mut sessions = self.lock();
        let any_active = sessions.values().any(|s| s.is_active);

        let mut session = session;
        session.is_active = match sessions.get(&session.key) {
            Some(existing) => existing.is_active || !any_active,
            None => !any_active,
        };

        debug!(key = %session.key, active = session.is_active, "Saving session");
        sessions.insert(session.key.clone(), session);
        self.persist(&sessions);
    }

    /// Replace a session's token pair in one step.
    ///
    /// A `None` refresh token keeps the stored one. Returns `false` without
    /// touching anything when the key is gone.
    pub fn update_tokens(&self, key: &str, access_token: &str, refresh_token: Option<&str>) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(key) else {
            debug!(key = key, "Token update for missing session ignored");
            return false;
        };

        session.access_token = access_token.to_string();
        if let Some(refresh) = refresh_token {
            session.refresh_token = refresh.to_string();
        }
        session.last_activity = Utc::now();

        self.persist(&sessions);
        true
    }

    /// Make `key` the only active session. Unknown keys change nothing.
    pub fn switch_active(&self, key: &str) -> bool {
        let mut sessions = self.lock();
        if !sessions.contains_key(key) {
            return false;
        }

        let now = Utc::now();
        for (k, session) in sessions.iter_mut() {
            session.is_active = k == key;
            if session.is_active {
                session.last_activity = now;
            }
        }

        info!(key = key, "Switched active session");
        self.persist(&sessions);
        true
    }

    /// Remove one session. Clearing the active session leaves none active.
    pub fn clear(&self, key: &str) -> Option<Session> {
        let mut sessions = self.lock();
        let removed = sessions.remove(key);
        if removed.is_some() {
            info!(key = key, remaining = sessions.len(), "Session cleared");
            self.persist(&sessions);
        }
        removed
    }

    pub fn clear_all(&self) {
        let mut sessions = self.lock();
        sessions.clear();
        info!("All sessions cleared");
        self.persist(&sessions);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, sessions: &BTreeMap<String, Session>) {
        let records: BTreeMap<&str, SessionRecord> = sessions
            .iter()
            .map(|(key, session)| (key.as_str(), SessionRecord::from_session(session)))
            .collect();

        let result = serde_json::to_string_pretty(&records)
            .context("Failed to serialize sessions")
            .and_then(|contents| self.backend.store(&contents));

        if let Err(e) = result {
            warn!(error = %e, "Failed to persist sessions");
        }
    }
}

/// Parse a stored document, skipping entries that do not parse and keeping
/// at most one active session (the most recently active).
fn decode(contents: &str) -> BTreeMap<String, Session> {
    let raw: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(contents) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Session file is corrupt, ignoring it");
            return BTreeMap::new();
        }
    };

    let mut sessions = BTreeMap::new();
    for (key, value) in raw {
        match serde_json::from_value::<SessionRecord>(value) {
            Ok(record) => {
                sessions.insert(key.clone(), record.into_session(key));
            }
            Err(e) => warn!(key = %key, error = %e, "Skipping corrupt session entry"),
        }
    }

    let active_key = sessions
        .values()
        .filter(|s| s.is_active)
        .max_by_key(|s| s.last_activity)
        .map(|s| s.key.clone());

    for session in sessions.values_mut() {
        session.is_active = active_key.as_deref() == Some(session.key.as_str());
    }

    sessions
}
