//! Session management for every identity logged in on this host.
//!
//! This module provides:
//! - `Session`: one identity's access/refresh token pair plus a user snapshot
//! - `SessionStore`: keyed, durable storage with a single active session
//! - `CredentialStore`: OS keychain storage for login passwords
//!
//! Sessions are persisted to `sessions.json` in the cache directory.

pub mod credentials;
pub mod session;
pub mod store;

pub use credentials::CredentialStore;
pub use session::{AccountKind, Session, SessionSummary, UserSnapshot};
pub use store::{FileBackend, MemoryBackend, SessionBackend, SessionStore, SESSIONS_FILE};
