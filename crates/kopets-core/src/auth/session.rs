use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of account behind a session.
///
/// Serialized with the server's `tipo_usuario` values so snapshots can be
/// read straight out of authentication responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AccountKind {
    /// A foundation (shelter) account that manages pets and campaigns
    #[serde(rename = "REFUGIO")]
    Foundation,
    /// An individual adopter account
    #[serde(rename = "ADOPTANTE")]
    Adopter,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Foundation => "REFUGIO",
            AccountKind::Adopter => "ADOPTANTE",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccountKind::Foundation => "Foundation",
            AccountKind::Adopter => "Adopter",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized identity kept alongside the tokens so the host can render
/// who is logged in without a network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserSnapshot {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "tipo_usuario")]
    pub kind: AccountKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl UserSnapshot {
    /// "First Last" when the profile has a name, otherwise the username
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if parts.is_empty() {
            self.username.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// One authenticated identity known to this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserSnapshot,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

impl Session {
    /// Build a freshly verified session. The store decides whether it is active.
    pub fn new(access_token: String, refresh_token: String, user: UserSnapshot) -> Self {
        Self {
            key: Self::key_for(&user),
            access_token,
            refresh_token,
            user,
            last_activity: Utc::now(),
            is_active: false,
        }
    }

    /// Storage key derived from the account, e.g. `REFUGIO_1` or `ADOPTANTE_5`.
    pub fn key_for(user: &UserSnapshot) -> String {
        format!("{}_{}", user.kind, user.id)
    }

    /// Refresh token, if the session carries a usable one
    pub fn refresh_token(&self) -> Option<&str> {
        Some(self.refresh_token.as_str()).filter(|t| !t.is_empty())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            user: self.user.clone(),
            is_active: self.is_active,
            last_activity: self.last_activity,
        }
    }
}

/// Token-free view of a session for session switchers and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSummary {
    pub key: String,
    pub user: UserSnapshot,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn test_user(kind: AccountKind, id: i64) -> UserSnapshot {
    UserSnapshot {
        id,
        username: format!("user{}", id),
        email: format!("user{}@example.org", id),
        kind,
        first_name: None,
        last_name: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derived_from_account() {
        let foundation = test_user(AccountKind::Foundation, 1);
        let adopter = test_user(AccountKind::Adopter, 5);
        assert_eq!(Session::key_for(&foundation), "REFUGIO_1");
        assert_eq!(Session::key_for(&adopter), "ADOPTANTE_5");

        // Same id, different account kind: distinct sessions
        let other = test_user(AccountKind::Adopter, 1);
        assert_ne!(Session::key_for(&foundation), Session::key_for(&other));
    }

    #[test]
    fn test_display_name() {
        let mut user = test_user(AccountKind::Adopter, 3);
        assert_eq!(user.display_name(), "user3");

        user.first_name = Some("Ana".to_string());
        assert_eq!(user.display_name(), "Ana");

        user.last_name = Some("Rojas".to_string());
        assert_eq!(user.display_name(), "Ana Rojas");

        user.first_name = Some("  ".to_string());
        assert_eq!(user.display_name(), "Rojas");
    }

    #[test]
    fn test_empty_refresh_token_is_absent() {
        let mut session = Session::new(
            "a".to_string(),
            String::new(),
            test_user(AccountKind::Foundation, 1),
        );
        assert_eq!(session.refresh_token(), None);

        session.refresh_token = "r".to_string();
        assert_eq!(session.refresh_token(), Some("r"));
    }

    #[test]
    fn test_parse_server_user() {
        let json = r#"{"id": 7, "username": "huellitas", "email": "info@huellitas.cl", "tipo_usuario": "REFUGIO", "first_name": "", "telefono": "123"}"#;
        let user: UserSnapshot = serde_json::from_str(json).expect("Failed to parse user JSON");
        assert_eq!(user.id, 7);
        assert_eq!(user.kind, AccountKind::Foundation);
        assert_eq!(user.display_name(), "huellitas");
    }
}
