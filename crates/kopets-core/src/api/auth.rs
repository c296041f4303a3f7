//! Authentication endpoints: login, 2FA verification, registration,
//! token refresh, and local logout.
//!
//! These calls go straight to the transport rather than through the request
//! pipeline, so a wrong password (401) never triggers a token refresh.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use super::{join_url, ApiError};
use crate::auth::{AccountKind, Session, SessionStore, UserSnapshot};

const LOGIN_PATH: &str = "auth/login/";
const VERIFY_CODE_PATH: &str = "auth/verificar_codigo/";
const REGISTER_PATH: &str = "auth/registro/";
pub(crate) const REFRESH_PATH: &str = "auth/token/refresh/";

/// Result of the first login step. On success the server has sent a
/// verification code and `user_id` identifies the pending login.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default, rename = "tipo_usuario")]
    pub account_kind: Option<AccountKind>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    user: Option<UserSnapshot>,
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
}

/// Result of the verification step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub success: bool,
    pub message: String,
    /// Key of the session created and activated by a successful verification
    pub session_key: Option<String>,
    pub user: Option<UserSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationKind {
    Adopter { name: Option<String> },
    Foundation { foundation_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub email: String,
    pub password: String,
    pub kind: RegistrationKind,
}

impl RegistrationRequest {
    fn to_body(&self) -> serde_json::Value {
        let mut body = json!({
            "email": self.email,
            "password": self.password,
        });
        match &self.kind {
            RegistrationKind::Adopter { name } => {
                body["tipo_usuario"] = json!("usuario");
                if let Some(name) = name {
                    body["nombre"] = json!(name);
                }
            }
            RegistrationKind::Foundation { foundation_name } => {
                body["tipo_usuario"] = json!("fundacion");
                body["nombre_fundacion"] = json!(foundation_name);
            }
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistrationOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Foundations wait for an administrator before they can log in
    #[serde(default, rename = "requiere_verificacion")]
    pub requires_approval: bool,
}

/// Token pair returned by the refresh endpoint. The server may or may not
/// rotate the refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Exchange a refresh token for a new access token.
/// Any non-2xx answer means the refresh token is invalid or expired.
pub(crate) async fn exchange_refresh_token(
    transport: &dyn Transport,
    base_url: &str,
    refresh_token: &str,
) -> Result<TokenPair, ApiError> {
    let request = HttpRequest::new(
        Method::Post,
        join_url(base_url, REFRESH_PATH),
        Some(json!({ "refresh": refresh_token })),
    );

    let response = transport.send(request).await?;
    if !response.is_success() {
        let reason = refresh_failure_reason(&response);
        debug!(status = response.status, reason = %reason, "Refresh endpoint rejected token");
        return Err(ApiError::RefreshRejected(reason));
    }

    let pair: TokenPair = response.json()?;
    if pair.access.is_empty() {
        return Err(ApiError::InvalidResponse(
            "Refresh response carried an empty access token".to_string(),
        ));
    }
    Ok(pair)
}

/// Pull the server's error code out of a failed refresh, e.g. `invalid_grant`
fn refresh_failure_reason(response: &HttpResponse) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(&response.body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            ["error", "code", "detail"]
                .iter()
                .find_map(|field| v.get(*field).and_then(|f| f.as_str()))
        })
        .map(str::to_string)
        .unwrap_or_else(|| format!("refresh rejected with status {}", response.status))
}

/// Client for the authentication endpoints, writing sessions into the store.
#[derive(Clone)]
pub struct AuthClient {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    base_url: String,
}

impl AuthClient {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<SessionStore>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            store,
            base_url: base_url.into(),
        }
    }

    /// First login step: check the password and have the server send a code
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let body = json!({ "email": email, "password": password });
        let response = self.post(LOGIN_PATH, body).await?;
        let outcome: LoginOutcome = Self::parse_outcome(&response)?;
        debug!(success = outcome.success, user_id = ?outcome.user_id, "Login response");
        Ok(outcome)
    }

    /// Second login step. A correct code creates the session and makes it active.
    pub async fn verify_code(&self, user_id: i64, code: &str) -> Result<VerifyOutcome, ApiError> {
        let body = json!({ "user_id": user_id, "codigo": code });
        let response = self.post(VERIFY_CODE_PATH, body).await?;
        let parsed: VerifyResponse = Self::parse_outcome(&response)?;

        let mut outcome = VerifyOutcome {
            success: parsed.success,
            message: parsed.message,
            session_key: None,
            user: parsed.user.clone(),
        };

        if !parsed.success {
            return Ok(outcome);
        }

        match (parsed.access, parsed.refresh, parsed.user) {
            (Some(access), Some(refresh), Some(user)) => {
                let session = Session::new(access, refresh, user);
                let key = session.key.clone();
                self.store.save(session);
                self.store.switch_active(&key);
                info!(key = %key, "Login verified, session active");
                outcome.session_key = Some(key);
                Ok(outcome)
            }
            _ => Err(ApiError::InvalidResponse(
                "Verification succeeded without tokens and user".to_string(),
            )),
        }
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutcome, ApiError> {
        let response = self.post(REGISTER_PATH, request.to_body()).await?;
        Self::parse_outcome(&response)
    }

    /// Exchange a refresh token without touching the store
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        exchange_refresh_token(self.transport.as_ref(), &self.base_url, refresh_token).await
    }

    /// Log out one session (the active one when `key` is `None`).
    ///
    /// If the removed session was active, the most recently active remaining
    /// session takes over. Returns the removed session.
    pub fn logout(&self, key: Option<&str>) -> Option<Session> {
        let active = self.store.get_active();
        let target = match key {
            Some(k) => k.to_string(),
            None => active.as_ref()?.key.clone(),
        };

        let removed = self.store.clear(&target)?;
        if removed.is_active {
            if let Some(next) = self.store.list().first() {
                self.store.switch_active(&next.key);
            }
        }
        Some(removed)
    }

    pub fn logout_all(&self) {
        self.store.clear_all();
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<HttpResponse, ApiError> {
        let request = HttpRequest::new(Method::Post, join_url(&self.base_url, path), Some(body));
        self.transport.send(request).await
    }

    /// Auth endpoints answer failures with a `{success: false, message}` body
    /// and a non-2xx status; those are outcomes, not errors.
    fn parse_outcome<T: serde::de::DeserializeOwned>(response: &HttpResponse) -> Result<T, ApiError> {
        match response.json::<T>() {
            Ok(outcome) => Ok(outcome),
            Err(e) if response.is_success() => Err(e),
            Err(_) => {
                warn!(status = response.status, "Auth endpoint returned an unexpected body");
                Err(ApiError::from_status(response.status, &response.body))
            }
        }
    }
}
