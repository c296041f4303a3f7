//! API client for the kopets foundation dashboard backend.
//!
//! `ApiClient` bundles the request pipeline and the authentication client
//! over one session store and one transport. Resource wrappers (pets,
//! campaigns, adopters, ...) only need [`ApiClient::request`] or the typed
//! helpers built on it.

use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::auth::{AuthClient, LoginOutcome, RegistrationOutcome, RegistrationRequest, VerifyOutcome};
use super::pipeline::{Navigation, RequestPipeline};
use super::transport::{Method, ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::{Session, SessionStore, UserSnapshot};
use crate::config::Config;

const PROFILE_PATH: &str = "auth/perfil/";

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    success: bool,
    user: Option<UserSnapshot>,
}

/// API client for the kopets backend.
/// Clone is cheap - the pipeline, store and transport are shared.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: Arc<RequestPipeline>,
    auth: AuthClient,
}

impl ApiClient {
    /// Create a client talking to the configured backend over HTTP
    pub fn new(config: &Config, store: Arc<SessionStore>) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::with_transport(
            Arc::new(transport),
            store,
            config.base_url(),
        ))
    }

    /// Create a client over any transport, sharing one store between the
    /// pipeline and the authentication client
    pub fn with_transport(transport: Arc<dyn Transport>, store: Arc<SessionStore>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let pipeline = Arc::new(RequestPipeline::new(
            store.clone(),
            transport.clone(),
            base_url.clone(),
        ));
        let auth = AuthClient::new(transport, store, base_url);
        Self { pipeline, auth }
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.pipeline.store()
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Navigation signals from expired sessions
    pub fn subscribe(&self) -> broadcast::Receiver<Navigation> {
        self.pipeline.subscribe()
    }

    // ===== Request primitive =====

    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        self.pipeline.request(method, path, body).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = self.request(Method::Get, path, None).await?;
        Self::decode(path, value)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let value = self.request(Method::Post, path, Some(Self::encode(body)?)).await?;
        Self::decode(path, value)
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let value = self.request(Method::Patch, path, Some(Self::encode(body)?)).await?;
        Self::decode(path, value)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request(Method::Delete, path, None).await?;
        Ok(())
    }

    fn encode<B: Serialize>(body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))
    }

    fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e)))
    }

    // ===== Authentication =====

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        self.auth.login(email, password).await
    }

    pub async fn verify_code(&self, user_id: i64, code: &str) -> Result<VerifyOutcome, ApiError> {
        self.auth.verify_code(user_id, code).await
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationOutcome, ApiError> {
        self.auth.register(request).await
    }

    pub fn logout(&self, key: Option<&str>) -> Option<Session> {
        self.auth.logout(key)
    }

    pub fn logout_all(&self) {
        self.auth.logout_all()
    }

    pub fn switch_session(&self, key: &str) -> bool {
        self.sessions().switch_active(key)
    }

    /// Profile of the active session's user, fetched from the server
    pub async fn profile(&self) -> Result<UserSnapshot, ApiError> {
        let response: ProfileResponse = self.get(PROFILE_PATH).await?;
        match response.user {
            Some(user) if response.success => Ok(user),
            _ => Err(ApiError::InvalidResponse("Profile response without user".to_string())),
        }
    }
}
