//! REST API client module for the kopets backend.
//!
//! This module provides the `ApiClient` for talking to the foundation
//! dashboard API, and the pieces it is built from:
//! - `RequestPipeline`: bearer injection and single-flight token refresh
//! - `AuthClient`: login, 2FA verification, registration and logout
//! - `Transport`: the seam to the network, backed by `reqwest`
//!
//! The API uses JWT bearer tokens; refresh tokens are exchanged at
//! `auth/token/refresh/` when an access token expires.

pub mod auth;
pub mod client;
pub mod error;
pub mod pipeline;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{
    AuthClient, LoginOutcome, RegistrationKind, RegistrationOutcome, RegistrationRequest, TokenPair,
    VerifyOutcome,
};
pub use client::ApiClient;
pub use error::ApiError;
pub use pipeline::{Navigation, RequestPipeline};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};

/// Join a base URL and an endpoint path. Absolute URLs pass through.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
