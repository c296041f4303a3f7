//! Core library for kopets: the authenticated API client behind the
//! foundation dashboard.
//!
//! - [`auth`]: sessions for every identity logged in on this host
//! - [`api`]: request pipeline with single-flight token refresh, plus the
//!   authentication endpoints
//! - [`config`]: host configuration

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, Method, Navigation, RequestPipeline};
pub use auth::{AccountKind, Session, SessionStore, SessionSummary, UserSnapshot};
pub use config::Config;
