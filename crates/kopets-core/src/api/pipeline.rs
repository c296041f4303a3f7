//! Outbound request pipeline with single-flight token refresh.
//!
//! Every call gets the active session's access token as a bearer credential.
//! The first 401 of an expiry episode starts one refresh; requests that hit
//! a 401 while it is in flight are queued behind it and replayed, in the
//! order they queued, once it settles. A request is replayed at most once:
//! a second 401 is surfaced as-is.
//!
//! When a refresh is impossible or rejected, the affected session is cleared
//! and a [`Navigation`] is broadcast so the host can send the user to the
//! login screen or activate another session.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::exchange_refresh_token;
use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use super::{join_url, ApiError};
use crate::auth::{Session, SessionStore};

/// Buffered navigation signals per subscriber
const NAVIGATION_CHANNEL_CAPACITY: usize = 16;

/// What the host should do after an authentication episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    /// Nothing to do; the session is usable
    Continue,
    /// No sessions remain
    NavigateToLogin,
    /// The expired session is gone but others remain; reload and activate one
    ReloadForSession,
}

impl fmt::Display for Navigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Navigation::Continue => "continue",
            Navigation::NavigateToLogin => "navigate to login",
            Navigation::ReloadForSession => "reload to activate a remaining session",
        };
        f.write_str(s)
    }
}

type Reply = oneshot::Sender<Result<HttpResponse, ApiError>>;

/// A request parked behind the in-flight refresh.
struct PendingRequest {
    ticket: u64,
    request: HttpRequest,
    reply: Reply,
}

/// The access token whose session was expired, and how that ended.
struct ExpiredToken {
    access_token: String,
    error: ApiError,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingRequest>,
    expired: Option<ExpiredToken>,
}

impl RefreshState {
    /// Outcome of the failed episode `sent_token` belongs to, if any
    fn expired_with(&self, sent_token: Option<&str>) -> Option<ApiError> {
        let expired = self.expired.as_ref()?;
        (sent_token == Some(expired.access_token.as_str())).then(|| expired.error.clone())
    }
}

enum Recovery {
    /// This request starts the refresh
    Lead,
    /// A refresh is in flight; wait for its outcome
    Wait {
        ticket: u64,
        reply: oneshot::Receiver<Result<HttpResponse, ApiError>>,
    },
    /// A refresh already replaced the token this request was sent with
    Replay(Option<String>),
    /// The episode this request belongs to already failed
    Reject(ApiError),
}

/// Returns the pipeline to idle even if the refreshing future is dropped,
/// rejecting anything still queued.
struct RefreshGuard<'a> {
    state: &'a Mutex<RefreshState>,
    finished: bool,
}

impl RefreshGuard<'_> {
    fn finish(mut self) -> VecDeque<PendingRequest> {
        self.finished = true;
        let mut state = lock(self.state);
        state.refreshing = false;
        std::mem::take(&mut state.queue)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let abandoned = {
            let mut state = lock(self.state);
            state.refreshing = false;
            std::mem::take(&mut state.queue)
        };
        warn!(queued = abandoned.len(), "Token refresh abandoned");
        for pending in abandoned {
            let _ = pending.reply.send(Err(ApiError::Cancelled));
        }
    }
}

fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RequestPipeline {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    base_url: String,
    state: Mutex<RefreshState>,
    next_ticket: AtomicU64,
    navigation: broadcast::Sender<Navigation>,
}

impl RequestPipeline {
    pub fn new(store: Arc<SessionStore>, transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        let (navigation, _) = broadcast::channel(NAVIGATION_CHANNEL_CAPACITY);
        Self {
            store,
            transport,
            base_url: base_url.into(),
            state: Mutex::new(RefreshState::default()),
            next_ticket: AtomicU64::new(0),
            navigation,
        }
    }

    /// Receive navigation signals emitted when a session expires
    pub fn subscribe(&self) -> broadcast::Receiver<Navigation> {
        self.navigation.subscribe()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.state).refreshing
    }

    /// Requests currently parked behind a refresh
    pub fn queued_requests(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Send a request to `path` (relative to the base URL) and return the JSON body
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        self.request_with_cancel(method, path, body, &CancellationToken::new())
            .await
    }

    /// Like [`request`](Self::request), but gives up with
    /// [`ApiError::Cancelled`] if `cancel` fires while the request is waiting
    /// on a token refresh.
    pub async fn request_with_cancel(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ApiError> {
        let request = HttpRequest::new(method, join_url(&self.base_url, path), body);
        self.execute(request, cancel).await?.json_value()
    }

    /// Run one request through the refresh protocol.
    pub async fn execute(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse, ApiError> {
        let token = self.store.active_access_token();
        let response = self
            .transport
            .send(request.clone().with_bearer(token.clone()))
            .await?;

        if !response.is_unauthorized() {
            return response.error_for_status();
        }

        debug!(method = %request.method, url = %request.url, "Request unauthorized");
        self.recover(request, token, cancel).await
    }

    async fn recover(
        &self,
        request: HttpRequest,
        sent_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, ApiError> {
        let recovery = {
            let mut state = lock(&self.state);
            if state.refreshing {
                let (reply, receiver) = oneshot::channel();
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                state.queue.push_back(PendingRequest {
                    ticket,
                    request: request.clone(),
                    reply,
                });
                debug!(ticket, queued = state.queue.len(), "Refresh in flight, request queued");
                Recovery::Wait {
                    ticket,
                    reply: receiver,
                }
            } else if let Some(error) = state.expired_with(sent_token.as_deref()) {
                Recovery::Reject(error)
            } else {
                let current = self.store.active_access_token();
                if current.is_some() && current != sent_token {
                    Recovery::Replay(current)
                } else {
                    state.refreshing = true;
                    Recovery::Lead
                }
            }
        };

        match recovery {
            Recovery::Lead => self.lead_refresh(request).await,
            Recovery::Wait { ticket, reply } => self.wait_for_refresh(ticket, reply, cancel).await,
            Recovery::Replay(token) => {
                debug!(url = %request.url, "Token already refreshed, replaying");
                self.send_final(request, token).await
            }
            Recovery::Reject(error) => {
                debug!(url = %request.url, "Session already expired for this token");
                Err(error)
            }
        }
    }

    /// Wait for the queued request's outcome.
    ///
    /// Cancellation only applies while the request is still queued. Once the
    /// leader has taken it for replay it may already be on the wire, so the
    /// caller gets the real response instead of `Cancelled`.
    async fn wait_for_refresh(
        &self,
        ticket: u64,
        mut reply: oneshot::Receiver<Result<HttpResponse, ApiError>>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, ApiError> {
        tokio::select! {
            result = &mut reply => result.unwrap_or(Err(ApiError::Cancelled)),
            _ = cancel.cancelled() => {
                if self.withdraw(ticket) {
                    debug!(ticket, "Queued request cancelled");
                    return Err(ApiError::Cancelled);
                }
                debug!(ticket, "Cancelled after replay was taken, awaiting its response");
                reply.await.unwrap_or(Err(ApiError::Cancelled))
            }
        }
    }

    async fn lead_refresh(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let guard = RefreshGuard {
            state: &self.state,
            finished: false,
        };
        let outcome = self.refresh_active_session().await;
        let queued = guard.finish();

        match outcome {
            Ok(token) => {
                info!(replays = queued.len() + 1, "Replaying requests with refreshed token");
                let own = self.send_final(request, Some(token.clone()));
                // join_all polls in queue order, so replays go out FIFO
                let others = join_all(queued.into_iter().map(|pending| {
                    let token = token.clone();
                    async move {
                        // The waiter is gone; don't send on its behalf
                        if pending.reply.is_closed() {
                            debug!(ticket = pending.ticket, "Skipping replay for dropped request");
                            return;
                        }
                        let result = self.send_final(pending.request, Some(token)).await;
                        let _ = pending.reply.send(result);
                    }
                }));
                let (own, _) = futures::join!(own, others);
                own
            }
            Err(error) => {
                for pending in queued {
                    let _ = pending.reply.send(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Refresh the active session's tokens, returning the new access token.
    async fn refresh_active_session(&self) -> Result<String, ApiError> {
        let Some(session) = self.store.get_active() else {
            return Err(self.expire(None, "no active session"));
        };
        let Some(refresh_token) = session.refresh_token() else {
            return Err(self.expire(Some(&session), "no refresh token"));
        };

        debug!(key = %session.key, "Refreshing access token");
        match exchange_refresh_token(self.transport.as_ref(), &self.base_url, refresh_token).await {
            Ok(pair) => {
                if !self
                    .store
                    .update_tokens(&session.key, &pair.access, pair.refresh.as_deref())
                {
                    debug!(key = %session.key, "Session logged out during refresh");
                    return Err(ApiError::Unauthorized);
                }
                info!(key = %session.key, rotated = pair.refresh.is_some(), "Access token refreshed");
                Ok(pair.access)
            }
            Err(ApiError::Network(message)) => {
                warn!(key = %session.key, error = %message, "Token refresh could not reach the server");
                Err(ApiError::Network(message))
            }
            Err(e) => {
                warn!(key = %session.key, error = %e, "Token refresh failed");
                let reason = match e {
                    ApiError::RefreshRejected(reason) => reason,
                    other => other.to_string(),
                };
                Err(self.expire(Some(&session), &reason))
            }
        }
    }

    /// Drop the session that can no longer authenticate and tell the host
    /// where to go next.
    ///
    /// The expired access token is remembered so 401s that were already in
    /// flight with it get the same error without a second signal.
    fn expire(&self, session: Option<&Session>, reason: &str) -> ApiError {
        if let Some(session) = session {
            self.store.clear(&session.key);
        }

        let navigation = if self.store.is_empty() {
            Navigation::NavigateToLogin
        } else {
            Navigation::ReloadForSession
        };
        let error = ApiError::SessionExpired {
            reason: reason.to_string(),
            navigation,
        };
        info!(key = ?session.map(|s| &s.key), reason = reason, %navigation, "Session expired");

        if let Some(session) = session {
            lock(&self.state).expired = Some(ExpiredToken {
                access_token: session.access_token.clone(),
                error: error.clone(),
            });
        }

        if self.navigation.send(navigation).is_err() {
            debug!("No navigation subscribers");
        }

        error
    }

    /// Send an already-retried request; a 401 here is final.
    async fn send_final(&self, request: HttpRequest, token: Option<String>) -> Result<HttpResponse, ApiError> {
        self.transport
            .send(request.with_bearer(token))
            .await?
            .error_for_status()
    }

    /// Remove a queued request; `false` if the leader already took it.
    fn withdraw(&self, ticket: u64) -> bool {
        let mut state = lock(&self.state);
        let before = state.queue.len();
        state.queue.retain(|pending| pending.ticket != ticket);
        state.queue.len() != before
    }
}
