//! Two-legged OAuth token handling.
//!
//! [`RemoteAuthenticator`] performs the client-credentials exchange;
//! [`TokenCache`] owns the current [`Credential`] and collapses concurrent
//! refreshes into one exchange that every waiting caller joins.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AuthError, TransportError};
use crate::http::{HttpRequest, HttpTransport};
use crate::retry::RetryPolicy;

/// A credential stops being handed out this long before it actually expires.
pub const TOKEN_SAFETY_MARGIN: Duration = Duration::from_secs(300);
pub const DEFAULT_SCOPE: &str = "code:all";
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;
const DEFAULT_TOKEN_TYPE: &str = "Bearer";
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct Credential {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Instant,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now + TOKEN_SAFETY_MARGIN >= self.expires_at
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
}

pub struct RemoteAuthenticator {
    transport: Arc<dyn HttpTransport>,
    token_url: String,
    credentials: ClientCredentials,
    scope: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RemoteAuthenticator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        token_url: impl Into<String>,
        credentials: ClientCredentials,
    ) -> Self {
        Self {
            transport,
            token_url: token_url.into(),
            credentials,
            scope: DEFAULT_SCOPE.to_string(),
            timeout: DEFAULT_CONTROL_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Perform one client-credentials exchange. Only network-level failures are
    /// retried; any answer from the token endpoint is final.
    pub async fn exchange(&self) -> Result<Credential, AuthError> {
        let request = HttpRequest::post(&self.token_url, self.timeout).form(vec![
            ("client_id".to_string(), self.credentials.client_id.clone()),
            (
                "client_secret".to_string(),
                self.credentials.client_secret.clone(),
            ),
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("scope".to_string(), self.scope.clone()),
        ]);
        let transport = self.transport.as_ref();

        let response = self
            .retry
            .run(
                "token exchange",
                move || {
                    let request = request.clone();
                    async move { transport.send(request).await }
                },
                TransportError::is_transient,
            )
            .await
            .map_err(|failure| AuthError::Unreachable {
                attempts: failure.attempts,
                message: failure.error.to_string(),
            })?;

        if !response.is_success() {
            warn!(
                status = response.status,
                client_id = %self.credentials.client_id,
                "token exchange rejected"
            );
            return Err(AuthError::Rejected {
                status: response.status,
                body: response.text_snippet(),
            });
        }

        let body: TokenResponse = response
            .json()
            .map_err(|err| AuthError::Malformed(err.to_string()))?;
        if body.access_token.trim().is_empty() {
            return Err(AuthError::Malformed("empty access_token".to_string()));
        }

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        info!(expires_in, "APS token issued");

        Ok(Credential {
            access_token: body.access_token,
            token_type: body
                .token_type
                .filter(|kind| !kind.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
            issued_at: Utc::now(),
        })
    }
}

type SharedExchange = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

#[derive(Default)]
struct CacheState {
    current: Option<Credential>,
    inflight: Option<SharedExchange>,
}

/// Owns the current credential. Safe to share between concurrent runs.
pub struct TokenCache {
    authenticator: Arc<RemoteAuthenticator>,
    state: Mutex<CacheState>,
}

impl TokenCache {
    pub fn new(authenticator: RemoteAuthenticator) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a valid credential, refreshing it when needed.
    pub async fn token(&self) -> Result<Credential, AuthError> {
        let exchange = {
            let mut state = self.lock();
            if let Some(credential) = state.current.as_ref().filter(|c| !c.is_expired()) {
                return Ok(credential.clone());
            }
            // An expired credential is never handed out again, even if the refresh fails.
            state.current = None;

            match state.inflight.as_ref() {
                Some(exchange) => {
                    debug!("joining in-flight token exchange");
                    exchange.clone()
                }
                None => {
                    let authenticator = Arc::clone(&self.authenticator);
                    let exchange = async move { authenticator.exchange().await }
                        .boxed()
                        .shared();
                    state.inflight = Some(exchange.clone());
                    exchange
                }
            }
        };

        let outcome = exchange.clone().await;

        let mut state = self.lock();
        if state
            .inflight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&exchange))
        {
            state.inflight = None;
            if let Ok(credential) = &outcome {
                state.current = Some(credential.clone());
            }
        }
        outcome
    }

    /// Drop the cached credential so the next [`TokenCache::token`] call exchanges again.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        if state.current.take().is_some() {
            debug!("cached token invalidated");
        }
    }

    /// The cached credential, if one is present and still valid.
    pub fn cached(&self) -> Option<Credential> {
        self.lock()
            .current
            .as_ref()
            .filter(|credential| !credential.is_expired())
            .cloned()
    }
}
